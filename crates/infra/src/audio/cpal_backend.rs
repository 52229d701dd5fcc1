//! CPAL-based output device discovery
//!
//! Provides the device probe the software context factory uses to decide
//! whether audio output is possible at all, and the device listing shown by
//! the CLI.

use crate::audio::stream::{Result, StreamError};
use cpal::traits::{DeviceTrait, HostTrait};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What an output device can do
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputDeviceInfo {
    pub name: String,
    pub default_sample_rate: Option<u32>,
    pub default_channels: Option<u16>,
    /// Supported sample rate range, lowest to highest
    pub sample_rates: Vec<u32>,
    pub max_channels: u16,
}

impl OutputDeviceInfo {
    pub fn from_device(device: &cpal::Device) -> Self {
        #[allow(deprecated)]
        let name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let mut sample_rates = Vec::new();
        let mut max_channels = 0;
        if let Ok(configs) = device.supported_output_configs() {
            for config in configs {
                sample_rates.push(config.min_sample_rate());
                sample_rates.push(config.max_sample_rate());
                max_channels = max_channels.max(config.channels());
            }
        }
        sample_rates.sort_unstable();
        sample_rates.dedup();

        let default_config = device.default_output_config().ok();

        let info = Self {
            name,
            default_sample_rate: default_config.as_ref().map(|c| c.sample_rate()),
            default_channels: default_config.as_ref().map(|c| c.channels()),
            sample_rates,
            max_channels,
        };
        debug!("Probed output device: {}", info.name);
        info
    }

    /// Whether the device advertises the given rate
    pub fn supports_rate(&self, rate: u32) -> bool {
        match (self.sample_rates.first(), self.sample_rates.last()) {
            (Some(min), Some(max)) => (*min..=*max).contains(&rate),
            _ => false,
        }
    }
}

/// The host's default output device
pub fn default_output_device() -> Result<OutputDeviceInfo> {
    let host = cpal::default_host();
    debug!("Using audio host: {:?}", host.id());
    let device = host
        .default_output_device()
        .ok_or_else(|| StreamError::NoDevice("No default output device".to_string()))?;
    Ok(OutputDeviceInfo::from_device(&device))
}

/// Every output device the host reports
pub fn output_devices() -> Result<Vec<OutputDeviceInfo>> {
    info!("Enumerating output devices");
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| StreamError::Host(e.to_string()))?;

    let infos: Vec<OutputDeviceInfo> = devices
        .map(|device| OutputDeviceInfo::from_device(&device))
        .filter(|info| {
            let usable = info.max_channels > 0;
            if !usable {
                warn!("Skipping device without output configs: {}", info.name);
            }
            usable
        })
        .collect();

    info!("Found {} output devices", infos.len());
    Ok(infos)
}
