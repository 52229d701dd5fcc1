//! Playback mix and real-time output stream
//!
//! `PlaybackMix` is what the speakers hear: the element's direct output
//! (scaled by its native volume, silent while muted) plus whatever the live
//! effects graph renders. `OutputStream` pulls the mix from a CPAL output
//! callback.

use crate::audio::software::RenderTap;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig as CpalStreamConfig};
use crossbeam::channel::{bounded, Receiver};
use encore_core::domain::audio::{lock_element, SharedElement};
use encore_core::domain::config::EngineSettings;
use encore_core::domain::dsp::{amplitude_to_db, params};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub type Result<T> = std::result::Result<T, StreamError>;

/// Errors raised by the output side
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StreamError {
    #[error("Device not found: {0}")]
    NoDevice(String),

    #[error("Audio host error: {0}")]
    Host(String),

    #[error("Failed to build stream: {0}")]
    Build(String),

    #[error("Failed to start stream: {0}")]
    Play(String),
}

/// Peak and RMS of everything fed through it
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelMeter {
    peak: f32,
    sum_squares: f64,
    samples: u64,
}

impl LevelMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, block: &[f32]) {
        for sample in block {
            self.peak = self.peak.max(sample.abs());
            self.sum_squares += f64::from(*sample) * f64::from(*sample);
        }
        self.samples += block.len() as u64;
    }

    pub fn peak(&self) -> f32 {
        self.peak
    }

    pub fn rms(&self) -> f32 {
        if self.samples == 0 {
            0.0
        } else {
            (self.sum_squares / self.samples as f64).sqrt() as f32
        }
    }

    pub fn peak_db(&self) -> f32 {
        amplitude_to_db(self.peak)
    }

    pub fn rms_db(&self) -> f32 {
        amplitude_to_db(self.rms())
    }

    /// True when nothing above the dB floor has been seen
    pub fn is_silent(&self) -> bool {
        self.peak_db() <= params::DB_FLOOR
    }
}

/// Direct element playback summed with the effects graph output
pub struct PlaybackMix {
    element: SharedElement,
    tap: RenderTap,
    input: Vec<f32>,
    processed: Vec<f32>,
}

impl PlaybackMix {
    pub fn new(element: SharedElement, tap: RenderTap) -> Self {
        Self {
            element,
            tap,
            input: Vec::new(),
            processed: Vec::new(),
        }
    }

    /// Render one block with each path written separately
    ///
    /// The element is read once; its block feeds both paths.
    pub fn render_paths(&mut self, direct: &mut [f32], processed: &mut [f32]) {
        self.input.resize(direct.len(), 0.0);
        let gain = {
            let mut element = lock_element(&self.element);
            element.read_frames(&mut self.input);
            if element.muted() {
                0.0
            } else {
                element.volume()
            }
        };

        for (out, sample) in direct.iter_mut().zip(&self.input) {
            *out = sample * gain;
        }
        self.tap.render(&self.input, processed);
    }

    /// Render one mixed block
    pub fn render(&mut self, out: &mut [f32]) {
        let mut processed = std::mem::take(&mut self.processed);
        processed.resize(out.len(), 0.0);
        self.render_paths(out, &mut processed);
        for (sample, wet) in out.iter_mut().zip(&processed) {
            *sample += wet;
        }
        self.processed = processed;
    }
}

/// Output stream parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer_size: u32,
}

impl From<&EngineSettings> for OutputConfig {
    fn from(engine: &EngineSettings) -> Self {
        Self {
            sample_rate: engine.sample_rate,
            channels: engine.channels,
            buffer_size: engine.buffer_size,
        }
    }
}

/// Real-time output stream driving a [`PlaybackMix`]
pub struct OutputStream {
    _stream: Stream,
    config: OutputConfig,
    device_name: String,
    errors: Receiver<String>,
}

impl OutputStream {
    /// Open the default output device and start pulling `mix`
    pub fn start(mix: PlaybackMix, config: OutputConfig) -> Result<Self> {
        info!("Creating output stream: config={:?}", config);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| StreamError::NoDevice("No default output device".to_string()))?;
        #[allow(deprecated)]
        let device_name = device
            .name()
            .unwrap_or_else(|_| "Unknown Device".to_string());

        let mix = Arc::new(Mutex::new(mix));
        let (err_tx, errors) = bounded(16);

        let fixed = CpalStreamConfig {
            channels: config.channels,
            sample_rate: config.sample_rate,
            buffer_size: cpal::BufferSize::Fixed(config.buffer_size),
        };
        let build = |cpal_config: &CpalStreamConfig| {
            let mix = Arc::clone(&mix);
            let err_tx = err_tx.clone();
            device.build_output_stream(
                cpal_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    mix.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .render(data);
                },
                move |err| {
                    error!("Output stream error: {}", err);
                    let _ = err_tx.try_send(err.to_string());
                },
                None,
            )
        };

        let stream = match build(&fixed) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(
                    buffer_size = config.buffer_size,
                    "Fixed buffer size rejected ({}), using device default", e
                );
                let flexible = CpalStreamConfig {
                    buffer_size: cpal::BufferSize::Default,
                    ..fixed
                };
                build(&flexible).map_err(|e| StreamError::Build(e.to_string()))?
            }
        };

        stream
            .play()
            .map_err(|e| StreamError::Play(e.to_string()))?;

        debug!(device = %device_name, "Output stream started");
        Ok(Self {
            _stream: stream,
            config,
            device_name,
            errors,
        })
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Errors reported by the stream since the last call
    pub fn take_errors(&self) -> Vec<String> {
        self.errors.try_iter().collect()
    }
}
