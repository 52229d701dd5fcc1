//! Subcommand handlers

use anyhow::{bail, Context};
use encore_core::domain::audio::{lock_element, MediaElement, SharedElement};
use encore_core::domain::config::{PlayerSettings, SettingsStore, SettingsWatcher};
use encore_core::domain::effects::AudioEffectsManager;
use encore_core::domain::equalizer::{EqPreset, BAND_COUNT, CANONICAL_FREQUENCIES};
use encore_infra::audio::{
    output_devices, Clip, LevelMeter, MemoryElement, OutputConfig, OutputStream, PlaybackMix,
    SoftwareContextFactory, SoftwareContextOptions,
};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Tones spanning the low, mid and high bands
const TEST_TONES: [f32; 3] = [80.0, 1000.0, 8000.0];
const TEST_SIGNAL: &str = "test-signal";

#[derive(Serialize)]
struct PresetView {
    name: &'static str,
    gains: [f32; BAND_COUNT],
}

pub fn presets(json: bool) -> anyhow::Result<()> {
    if json {
        let views: Vec<PresetView> = EqPreset::ALL
            .iter()
            .map(|preset| PresetView {
                name: preset.name(),
                gains: preset.gains(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&views)?);
        return Ok(());
    }

    let header: Vec<String> = CANONICAL_FREQUENCIES
        .iter()
        .map(|f| format_frequency(*f))
        .collect();
    println!("{:<14}{}", "preset", header.join(""));
    for preset in EqPreset::ALL {
        let gains: Vec<String> = preset.gains().iter().map(|g| format!("{g:>6.1}")).collect();
        println!("{:<14}{}", preset.name(), gains.join(""));
    }
    Ok(())
}

fn format_frequency(hz: f32) -> String {
    if hz >= 1000.0 {
        format!("{:>6}", format!("{}k", hz / 1000.0))
    } else {
        format!("{hz:>6}")
    }
}

pub async fn show_settings(store: &SettingsStore, json: bool) -> anyhow::Result<()> {
    let settings = store.load().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        println!("# {}", store.settings_path().display());
        print!("{}", toml::to_string_pretty(&settings)?);
    }
    Ok(())
}

pub async fn reset_settings(store: &SettingsStore) -> anyhow::Result<()> {
    store.clear().await?;
    store.save(&PlayerSettings::factory_default()).await?;
    info!("Settings reset to factory defaults");
    Ok(())
}

async fn update_settings(
    store: &SettingsStore,
    edit: impl FnOnce(&mut PlayerSettings) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut settings = store.load().await;
    edit(&mut settings)?;
    store
        .save(&settings)
        .await
        .with_context(|| format!("Failed to save {}", store.settings_path().display()))
}

pub async fn set_preset(store: &SettingsStore, name: &str, enabled: bool) -> anyhow::Result<()> {
    let preset: EqPreset = name.parse()?;
    update_settings(store, |settings| {
        settings.equalizer.apply_preset(preset);
        settings.equalizer.enabled = enabled;
        Ok(())
    })
    .await?;
    info!(%preset, enabled, "Equalizer preset stored");
    Ok(())
}

pub async fn set_gain(store: &SettingsStore, band: usize, gain: f32) -> anyhow::Result<()> {
    update_settings(store, |settings| {
        settings.equalizer.set_gain(band, gain)?;
        Ok(())
    })
    .await
}

pub async fn set_volume(store: &SettingsStore, volume: f32) -> anyhow::Result<()> {
    if !(0.0..=1.0).contains(&volume) {
        bail!("Volume must be between 0 and 1, got {volume}");
    }
    update_settings(store, |settings| {
        settings.volume = volume;
        Ok(())
    })
    .await
}

pub async fn set_normalization(store: &SettingsStore, enabled: bool) -> anyhow::Result<()> {
    update_settings(store, |settings| {
        settings.normalization = enabled;
        Ok(())
    })
    .await
}

pub async fn watch_settings(store: &SettingsStore) -> anyhow::Result<()> {
    let watcher = SettingsWatcher::new(store).await?;
    let mut changes = watcher.subscribe();
    println!("Watching {} (Ctrl-C to stop)", store.settings_path().display());

    loop {
        tokio::select! {
            change = changes.recv() => match change {
                Ok(path) => {
                    let settings = store.load().await;
                    println!(
                        "{}: preset={} enabled={} normalization={} volume={:.2}",
                        path.display(),
                        settings.equalizer.preset,
                        settings.equalizer.enabled,
                        settings.normalization,
                        settings.volume
                    );
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Missed settings changes"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

/// Parameters of an offline render
pub struct RenderRequest {
    pub preset: String,
    pub seconds: f32,
    pub normalize: bool,
    pub volume: f32,
}

#[derive(Serialize)]
struct PathLevels {
    peak_db: f32,
    rms_db: f32,
}

impl From<&LevelMeter> for PathLevels {
    fn from(meter: &LevelMeter) -> Self {
        Self {
            peak_db: meter.peak_db(),
            rms_db: meter.rms_db(),
        }
    }
}

#[derive(Serialize)]
struct RenderReport {
    preset: EqPreset,
    normalization: bool,
    volume: f32,
    state: String,
    input: PathLevels,
    direct: PathLevels,
    processed: PathLevels,
}

fn test_element(settings: &PlayerSettings, seconds: f32) -> (Clip, SharedElement) {
    let engine = &settings.engine;
    let clip = Clip::tones(&TEST_TONES, seconds, engine.sample_rate, engine.channels, 0.8);
    let mut element = MemoryElement::new(engine.sample_rate, engine.channels);
    element.register(TEST_SIGNAL, clip.clone());
    element.set_src(TEST_SIGNAL);
    element.play();
    (clip, element.into_shared().1)
}

pub async fn render(
    store: &SettingsStore,
    request: RenderRequest,
    json: bool,
) -> anyhow::Result<()> {
    let preset: EqPreset = request.preset.parse()?;
    if !(request.seconds.is_finite() && request.seconds > 0.0) {
        bail!("Render length must be positive, got {}", request.seconds);
    }

    let settings = store.load().await;
    let options = SoftwareContextOptions {
        autoplay_allowed: true,
        ..SoftwareContextOptions::from(&settings.engine)
    };
    let factory = SoftwareContextFactory::new(options);
    let tap = factory.tap();

    let mut manager = AudioEffectsManager::new(factory);
    manager.apply_preset(preset, true);
    manager.set_normalization(request.normalize);
    manager.set_master_volume(request.volume);

    let (clip, element) = test_element(&settings, request.seconds);
    manager.attach_audio_element(element.clone());

    let block = settings.engine.buffer_size as usize * usize::from(settings.engine.channels);
    let mut mix = PlaybackMix::new(element.clone(), tap);
    let mut direct = vec![0.0; block];
    let mut processed = vec![0.0; block];
    let (mut direct_meter, mut processed_meter) = (LevelMeter::new(), LevelMeter::new());

    let max_blocks = clip.samples.len() / block.max(1) + 2;
    for _ in 0..max_blocks {
        mix.render_paths(&mut direct, &mut processed);
        direct_meter.update(&direct);
        processed_meter.update(&processed);
        if lock_element(&element).is_paused() {
            break;
        }
    }

    let mut input_meter = LevelMeter::new();
    input_meter.update(&clip.samples);

    let report = RenderReport {
        preset,
        normalization: request.normalize,
        volume: manager.volume(),
        state: manager.state().to_string(),
        input: (&input_meter).into(),
        direct: (&direct_meter).into(),
        processed: (&processed_meter).into(),
    };
    manager.detach();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "preset={} normalization={} volume={:.2} state={}",
            report.preset, report.normalization, report.volume, report.state
        );
        for (name, levels) in [
            ("input", &report.input),
            ("direct", &report.direct),
            ("processed", &report.processed),
        ] {
            println!(
                "{name:<10} peak {:>7.1} dBFS   rms {:>7.1} dBFS",
                levels.peak_db, levels.rms_db
            );
        }
    }
    Ok(())
}

pub async fn play(
    store: &SettingsStore,
    seconds: f32,
    preset: Option<String>,
) -> anyhow::Result<()> {
    if !(seconds.is_finite() && seconds > 0.0) {
        bail!("Playback length must be positive, got {seconds}");
    }

    let mut settings = store.load().await;
    if let Some(name) = preset {
        settings.equalizer.apply_preset(name.parse()?);
    }

    let options = SoftwareContextOptions {
        require_output_device: true,
        ..SoftwareContextOptions::from(&settings.engine)
    };
    let factory = SoftwareContextFactory::new(options);
    let tap = factory.tap();
    // Running the command is the user's gesture
    factory.activation().grant();

    let mut manager = AudioEffectsManager::new(factory);
    manager.apply_settings(&settings);
    let target = manager.volume();
    manager.set_master_volume(0.0);

    let (_, element) = test_element(&settings, seconds);
    manager.attach_audio_element(element.clone());
    info!(state = %manager.state(), "Effects chain ready");

    let stream = OutputStream::start(
        PlaybackMix::new(element.clone(), tap),
        OutputConfig::from(&settings.engine),
    )?;
    info!(device = stream.device_name(), "Playing demo tone");

    let fade = f64::from(settings.fade.duration_secs.min(seconds / 2.0));
    manager.fade_to(target, fade, Some(element.clone())).await;
    manager.set_master_volume(target);

    let hold = f64::from(seconds) - 2.0 * fade;
    tokio::time::sleep(Duration::from_secs_f64(hold.max(0.0))).await;

    manager.fade_to(0.0, fade, Some(element.clone())).await;

    for error in stream.take_errors() {
        warn!("Stream reported: {}", error);
    }
    drop(stream);
    manager.detach();
    Ok(())
}

pub fn devices(json: bool) -> anyhow::Result<()> {
    let devices = output_devices()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No output devices found");
    }
    for device in devices {
        let rate = device
            .default_sample_rate
            .map_or_else(|| "?".to_string(), |r| r.to_string());
        println!(
            "{}  (default {} Hz, up to {} channels)",
            device.name, rate, device.max_channels
        );
    }
    Ok(())
}
