//! Encore CLI Application

mod commands;

use clap::{Parser, Subcommand, ValueEnum};
use encore_core::domain::config::SettingsStore;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Equalizer, normalization and volume for the player's audio", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Settings directory (defaults to the user config directory)
    #[arg(long, global = true, value_name = "DIR")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List equalizer presets
    Presets {
        #[arg(long)]
        json: bool,
    },

    /// Inspect or edit persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Render a test signal through the effects chain and report levels
    Render {
        /// Equalizer preset
        #[arg(long, default_value = "flat")]
        preset: String,

        /// Signal length in seconds
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,

        /// Route through the normalization compressor
        #[arg(long)]
        normalize: bool,

        /// Master volume in [0, 1]
        #[arg(long, default_value_t = 1.0)]
        volume: f32,

        #[arg(long)]
        json: bool,
    },

    /// Play a demo tone through the default output device
    Play {
        #[arg(long, default_value_t = 5.0)]
        seconds: f32,

        /// Override the persisted preset
        #[arg(long)]
        preset: Option<String>,
    },

    /// List output devices
    Devices {
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Print the current settings
    Show {
        #[arg(long)]
        json: bool,
    },
    /// Restore factory defaults
    Reset,
    /// Load a preset's gains
    SetPreset {
        name: String,
        /// Store the equalizer as disabled
        #[arg(long)]
        disable: bool,
    },
    /// Set one band's gain in dB
    SetGain { band: usize, gain: f32 },
    /// Set the master volume in [0, 1]
    SetVolume { volume: f32 },
    /// Turn normalization on or off
    Normalization { state: Toggle },
    /// Print settings whenever the file changes
    Watch,
}

#[derive(Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl From<Toggle> for bool {
    fn from(toggle: Toggle) -> Self {
        matches!(toggle, Toggle::On)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::debug!("Encore starting");

    let config_dir = match cli.config {
        Some(dir) => dir,
        None => SettingsStore::default_config_dir()?,
    };
    let store = SettingsStore::new(config_dir);

    match cli.command {
        Command::Presets { json } => commands::presets(json),
        Command::Settings { action } => match action {
            SettingsAction::Show { json } => commands::show_settings(&store, json).await,
            SettingsAction::Reset => commands::reset_settings(&store).await,
            SettingsAction::SetPreset { name, disable } => {
                commands::set_preset(&store, &name, !disable).await
            }
            SettingsAction::SetGain { band, gain } => commands::set_gain(&store, band, gain).await,
            SettingsAction::SetVolume { volume } => commands::set_volume(&store, volume).await,
            SettingsAction::Normalization { state } => {
                commands::set_normalization(&store, state.into()).await
            }
            SettingsAction::Watch => commands::watch_settings(&store).await,
        },
        Command::Render {
            preset,
            seconds,
            normalize,
            volume,
            json,
        } => {
            let request = commands::RenderRequest {
                preset,
                seconds,
                normalize,
                volume,
            };
            commands::render(&store, request, json).await
        }
        Command::Play { seconds, preset } => commands::play(&store, seconds, preset).await,
        Command::Devices { json } => commands::devices(json),
    }
}
