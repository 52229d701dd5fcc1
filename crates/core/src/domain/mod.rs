//! Domain entities and business rules

pub mod audio;
pub mod config;
pub mod dsp;
pub mod effects;
pub mod equalizer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-export specific items to avoid ambiguous glob imports
pub use audio::{
    lock_element, AudioContext, ContextFactory, ContextState, ElementId, Endpoint, FilterInfo,
    FilterKind, GraphError, MediaElement, MediaEvent, NodeId, SharedElement,
};
pub use config::{
    ConfigError, EngineSettings, EqualizerSettings, FadeSettings, PlayerSettings,
    SettingsStore, SettingsWatcher, CUSTOM_PRESET,
};
pub use dsp::*;
pub use effects::{
    AudioEffectsManager, EffectsState, RoutingTarget, MASTER_VOLUME_TIME_CONSTANT,
    SOFTWARE_FADE_STEPS,
};
pub use equalizer::{
    filter_info_for, filter_kind_for, EqPreset, EqualizerBand, UnknownPreset, BAND_COUNT,
    CANONICAL_FREQUENCIES,
};
