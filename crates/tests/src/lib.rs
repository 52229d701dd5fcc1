//! Shared fixtures for the cross-crate integration tests

use encore_core::domain::audio::{lock_element, MediaElement, NodeId, SharedElement};
use encore_core::domain::effects::AudioEffectsManager;
use encore_core::domain::equalizer::{EqualizerBand, CANONICAL_FREQUENCIES};
use encore_core::domain::testing::{FailurePlan, Journal, RecordedNode, RecordingFactory};
use encore_infra::audio::{
    Clip, LevelMeter, MemoryElement, PlaybackMix, RenderTap, SoftwareContextFactory,
    SoftwareContextOptions, UserActivation,
};

pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 2;
pub const BLOCK_FRAMES: usize = 512;

// ============================================================================
// RECORDING CONTEXT
// ============================================================================

pub fn recording_manager(plan: FailurePlan) -> (AudioEffectsManager, Journal) {
    let journal = Journal::new(plan);
    let manager = AudioEffectsManager::new(RecordingFactory::new(journal.clone()));
    (manager, journal)
}

pub fn unsupported() -> FailurePlan {
    FailurePlan {
        unsupported: true,
        ..Default::default()
    }
}

/// Node handles of the live graph, looked up by kind
pub struct GraphNodes {
    pub source: NodeId,
    pub filters: Vec<NodeId>,
    pub compressor: NodeId,
    pub master: NodeId,
}

impl GraphNodes {
    pub fn find(journal: &Journal) -> Option<Self> {
        let first = |nodes: Vec<NodeId>| nodes.first().copied();
        Some(Self {
            source: first(journal.nodes_where(|n| matches!(n, RecordedNode::Source(_))))?,
            filters: journal.nodes_where(|n| matches!(n, RecordedNode::Filter(_))),
            compressor: first(journal.nodes_where(|n| matches!(n, RecordedNode::Compressor(_))))?,
            master: first(journal.nodes_where(|n| matches!(n, RecordedNode::Gain(_))))?,
        })
    }

    /// Last node of the equalizer chain
    pub fn tail(&self) -> NodeId {
        self.filters.last().copied().unwrap_or(self.source)
    }
}

pub fn bands_from(gains: &[f32]) -> Vec<EqualizerBand> {
    CANONICAL_FREQUENCIES
        .iter()
        .zip(gains)
        .map(|(freq, gain)| EqualizerBand::new(*freq, *gain))
        .collect()
}

// ============================================================================
// SOFTWARE PLAYBACK
// ============================================================================

/// Manager over software contexts, with the tap and activation it uses
pub struct SoftwarePlayer {
    pub manager: AudioEffectsManager,
    pub tap: RenderTap,
    pub activation: UserActivation,
}

impl SoftwarePlayer {
    pub fn new(autoplay_allowed: bool) -> Self {
        let options = SoftwareContextOptions {
            sample_rate: SAMPLE_RATE,
            channels: CHANNELS,
            autoplay_allowed,
            require_output_device: false,
        };
        let factory = SoftwareContextFactory::new(options);
        let tap = factory.tap();
        let activation = factory.activation();
        Self {
            manager: AudioEffectsManager::new(factory),
            tap,
            activation,
        }
    }

    pub fn mix(&self, element: &SharedElement) -> PlaybackMix {
        PlaybackMix::new(element.clone(), self.tap.clone())
    }
}

/// A playing element loaded with a sum of tones
pub fn playing_tones(frequencies: &[f32], amplitude: f32, seconds: f32) -> SharedElement {
    let clip = Clip::tones(frequencies, seconds, SAMPLE_RATE, CHANNELS, amplitude);
    let mut element = MemoryElement::new(SAMPLE_RATE, CHANNELS);
    element.register("tones", clip);
    element.set_src("tones");
    element.play();
    element.into_shared().1
}

/// Levels of each path over `blocks` blocks, ignoring the first `skip`
pub fn measure(mix: &mut PlaybackMix, skip: usize, blocks: usize) -> (LevelMeter, LevelMeter) {
    let len = BLOCK_FRAMES * CHANNELS as usize;
    let mut direct = vec![0.0; len];
    let mut processed = vec![0.0; len];
    let (mut direct_meter, mut processed_meter) = (LevelMeter::new(), LevelMeter::new());

    for block in 0..skip + blocks {
        mix.render_paths(&mut direct, &mut processed);
        if block >= skip {
            direct_meter.update(&direct);
            processed_meter.update(&processed);
        }
    }
    (direct_meter, processed_meter)
}

/// Blocks covering `seconds` of audio
pub fn blocks_for(seconds: f64) -> usize {
    (seconds * f64::from(SAMPLE_RATE) / BLOCK_FRAMES as f64).ceil() as usize
}

pub fn is_muted(element: &SharedElement) -> bool {
    lock_element(element).muted()
}
