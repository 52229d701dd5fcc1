//! Audio graph and media element contracts
//!
//! This module defines the platform-agnostic interfaces the effects manager
//! drives. Implementations (a software DSP context, in-memory media
//! elements) live in the `infra` crate.

use crate::domain::dsp::{CompressorParams, ParamEvent};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors raised by an audio context while building or routing a graph
///
/// The effects manager never surfaces these to its callers; they are logged
/// and turned into a fallback to direct element playback.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GraphError {
    /// The audio-processing API is not available in this environment
    #[error("Audio processing unsupported: {0}")]
    Unsupported(String),

    /// Node or context creation failed
    #[error("Graph construction failed: {0}")]
    Construction(String),

    /// Connecting or disconnecting nodes failed
    #[error("Routing failed: {0}")]
    Routing(String),

    /// A suspended context refused to resume
    #[error("Context resume failed: {0}")]
    Resume(String),

    /// The node handle does not belong to this context
    #[error("Unknown node: {0}")]
    UnknownNode(NodeId),

    /// The context has been closed
    #[error("Audio context is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// Handle to a node inside one audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Where a node's output is connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Node(NodeId),
    /// The context's output (speakers)
    Destination,
}

/// Running state of an audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextState {
    Suspended,
    Running,
    Closed,
}

/// Biquad response used by an equalizer band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterKind {
    LowShelf,
    Peaking,
    HighShelf,
}

impl FilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterKind::LowShelf => "low-shelf",
            FilterKind::Peaking => "peaking",
            FilterKind::HighShelf => "high-shelf",
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of a filter node, as configured or read back
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterInfo {
    pub kind: FilterKind,
    pub frequency: f32,
    pub q: f32,
    pub gain_db: f32,
}

/// Identity of a media element
///
/// Attach idempotency is decided on this id, not on the handle pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId(u64);

impl ElementId {
    /// Allocate a process-unique element id
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

/// Lifecycle events emitted by a media element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaEvent {
    MetadataReady { duration_secs: f64 },
    Ended,
}

/// A playable media handle owned by the surrounding player
///
/// The effects chain never assigns sources or starts playback; it only
/// toggles `muted` and writes `volume`.
pub trait MediaElement: Send {
    /// Stable identity of this element
    fn id(&self) -> ElementId;

    fn src(&self) -> Option<&str>;
    fn set_src(&mut self, src: &str);

    /// Playback position in seconds
    fn current_time(&self) -> f64;
    fn set_current_time(&mut self, seconds: f64);

    fn play(&mut self);
    fn pause(&mut self);
    fn is_paused(&self) -> bool;

    /// Native volume in [0, 1]
    fn volume(&self) -> f32;
    fn set_volume(&mut self, volume: f32);

    fn muted(&self) -> bool;
    fn set_muted(&mut self, muted: bool);

    /// Pull the next block of decoded, interleaved samples
    ///
    /// Returns the number of samples written. Elements that cannot expose
    /// their decoded audio return 0.
    fn read_frames(&mut self, _out: &mut [f32]) -> usize {
        0
    }

    /// Drain lifecycle events queued since the last call
    fn take_events(&mut self) -> Vec<MediaEvent> {
        Vec::new()
    }
}

/// Media element shared between the player and the effects chain
pub type SharedElement = Arc<Mutex<dyn MediaElement>>;

/// Lock a shared element, recovering the guard if a holder panicked
pub fn lock_element(element: &SharedElement) -> MutexGuard<'_, dyn MediaElement + 'static> {
    element.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An audio-processing context: node factory, router and clock
///
/// Every fallible call reports through [`GraphError`]; the caller decides
/// how to degrade.
pub trait AudioContext: Send {
    fn state(&self) -> ContextState;

    /// Resume a suspended context
    fn resume(&mut self) -> Result<()>;

    /// Close the context and release every node
    fn close(&mut self) -> Result<()>;

    /// Context clock in seconds
    fn current_time(&self) -> f64;

    fn sample_rate(&self) -> u32;

    /// Wrap a media element in a source node
    ///
    /// A given element can only be wrapped once per context.
    fn create_media_source(&mut self, element: &SharedElement) -> Result<NodeId>;

    fn create_filter(&mut self, info: FilterInfo) -> Result<NodeId>;

    fn create_compressor(&mut self, params: CompressorParams) -> Result<NodeId>;

    fn create_gain(&mut self, initial: f32) -> Result<NodeId>;

    fn connect(&mut self, from: NodeId, to: Endpoint) -> Result<()>;

    /// Remove every outgoing connection of `node`
    fn disconnect(&mut self, node: NodeId) -> Result<()>;

    /// Drop a node; its connections go with it
    fn release(&mut self, node: NodeId) -> Result<()>;

    fn set_filter_gain(&mut self, node: NodeId, gain_db: f32) -> Result<()>;

    /// Add an automation event to a gain node's parameter
    fn schedule_gain(&mut self, node: NodeId, event: ParamEvent) -> Result<()>;

    /// Drop scheduled events at or after `time` and hold the value the
    /// parameter has at `time`
    fn cancel_and_hold(&mut self, node: NodeId, time: f64) -> Result<()>;

    fn filter_info(&self, node: NodeId) -> Option<FilterInfo>;

    /// Gain parameter value at the current context time
    fn gain_value(&self, node: NodeId) -> Option<f32>;
}

/// Creates audio contexts on demand
pub trait ContextFactory: Send {
    fn create(&mut self) -> Result<Box<dyn AudioContext>>;
}

impl<F> ContextFactory for F
where
    F: FnMut() -> Result<Box<dyn AudioContext>> + Send,
{
    fn create(&mut self) -> Result<Box<dyn AudioContext>> {
        self()
    }
}
