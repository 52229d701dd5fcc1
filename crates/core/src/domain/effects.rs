//! Audio effects chain attached to a single media element
//!
//! The manager routes one playing element through a ten-band equalizer, an
//! optional normalization compressor and a master gain stage:
//!
//! ```text
//! source -> band[0] -> ... -> band[n-1] -+-> compressor -+-> master gain -> destination
//!                                        +---------------+
//! ```
//!
//! Whenever the graph cannot be verified active the raw element is left
//! unmuted, so the listener always hears direct playback rather than nothing.

use crate::domain::audio::{
    lock_element, AudioContext, ContextFactory, ContextState, ElementId, Endpoint, FilterInfo,
    GraphError, NodeId, Result, SharedElement,
};
use crate::domain::config::PlayerSettings;
use crate::domain::dsp::{CompressorParams, ParamEvent};
use crate::domain::equalizer::{filter_info_for, EqPreset, EqualizerBand};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Smoothing time constant for master volume changes, in seconds
pub const MASTER_VOLUME_TIME_CONSTANT: f64 = 0.015;

/// Number of discrete volume steps in a software fade
pub const SOFTWARE_FADE_STEPS: u32 = 20;

/// Lifecycle state of the effects chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EffectsState {
    Unattached,
    Attaching,
    /// Graph wired and context running; element muted
    Active,
    /// Direct element playback; element unmuted
    DegradedFallback,
}

impl fmt::Display for EffectsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EffectsState::Unattached => "unattached",
            EffectsState::Attaching => "attaching",
            EffectsState::Active => "active",
            EffectsState::DegradedFallback => "degraded-fallback",
        };
        f.write_str(name)
    }
}

/// Node that follows the filter chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingTarget {
    /// Filters feed the compressor, which feeds the master gain
    Compressor,
    /// Filters feed the master gain directly
    Direct,
}

impl RoutingTarget {
    pub fn for_normalization(enabled: bool) -> Self {
        if enabled {
            RoutingTarget::Compressor
        } else {
            RoutingTarget::Direct
        }
    }
}

/// Nodes built inside one audio context
struct EffectsGraph {
    context: Box<dyn AudioContext>,
    source: Option<NodeId>,
    filters: Vec<NodeId>,
    compressor: Option<NodeId>,
    master_gain: Option<NodeId>,
    routing: Option<RoutingTarget>,
}

impl EffectsGraph {
    fn new(context: Box<dyn AudioContext>) -> Self {
        Self {
            context,
            source: None,
            filters: Vec::new(),
            compressor: None,
            master_gain: None,
            routing: None,
        }
    }

    /// Wired end to end with a running clock
    fn is_live(&self) -> bool {
        self.source.is_some()
            && self.master_gain.is_some()
            && self.routing.is_some()
            && self.context.state() == ContextState::Running
    }

    /// Create whatever nodes are missing and wire the chain
    fn build(
        &mut self,
        element: &SharedElement,
        bands: &[EqualizerBand],
        enabled: bool,
        volume: f32,
        target: RoutingTarget,
    ) -> Result<()> {
        if self.source.is_none() {
            self.source = Some(self.context.create_media_source(element)?);
        }
        if self.compressor.is_none() {
            let params = CompressorParams::normalization();
            self.compressor = Some(self.context.create_compressor(params)?);
        }
        if self.master_gain.is_none() {
            let gain = self.context.create_gain(volume)?;
            self.master_gain = Some(gain);
            self.context.connect(gain, Endpoint::Destination)?;
        }

        if self.filters.len() == bands.len() {
            self.patch_gains(bands, enabled)?;
            self.wire_chain()?;
        } else {
            self.rebuild_filters(bands, enabled)?;
        }
        self.route(target)?;

        match self.context.state() {
            ContextState::Running => Ok(()),
            ContextState::Suspended => self.context.resume(),
            ContextState::Closed => Err(GraphError::Closed),
        }
    }

    /// Replace every band filter and rewire the chain
    fn rebuild_filters(&mut self, bands: &[EqualizerBand], enabled: bool) -> Result<()> {
        debug!(
            old = self.filters.len(),
            new = bands.len(),
            "Rebuilding equalizer chain"
        );
        self.routing = None;
        for node in std::mem::take(&mut self.filters) {
            if let Err(e) = self.context.release(node) {
                debug!(node = %node, error = %e, "Failed to release filter");
            }
        }

        let count = bands.len();
        for (index, band) in bands.iter().enumerate() {
            let node = self
                .context
                .create_filter(filter_info_for(index, count, band, enabled))?;
            self.filters.push(node);
        }
        self.wire_chain()
    }

    fn patch_gains(&mut self, bands: &[EqualizerBand], enabled: bool) -> Result<()> {
        for (node, band) in self.filters.iter().zip(bands) {
            self.context
                .set_filter_gain(*node, band.effective_gain(enabled))?;
        }
        Ok(())
    }

    /// Connect source -> band[0] -> ... -> band[n-1]
    ///
    /// Disconnecting the tail drops the routing edge, so routing is cleared.
    fn wire_chain(&mut self) -> Result<()> {
        let source = self.source.ok_or_else(|| missing("source"))?;
        self.routing = None;

        let mut upstream = source;
        for &filter in &self.filters {
            self.context.disconnect(upstream)?;
            self.context.connect(upstream, Endpoint::Node(filter))?;
            upstream = filter;
        }
        Ok(())
    }

    fn tail(&self) -> Option<NodeId> {
        self.filters.last().copied().or(self.source)
    }

    /// Point the chain tail at the compressor or the master gain
    fn route(&mut self, target: RoutingTarget) -> Result<()> {
        if self.routing == Some(target) {
            trace!(?target, "Routing unchanged");
            return Ok(());
        }

        let tail = self.tail().ok_or_else(|| missing("source"))?;
        let compressor = self.compressor.ok_or_else(|| missing("compressor"))?;
        let master = self.master_gain.ok_or_else(|| missing("master gain"))?;

        self.routing = None;
        self.context.disconnect(tail)?;
        self.context.disconnect(compressor)?;
        match target {
            RoutingTarget::Compressor => {
                self.context.connect(tail, Endpoint::Node(compressor))?;
                self.context.connect(compressor, Endpoint::Node(master))?;
            }
            RoutingTarget::Direct => {
                self.context.connect(tail, Endpoint::Node(master))?;
            }
        }
        self.routing = Some(target);
        debug!(?target, "Signal routed");
        Ok(())
    }

    /// Cancel pending automation on the master gain and schedule `event`
    /// relative to the current context time
    fn automate_master(&mut self, event: impl FnOnce(f64) -> ParamEvent) -> Result<()> {
        let master = self.master_gain.ok_or_else(|| missing("master gain"))?;
        let now = self.context.current_time();
        self.context.cancel_and_hold(master, now)?;
        self.context.schedule_gain(master, event(now))
    }

    fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.source
            .into_iter()
            .chain(self.filters.iter().copied())
            .chain(self.compressor)
            .chain(self.master_gain)
    }

    fn teardown(mut self) {
        let nodes: Vec<NodeId> = self.nodes().collect();
        for node in nodes {
            if let Err(e) = self
                .context
                .disconnect(node)
                .and_then(|_| self.context.release(node))
            {
                debug!(node = %node, error = %e, "Failed to release node");
            }
        }
        if let Err(e) = self.context.close() {
            warn!(error = %e, "Failed to close audio context");
        }
    }
}

fn missing(what: &str) -> GraphError {
    GraphError::Construction(format!("{what} node missing"))
}

/// How a fade completes once scheduled
enum FadePlan {
    Immediate,
    /// Ramp scheduled on the graph; wait for it to finish
    Ramp(Duration),
    /// Step the element's native volume
    Steps {
        element: SharedElement,
        from: f32,
        to: f32,
        duration: Duration,
        generation: u64,
        current: Arc<AtomicU64>,
    },
}

impl FadePlan {
    async fn run(self) {
        match self {
            FadePlan::Immediate => {}
            FadePlan::Ramp(duration) => tokio::time::sleep(duration).await,
            FadePlan::Steps {
                element,
                from,
                to,
                duration,
                generation,
                current,
            } => {
                let step = duration / SOFTWARE_FADE_STEPS;
                for i in 1..=SOFTWARE_FADE_STEPS {
                    tokio::time::sleep(step).await;
                    if current.load(Ordering::SeqCst) != generation {
                        debug!(generation, "Software fade superseded");
                        return;
                    }
                    let progress = i as f32 / SOFTWARE_FADE_STEPS as f32;
                    lock_element(&element).set_volume(from + (to - from) * progress);
                }
            }
        }
    }
}

fn clamp_volume(volume: f32) -> Option<f32> {
    volume.is_finite().then(|| volume.clamp(0.0, 1.0))
}

fn fade_duration(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}

/// Owns the effects graph for the application's playing element
///
/// All operations are infallible to the caller. Graph errors are logged and
/// turn into direct element playback.
pub struct AudioEffectsManager {
    factory: Box<dyn ContextFactory>,
    graph: Option<EffectsGraph>,
    element: Option<SharedElement>,
    element_id: Option<ElementId>,
    attach_attempted: bool,
    state: EffectsState,
    bands: Vec<EqualizerBand>,
    eq_enabled: bool,
    normalization: bool,
    volume: f32,
    fade_generation: Arc<AtomicU64>,
}

impl AudioEffectsManager {
    pub fn new(factory: impl ContextFactory + 'static) -> Self {
        Self {
            factory: Box::new(factory),
            graph: None,
            element: None,
            element_id: None,
            attach_attempted: false,
            state: EffectsState::Unattached,
            bands: EqualizerBand::flat(),
            eq_enabled: true,
            normalization: false,
            volume: 1.0,
            fade_generation: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Route `element` through the effects chain
    ///
    /// Re-attaching the element that is already active does nothing. A
    /// different element replaces the current one and its graph.
    pub fn attach_audio_element(&mut self, element: SharedElement) {
        let id = lock_element(&element).id();
        if self.element_id == Some(id) && self.is_active() {
            trace!(element = %id, "Element already attached");
            return;
        }
        if self.element_id.is_some_and(|current| current != id) {
            debug!(element = %id, "Replacing attached element");
            self.detach();
        }

        info!(element = %id, "Attaching effects chain");
        self.element = Some(element.clone());
        self.element_id = Some(id);
        self.attach_attempted = true;
        self.state = EffectsState::Attaching;

        lock_element(&element).set_volume(self.volume);
        if let Err(e) = self.build_graph(&element) {
            warn!(element = %id, error = %e, "Effects graph unavailable, using direct playback");
        }
        self.enforce_output_policy();
    }

    fn build_graph(&mut self, element: &SharedElement) -> Result<()> {
        if let Some(graph) = self.graph.take() {
            if graph.context.state() == ContextState::Closed {
                debug!("Audio context closed, creating a new one");
                graph.teardown();
            } else {
                self.graph = Some(graph);
            }
        }

        if self.graph.is_none() {
            self.graph = Some(EffectsGraph::new(self.factory.create()?));
        }
        let Some(graph) = self.graph.as_mut() else {
            return Err(GraphError::Construction("no audio context".to_string()));
        };
        graph.build(
            element,
            &self.bands,
            self.eq_enabled,
            self.volume,
            RoutingTarget::for_normalization(self.normalization),
        )
    }

    /// Tear down the graph and restore direct, unmuted playback
    pub fn detach(&mut self) {
        self.fade_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(element) = &self.element {
            lock_element(element).set_muted(false);
        }
        if let Some(graph) = self.graph.take() {
            info!("Tearing down effects graph");
            graph.teardown();
        }
        self.element = None;
        self.element_id = None;
        self.attach_attempted = false;
        self.state = EffectsState::Unattached;
    }

    /// Apply band gains; disabled bands are written as 0 dB
    ///
    /// A different band count rebuilds the filter chain, otherwise gains are
    /// patched in place.
    pub fn set_equalizer(&mut self, bands: &[EqualizerBand], enabled: bool) {
        self.bands = bands
            .iter()
            .map(|band| EqualizerBand::new(band.frequency, band.gain))
            .collect();
        self.eq_enabled = enabled;

        let target = RoutingTarget::for_normalization(self.normalization);
        if let Some(graph) = self.graph.as_mut().filter(|g| g.source.is_some()) {
            let result = if graph.filters.len() == self.bands.len() {
                graph.patch_gains(&self.bands, enabled)
            } else {
                graph
                    .rebuild_filters(&self.bands, enabled)
                    .and_then(|_| graph.route(target))
            };
            if let Err(e) = result {
                warn!(error = %e, "Failed to apply equalizer");
            }
        }
        self.enforce_output_policy();
    }

    /// Apply a named preset's gains
    pub fn apply_preset(&mut self, preset: EqPreset, enabled: bool) {
        debug!(%preset, enabled, "Applying equalizer preset");
        self.set_equalizer(&preset.bands(), enabled);
    }

    /// Toggle the normalization compressor
    pub fn set_normalization(&mut self, enabled: bool) {
        self.normalization = enabled;
        let target = RoutingTarget::for_normalization(enabled);
        if let Some(graph) = self.graph.as_mut().filter(|g| g.source.is_some()) {
            if let Err(e) = graph.route(target) {
                warn!(?target, error = %e, "Routing failed, using direct playback");
            }
        }
        self.enforce_output_policy();
    }

    /// Set the master volume in [0, 1]
    ///
    /// The graph gain approaches the new value smoothly; the element's native
    /// volume is always written too.
    pub fn set_master_volume(&mut self, volume: f32) {
        let Some(volume) = clamp_volume(volume) else {
            warn!(volume, "Ignoring non-finite master volume");
            return;
        };
        self.volume = volume;
        self.fade_generation.fetch_add(1, Ordering::SeqCst);

        if let Some(graph) = self.graph.as_mut().filter(|g| g.master_gain.is_some()) {
            let result = graph.automate_master(|now| ParamEvent::SetTarget {
                target: volume,
                start: now,
                time_constant: MASTER_VOLUME_TIME_CONSTANT,
            });
            if let Err(e) = result {
                warn!(error = %e, "Failed to schedule master volume");
            }
        }
        if let Some(element) = &self.element {
            lock_element(element).set_volume(volume);
        }
        self.enforce_output_policy();
    }

    /// Fade to `volume` over `duration_secs`
    ///
    /// With an active graph the master gain ramps linearly. Otherwise, with a
    /// fallback element and a positive duration, the element's volume is
    /// stepped. The returned future always completes; a later fade
    /// supersedes an earlier software fade. The cached master volume is left
    /// unchanged.
    pub fn fade_to(
        &mut self,
        volume: f32,
        duration_secs: f64,
        fallback: Option<SharedElement>,
    ) -> impl Future<Output = ()> + Send + 'static {
        let generation = self.fade_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let duration = fade_duration(duration_secs);
        let plan = match clamp_volume(volume) {
            None => {
                warn!(volume, "Ignoring non-finite fade target");
                FadePlan::Immediate
            }
            Some(target) => self.plan_fade(target, duration, fallback, generation),
        };
        plan.run()
    }

    fn plan_fade(
        &mut self,
        target: f32,
        duration: Duration,
        fallback: Option<SharedElement>,
        generation: u64,
    ) -> FadePlan {
        if self.is_active() {
            if let Some(graph) = self.graph.as_mut() {
                let seconds = duration.as_secs_f64();
                let result = graph.automate_master(|now| {
                    if duration.is_zero() {
                        ParamEvent::SetValue {
                            value: target,
                            time: now,
                        }
                    } else {
                        ParamEvent::LinearRamp {
                            value: target,
                            end_time: now + seconds,
                        }
                    }
                });
                return match result {
                    Ok(()) => {
                        debug!(target, seconds, "Master gain fade scheduled");
                        FadePlan::Ramp(duration)
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to schedule fade");
                        FadePlan::Immediate
                    }
                };
            }
        }

        match fallback {
            Some(element) if !duration.is_zero() => {
                let from = lock_element(&element).volume();
                debug!(from, target, "Software fade on element volume");
                FadePlan::Steps {
                    element,
                    from,
                    to: target,
                    duration,
                    generation,
                    current: Arc::clone(&self.fade_generation),
                }
            }
            _ => FadePlan::Immediate,
        }
    }

    /// Equalizer, normalization and volume from persisted settings
    pub fn apply_settings(&mut self, settings: &PlayerSettings) {
        self.set_equalizer(
            &EqualizerBand::from_gains(&settings.equalizer.gains),
            settings.equalizer.enabled,
        );
        self.set_normalization(settings.normalization);
        self.set_master_volume(settings.volume);
    }

    /// True only when attached audio is actually flowing through the graph
    pub fn is_active(&self) -> bool {
        self.attach_attempted
            && self.element.is_some()
            && self.graph.as_ref().is_some_and(EffectsGraph::is_live)
    }

    /// Mute the raw element exactly when the graph is active
    fn enforce_output_policy(&mut self) {
        let active = self.is_active();
        let next = match (&self.element, active) {
            (None, _) => EffectsState::Unattached,
            (Some(_), true) => EffectsState::Active,
            (Some(_), false) => EffectsState::DegradedFallback,
        };

        if let Some(element) = &self.element {
            let mut element = lock_element(element);
            if element.muted() != active {
                element.set_muted(active);
            }
        }

        if next != self.state {
            match next {
                EffectsState::DegradedFallback => {
                    warn!(from = %self.state, "Effects chain degraded to direct playback")
                }
                _ => info!(from = %self.state, to = %next, "Effects chain state changed"),
            }
            self.state = next;
        }
    }

    pub fn state(&self) -> EffectsState {
        self.state
    }

    /// Built filters as the context reports them
    pub fn filters(&self) -> Vec<FilterInfo> {
        self.graph
            .as_ref()
            .map(|graph| {
                graph
                    .filters
                    .iter()
                    .filter_map(|node| graph.context.filter_info(*node))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn routing(&self) -> Option<RoutingTarget> {
        self.graph.as_ref().and_then(|graph| graph.routing)
    }

    /// Master gain at the current context time
    pub fn master_gain_value(&self) -> Option<f32> {
        let graph = self.graph.as_ref()?;
        graph.context.gain_value(graph.master_gain?)
    }

    pub fn element_muted(&self) -> Option<bool> {
        self.element
            .as_ref()
            .map(|element| lock_element(element).muted())
    }

    pub fn context_state(&self) -> Option<ContextState> {
        self.graph.as_ref().map(|graph| graph.context.state())
    }

    pub fn context_time(&self) -> Option<f64> {
        self.graph.as_ref().map(|graph| graph.context.current_time())
    }

    pub fn bands(&self) -> &[EqualizerBand] {
        &self.bands
    }

    pub fn eq_enabled(&self) -> bool {
        self.eq_enabled
    }

    pub fn normalization(&self) -> bool {
        self.normalization
    }

    /// Cached master volume
    pub fn volume(&self) -> f32 {
        self.volume
    }
}

impl fmt::Debug for AudioEffectsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioEffectsManager")
            .field("state", &self.state)
            .field("element", &self.element_id)
            .field("routing", &self.routing())
            .field("bands", &self.bands.len())
            .field("eq_enabled", &self.eq_enabled)
            .field("normalization", &self.normalization)
            .field("volume", &self.volume)
            .finish()
    }
}
