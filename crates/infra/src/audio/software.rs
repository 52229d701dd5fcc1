//! Software audio context
//!
//! Renders the effects graph on the CPU: biquad filter stages, the feedback
//! compressor and automated gain nodes from the core DSP module, evaluated in
//! topological order once per block. The node table is shared with the
//! render side through a [`GraphRenderer`]; the control side mutates it
//! through the [`AudioContext`] trait.

use crate::audio::cpal_backend::default_output_device;
use encore_core::domain::audio::{
    lock_element, AudioContext, ContextFactory, ContextState, ElementId, Endpoint, FilterInfo,
    GraphError, NodeId, Result, SharedElement,
};
use encore_core::domain::config::EngineSettings;
use encore_core::domain::dsp::{
    BlockClock, Compressor, CompressorParams, Effect, FilterStage, GainStage, ParamEvent,
};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, trace};

enum NodeKind {
    /// Passes through the element block supplied by the mix
    Source(ElementId),
    Filter(FilterStage),
    Compressor(Compressor),
    Gain(GainStage),
}

impl NodeKind {
    fn effect(&mut self) -> Option<&mut dyn Effect> {
        match self {
            NodeKind::Source(_) => None,
            NodeKind::Filter(stage) => Some(stage as &mut dyn Effect),
            NodeKind::Compressor(comp) => Some(comp as &mut dyn Effect),
            NodeKind::Gain(gain) => Some(gain as &mut dyn Effect),
        }
    }
}

struct GraphNode {
    kind: NodeKind,
    outputs: Vec<Endpoint>,
}

struct GraphCore {
    state: ContextState,
    sample_rate: u32,
    channels: usize,
    frames_rendered: u64,
    next_id: u32,
    nodes: BTreeMap<NodeId, GraphNode>,
    wrapped: HashSet<ElementId>,
    scratch: HashMap<NodeId, Vec<f32>>,
}

impl GraphCore {
    fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / f64::from(self.sample_rate)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == ContextState::Closed {
            Err(GraphError::Closed)
        } else {
            Ok(())
        }
    }

    fn add(&mut self, kind: NodeKind) -> Result<NodeId> {
        self.ensure_open()?;
        self.next_id += 1;
        let id = NodeId::new(self.next_id);
        self.nodes.insert(
            id,
            GraphNode {
                kind,
                outputs: Vec::new(),
            },
        );
        trace!(node = %id, "Node created");
        Ok(id)
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut GraphNode> {
        self.nodes.get_mut(&id).ok_or(GraphError::UnknownNode(id))
    }

    /// Whether `to` can already reach `from`
    fn reaches(&self, from: NodeId, to: NodeId) -> bool {
        let mut stack = vec![from];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.outputs.iter().filter_map(|out| match out {
                    Endpoint::Node(next) => Some(*next),
                    Endpoint::Destination => None,
                }));
            }
        }
        false
    }

    /// Kahn's algorithm over the node table
    fn render_order(&self) -> Vec<NodeId> {
        let mut indegree: HashMap<NodeId, usize> = self.nodes.keys().map(|id| (*id, 0)).collect();
        for node in self.nodes.values() {
            for out in &node.outputs {
                if let Endpoint::Node(next) = out {
                    if let Some(count) = indegree.get_mut(next) {
                        *count += 1;
                    }
                }
            }
        }

        let mut ready: VecDeque<NodeId> = self
            .nodes
            .keys()
            .filter(|id| indegree.get(id) == Some(&0))
            .copied()
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            for out in &node.outputs {
                if let Endpoint::Node(next) = out {
                    if let Some(count) = indegree.get_mut(next) {
                        *count -= 1;
                        if *count == 0 {
                            ready.push_back(*next);
                        }
                    }
                }
            }
        }
        order
    }

    /// Render one interleaved block into `out`
    ///
    /// `input` is the element block every source node emits. A context that
    /// is not running renders silence and its clock stands still.
    fn render(&mut self, input: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        if self.state != ContextState::Running || out.is_empty() {
            return;
        }

        let len = out.len();
        let clock = BlockClock::new(self.current_time(), self.sample_rate, self.channels);
        for buffer in self.scratch.values_mut() {
            buffer.clear();
            buffer.resize(len, 0.0);
        }

        for id in self.render_order() {
            let mut buffer = self.scratch.remove(&id).unwrap_or_else(|| vec![0.0; len]);
            buffer.resize(len, 0.0);

            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            match node.kind.effect() {
                Some(effect) => effect.process(&mut buffer, clock),
                None => {
                    let n = input.len().min(len);
                    buffer[..n].copy_from_slice(&input[..n]);
                    buffer[n..].fill(0.0);
                }
            }

            for target in &node.outputs {
                let sink = match target {
                    Endpoint::Destination => &mut *out,
                    Endpoint::Node(next) => self
                        .scratch
                        .entry(*next)
                        .or_insert_with(|| vec![0.0; len])
                        .as_mut_slice(),
                };
                for (acc, sample) in sink.iter_mut().zip(&buffer) {
                    *acc += sample;
                }
            }
            buffer.fill(0.0);
            self.scratch.insert(id, buffer);
        }

        self.frames_rendered += (len / self.channels) as u64;
    }
}

fn lock_core(core: &Arc<Mutex<GraphCore>>) -> MutexGuard<'_, GraphCore> {
    core.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Whether the user has interacted with the player yet
///
/// A context created without autoplay permission can only resume once this
/// has been granted.
#[derive(Debug, Clone, Default)]
pub struct UserActivation(Arc<AtomicBool>);

impl UserActivation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_granted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Options for software contexts
#[derive(Debug, Clone, PartialEq)]
pub struct SoftwareContextOptions {
    pub sample_rate: u32,
    pub channels: u16,
    /// Start running without a user gesture
    pub autoplay_allowed: bool,
    /// Refuse to create a context when no output device exists
    pub require_output_device: bool,
}

impl Default for SoftwareContextOptions {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for SoftwareContextOptions {
    fn from(engine: &EngineSettings) -> Self {
        Self {
            sample_rate: engine.sample_rate,
            channels: engine.channels,
            autoplay_allowed: engine.autoplay_allowed,
            require_output_device: false,
        }
    }
}

/// Render handle onto a software context's graph
#[derive(Clone)]
pub struct GraphRenderer {
    core: Arc<Mutex<GraphCore>>,
}

impl GraphRenderer {
    /// Render one block, feeding `input` to the source nodes
    pub fn render(&self, input: &[f32], out: &mut [f32]) {
        lock_core(&self.core).render(input, out);
    }

    pub fn state(&self) -> ContextState {
        lock_core(&self.core).state
    }
}

/// Audio context rendered in software
pub struct SoftwareContext {
    core: Arc<Mutex<GraphCore>>,
    options: SoftwareContextOptions,
    activation: UserActivation,
}

impl SoftwareContext {
    pub fn new(options: SoftwareContextOptions, activation: UserActivation) -> Self {
        let state = if options.autoplay_allowed || activation.is_granted() {
            ContextState::Running
        } else {
            ContextState::Suspended
        };
        info!(
            sample_rate = options.sample_rate,
            channels = options.channels,
            ?state,
            "Software audio context created"
        );

        let core = GraphCore {
            state,
            sample_rate: options.sample_rate.max(1),
            channels: options.channels.max(1) as usize,
            frames_rendered: 0,
            next_id: 0,
            nodes: BTreeMap::new(),
            wrapped: HashSet::new(),
            scratch: HashMap::new(),
        };
        Self {
            core: Arc::new(Mutex::new(core)),
            options,
            activation,
        }
    }

    pub fn renderer(&self) -> GraphRenderer {
        GraphRenderer {
            core: Arc::clone(&self.core),
        }
    }

    pub fn options(&self) -> &SoftwareContextOptions {
        &self.options
    }

    fn core(&self) -> MutexGuard<'_, GraphCore> {
        lock_core(&self.core)
    }
}

impl AudioContext for SoftwareContext {
    fn state(&self) -> ContextState {
        self.core().state
    }

    fn resume(&mut self) -> Result<()> {
        let allowed = self.options.autoplay_allowed || self.activation.is_granted();
        let mut core = self.core();
        match core.state {
            ContextState::Closed => Err(GraphError::Closed),
            ContextState::Running => Ok(()),
            ContextState::Suspended if allowed => {
                core.state = ContextState::Running;
                debug!("Software audio context resumed");
                Ok(())
            }
            ContextState::Suspended => Err(GraphError::Resume(
                "playback has not been activated by the user".to_string(),
            )),
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut core = self.core();
        core.state = ContextState::Closed;
        core.nodes.clear();
        core.scratch.clear();
        debug!("Software audio context closed");
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.core().current_time()
    }

    fn sample_rate(&self) -> u32 {
        self.core().sample_rate
    }

    fn create_media_source(&mut self, element: &SharedElement) -> Result<NodeId> {
        let id = lock_element(element).id();
        let mut core = self.core();
        core.ensure_open()?;
        if !core.wrapped.insert(id) {
            return Err(GraphError::Construction(format!(
                "{id} is already wrapped by a source node"
            )));
        }
        core.add(NodeKind::Source(id))
    }

    fn create_filter(&mut self, info: FilterInfo) -> Result<NodeId> {
        let mut core = self.core();
        let stage = FilterStage::new(info, core.sample_rate);
        core.add(NodeKind::Filter(stage))
    }

    fn create_compressor(&mut self, params: CompressorParams) -> Result<NodeId> {
        let mut core = self.core();
        let compressor = Compressor::new(params, core.sample_rate);
        core.add(NodeKind::Compressor(compressor))
    }

    fn create_gain(&mut self, initial: f32) -> Result<NodeId> {
        self.core().add(NodeKind::Gain(GainStage::new(initial)))
    }

    fn connect(&mut self, from: NodeId, to: Endpoint) -> Result<()> {
        let mut core = self.core();
        core.ensure_open()?;
        if !core.nodes.contains_key(&from) {
            return Err(GraphError::UnknownNode(from));
        }
        if let Endpoint::Node(target) = to {
            match core.nodes.get(&target) {
                None => return Err(GraphError::UnknownNode(target)),
                Some(GraphNode {
                    kind: NodeKind::Source(_),
                    ..
                }) => {
                    return Err(GraphError::Routing(format!(
                        "source {target} has no input"
                    )))
                }
                Some(_) => {}
            }
            if core.reaches(target, from) {
                return Err(GraphError::Routing(format!(
                    "connecting {from} to {target} would create a cycle"
                )));
            }
        }

        let node = core.node_mut(from)?;
        if !node.outputs.contains(&to) {
            node.outputs.push(to);
        }
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) -> Result<()> {
        self.core().node_mut(node)?.outputs.clear();
        Ok(())
    }

    fn release(&mut self, node: NodeId) -> Result<()> {
        let mut core = self.core();
        core.nodes
            .remove(&node)
            .ok_or(GraphError::UnknownNode(node))?;
        core.scratch.remove(&node);
        for other in core.nodes.values_mut() {
            other.outputs.retain(|out| *out != Endpoint::Node(node));
        }
        Ok(())
    }

    fn set_filter_gain(&mut self, node: NodeId, gain_db: f32) -> Result<()> {
        match &mut self.core().node_mut(node)?.kind {
            NodeKind::Filter(stage) => {
                stage.set_gain(gain_db);
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(node)),
        }
    }

    fn schedule_gain(&mut self, node: NodeId, event: ParamEvent) -> Result<()> {
        match &mut self.core().node_mut(node)?.kind {
            NodeKind::Gain(gain) => {
                gain.param_mut().schedule(event);
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(node)),
        }
    }

    fn cancel_and_hold(&mut self, node: NodeId, time: f64) -> Result<()> {
        match &mut self.core().node_mut(node)?.kind {
            NodeKind::Gain(gain) => {
                gain.param_mut().cancel_and_hold(time);
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(node)),
        }
    }

    fn filter_info(&self, node: NodeId) -> Option<FilterInfo> {
        match &self.core().nodes.get(&node)?.kind {
            NodeKind::Filter(stage) => Some(stage.info()),
            _ => None,
        }
    }

    fn gain_value(&self, node: NodeId) -> Option<f32> {
        let core = self.core();
        match &core.nodes.get(&node)?.kind {
            NodeKind::Gain(gain) => Some(gain.param().value_at(core.current_time())),
            _ => None,
        }
    }
}

/// Slot through which the output side finds the live graph
#[derive(Clone, Default)]
pub struct RenderTap(Arc<Mutex<Option<GraphRenderer>>>);

impl RenderTap {
    pub fn new() -> Self {
        Self::default()
    }

    fn publish(&self, renderer: GraphRenderer) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(renderer);
    }

    pub fn current(&self) -> Option<GraphRenderer> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Render the live graph, or silence when there is none
    pub fn render(&self, input: &[f32], out: &mut [f32]) {
        match self.current() {
            Some(renderer) => renderer.render(input, out),
            None => out.fill(0.0),
        }
    }
}

/// Creates software contexts and publishes each through a [`RenderTap`]
pub struct SoftwareContextFactory {
    options: SoftwareContextOptions,
    activation: UserActivation,
    tap: RenderTap,
}

impl SoftwareContextFactory {
    pub fn new(options: SoftwareContextOptions) -> Self {
        Self {
            options,
            activation: UserActivation::new(),
            tap: RenderTap::new(),
        }
    }

    pub fn activation(&self) -> UserActivation {
        self.activation.clone()
    }

    pub fn tap(&self) -> RenderTap {
        self.tap.clone()
    }
}

impl ContextFactory for SoftwareContextFactory {
    fn create(&mut self) -> Result<Box<dyn AudioContext>> {
        if self.options.require_output_device {
            let device = default_output_device()
                .map_err(|e| GraphError::Unsupported(e.to_string()))?;
            debug!("Rendering for output device: {}", device.name);
        }

        let context = SoftwareContext::new(self.options.clone(), self.activation.clone());
        self.tap.publish(context.renderer());
        Ok(Box::new(context))
    }
}
