//! Recording audio context for tests
//!
//! `RecordingContext` keeps the node table and an operation journal in a
//! shared [`Journal`] so tests can inspect what the effects manager did and
//! inject failures at chosen points. Its clock only moves when the test
//! calls [`Journal::advance`].

use crate::domain::audio::{
    lock_element, AudioContext, ContextFactory, ContextState, ElementId, Endpoint, FilterInfo,
    GraphError, MediaElement, MediaEvent, NodeId, Result, SharedElement,
};
use crate::domain::dsp::{AutomatedParam, CompressorParams, ParamEvent};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Failures the recording context should simulate
#[derive(Debug, Clone, Default)]
pub struct FailurePlan {
    /// Context creation fails outright
    pub unsupported: bool,
    /// Creating a filter node fails
    pub fail_filters: bool,
    /// Every `connect` fails
    pub fail_connect: bool,
    /// Context starts suspended
    pub start_suspended: bool,
    /// `resume` fails
    pub fail_resume: bool,
}

/// Kind of a recorded node
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedNode {
    Source(ElementId),
    Filter(FilterInfo),
    Compressor(CompressorParams),
    Gain(AutomatedParam),
}

/// Operations performed on the context, in order
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    CreateContext,
    Resume,
    Close,
    Create(NodeId),
    Connect(NodeId, Endpoint),
    Disconnect(NodeId),
    Release(NodeId),
    SetFilterGain(NodeId, f32),
    Schedule(NodeId, ParamEvent),
    CancelAndHold(NodeId, f64),
}

/// State shared between a recording context and the test
#[derive(Debug, Default)]
pub struct JournalState {
    pub plan: FailurePlan,
    pub now: f64,
    pub state: Option<ContextState>,
    pub nodes: BTreeMap<NodeId, RecordedNode>,
    pub edges: Vec<(NodeId, Endpoint)>,
    pub ops: Vec<Op>,
    pub contexts_created: usize,
    next_id: u32,
    wrapped: HashSet<ElementId>,
}

/// Cloneable handle to the recording state
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<JournalState>>);

impl Journal {
    pub fn new(plan: FailurePlan) -> Self {
        let journal = Self::default();
        journal.lock().plan = plan;
        journal
    }

    pub fn lock(&self) -> MutexGuard<'_, JournalState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the failure plan mid-test
    pub fn set_plan(&self, plan: FailurePlan) {
        self.lock().plan = plan;
    }

    /// Move the context clock forward
    pub fn advance(&self, seconds: f64) {
        self.lock().now += seconds;
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.clone()
    }

    /// Number of nodes ever created
    pub fn nodes_created(&self) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| matches!(op, Op::Create(_)))
            .count()
    }

    pub fn count_ops(&self, predicate: impl Fn(&Op) -> bool) -> usize {
        self.lock().ops.iter().filter(|op| predicate(op)).count()
    }

    /// Whether a live edge `from -> to` exists
    pub fn is_connected(&self, from: NodeId, to: Endpoint) -> bool {
        self.lock().edges.contains(&(from, to))
    }

    /// Live nodes of the given kind, in creation order
    pub fn nodes_where(&self, predicate: impl Fn(&RecordedNode) -> bool) -> Vec<NodeId> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| predicate(node))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn context_state(&self) -> Option<ContextState> {
        self.lock().state
    }
}

/// Audio context that records instead of rendering
pub struct RecordingContext {
    journal: Journal,
}

impl RecordingContext {
    fn with_node<T>(&self, node: NodeId, f: impl FnOnce(&mut RecordedNode) -> T) -> Result<T> {
        let mut state = self.journal.lock();
        state
            .nodes
            .get_mut(&node)
            .map(f)
            .ok_or(GraphError::UnknownNode(node))
    }

    fn add_node(&mut self, node: RecordedNode) -> Result<NodeId> {
        let mut state = self.journal.lock();
        if state.state == Some(ContextState::Closed) {
            return Err(GraphError::Closed);
        }
        state.next_id += 1;
        let id = NodeId::new(state.next_id);
        state.nodes.insert(id, node);
        state.ops.push(Op::Create(id));
        Ok(id)
    }
}

impl AudioContext for RecordingContext {
    fn state(&self) -> ContextState {
        self.journal.lock().state.unwrap_or(ContextState::Closed)
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = self.journal.lock();
        state.ops.push(Op::Resume);
        if state.plan.fail_resume {
            return Err(GraphError::Resume("user gesture required".to_string()));
        }
        match state.state {
            Some(ContextState::Closed) | None => Err(GraphError::Closed),
            _ => {
                state.state = Some(ContextState::Running);
                Ok(())
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        let mut state = self.journal.lock();
        state.ops.push(Op::Close);
        state.state = Some(ContextState::Closed);
        state.nodes.clear();
        state.edges.clear();
        state.wrapped.clear();
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.journal.lock().now
    }

    fn sample_rate(&self) -> u32 {
        48000
    }

    fn create_media_source(&mut self, element: &SharedElement) -> Result<NodeId> {
        let id = lock_element(element).id();
        if !self.journal.lock().wrapped.insert(id) {
            return Err(GraphError::Construction(format!(
                "{id} is already wrapped by a source node"
            )));
        }
        self.add_node(RecordedNode::Source(id))
    }

    fn create_filter(&mut self, info: FilterInfo) -> Result<NodeId> {
        if self.journal.lock().plan.fail_filters {
            return Err(GraphError::Construction("filter limit reached".to_string()));
        }
        self.add_node(RecordedNode::Filter(info))
    }

    fn create_compressor(&mut self, params: CompressorParams) -> Result<NodeId> {
        self.add_node(RecordedNode::Compressor(params))
    }

    fn create_gain(&mut self, initial: f32) -> Result<NodeId> {
        self.add_node(RecordedNode::Gain(AutomatedParam::new(initial)))
    }

    fn connect(&mut self, from: NodeId, to: Endpoint) -> Result<()> {
        let mut state = self.journal.lock();
        state.ops.push(Op::Connect(from, to));
        if state.plan.fail_connect {
            return Err(GraphError::Routing(format!("cannot connect {from}")));
        }
        if !state.nodes.contains_key(&from) {
            return Err(GraphError::UnknownNode(from));
        }
        if let Endpoint::Node(target) = to {
            if !state.nodes.contains_key(&target) {
                return Err(GraphError::UnknownNode(target));
            }
        }
        if !state.edges.contains(&(from, to)) {
            state.edges.push((from, to));
        }
        Ok(())
    }

    fn disconnect(&mut self, node: NodeId) -> Result<()> {
        let mut state = self.journal.lock();
        state.ops.push(Op::Disconnect(node));
        state.edges.retain(|(from, _)| *from != node);
        Ok(())
    }

    fn release(&mut self, node: NodeId) -> Result<()> {
        let mut state = self.journal.lock();
        state.ops.push(Op::Release(node));
        state.nodes.remove(&node);
        state
            .edges
            .retain(|(from, to)| *from != node && *to != Endpoint::Node(node));
        Ok(())
    }

    fn set_filter_gain(&mut self, node: NodeId, gain_db: f32) -> Result<()> {
        self.journal.lock().ops.push(Op::SetFilterGain(node, gain_db));
        self.with_node(node, |recorded| match recorded {
            RecordedNode::Filter(info) => {
                info.gain_db = gain_db;
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(node)),
        })?
    }

    fn schedule_gain(&mut self, node: NodeId, event: ParamEvent) -> Result<()> {
        self.journal.lock().ops.push(Op::Schedule(node, event));
        self.with_node(node, |recorded| match recorded {
            RecordedNode::Gain(param) => {
                param.schedule(event);
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(node)),
        })?
    }

    fn cancel_and_hold(&mut self, node: NodeId, time: f64) -> Result<()> {
        self.journal.lock().ops.push(Op::CancelAndHold(node, time));
        self.with_node(node, |recorded| match recorded {
            RecordedNode::Gain(param) => {
                param.cancel_and_hold(time);
                Ok(())
            }
            _ => Err(GraphError::UnknownNode(node)),
        })?
    }

    fn filter_info(&self, node: NodeId) -> Option<FilterInfo> {
        match self.journal.lock().nodes.get(&node) {
            Some(RecordedNode::Filter(info)) => Some(*info),
            _ => None,
        }
    }

    fn gain_value(&self, node: NodeId) -> Option<f32> {
        let state = self.journal.lock();
        match state.nodes.get(&node) {
            Some(RecordedNode::Gain(param)) => Some(param.value_at(state.now)),
            _ => None,
        }
    }
}

/// Factory producing recording contexts bound to one journal
#[derive(Debug, Clone, Default)]
pub struct RecordingFactory {
    journal: Journal,
}

impl RecordingFactory {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl ContextFactory for RecordingFactory {
    fn create(&mut self) -> Result<Box<dyn AudioContext>> {
        let mut state = self.journal.lock();
        if state.plan.unsupported {
            return Err(GraphError::Unsupported(
                "audio processing API unavailable".to_string(),
            ));
        }
        state.ops.push(Op::CreateContext);
        state.contexts_created += 1;
        state.state = Some(if state.plan.start_suspended {
            ContextState::Suspended
        } else {
            ContextState::Running
        });
        state.nodes.clear();
        state.edges.clear();
        state.wrapped.clear();
        drop(state);

        Ok(Box::new(RecordingContext {
            journal: self.journal.clone(),
        }))
    }
}

/// Minimal media element for tests
#[derive(Debug, Clone)]
pub struct StubElement {
    id: ElementId,
    src: Option<String>,
    position: f64,
    paused: bool,
    pub volume: f32,
    pub muted: bool,
}

impl StubElement {
    pub fn new() -> Self {
        Self {
            id: ElementId::next(),
            src: None,
            position: 0.0,
            paused: true,
            volume: 1.0,
            muted: false,
        }
    }

    /// Wrap in the shared handle the effects manager expects
    pub fn shared() -> (Arc<Mutex<StubElement>>, SharedElement) {
        let concrete = Arc::new(Mutex::new(Self::new()));
        let shared: SharedElement = concrete.clone();
        (concrete, shared)
    }
}

impl Default for StubElement {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaElement for StubElement {
    fn id(&self) -> ElementId {
        self.id
    }

    fn src(&self) -> Option<&str> {
        self.src.as_deref()
    }

    fn set_src(&mut self, src: &str) {
        self.src = Some(src.to_string());
        self.position = 0.0;
    }

    fn current_time(&self) -> f64 {
        self.position
    }

    fn set_current_time(&mut self, seconds: f64) {
        self.position = seconds.max(0.0);
    }

    fn play(&mut self) {
        self.paused = false;
    }

    fn pause(&mut self) {
        self.paused = true;
    }

    fn is_paused(&self) -> bool {
        self.paused
    }

    fn volume(&self) -> f32 {
        self.volume
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume = volume;
    }

    fn muted(&self) -> bool {
        self.muted
    }

    fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
    }

    fn take_events(&mut self) -> Vec<MediaEvent> {
        Vec::new()
    }
}
