//! End-to-end scenarios against the recording context

use encore_core::domain::audio::{AudioContext, ContextState, Endpoint, FilterKind, GraphError};
use encore_core::domain::effects::{AudioEffectsManager, EffectsState, RoutingTarget};
use encore_core::domain::equalizer::{EqPreset, PEAKING_Q};
use encore_core::domain::testing::{FailurePlan, Op, StubElement};
use encore_tests::{bands_from, recording_manager, unsupported, GraphNodes};

// ============================================================================
// CONSTRUCTION FAILURE
// ============================================================================

#[test]
fn test_construction_failure_leaves_element_audible() {
    let (mut manager, journal) = recording_manager(unsupported());
    let (stub, element) = StubElement::shared();

    manager.attach_audio_element(element);

    assert!(!manager.is_active());
    assert_eq!(manager.state(), EffectsState::DegradedFallback);
    assert!(!stub.lock().unwrap().muted);
    assert!(journal.ops().is_empty());
}

#[test]
fn test_closure_factory_failure_leaves_element_audible() {
    let mut manager = AudioEffectsManager::new(|| -> Result<Box<dyn AudioContext>, GraphError> {
        Err(GraphError::Construction("out of nodes".to_string()))
    });
    let (stub, element) = StubElement::shared();

    manager.attach_audio_element(element);
    manager.set_normalization(true);
    manager.apply_preset(EqPreset::Rock, true);

    assert!(!manager.is_active());
    assert!(!stub.lock().unwrap().muted);
    assert!(manager.filters().is_empty());
}

#[test]
fn test_recovers_once_environment_allows() {
    let plan = FailurePlan {
        start_suspended: true,
        fail_resume: true,
        ..Default::default()
    };
    let (mut manager, journal) = recording_manager(plan);
    let (stub, element) = StubElement::shared();

    manager.attach_audio_element(element.clone());
    assert!(!manager.is_active());
    assert_eq!(manager.context_state(), Some(ContextState::Suspended));

    journal.set_plan(FailurePlan::default());
    manager.attach_audio_element(element);
    assert!(manager.is_active());
    assert!(stub.lock().unwrap().muted);
    assert_eq!(journal.lock().contexts_created, 1);
}

// ============================================================================
// EQUALIZER SHAPE
// ============================================================================

#[test]
fn test_equalizer_filter_shapes() {
    let (mut manager, _journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);

    let gains = [6.0, 3.0, 0.0, -2.0, -4.0, 1.0, 2.0, 3.0, 4.0, 5.0];
    manager.set_equalizer(&bands_from(&gains), true);

    let filters = manager.filters();
    assert_eq!(filters.len(), 10);

    let first = filters[0];
    assert_eq!(first.kind, FilterKind::LowShelf);
    assert_eq!(first.gain_db, 6.0);
    assert_eq!(first.frequency, 60.0);

    assert_eq!(filters[9].kind, FilterKind::HighShelf);
    assert_eq!(filters[9].gain_db, 5.0);

    for filter in &filters[1..9] {
        assert_eq!(filter.kind, FilterKind::Peaking);
        assert_eq!(filter.q, PEAKING_Q);
    }
}

#[test]
fn test_short_chain_keeps_shelves_at_the_ends() {
    let (mut manager, _journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);

    manager.set_equalizer(&bands_from(&[3.0, 0.0, -3.0]), true);

    let kinds: Vec<FilterKind> = manager.filters().iter().map(|f| f.kind).collect();
    assert_eq!(
        kinds,
        [FilterKind::LowShelf, FilterKind::Peaking, FilterKind::HighShelf]
    );
    assert!(manager.is_active());
}

// ============================================================================
// NORMALIZATION ROUTING
// ============================================================================

#[test]
fn test_each_routing_change_reconnects_tail_once() {
    let (mut manager, journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);
    let tail = GraphNodes::find(&journal).unwrap().tail();
    let tail_connects =
        || journal.count_ops(|op| matches!(op, Op::Connect(from, _) if *from == tail));

    let before = tail_connects();
    manager.set_normalization(true);
    assert_eq!(tail_connects(), before + 1);
    assert_eq!(manager.routing(), Some(RoutingTarget::Compressor));

    manager.set_normalization(true);
    assert_eq!(tail_connects(), before + 1);

    manager.set_normalization(false);
    assert_eq!(tail_connects(), before + 2);
    assert_eq!(manager.routing(), Some(RoutingTarget::Direct));

    manager.set_normalization(false);
    assert_eq!(tail_connects(), before + 2);
    assert!(manager.is_active());
}

#[test]
fn test_equalizer_patch_keeps_routing() {
    let (mut manager, journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);
    manager.set_normalization(true);
    let connects = journal.count_ops(|op| matches!(op, Op::Connect(..)));

    manager.apply_preset(EqPreset::Vocal, true);
    manager.apply_preset(EqPreset::Electronic, false);

    assert_eq!(journal.count_ops(|op| matches!(op, Op::Connect(..))), connects);
    assert_eq!(manager.routing(), Some(RoutingTarget::Compressor));
}

// ============================================================================
// VOLUME THEN FADE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fade_after_volume_change_reaches_target() {
    let (mut manager, journal) = recording_manager(FailurePlan::default());
    let (_, element) = StubElement::shared();
    manager.attach_audio_element(element.clone());

    manager.set_master_volume(0.3);
    let fade = manager.fade_to(0.9, 2.0, Some(element));

    journal.advance(2.0);
    fade.await;

    let gain = manager.master_gain_value().unwrap();
    assert!((gain - 0.9).abs() < 1e-3, "gain {gain}");
    assert_eq!(manager.volume(), 0.3);
}

#[test]
fn test_volume_settles_near_target() {
    let (mut manager, journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);

    manager.set_master_volume(0.3);
    journal.advance(0.2);

    let gain = manager.master_gain_value().unwrap();
    assert!((gain - 0.3).abs() < 1e-3, "gain {gain}");

    let nodes = GraphNodes::find(&journal).unwrap();
    assert!(journal.is_connected(nodes.master, Endpoint::Destination));
}
