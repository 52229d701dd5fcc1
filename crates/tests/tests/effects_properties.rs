//! Safety and consistency properties of the effects manager

use encore_core::domain::audio::{lock_element, Endpoint, MediaElement, SharedElement};
use encore_core::domain::effects::{AudioEffectsManager, EffectsState};
use encore_core::domain::equalizer::{EqualizerBand, CANONICAL_FREQUENCIES};
use encore_core::domain::testing::{FailurePlan, StubElement};
use encore_tests::{bands_from, recording_manager, unsupported, GraphNodes};
use proptest::prelude::*;
use std::time::Duration;

// ============================================================================
// THE ELEMENT IS NEVER SILENCED WITHOUT A LIVE GRAPH
// ============================================================================

#[derive(Debug, Clone)]
enum Action {
    Attach(usize),
    Detach,
    SetEqualizer(Vec<f32>, bool),
    SetNormalization(bool),
    SetVolume(f32),
    BreakContext(FailurePlan),
}

fn plan_strategy() -> impl Strategy<Value = FailurePlan> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(fail_filters, fail_connect, start_suspended, fail_resume)| FailurePlan {
            unsupported: false,
            fail_filters,
            fail_connect,
            start_suspended,
            fail_resume,
        },
    )
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (0usize..2).prop_map(Action::Attach),
        Just(Action::Detach),
        (prop::collection::vec(-12.0f32..12.0, 1..=10), any::<bool>())
            .prop_map(|(gains, enabled)| Action::SetEqualizer(gains, enabled)),
        any::<bool>().prop_map(Action::SetNormalization),
        (-0.5f32..1.5).prop_map(Action::SetVolume),
        plan_strategy().prop_map(Action::BreakContext),
    ]
}

fn check_mute_policy(
    manager: &AudioEffectsManager,
    elements: &[SharedElement],
    current: Option<usize>,
) {
    for (index, element) in elements.iter().enumerate() {
        let muted = lock_element(element).muted();
        let expected = manager.is_active() && current == Some(index);
        assert_eq!(
            muted, expected,
            "element {index}: muted={muted}, active={}, current={current:?}",
            manager.is_active()
        );
    }
    if !manager.is_active() && current.is_some() {
        assert_eq!(manager.state(), EffectsState::DegradedFallback);
    }
}

proptest! {
    #[test]
    fn prop_inactive_means_unmuted(
        initial in plan_strategy(),
        actions in prop::collection::vec(action_strategy(), 1..40),
    ) {
        let (mut manager, journal) = recording_manager(initial);
        let elements: Vec<SharedElement> = (0..2).map(|_| StubElement::shared().1).collect();
        let mut current = None;

        for action in actions {
            match action {
                Action::Attach(index) => {
                    manager.attach_audio_element(elements[index].clone());
                    current = Some(index);
                }
                Action::Detach => {
                    manager.detach();
                    current = None;
                }
                Action::SetEqualizer(gains, enabled) => {
                    manager.set_equalizer(&bands_from(&gains), enabled);
                }
                Action::SetNormalization(enabled) => manager.set_normalization(enabled),
                Action::SetVolume(volume) => manager.set_master_volume(volume),
                Action::BreakContext(plan) => journal.set_plan(plan),
            }
            check_mute_policy(&manager, &elements, current);
        }
    }
}

#[test]
fn test_inactive_is_unmuted_after_each_failure() {
    for plan in [
        unsupported(),
        FailurePlan { fail_filters: true, ..Default::default() },
        FailurePlan { fail_connect: true, ..Default::default() },
        FailurePlan { start_suspended: true, fail_resume: true, ..Default::default() },
    ] {
        let (mut manager, _journal) = recording_manager(plan.clone());
        let (stub, element) = StubElement::shared();
        manager.attach_audio_element(element);

        assert!(!manager.is_active(), "{plan:?}");
        assert!(!stub.lock().unwrap().muted, "{plan:?}");
    }
}

// ============================================================================
// DOUBLE ATTACH
// ============================================================================

#[test]
fn test_double_attach_is_idempotent_when_active() {
    let (mut manager, journal) = recording_manager(FailurePlan::default());
    let (_, element) = StubElement::shared();

    manager.attach_audio_element(element.clone());
    let nodes = journal.nodes_created();
    let contexts = journal.lock().contexts_created;
    assert!(manager.is_active());

    manager.attach_audio_element(element);
    assert_eq!(journal.nodes_created(), nodes);
    assert_eq!(journal.lock().contexts_created, contexts);
    assert!(manager.is_active());
}

#[test]
fn test_double_attach_in_fallback_stays_in_fallback() {
    let (mut manager, journal) = recording_manager(unsupported());
    let (stub, element) = StubElement::shared();

    manager.attach_audio_element(element.clone());
    manager.attach_audio_element(element);

    assert_eq!(journal.nodes_created(), 0);
    assert!(!manager.is_active());
    assert!(!stub.lock().unwrap().muted);
}

// ============================================================================
// EQUALIZER READ-BACK
// ============================================================================

proptest! {
    #[test]
    fn prop_filter_gains_follow_bands(
        gains in prop::collection::vec(-12.0f32..12.0, 10),
        enabled in any::<bool>(),
    ) {
        let (mut manager, _journal) = recording_manager(FailurePlan::default());
        manager.attach_audio_element(StubElement::shared().1);
        manager.set_equalizer(&bands_from(&gains), enabled);

        let filters = manager.filters();
        prop_assert_eq!(filters.len(), gains.len());
        for (filter, gain) in filters.iter().zip(&gains) {
            let expected = if enabled { *gain } else { 0.0 };
            prop_assert!((filter.gain_db - expected).abs() < 1e-6);
        }
    }
}

#[test]
fn test_reenabling_restores_gains() {
    let (mut manager, _journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);

    let bands: Vec<EqualizerBand> = CANONICAL_FREQUENCIES
        .iter()
        .map(|f| EqualizerBand::new(*f, 4.0))
        .collect();
    manager.set_equalizer(&bands, false);
    assert!(manager.filters().iter().all(|f| f.gain_db == 0.0));

    manager.set_equalizer(&bands, true);
    assert!(manager.filters().iter().all(|f| f.gain_db == 4.0));
}

// ============================================================================
// ROUTING EXCLUSIVITY
// ============================================================================

#[test]
fn test_routing_is_exclusive() {
    let (mut manager, journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);
    let nodes = GraphNodes::find(&journal).unwrap();
    let tail = nodes.tail();

    for enabled in [true, false, true, true, false] {
        manager.set_normalization(enabled);

        let via_compressor = journal.is_connected(tail, Endpoint::Node(nodes.compressor))
            && journal.is_connected(nodes.compressor, Endpoint::Node(nodes.master));
        let direct = journal.is_connected(tail, Endpoint::Node(nodes.master));

        assert_eq!(via_compressor, enabled);
        assert_eq!(direct, !enabled);
        assert!(journal.is_connected(nodes.master, Endpoint::Destination));
        if !enabled {
            assert!(!journal.is_connected(nodes.compressor, Endpoint::Node(nodes.master)));
        }
    }
}

// ============================================================================
// VOLUME BACKSTOP
// ============================================================================

proptest! {
    #[test]
    fn prop_element_volume_tracks_master(volume in 0.0f32..=1.0, supported in any::<bool>()) {
        let plan = if supported { FailurePlan::default() } else { unsupported() };
        let (mut manager, _journal) = recording_manager(plan);
        let (stub, element) = StubElement::shared();
        manager.attach_audio_element(element);

        manager.set_master_volume(volume);
        prop_assert_eq!(stub.lock().unwrap().volume, volume);
        prop_assert_eq!(manager.is_active(), supported);
    }
}

#[test]
fn test_volume_set_before_attach_reaches_element() {
    let (mut manager, _journal) = recording_manager(unsupported());
    manager.set_master_volume(0.4);

    let (stub, element) = StubElement::shared();
    manager.attach_audio_element(element);
    assert_eq!(stub.lock().unwrap().volume, 0.4);
}

// ============================================================================
// FADES ALWAYS FINISH
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_fade_resolves_in_every_configuration() {
    let limit = Duration::from_secs(3);

    let cases = [
        (FailurePlan::default(), true),
        (FailurePlan::default(), false),
        (unsupported(), true),
        (unsupported(), false),
        (FailurePlan { start_suspended: true, fail_resume: true, ..Default::default() }, true),
    ];
    for (plan, with_fallback) in cases {
        let (mut manager, _journal) = recording_manager(plan.clone());
        let (_, element) = StubElement::shared();
        manager.attach_audio_element(element.clone());

        let fallback = with_fallback.then(|| element.clone());
        let fade = manager.fade_to(0.2, 1.0, fallback);
        assert!(
            tokio::time::timeout(limit, fade).await.is_ok(),
            "fade hung for {plan:?} fallback={with_fallback}"
        );
    }

    let (mut detached, _journal) = recording_manager(FailurePlan::default());
    for duration in [0.0, -1.0, f64::NAN, 1.0] {
        let fade = detached.fade_to(0.5, duration, None);
        assert!(tokio::time::timeout(limit, fade).await.is_ok());
    }
    let fade = detached.fade_to(f32::NAN, 1.0, None);
    assert!(tokio::time::timeout(limit, fade).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_software_fade_reaches_target_on_element() {
    let (mut manager, _journal) = recording_manager(unsupported());
    let (stub, element) = StubElement::shared();
    manager.attach_audio_element(element.clone());

    manager.fade_to(0.0, 1.0, Some(element.clone())).await;
    assert_eq!(lock_element(&element).volume(), 0.0);
    assert!(!stub.lock().unwrap().muted);
    assert_eq!(manager.volume(), 1.0);
}
