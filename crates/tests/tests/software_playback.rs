//! What the listener hears, rendered through the software context

use encore_core::domain::audio::{lock_element, AudioContext, GraphError, MediaElement};
use encore_core::domain::effects::{AudioEffectsManager, EffectsState};
use encore_core::domain::equalizer::EqPreset;
use encore_infra::audio::{PlaybackMix, RenderTap};
use encore_tests::{bands_from, blocks_for, is_muted, measure, playing_tones, SoftwarePlayer};

const SETTLE_BLOCKS: usize = 20;
const MEASURE_BLOCKS: usize = 40;

fn db_ratio(a: f32, b: f32) -> f32 {
    20.0 * (a / b).log10()
}

// ============================================================================
// GRAPH PATH
// ============================================================================

#[test]
fn test_flat_chain_is_transparent() {
    let mut player = SoftwarePlayer::new(true);
    let element = playing_tones(&[1000.0], 0.5, 3.0);
    player.manager.attach_audio_element(element.clone());
    assert!(player.manager.is_active());
    assert!(is_muted(&element));

    let mut mix = player.mix(&element);
    let (direct, processed) = measure(&mut mix, SETTLE_BLOCKS, MEASURE_BLOCKS);

    assert!(direct.is_silent());
    let expected_rms = 0.5 / std::f32::consts::SQRT_2;
    assert!(
        db_ratio(processed.rms(), expected_rms).abs() < 0.2,
        "processed rms {}",
        processed.rms()
    );
}

#[test]
fn test_bass_gain_lifts_low_tone() {
    let level_80hz = |gains: &[f32]| {
        let mut player = SoftwarePlayer::new(true);
        player.manager.set_equalizer(&bands_from(gains), true);
        let element = playing_tones(&[80.0], 0.25, 3.0);
        player.manager.attach_audio_element(element.clone());
        let (_, processed) = measure(&mut player.mix(&element), SETTLE_BLOCKS, MEASURE_BLOCKS);
        processed.rms()
    };

    let flat = level_80hz(&[0.0; 10][..]);
    let boosted = level_80hz(&[12.0, 12.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0][..]);
    assert!(db_ratio(boosted, flat) > 3.0, "flat {flat}, boosted {boosted}");
}

#[test]
fn test_disabled_equalizer_is_transparent() {
    let mut player = SoftwarePlayer::new(true);
    player.manager.apply_preset(EqPreset::BassBoost, false);
    let element = playing_tones(&[80.0], 0.5, 3.0);
    player.manager.attach_audio_element(element.clone());

    let (_, processed) = measure(&mut player.mix(&element), SETTLE_BLOCKS, MEASURE_BLOCKS);
    let expected_rms = 0.5 / std::f32::consts::SQRT_2;
    assert!(db_ratio(processed.rms(), expected_rms).abs() < 0.2);
}

#[test]
fn test_normalization_tames_loud_signal() {
    let level = |normalize: bool| {
        let mut player = SoftwarePlayer::new(true);
        player.manager.set_normalization(normalize);
        let element = playing_tones(&[1000.0], 0.9, 3.0);
        player.manager.attach_audio_element(element.clone());
        let (_, processed) = measure(&mut player.mix(&element), SETTLE_BLOCKS, MEASURE_BLOCKS);
        processed.rms()
    };

    let plain = level(false);
    let normalized = level(true);
    assert!(
        db_ratio(plain, normalized) > 6.0,
        "plain {plain}, normalized {normalized}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_fade_follows_render_clock() {
    let mut player = SoftwarePlayer::new(true);
    let element = playing_tones(&[1000.0], 0.5, 4.0);
    player.manager.attach_audio_element(element.clone());
    let mut mix = player.mix(&element);

    player.manager.set_master_volume(0.3);
    let fade = player.manager.fade_to(0.9, 2.0, Some(element.clone()));
    measure(&mut mix, blocks_for(2.0), 0);

    let gain = player.manager.master_gain_value().unwrap();
    assert!((gain - 0.9).abs() < 1e-3, "gain {gain}");
    assert!(player.manager.context_time().unwrap() >= 2.0);

    fade.await;
    assert_eq!(player.manager.volume(), 0.3);
    assert_eq!(lock_element(&element).volume(), 0.3);
}

// ============================================================================
// DIRECT PATH
// ============================================================================

#[test]
fn test_autoplay_block_then_user_gesture() {
    let mut player = SoftwarePlayer::new(false);
    let element = playing_tones(&[1000.0], 0.5, 3.0);

    player.manager.attach_audio_element(element.clone());
    assert_eq!(player.manager.state(), EffectsState::DegradedFallback);
    assert!(!is_muted(&element));

    let mut mix = player.mix(&element);
    let (direct, processed) = measure(&mut mix, 0, 4);
    assert!(!direct.is_silent());
    assert!(processed.is_silent());

    player.activation.grant();
    player.manager.attach_audio_element(element.clone());
    assert!(player.manager.is_active());
    assert!(is_muted(&element));

    let (direct, processed) = measure(&mut mix, SETTLE_BLOCKS, 4);
    assert!(direct.is_silent());
    assert!(!processed.is_silent());
}

#[test]
fn test_unsupported_environment_plays_directly() {
    let mut manager = AudioEffectsManager::new(|| -> Result<Box<dyn AudioContext>, GraphError> {
        Err(GraphError::Unsupported("no output device".to_string()))
    });
    let element = playing_tones(&[1000.0], 0.5, 3.0);
    manager.attach_audio_element(element.clone());
    assert!(!manager.is_active());

    let mut mix = PlaybackMix::new(element.clone(), RenderTap::new());
    let (full, _) = measure(&mut mix, 0, MEASURE_BLOCKS);

    manager.set_master_volume(0.5);
    let (half, processed) = measure(&mut mix, 0, MEASURE_BLOCKS);

    assert!((db_ratio(full.rms(), half.rms()) - 6.02).abs() < 0.1);
    assert!(processed.is_silent());
}

#[test]
fn test_detach_returns_to_direct_playback() {
    let mut player = SoftwarePlayer::new(true);
    let element = playing_tones(&[1000.0], 0.5, 3.0);
    player.manager.attach_audio_element(element.clone());
    let mut mix = player.mix(&element);
    measure(&mut mix, 4, 0);

    player.manager.detach();
    assert_eq!(player.manager.state(), EffectsState::Unattached);
    assert!(!is_muted(&element));

    let (direct, processed) = measure(&mut mix, 0, 4);
    assert!(!direct.is_silent());
    assert!(processed.is_silent());
}

#[test]
fn test_mixed_output_is_never_doubled() {
    let mut player = SoftwarePlayer::new(true);
    let element = playing_tones(&[1000.0], 0.5, 3.0);
    player.manager.attach_audio_element(element.clone());
    let mut mix = player.mix(&element);

    let mut out = vec![0.0; 1024];
    for _ in 0..MEASURE_BLOCKS {
        mix.render(&mut out);
        assert!(out.iter().all(|s| s.abs() <= 0.5 + 1e-3));
    }
}
