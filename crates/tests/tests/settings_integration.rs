//! Persisted settings flowing into the effects chain

use encore_core::domain::config::{PlayerSettings, SettingsStore, CUSTOM_PRESET};
use encore_core::domain::equalizer::EqPreset;
use encore_core::domain::testing::{FailurePlan, StubElement};
use encore_tests::recording_manager;
use tempfile::TempDir;

#[tokio::test]
async fn test_stored_settings_drive_the_graph() {
    let dir = TempDir::new().unwrap();
    let store = SettingsStore::new(dir.path().to_path_buf());

    let mut settings = PlayerSettings::factory_default();
    settings.equalizer.apply_preset(EqPreset::Rock);
    settings.normalization = true;
    settings.volume = 0.6;
    store.save(&settings).await.unwrap();

    let loaded = store.load().await;
    let (mut manager, _journal) = recording_manager(FailurePlan::default());
    let (stub, element) = StubElement::shared();
    manager.apply_settings(&loaded);
    manager.attach_audio_element(element);

    assert!(manager.is_active());
    assert!(manager.normalization());
    assert_eq!(manager.volume(), 0.6);
    assert_eq!(stub.lock().unwrap().volume, 0.6);

    let gains: Vec<f32> = manager.filters().iter().map(|f| f.gain_db).collect();
    assert_eq!(gains, EqPreset::Rock.gains().to_vec());
}

#[tokio::test]
async fn test_custom_gain_survives_reload() {
    let dir = TempDir::new().unwrap();
    let store = SettingsStore::new(dir.path().to_path_buf());

    let mut settings = store.load().await;
    settings.equalizer.set_gain(3, -7.5).unwrap();
    settings.equalizer.enabled = false;
    store.save(&settings).await.unwrap();

    let loaded = store.load().await;
    assert_eq!(loaded.equalizer.preset, CUSTOM_PRESET);
    assert_eq!(loaded.equalizer.gains[3], -7.5);

    let (mut manager, _journal) = recording_manager(FailurePlan::default());
    manager.attach_audio_element(StubElement::shared().1);
    manager.apply_settings(&loaded);

    assert!(!manager.eq_enabled());
    assert_eq!(manager.bands()[3].gain, -7.5);
    assert!(manager.filters().iter().all(|f| f.gain_db == 0.0));
}

#[tokio::test]
async fn test_corrupt_settings_fall_back_to_defaults() {
    let dir = TempDir::new().unwrap();
    let store = SettingsStore::new(dir.path().to_path_buf());
    tokio::fs::write(store.settings_path(), "volume = [not toml")
        .await
        .unwrap();

    let loaded = store.load().await;
    assert_eq!(loaded, PlayerSettings::factory_default());
    assert!(store.backup_path().exists());

    let (mut manager, _journal) = recording_manager(FailurePlan::default());
    manager.apply_settings(&loaded);
    assert_eq!(manager.volume(), 1.0);
    assert!(!manager.normalization());
}
