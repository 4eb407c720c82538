use sitecheck_orchestrator::config::PlanLimits;
use sitecheck_orchestrator::settings::{load_settings, save_settings, PersistentSettings};
use tempfile::TempDir;

#[test]
fn test_load_missing_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nonexistent.json");
    let settings = load_settings(&path);
    assert!(settings.global_max_concurrent.is_none());
    assert!(settings.plan_limits.is_none());
    assert!(settings.reservoir_capacity.is_none());
}

#[test]
fn test_load_invalid_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.json");
    std::fs::write(&path, "not json at all {{{").unwrap();
    let settings = load_settings(&path);
    // Should return defaults instead of panicking
    assert!(settings.global_max_concurrent.is_none());
    assert!(settings.plan_limits.is_none());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("settings.json");

    let settings = PersistentSettings {
        global_max_concurrent: Some(50),
        plan_limits: Some(PlanLimits {
            free: 2,
            pro: 5,
            enterprise: 25,
        }),
        reservoir_capacity: Some(2_000),
    };

    save_settings(&path, &settings);
    let loaded = load_settings(&path);

    assert_eq!(loaded.global_max_concurrent, Some(50));
    assert_eq!(loaded.plan_limits.map(|p| p.enterprise), Some(25));
    assert_eq!(loaded.reservoir_capacity, Some(2_000));
}

#[test]
fn test_partial_settings() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("partial.json");

    // Write JSON with only one field set
    std::fs::write(&path, r#"{"globalMaxConcurrent": 4}"#).unwrap();
    let loaded = load_settings(&path);

    assert_eq!(loaded.global_max_concurrent, Some(4));
    assert!(loaded.plan_limits.is_none());
    assert!(loaded.reservoir_capacity.is_none());
}
