use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

use crate::config::PlanLimits;

/// Operator overrides that survive restarts. CLI flags win over these.
#[derive(Serialize, Deserialize, Default, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PersistentSettings {
    pub global_max_concurrent: Option<usize>,
    pub plan_limits: Option<PlanLimits>,
    pub reservoir_capacity: Option<usize>,
}

pub fn load_settings(path: &Path) -> PersistentSettings {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str(&content) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Ignoring unreadable settings file {:?}: {}", path, e);
                PersistentSettings::default()
            }
        },
        Err(_) => PersistentSettings::default(),
    }
}

pub fn save_settings(path: &Path, settings: &PersistentSettings) {
    match serde_json::to_string_pretty(settings) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                warn!("Failed to save settings to {:?}: {}", path, e);
            }
        }
        Err(e) => {
            warn!("Failed to serialize settings: {}", e);
        }
    }
}
