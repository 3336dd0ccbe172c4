//! Per-capability settings.
//!
//! Entries come from the `[capabilities.<name>]` tables of the loaded
//! configuration. A capability without an entry gets the defaults
//! (remote execution disabled), which are then stored so later lookups see
//! the same values.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Settings for one capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilitySettings {
    /// Whether workers expose this capability over RPC
    pub remote_enabled: bool,
}

/// Concurrent settings table keyed by capability name
#[derive(Debug, Default)]
pub struct CapabilitySettingsStore {
    entries: DashMap<String, CapabilitySettings>,
}

impl CapabilitySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(settings: &HashMap<String, CapabilitySettings>) -> Self {
        let entries = DashMap::with_capacity(settings.len());
        for (name, value) in settings {
            entries.insert(name.clone(), *value);
        }
        Self { entries }
    }

    /// Settings for `name`, materializing defaults on first access
    pub fn settings(&self, name: &str) -> CapabilitySettings {
        *self.entries.entry(name.to_string()).or_insert_with(|| {
            info!(
                capability = name,
                "No settings found for capability, using defaults (remote_enabled=false)"
            );
            CapabilitySettings::default()
        })
    }

    pub fn remote_enabled(&self, name: &str) -> bool {
        self.settings(name).remote_enabled
    }

    pub fn set(&self, name: impl Into<String>, settings: CapabilitySettings) {
        self.entries.insert(name.into(), settings);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
