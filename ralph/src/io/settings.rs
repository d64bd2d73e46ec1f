//! Persisted user toggles (`.ralph/settings.json`).
//!
//! Read once per invocation and passed into the orchestrator.

use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::io::atomic::write_json_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    /// Include the cross-session memory in prompts.
    pub memory_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            memory_enabled: true,
        }
    }
}

/// Load settings; a missing or unreadable file yields defaults.
pub fn load_settings(path: &Path) -> Settings {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Settings::default(),
        Err(err) => {
            warn!(path = %path.display(), err = %err, "unreadable settings, using defaults");
            return Settings::default();
        }
    };
    match serde_json::from_str(&contents) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "malformed settings, using defaults");
            Settings::default()
        }
    }
}

pub fn write_settings(path: &Path, settings: &Settings) -> Result<()> {
    write_json_atomic(path, settings)
}
