//! Recoverable loop position (`checkpoint.json`) with schema validation on load.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Local;
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::types::Phase;
use crate::io::atomic::write_json_atomic;

const CHECKPOINT_SCHEMA: &str = include_str!("../../schemas/checkpoint.schema.json");

/// Snapshot of where the loop was after the last finished step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub phase: Phase,
    /// Last completed iteration number (session-wide, monotonically increasing).
    pub iteration: u32,
    /// Ordinal of the task the last iteration worked on.
    pub active_task_id: Option<usize>,
    pub active_task: Option<String>,
    pub pending_count: usize,
    /// RFC 3339 time the checkpoint was written.
    pub timestamp: String,
    pub last_error: Option<String>,
}

impl Checkpoint {
    /// Checkpoint stamped with the current local time.
    pub fn now(phase: Phase, iteration: u32, pending_count: usize) -> Self {
        Self {
            phase,
            iteration,
            active_task_id: None,
            active_task: None,
            pending_count,
            timestamp: Local::now().to_rfc3339(),
            last_error: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointManager {
    path: PathBuf,
}

impl CheckpointManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Atomically persist `checkpoint`, replacing any previous one.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        debug!(
            path = %self.path.display(),
            phase = %checkpoint.phase,
            iteration = checkpoint.iteration,
            pending = checkpoint.pending_count,
            "writing checkpoint"
        );
        write_json_atomic(&self.path, checkpoint)
    }

    /// Load the checkpoint if one exists and is valid.
    ///
    /// A corrupt or schema-invalid checkpoint is reported and treated as absent.
    pub fn load(&self) -> Option<Checkpoint> {
        match self.try_load() {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                warn!(path = %self.path.display(), err = %format!("{err:#}"), "ignoring invalid checkpoint");
                None
            }
        }
    }

    /// Strict variant of [`CheckpointManager::load`].
    pub fn try_load(&self) -> Result<Option<Checkpoint>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let value: Value = serde_json::from_str(&contents)
            .with_context(|| format!("parse checkpoint {}", self.path.display()))?;
        validate_schema(&value)?;
        let checkpoint: Checkpoint = serde_json::from_value(value)
            .with_context(|| format!("deserialize checkpoint {}", self.path.display()))?;
        debug!(phase = %checkpoint.phase, iteration = checkpoint.iteration, "checkpoint loaded");
        Ok(Some(checkpoint))
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Remove the checkpoint; a missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "checkpoint cleared");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

fn validate_schema(checkpoint: &Value) -> Result<()> {
    let schema_value: Value =
        serde_json::from_str(CHECKPOINT_SCHEMA).context("parse checkpoint schema")?;
    let compiled =
        validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(checkpoint) {
        let messages = compiled
            .iter_errors(checkpoint)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "checkpoint schema validation failed: {}",
            messages.join("; ")
        ));
    }
    Ok(())
}
