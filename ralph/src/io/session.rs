//! Session storage under `.ralph/sessions/<id>/` plus the active-session pointer.
//!
//! A session isolates one line of work: its own plan, progress log,
//! checkpoint and (optionally) specs. At most one session is active; the
//! pointer file holds its id. No pointer means the `default` session.

use std::fs;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::session_id::{DEFAULT_SESSION_ID, session_id, validate_id};
use crate::core::types::SpecsMode;
use crate::io::atomic::{write_atomic, write_json_atomic};
use crate::io::paths::{RalphPaths, SessionPaths};

/// Persisted session metadata (`session.json`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionMeta {
    pub id: String,
    pub label: String,
    /// RFC 3339 creation time.
    pub created_at: String,
    pub specs_mode: SpecsMode,
}

/// A resolved session ready for use by the orchestrator.
#[derive(Debug, Clone)]
pub struct Session {
    pub meta: SessionMeta,
    pub paths: SessionPaths,
    pub active: bool,
}

/// Listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub meta: SessionMeta,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    project: RalphPaths,
}

impl SessionStore {
    pub fn new(project: RalphPaths) -> Self {
        Self { project }
    }

    pub fn project(&self) -> &RalphPaths {
        &self.project
    }

    /// Create a new session from a human label.
    pub fn create(&self, label: &str, specs_mode: SpecsMode) -> Result<SessionMeta> {
        self.create_at(label, specs_mode, Local::now())
    }

    pub fn create_at(
        &self,
        label: &str,
        specs_mode: SpecsMode,
        now: DateTime<Local>,
    ) -> Result<SessionMeta> {
        let base = session_id(label, now.naive_local());
        let id = self.unique_id(&base)?;
        let meta = SessionMeta {
            id,
            label: label.trim().to_string(),
            created_at: now.to_rfc3339(),
            specs_mode,
        };
        self.write_new(&meta)?;
        info!(session = %meta.id, specs_mode = %meta.specs_mode, "session created");
        Ok(meta)
    }

    fn unique_id(&self, base: &str) -> Result<String> {
        for suffix in 1..=999u32 {
            let id = if suffix == 1 {
                base.to_string()
            } else {
                format!("{base}-{suffix}")
            };
            validate_id(&id)?;
            if !self.project.session_dir(&id).exists() {
                return Ok(id);
            }
        }
        Err(anyhow!(
            "unable to generate unique session id from base '{base}' (too many existing sessions)"
        ))
    }

    fn write_new(&self, meta: &SessionMeta) -> Result<()> {
        let paths = self.project.session(&meta.id, meta.specs_mode);
        fs::create_dir_all(&paths.dir)
            .with_context(|| format!("create session dir {}", paths.dir.display()))?;
        if meta.specs_mode == SpecsMode::Isolated {
            fs::create_dir_all(&paths.specs_dir)
                .with_context(|| format!("create specs dir {}", paths.specs_dir.display()))?;
        }
        write_json_atomic(&paths.meta_path, meta)
    }

    /// Load metadata for an existing session.
    pub fn load(&self, id: &str) -> Result<SessionMeta> {
        validate_id(id)?;
        let path = self.project.session_dir(id).join("session.json");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("session '{id}' not found ({})", path.display()))?;
        let meta: SessionMeta = serde_json::from_str(&contents)
            .with_context(|| format!("parse session metadata {}", path.display()))?;
        if meta.id != id {
            return Err(anyhow!(
                "session metadata id '{}' does not match directory '{id}'",
                meta.id
            ));
        }
        Ok(meta)
    }

    pub fn exists(&self, id: &str) -> bool {
        validate_id(id).is_ok() && self.project.session_dir(id).join("session.json").is_file()
    }

    /// All sessions with readable metadata, oldest first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let active = self.active_id();
        let mut sessions = Vec::new();
        if !self.project.sessions_dir.exists() {
            return Ok(sessions);
        }
        let entries = fs::read_dir(&self.project.sessions_dir).with_context(|| {
            format!("read sessions dir {}", self.project.sessions_dir.display())
        })?;
        for entry in entries {
            let entry = entry.context("read sessions dir entry")?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() {
                continue;
            }
            match self.load(&name) {
                Ok(meta) => sessions.push(SessionSummary {
                    active: active.as_deref() == Some(meta.id.as_str()),
                    meta,
                }),
                Err(err) => warn!(dir = %name, err = %err, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| {
            a.meta
                .created_at
                .cmp(&b.meta.created_at)
                .then_with(|| a.meta.id.cmp(&b.meta.id))
        });
        Ok(sessions)
    }

    /// Id stored in the active-session pointer, if it is present and valid.
    pub fn active_id(&self) -> Option<String> {
        let path = &self.project.active_session_path;
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "unreadable active session pointer");
                return None;
            }
        };
        let id = contents.trim();
        if id.is_empty() {
            return None;
        }
        if let Err(err) = validate_id(id) {
            warn!(err = %err, "ignoring invalid active session pointer");
            return None;
        }
        Some(id.to_string())
    }

    /// Point the active-session pointer at `id` (atomic replace).
    pub fn activate(&self, id: &str) -> Result<()> {
        if !self.exists(id) {
            return Err(anyhow!("session '{id}' does not exist"));
        }
        write_atomic(&self.project.active_session_path, &format!("{id}\n"))?;
        debug!(session = id, "session activated");
        Ok(())
    }

    /// Remove the pointer so the default session is used.
    pub fn deactivate(&self) -> Result<()> {
        let path = &self.project.active_session_path;
        if path.exists() {
            fs::remove_file(path).with_context(|| format!("remove {}", path.display()))?;
        }
        Ok(())
    }

    /// Delete a session's directory tree, clearing the pointer if it was active.
    pub fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let dir = self.project.session_dir(id);
        if !dir.exists() {
            return Err(anyhow!("session '{id}' does not exist"));
        }
        if self.active_id().as_deref() == Some(id) {
            self.deactivate()?;
        }
        fs::remove_dir_all(&dir).with_context(|| format!("remove {}", dir.display()))?;
        info!(session = id, "session deleted");
        Ok(())
    }

    /// Load the default session, creating it on first use.
    pub fn ensure_default(&self) -> Result<SessionMeta> {
        if self.exists(DEFAULT_SESSION_ID) {
            return self.load(DEFAULT_SESSION_ID);
        }
        let meta = SessionMeta {
            id: DEFAULT_SESSION_ID.to_string(),
            label: DEFAULT_SESSION_ID.to_string(),
            created_at: Local::now().to_rfc3339(),
            specs_mode: SpecsMode::Shared,
        };
        self.write_new(&meta)?;
        debug!("default session created");
        Ok(meta)
    }

    /// Resolve which session to use: explicit id, else the active pointer,
    /// else the default session.
    pub fn resolve(&self, explicit: Option<&str>) -> Result<Session> {
        let active = self.active_id();
        let meta = match explicit {
            Some(id) => self.load(id)?,
            None => match active.as_deref() {
                Some(id) if self.exists(id) => self.load(id)?,
                Some(id) => {
                    warn!(session = id, "active session missing, using default session");
                    self.ensure_default()?
                }
                None => self.ensure_default()?,
            },
        };
        Ok(self.open(meta, active.as_deref()))
    }

    fn open(&self, meta: SessionMeta, active: Option<&str>) -> Session {
        let paths = self.project.session(&meta.id, meta.specs_mode);
        let is_active = match active {
            Some(id) => id == meta.id,
            None => meta.id == DEFAULT_SESSION_ID,
        };
        Session {
            meta,
            paths,
            active: is_active,
        }
    }
}
