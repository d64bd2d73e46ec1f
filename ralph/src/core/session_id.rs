//! Session identifier derivation and validation.

use anyhow::{Result, anyhow};
use chrono::NaiveDateTime;

/// Id of the fallback session used when no session is active.
pub const DEFAULT_SESSION_ID: &str = "default";

const MAX_SLUG_LEN: usize = 40;

/// Lowercase a human label into `[a-z0-9-]`, collapsing separator runs.
///
/// Returns `"session"` when nothing usable is left.
pub fn slugify(label: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;
    for ch in label.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
        if slug.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "session".to_string()
    } else {
        slug.to_string()
    }
}

/// Derive a session id from a label and its creation time.
pub fn session_id(label: &str, created_at: NaiveDateTime) -> String {
    format!("{}-{}", slugify(label), created_at.format("%Y%m%d-%H%M%S"))
}

/// Validate that an id is safe to use as a directory name.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("session id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("session id must not be '{id}'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!(
            "session id must be [A-Za-z0-9._-] only (got '{id}')"
        ));
    }
    Ok(())
}
