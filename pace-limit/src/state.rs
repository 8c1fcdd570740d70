//! Persisted cross-process state.
//!
//! ```json
//! {"schema_version":1,"window_length_seconds":60.0,"limit":10,
//!  "entries":[{"at":1700000000.25,"tokens":1}]}
//! ```
//!
//! Readers treat a missing file as empty and a corrupt one as
//! [`LimitError::StateCorruption`], which callers recover from by starting over.

use std::io::ErrorKind;
use std::io::Write;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::debug;
use tracing::warn;

use crate::LimitError;
use crate::window::UsageEntry;
use crate::window::UsageLog;

pub(crate) const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WindowState {
    schema_version: u32,
    window_length_seconds: f64,
    limit: u32,
    entries: Vec<UsageEntry>,
}

fn corrupt(path: &Path, reason: impl Into<String>) -> LimitError {
    LimitError::StateCorruption {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<WindowState, LimitError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(corrupt(path, "file is empty"));
    }
    let state: WindowState =
        serde_json::from_slice(bytes).map_err(|e| corrupt(path, e.to_string()))?;

    if state.schema_version != SCHEMA_VERSION {
        return Err(corrupt(
            path,
            format!(
                "unsupported schema_version {} (expected {SCHEMA_VERSION})",
                state.schema_version
            ),
        ));
    }
    if let Some(bad) = state
        .entries
        .iter()
        .find(|e| !e.at.is_finite() || e.tokens == 0)
    {
        return Err(corrupt(path, format!("invalid entry {bad:?}")));
    }
    Ok(state)
}

/// Read the usage log at `path`.
///
/// Returns `Ok(None)` if the file does not exist.
pub(crate) fn load(path: &Path, window: f64, limit: u32) -> Result<Option<UsageLog>, LimitError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(corrupt(path, format!("unreadable: {e}"))),
    };
    let state = decode(path, &bytes)?;

    if state.limit != limit || state.window_length_seconds != window {
        debug!(
            path = %path.display(),
            stored_limit = state.limit,
            stored_window = state.window_length_seconds,
            limit,
            window,
            "state written with different parameters; using configured values"
        );
    }
    Ok(Some(UsageLog::from_entries(state.entries)))
}

/// Like [`load`], but a missing or corrupt file yields an empty log.
pub(crate) fn load_or_fresh(path: &Path, window: f64, limit: u32) -> UsageLog {
    match load(path, window, limit) {
        Ok(Some(log)) => log,
        Ok(None) => UsageLog::default(),
        Err(e) => {
            warn!(error = %e, "reinitialising rate limit state");
            UsageLog::default()
        }
    }
}

/// Atomically replace the file at `path` with `log`.
///
/// The caller must hold the state lock.
pub(crate) fn store(path: &Path, log: &UsageLog, window: f64, limit: u32) -> std::io::Result<()> {
    let state = WindowState {
        schema_version: SCHEMA_VERSION,
        window_length_seconds: window,
        limit,
        entries: log.entries().copied().collect(),
    };
    let json = serde_json::to_vec(&state)?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&json)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
