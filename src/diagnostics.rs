//! Diagnostics for Order Desk.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Health**: schema version, database size, rate age, submission counts
//! - **Directories**: data and log locations (overridable through env)
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files
//! - **Redaction**: masks secrets in values handed back to the frontend

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::AppState;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the rolling log files (`order-desk.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "order-desk";

const APP_DIR_NAME: &str = "com.orderdesk.app";

pub const DATA_DIR_ENV: &str = "ORDER_DESK_DATA_DIR";
pub const LOG_DIR_ENV: &str = "ORDER_DESK_LOG_DIR";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Snapshot shown on the settings screen's status panel.
pub fn health(state: &AppState) -> Result<Value, String> {
    let (schema_version, submissions) = {
        let conn = state.db.conn.lock().map_err(|e| e.to_string())?;
        let schema_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);
        let mut submissions = serde_json::Map::new();
        if let Ok(mut stmt) =
            conn.prepare("SELECT status, COUNT(*) FROM submitted_orders GROUP BY status")
        {
            if let Ok(rows) = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            }) {
                for (status, count) in rows.flatten() {
                    submissions.insert(status, json!(count));
                }
            }
        }
        (schema_version, Value::Object(submissions))
    }; // lock released here

    let db_size = fs::metadata(&state.db.db_path).map(|m| m.len()).unwrap_or(0);
    let open_carts = state.carts.lock().map(|c| c.len()).unwrap_or(0);
    let rates_fetched_at = state.rates_snapshot().map(|r| r.fetched_at.to_rfc3339());

    Ok(json!({
        "schemaVersion": schema_version,
        "dbSizeBytes": db_size,
        "openCarts": open_carts,
        "ratesFetchedAt": rates_fetched_at,
        "submissions": submissions,
        "logDir": get_log_dir().to_string_lossy(),
    }))
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

fn platform_data_base() -> PathBuf {
    std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        })
}

fn env_dir(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Where the database lives. `ORDER_DESK_DATA_DIR` wins over the platform
/// default.
pub fn get_data_dir() -> PathBuf {
    env_dir(DATA_DIR_ENV).unwrap_or_else(|| platform_data_base().join(APP_DIR_NAME))
}

/// Where rolling logs are written. `ORDER_DESK_LOG_DIR` wins, otherwise a
/// `logs` folder next to the database.
pub fn get_log_dir() -> PathBuf {
    env_dir(LOG_DIR_ENV).unwrap_or_else(|| get_data_dir().join("logs"))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs() {
    prune_logs_in(&get_log_dir(), MAX_LOG_FILES);
}

fn prune_logs_in(log_dir: &Path, keep: usize) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.iter().skip(keep) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Replace every secret-looking value in `value`, recursing into objects
/// and arrays.
pub fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) {
                    redacted.insert(key, Value::String("[REDACTED]".to_string()));
                } else {
                    redacted.insert(key, redact_sensitive_fields(value));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(redact_sensitive_fields).collect())
        }
        other => other,
    }
}

fn should_redact_key(key: &str) -> bool {
    let normalized = key.to_ascii_lowercase();
    let sensitive_markers = [
        "api_key",
        "apikey",
        "secret",
        "password",
        "token",
        "authorization",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}
