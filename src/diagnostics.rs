//! Diagnostics for Sales Desk.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform, backend
//! - **Health**: record counts per collection, pending mobile orders, last
//!   import report
//! - **Redaction** of secrets before configuration is printed
//! - **Log rotation helpers** used by `lib.rs` to set up rolling log files

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::AppConfig;
use crate::error::AppResult;
use crate::mobile_import;
use crate::reports;
use crate::repository::Repositories;
use crate::store::{Collection, Filter};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "sales-desk.log";

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Returns version, build timestamp, git SHA, platform and configured backend.
pub fn about(config: &AppConfig) -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
        "backend": config.store.backend.as_str(),
        "dataDir": config.data_dir().display().to_string(),
        "logDir": log_dir(config).display().to_string(),
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Live record counts and import backlog.
pub fn health(repos: &Repositories) -> AppResult<Value> {
    let store = repos.store();
    let mut counts = serde_json::Map::new();
    for collection in Collection::ALL {
        let live = store.count(collection, &Filter::new().is_null("deletedAt"))?;
        counts.insert(collection.as_str().to_string(), json!(live));
    }

    let pending = mobile_import::pending_orders(repos)?.len();
    let last_import = reports::latest(repos)?.map(|r| {
        json!({
            "id": r.meta.id,
            "code": r.meta.code,
            "startedAt": crate::models::timestamp::format(&r.started_at),
            "importedOrders": r.imported_orders,
            "importedVisits": r.imported_visits,
            "failed": r.failed,
            "totalValue": r.total_value,
        })
    });

    Ok(json!({
        "backend": store.backend_name(),
        "records": Value::Object(counts),
        "pendingMobileOrders": pending,
        "lastImport": last_import,
    }))
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Replace the values of secret-looking keys, recursively.
pub fn redact_sensitive_fields(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, value) in map {
                if should_redact_key(&key) && !value.is_null() {
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
        "connection_string",
    ];
    sensitive_markers
        .iter()
        .any(|marker| normalized.contains(marker))
}

/// Effective configuration with secrets hidden.
pub fn redacted_config(config: &AppConfig) -> AppResult<Value> {
    Ok(redact_sensitive_fields(serde_json::to_value(config)?))
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Log directory: `<data dir>/logs`.
pub fn log_dir(config: &AppConfig) -> PathBuf {
    config.data_dir().join("logs")
}

/// Prune old log files, keeping only the most recent `MAX_LOG_FILES`.
pub fn prune_old_logs(log_dir: &Path) {
    if !log_dir.exists() {
        return;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path.is_file()
                && path
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

    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to prune log file {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Customer;
    use crate::store::SqliteStore;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime};

    #[test]
    fn test_about_info_has_required_fields() {
        let info = about(&AppConfig::default());
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert_eq!(info["backend"], "sqlite");
        assert!(info["logDir"].as_str().unwrap().ends_with("logs"));
    }

    #[test]
    fn test_health_counts_live_records() {
        let repos = Repositories::new(Arc::new(SqliteStore::open_in_memory().unwrap()));
        let kept = repos
            .customers
            .create(Customer {
                name: "Padaria Sol".into(),
                ..Customer::default()
            })
            .unwrap();
        let gone = repos
            .customers
            .create(Customer {
                name: "Mercado Lua".into(),
                ..Customer::default()
            })
            .unwrap();
        repos.customers.soft_delete(&gone.meta.id).unwrap();

        let health = health(&repos).unwrap();
        assert_eq!(health["backend"], "sqlite");
        assert_eq!(health["records"]["customers"], 1);
        assert_eq!(health["records"]["orders"], 0);
        assert_eq!(health["pendingMobileOrders"], 0);
        assert!(health["lastImport"].is_null());
        assert!(repos.customers.find(&kept.meta.id).unwrap().is_some());
    }

    #[test]
    fn test_should_redact_key_matches_sensitive_markers() {
        assert!(should_redact_key("api_key"));
        assert!(should_redact_key("Authorization"));
        assert!(should_redact_key("connection_string"));
        assert!(!should_redact_key("url"));
    }

    #[test]
    fn test_redacted_config_hides_rest_secrets() {
        let mut config = AppConfig::default();
        config.rest.url = Some("https://sales.example.com".into());
        config.rest.api_key = Some("service-role-key".into());
        let value = redacted_config(&config).unwrap();
        assert_eq!(value["rest"]["api_key"], json!("[REDACTED]"));
        assert_eq!(value["rest"]["url"], json!("https://sales.example.com"));
        assert!(value["rest"]["connection_string"].is_null());
    }

    #[test]
    fn test_prune_keeps_newest_logs() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        for i in 0..(MAX_LOG_FILES + 3) {
            let path = dir.path().join(format!("{LOG_FILE_PREFIX}.2026-01-{:02}", i + 1));
            fs::write(&path, "line").unwrap();
            let file = fs::File::options().write(true).open(&path).unwrap();
            file.set_modified(base + Duration::from_secs(i as u64 * 60))
                .unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        prune_old_logs(dir.path());

        let remaining: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter_map(|e| e.file_name().to_str().map(String::from))
            .collect();
        assert_eq!(remaining.len(), MAX_LOG_FILES + 1);
        assert!(remaining.contains(&"notes.txt".to_string()));
        assert!(!remaining.contains(&format!("{LOG_FILE_PREFIX}.2026-01-01")));
    }
}
