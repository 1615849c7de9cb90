//! Configuration for Sales Desk.
//!
//! Settings come from a TOML file (default `<config dir>/sales-desk/config.toml`)
//! and are then overridden by `SALES_DESK_*` environment variables. A missing
//! file is not an error: every section has usable defaults.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};

const APP_DIR_NAME: &str = "sales-desk";
const CONFIG_FILE_NAME: &str = "config.toml";

pub const ENV_BACKEND: &str = "SALES_DESK_BACKEND";
pub const ENV_DATA_DIR: &str = "SALES_DESK_DATA_DIR";
pub const ENV_REST_URL: &str = "SALES_DESK_REST_URL";
pub const ENV_REST_KEY: &str = "SALES_DESK_REST_KEY";
pub const ENV_CONNECTION: &str = "SALES_DESK_CONNECTION";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Document,
    Rest,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Document => "document",
            Self::Rest => "rest",
        }
    }
}

impl FromStr for BackendKind {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sqlite" | "sql" | "relational" => Ok(Self::Sqlite),
            "document" | "doc" | "memory" => Ok(Self::Document),
            "rest" | "postgrest" | "remote" => Ok(Self::Rest),
            other => Err(AppError::Config(format!(
                "unknown backend '{other}' (expected sqlite, document or rest)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: BackendKind,
    pub data_dir: Option<PathBuf>,
    /// Snapshot the document store to disk after every write.
    pub persist: bool,
    /// Wrap the backend with the local read cache.
    pub local_cache: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            data_dir: None,
            persist: true,
            local_cache: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestConfig {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub connection_string: Option<String>,
    pub timeout_secs: u64,
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            connection_string: None,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub top_products: usize,
    /// Null well-formed ids that point at records which do not exist.
    pub check_references: bool,
    pub dry_run: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            top_products: 10,
            check_references: true,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: Option<String>,
    pub json: bool,
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: None,
            json: false,
            file: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub rest: RestConfig,
    pub import: ImportConfig,
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

impl AppConfig {
    /// Load the config file (explicit path or the default location) and apply
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let resolved = path.map(Path::to_path_buf).or_else(default_config_path);
        let mut config = match resolved {
            Some(ref file) if file.exists() => {
                info!("Loading config from {}", file.display());
                let raw = fs::read_to_string(file)?;
                Self::from_toml(&raw)?
            }
            Some(ref file) if path.is_some() => {
                return Err(AppError::Config(format!(
                    "config file not found: {}",
                    file.display()
                )));
            }
            _ => {
                debug!("No config file, using defaults");
                Self::default()
            }
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> AppResult<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn apply_env_overrides(&mut self) -> AppResult<()> {
        if let Some(backend) = env_value(ENV_BACKEND) {
            self.store.backend = backend.parse()?;
        }
        if let Some(dir) = env_value(ENV_DATA_DIR) {
            self.store.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = env_value(ENV_REST_URL) {
            self.rest.url = Some(url);
        }
        if let Some(key) = env_value(ENV_REST_KEY) {
            self.rest.api_key = Some(key);
        }
        if let Some(connection) = env_value(ENV_CONNECTION) {
            self.rest.connection_string = Some(connection);
        }
        Ok(())
    }

    /// Directory holding the SQLite database and document snapshots.
    pub fn data_dir(&self) -> PathBuf {
        self.store.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|dir| dir.join(APP_DIR_NAME))
                .unwrap_or_else(|| PathBuf::from("data"))
        })
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

// ---------------------------------------------------------------------------
// REST service credentials
// ---------------------------------------------------------------------------

impl RestConfig {
    /// Resolve the service base URL and API key. A connection string wins over
    /// the separate `url` / `api_key` settings for whatever it carries.
    pub fn resolve(&self) -> AppResult<(String, String)> {
        let from_connection = self.connection_string.as_deref();
        let url = from_connection
            .and_then(extract_url_from_connection_string)
            .or_else(|| self.url.clone())
            .map(|u| normalize_service_url(&u))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| AppError::Config("REST store not configured: missing URL".into()))?;
        let key = from_connection
            .and_then(extract_key_from_connection_string)
            .or_else(|| self.api_key.clone())
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| AppError::Config("REST store not configured: missing API key".into()))?;
        Ok((url, key))
    }
}

/// Normalise the service base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_service_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

pub fn extract_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .or_else(|| v.get("apiKey"))
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| v.get("url").and_then(Value::as_str).map(normalize_service_url))
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for name in [
            ENV_BACKEND,
            ENV_DATA_DIR,
            ENV_REST_URL,
            ENV_REST_KEY,
            ENV_CONNECTION,
        ] {
            std::env::remove_var(name);
        }
    }

    #[test]
    fn test_normalize_service_url() {
        assert_eq!(
            normalize_service_url("db.example.com/rest/v1/"),
            "https://db.example.com"
        );
        assert_eq!(
            normalize_service_url("localhost:54321"),
            "http://localhost:54321"
        );
        assert_eq!(
            normalize_service_url("https://db.example.com///"),
            "https://db.example.com"
        );
        assert_eq!(normalize_service_url("   "), "");
    }

    #[test]
    fn test_connection_string_json_and_base64() {
        let json = r#"{"url":"db.example.com/rest/v1","key":"secret-key"}"#;
        assert_eq!(
            extract_url_from_connection_string(json).as_deref(),
            Some("https://db.example.com")
        );
        assert_eq!(
            extract_key_from_connection_string(json).as_deref(),
            Some("secret-key")
        );

        let encoded = BASE64_STANDARD
            .encode(json)
            .replace('+', "-")
            .replace('/', "_")
            .trim_end_matches('=')
            .to_string();
        assert_eq!(
            extract_key_from_connection_string(&encoded).as_deref(),
            Some("secret-key")
        );
        assert!(extract_key_from_connection_string("short").is_none());
    }

    #[test]
    fn test_from_toml_fills_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [store]
            backend = "document"
            persist = false

            [import]
            top_products = 3
            "#,
        )
        .expect("parse config");
        assert_eq!(config.store.backend, BackendKind::Document);
        assert!(!config.store.persist);
        assert_eq!(config.import.top_products, 3);
        assert!(config.import.check_references);
        assert_eq!(config.rest.timeout_secs, 30);
        assert!(config.logging.file);
    }

    #[test]
    fn test_from_toml_rejects_unknown_backend() {
        let err = AppConfig::from_toml("[store]\nbackend = \"mongo\"\n").unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_env_overrides_win_over_file() {
        clear_env();
        std::env::set_var(ENV_BACKEND, "rest");
        std::env::set_var(ENV_REST_URL, "localhost:3000");
        std::env::set_var(ENV_REST_KEY, "env-key");

        let mut config = AppConfig::from_toml("[store]\nbackend = \"sqlite\"\n").unwrap();
        config.apply_env_overrides().expect("overrides");
        assert_eq!(config.store.backend, BackendKind::Rest);

        let (url, key) = config.rest.resolve().expect("resolve rest");
        assert_eq!(url, "http://localhost:3000");
        assert_eq!(key, "env-key");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_is_error() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let err = AppConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_load_reads_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[store]\nbackend = \"document\"\n").unwrap();
        let config = AppConfig::load(Some(&path)).expect("load");
        assert_eq!(config.store.backend, BackendKind::Document);
    }

    #[test]
    fn test_rest_resolve_requires_key() {
        let rest = RestConfig {
            url: Some("db.example.com".into()),
            ..RestConfig::default()
        };
        assert!(matches!(rest.resolve(), Err(AppError::Config(_))));
    }
}
