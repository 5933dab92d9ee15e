//! TOML configuration for the hostsync daemon and CLI.
//!
//! Layered the usual way: an explicit path, the `HOSTSYNC_CONFIG`
//! environment variable, the system location, then compiled-in defaults.
//! Every section is optional and falls back to its defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for the hostsync process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,
    #[serde(default)]
    pub cmsys: CmsysConfig,
    #[serde(default)]
    pub locations: Vec<LocationRule>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded hostsync configuration");
        Ok(config)
    }

    /// Resolve the configuration:
    /// 1. `explicit`, if given (errors are fatal here).
    /// 2. The path in `HOSTSYNC_CONFIG`.
    /// 3. `/etc/hostsync/hostsync.toml`.
    /// 4. Compiled-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var("HOSTSYNC_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "HOSTSYNC_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new("/etc/hostsync/hostsync.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Server / database
// ---------------------------------------------------------------------------

/// HTTP gateway listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

/// SQLite store location and pool sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    /// Upper bound on pooled connections; this is the outer limit on
    /// concurrent database work across all runs.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/hostsync.db"),
            max_connections: 16,
        }
    }
}

// ---------------------------------------------------------------------------
// Sync engine
// ---------------------------------------------------------------------------

/// Sync engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Worker budget for runs over an explicit or file-derived host list.
    pub list_concurrency: usize,
    /// Worker budget for the per-host fan-out of a full group sync.
    pub group_concurrency: usize,
    /// Hard limit on a single run, independent of whoever started it.
    pub run_timeout_secs: u64,
    /// How long shutdown waits for in-flight runs before abandoning them.
    pub shutdown_grace_secs: u64,
    /// Lookback window used when a task does not set its own.
    pub default_time_range_minutes: i64,
    /// Default row count for execution listings.
    pub default_list_limit: usize,
    /// Upper bound a caller may request for execution listings.
    pub max_list_limit: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            list_concurrency: 10,
            group_concurrency: 10,
            run_timeout_secs: 600,
            shutdown_grace_secs: 30,
            default_time_range_minutes: 60,
            default_list_limit: 50,
            max_list_limit: 500,
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Defaults for the search-index source. Tasks may override endpoint,
/// index pattern and time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchConfig {
    pub endpoint: String,
    pub index_pattern: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout_secs: u64,
    /// Multiplier applied to stored values; metricbeat stores fractions.
    pub value_scale: f64,
    pub fields: ElasticsearchFields,
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9200".to_string(),
            index_pattern: "metricbeat-*".to_string(),
            username: None,
            password: None,
            request_timeout_secs: 30,
            value_scale: 100.0,
            fields: ElasticsearchFields::default(),
        }
    }
}

/// Document field names used to build aggregation queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElasticsearchFields {
    pub host_address: String,
    pub host_name: String,
    pub group: String,
    pub timestamp: String,
    pub cpu: String,
    pub memory: String,
    pub disk: String,
}

impl Default for ElasticsearchFields {
    fn default() -> Self {
        Self {
            host_address: "host.ip".to_string(),
            host_name: "host.hostname".to_string(),
            group: "host.group".to_string(),
            timestamp: "@timestamp".to_string(),
            cpu: "system.cpu.total.norm.pct".to_string(),
            memory: "system.memory.actual.used.pct".to_string(),
            disk: "system.filesystem.used.pct".to_string(),
        }
    }
}

/// Defaults for the inventory-API source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CmsysConfig {
    pub endpoint: String,
    pub api_token: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for CmsysConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8090".to_string(),
            api_token: None,
            request_timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// An address-pattern rule seeded into the location registry at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationRule {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub priority: i64,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = AppConfig::default();

        assert_eq!(cfg.server.bind, "0.0.0.0:8080");
        assert_eq!(cfg.database.path, PathBuf::from("data/hostsync.db"));
        assert_eq!(cfg.sync.list_concurrency, 10);
        assert_eq!(cfg.sync.run_timeout_secs, 600);
        assert_eq!(cfg.sync.default_list_limit, 50);
        assert_eq!(cfg.elasticsearch.fields.host_address, "host.ip");
        assert!(cfg.cmsys.api_token.is_none());
        assert!(cfg.locations.is_empty());
        assert_eq!(cfg.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[server]
bind = "127.0.0.1:9000"

[database]
path = "/var/lib/hostsync/hostsync.db"
max_connections = 4

[sync]
list_concurrency = 20
run_timeout_secs = 120

[elasticsearch]
endpoint = "http://es.internal:9200"
index_pattern = "hosts-*"

[elasticsearch.fields]
cpu = "cpu.pct"

[cmsys]
endpoint = "https://cmsys.internal"
api_token = "secret"

[[locations]]
name = "dc-east"
pattern = "10.1.*"
priority = 1

[[locations]]
name = "dc-west"
pattern = "10.2.0.0/16"

[logging]
level = "debug"
format = "json"
"#;

        let cfg: AppConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.server.bind, "127.0.0.1:9000");
        assert_eq!(cfg.database.max_connections, 4);
        assert_eq!(cfg.sync.list_concurrency, 20);
        assert_eq!(cfg.sync.group_concurrency, 10);
        assert_eq!(cfg.sync.run_timeout_secs, 120);
        assert_eq!(cfg.elasticsearch.endpoint, "http://es.internal:9200");
        assert_eq!(cfg.elasticsearch.fields.cpu, "cpu.pct");
        assert_eq!(cfg.elasticsearch.fields.memory, "system.memory.actual.used.pct");
        assert_eq!(cfg.cmsys.api_token.as_deref(), Some("secret"));
        assert_eq!(cfg.locations.len(), 2);
        assert_eq!(cfg.locations[1].priority, 0);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: AppConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.bind, ServerConfig::default().bind);
        assert_eq!(cfg.sync.max_list_limit, 500);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hostsync.toml");
        std::fs::write(&path, "[server]\nbind = \"0.0.0.0:9999\"\n").unwrap();

        let cfg = AppConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:9999");
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = AppConfig::load(Path::new("/nonexistent/path/hostsync.toml"));
        assert!(result.is_err());
    }
}
