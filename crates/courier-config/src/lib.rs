use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub store: Store,
    pub remote: Remote,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub import: Import,
    #[serde(default)]
    pub logging: Logging,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub mode: String,
    pub endpoint: Option<String>,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

/// Abuse-avoidance limits applied by the eligibility filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cooldown_ms: default_cooldown_ms(),
            daily_limit: default_daily_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    #[serde(default = "default_explicit_delay_ms")]
    pub explicit_delay_ms: u64,
    #[serde(default = "default_pool_delay_ms")]
    pub pool_delay_ms: u64,
    #[serde(default = "default_target_page_size")]
    pub target_page_size: usize,
    #[serde(default = "default_failure_log_limit")]
    pub failure_log_limit: usize,
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            explicit_delay_ms: default_explicit_delay_ms(),
            pool_delay_ms: default_pool_delay_ms(),
            target_page_size: default_target_page_size(),
            failure_log_limit: default_failure_log_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_validate_on_import")]
    pub validate_on_import: bool,
}

impl Default for Import {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            validate_on_import: default_validate_on_import(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Logging {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_remote_timeout_ms() -> u64 {
    30_000
}

fn default_cooldown_ms() -> u64 {
    10 * 60 * 1000
}

fn default_daily_limit() -> u32 {
    5
}

fn default_explicit_delay_ms() -> u64 {
    2_000
}

fn default_pool_delay_ms() -> u64 {
    500
}

fn default_target_page_size() -> usize {
    500
}

fn default_failure_log_limit() -> usize {
    10_000
}

fn default_chunk_size() -> usize {
    5
}

fn default_validate_on_import() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    match cfg.remote.mode.as_str() {
        "dry_run" => {}
        "http" => {
            if cfg
                .remote
                .endpoint
                .as_ref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true)
            {
                return Err(ConfigError::UnsupportedConfig(
                    "remote.endpoint is required when remote.mode=http".to_string(),
                ));
            }
        }
        other => {
            return Err(ConfigError::UnsupportedConfig(format!(
                "remote.mode={other} is not implemented; supported: dry_run, http"
            )));
        }
    }
    if cfg.remote.timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "remote.timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.dispatch.target_page_size == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dispatch.target_page_size must be >= 1".to_string(),
        ));
    }
    if cfg.import.chunk_size == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "import.chunk_size must be >= 1".to_string(),
        ));
    }
    if cfg.logging.format != "pretty" && cfg.logging.format != "json" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "logging.format={} is not implemented; supported: pretty, json",
            cfg.logging.format
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("courier-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

store:
  type: "memory"

remote:
  mode: "dry_run"
  timeout_ms: 30000

policy:
  cooldown_ms: 600000
  daily_limit: 5

dispatch:
  explicit_delay_ms: 2000
  pool_delay_ms: 500
"#
        .to_string()
    }

    #[test]
    fn applies_defaults_for_omitted_sections() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.policy.daily_limit, 5);
        assert_eq!(cfg.dispatch.target_page_size, 500);
        assert_eq!(cfg.dispatch.failure_log_limit, 10_000);
        assert_eq!(cfg.import.chunk_size, 5);
        assert!(cfg.import.validate_on_import);
        assert_eq!(cfg.logging.format, "pretty");
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_http_remote_without_endpoint() {
        let path = write_temp_config(&base_yaml().replace("mode: \"dry_run\"", "mode: \"http\""));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let path = write_temp_config(&(base_yaml() + "\nimport:\n  chunk_size: 0\n"));
        let err = load_and_validate(&path).expect_err("expected rejection");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_unknown_remote_mode_at_runtime() {
        let mut cfg: Config = serde_yaml::from_str(&base_yaml()).unwrap();
        cfg.remote.mode = "grpc".to_string();
        assert!(matches!(
            validate_runtime_support(&cfg),
            Err(ConfigError::UnsupportedConfig(_))
        ));
    }
}
