//! Configuration Loader
//!
//! Environment-aware configuration loading. Sources are layered in order, later
//! sources winning:
//!
//! 1. Built-in defaults ([`KurultaiConfig::default`])
//! 2. `config/kurultai.{yaml,toml,json}` (or the file named by `KURULTAI_CONFIG`)
//! 3. `config/kurultai.<environment>.*` overrides
//! 4. `KURULTAI__SECTION__KEY` environment variables
//! 5. Conventional Neo4j variables (`NEO4J_URI`, `NEO4J_USER`, `NEO4J_PASSWORD`, ...)

use super::error::{ConfigResult, ConfigurationError};
use super::KurultaiConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ENV_PREFIX: &str = "KURULTAI";
const DEFAULT_CONFIG_STEM: &str = "config/kurultai";

/// Loaded, validated configuration plus the context it was loaded in
#[derive(Debug)]
pub struct ConfigManager {
    config: KurultaiConfig,
    environment: String,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        let explicit = env::var("KURULTAI_CONFIG").ok().map(PathBuf::from);
        Self::load_with_env(explicit.as_deref(), &Self::detect_environment())
    }

    /// Load configuration from an explicit file
    pub fn load_from_file(path: &Path) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_with_env(Some(path), &Self::detect_environment())
    }

    /// Load configuration with an explicit environment name.
    ///
    /// An explicitly named file must exist; the conventional default file is optional.
    pub fn load_with_env(
        config_file: Option<&Path>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        if let Some(path) = config_file {
            if !path.exists() {
                return Err(ConfigurationError::config_file_not_found(path.to_path_buf()));
            }
        }

        let defaults = config::Config::try_from(&KurultaiConfig::default())
            .map_err(|e| ConfigurationError::source_error("defaults", e))?;

        let mut builder = config::Config::builder().add_source(defaults);

        builder = match config_file {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_STEM).required(false)),
        };

        let overlay = match config_file {
            Some(path) => Self::environment_overlay(path, environment),
            None => format!("{DEFAULT_CONFIG_STEM}.{environment}"),
        };
        builder = builder.add_source(config::File::with_name(&overlay).required(false));

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let mut config: KurultaiConfig = builder
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| {
                ConfigurationError::source_error(
                    config_file
                        .map(|p| p.display().to_string())
                        .unwrap_or_else(|| DEFAULT_CONFIG_STEM.to_string()),
                    e,
                )
            })?;

        Self::apply_conventional_env_overrides(&mut config);
        config.validate()?;

        debug!(
            "Configuration loaded: {}",
            serde_json::to_string_pretty(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = environment,
            primary_uri = %config.primary_store.uri,
            credentials_present = config.primary_store.has_credentials(),
            fallback_path = %config.fallback.database_path.display(),
            "Configuration loaded successfully"
        );

        if !config.primary_store.has_credentials() {
            warn!("Primary store credentials are not configured; connection will run in fallback mode");
        }

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_file: config_file.map(Path::to_path_buf),
        }))
    }

    /// Load configuration, degrading to defaults (plus environment overrides) on failure
    pub fn load_or_default() -> Arc<ConfigManager> {
        match Self::load() {
            Ok(manager) => manager,
            Err(e) => {
                warn!(error = %e, "Configuration loading failed; using safe defaults");
                let mut config = KurultaiConfig::default();
                Self::apply_conventional_env_overrides(&mut config);
                Arc::new(ConfigManager {
                    config,
                    environment: Self::detect_environment(),
                    config_file: None,
                })
            }
        }
    }

    /// Wrap an already-built configuration (tests, embedding applications)
    pub fn from_config(config: KurultaiConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: Self::detect_environment(),
            config_file: None,
        }))
    }

    pub fn config(&self) -> &KurultaiConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Configuration as JSON with sensitive fields masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    fn detect_environment() -> String {
        env::var("KURULTAI_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }

    /// `config/kurultai.yaml` + `test` -> `config/kurultai.test`
    fn environment_overlay(path: &Path, environment: &str) -> String {
        let stem = path.with_extension("");
        format!("{}.{}", stem.display(), environment)
    }

    fn apply_conventional_env_overrides(config: &mut KurultaiConfig) {
        let non_empty = |name: &str| env::var(name).ok().filter(|value| !value.is_empty());

        if let Some(uri) = non_empty("NEO4J_URI") {
            config.primary_store.uri = uri;
        }
        if let Some(user) = non_empty("NEO4J_USER").or_else(|| non_empty("NEO4J_USERNAME")) {
            config.primary_store.username = Some(user);
        }
        if let Some(password) = non_empty("NEO4J_PASSWORD") {
            config.primary_store.password = Some(password);
        }
        if let Some(database) = non_empty("NEO4J_DATABASE") {
            config.primary_store.database = database;
        }
        if let Some(path) = non_empty("KURULTAI_FALLBACK_DB") {
            config.fallback.database_path = PathBuf::from(path);
        }
    }

    fn sanitize_config_for_logging(config: &KurultaiConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        let sensitive_patterns = ["password", "secret", "api_key", "token", "credential"];
        Self::sanitize_json_recursive(&mut config_json, &sensitive_patterns);
        config_json
    }

    fn sanitize_json_recursive(value: &mut serde_json::Value, sensitive_patterns: &[&str]) {
        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = sensitive_patterns
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        *val = match val {
                            serde_json::Value::Null => serde_json::Value::Null,
                            serde_json::Value::String(s) if s.is_empty() => {
                                serde_json::Value::String("[EMPTY]".to_string())
                            }
                            _ => serde_json::Value::String("[MASKED]".to_string()),
                        };
                    } else {
                        Self::sanitize_json_recursive(val, sensitive_patterns);
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for item in arr.iter_mut() {
                    Self::sanitize_json_recursive(item, sensitive_patterns);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kurultai.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "retry:\n  max_retries: 5\ncircuit_breaker:\n  failure_threshold: 2\n  daily_cost_limit: 12.5\nfailover:\n  standby_agent_id: backup"
        )
        .unwrap();

        let manager = ConfigManager::load_with_env(Some(&path), "test").unwrap();
        let config = manager.config();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.daily_cost_limit, Some(12.5));
        assert_eq!(config.failover.standby_agent_id, "backup");
        assert_eq!(manager.environment(), "test");
    }

    #[test]
    fn test_environment_overlay_applies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kurultai.yaml");
        std::fs::write(&path, "retry:\n  max_retries: 5\n").unwrap();
        std::fs::write(
            dir.path().join("kurultai.staging.yaml"),
            "retry:\n  max_retries: 9\n",
        )
        .unwrap();

        let manager = ConfigManager::load_with_env(Some(&path), "staging").unwrap();
        assert_eq!(manager.config().retry.max_retries, 9);
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let result = ConfigManager::load_with_env(Some(Path::new("/nonexistent/kurultai.yaml")), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kurultai.yaml");
        std::fs::write(&path, "retry:\n  max_retries: 0\n").unwrap();

        let result = ConfigManager::load_with_env(Some(&path), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_sanitize_masks_password() {
        let mut config = KurultaiConfig::default();
        config.primary_store.password = Some("hunter22".to_string());
        config.primary_store.username = Some("neo4j".to_string());

        let manager = ConfigManager::from_config(config).unwrap();
        let sanitized = manager.debug_config();
        assert_eq!(sanitized["primary_store"]["password"], "[MASKED]");
        assert_eq!(sanitized["primary_store"]["username"], "neo4j");
    }
}
