use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::services::lease::SelfPreservationConfig;
use crate::services::registry::{IdentityPolicy, StoreConfig};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// 配置加载错误
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid environment override: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub registry: StoreConfig,
    pub lease_manager: LeaseManagerConfig,
    pub self_preservation: SelfPreservationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8761".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LeaseManagerConfig {
    /// 未设置时取默认驱逐超时的一半
    pub sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// REGISTRY_* 环境变量覆盖项
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    bind_address: Option<String>,
    log_level: Option<String>,
    eager_up: Option<bool>,
    identity_policy: Option<IdentityPolicy>,
    default_lease_duration_secs: Option<u64>,
    max_lease_duration_secs: Option<u64>,
    eviction_timeout_factor: Option<u32>,
    sweep_interval_ms: Option<u64>,
    self_preservation_enabled: Option<bool>,
    self_preservation_threshold: Option<f64>,
    self_preservation_window_secs: Option<u64>,
}

impl Config {
    /// Loads `.env`, then the TOML file, then `REGISTRY_*` overrides.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("REGISTRY_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::from_file(DEFAULT_CONFIG_PATH)?,
            Err(_) => Self::default(),
        };

        let overrides: EnvOverrides = envy::prefixed("REGISTRY_").from_env()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&config_str)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config_str)?)
    }

    fn apply_overrides(&mut self, overrides: EnvOverrides) {
        if let Some(bind_address) = overrides.bind_address {
            self.server.bind_address = bind_address;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(eager_up) = overrides.eager_up {
            self.registry.eager_up = eager_up;
        }
        if let Some(policy) = overrides.identity_policy {
            self.registry.identity_policy = policy;
        }
        if let Some(secs) = overrides.default_lease_duration_secs {
            self.registry.default_lease_duration_secs = secs;
        }
        if let Some(secs) = overrides.max_lease_duration_secs {
            self.registry.max_lease_duration_secs = secs;
        }
        if let Some(factor) = overrides.eviction_timeout_factor {
            self.registry.eviction_timeout_factor = factor;
        }
        if let Some(ms) = overrides.sweep_interval_ms {
            self.lease_manager.sweep_interval_ms = Some(ms);
        }
        if let Some(enabled) = overrides.self_preservation_enabled {
            self.self_preservation.enabled = enabled;
        }
        if let Some(threshold) = overrides.self_preservation_threshold {
            self.self_preservation.threshold = threshold;
        }
        if let Some(secs) = overrides.self_preservation_window_secs {
            self.self_preservation.window_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address()?;

        let threshold = self.self_preservation.threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "self_preservation.threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.registry.default_lease_duration_secs == 0 {
            return Err(ConfigError::Invalid(
                "registry.default_lease_duration_secs must be positive".to_string(),
            ));
        }
        if self.registry.max_lease_duration_secs < self.registry.default_lease_duration_secs {
            return Err(ConfigError::Invalid(
                "registry.max_lease_duration_secs is below the default lease duration".to_string(),
            ));
        }
        if self.registry.eviction_timeout_factor == 0 {
            return Err(ConfigError::Invalid(
                "registry.eviction_timeout_factor must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> Result<SocketAddr, ConfigError> {
        self.server.bind_address.parse().map_err(|e| {
            ConfigError::Invalid(format!(
                "server.bind_address {:?}: {e}",
                self.server.bind_address
            ))
        })
    }

    pub fn sweep_interval(&self) -> Duration {
        match self.lease_manager.sweep_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => (self.registry.default_eviction_timeout() / 2).max(Duration::from_secs(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:8761");
        assert_eq!(config.registry.default_lease_duration_secs, 30);
        assert!(config.self_preservation.enabled);
        // 默认驱逐超时 90s，清理间隔取一半
        assert_eq!(config.sweep_interval(), Duration::from_secs(45));
        config.validate().unwrap();
    }

    #[test]
    fn sections_override_defaults() {
        let config = Config::from_toml_str(
            r#"
            [server]
            bind_address = "127.0.0.1:9000"

            [registry]
            eager_up = true
            identity_policy = "reject"
            default_lease_duration_secs = 5

            [lease_manager]
            sweep_interval_ms = 250

            [self_preservation]
            threshold = 0.5
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_address().unwrap().port(), 9000);
        assert!(config.registry.eager_up);
        assert_eq!(config.registry.identity_policy, IdentityPolicy::Reject);
        assert_eq!(config.sweep_interval(), Duration::from_millis(250));
        assert_eq!(config.self_preservation.threshold, 0.5);
        assert_eq!(config.self_preservation.window_secs, 60);
    }

    #[test]
    fn env_overrides_win() {
        let vars = [
            ("REGISTRY_BIND_ADDRESS", "127.0.0.1:0"),
            ("REGISTRY_SELF_PRESERVATION_ENABLED", "false"),
            ("REGISTRY_IDENTITY_POLICY", "reuse"),
            ("REGISTRY_CLIENT_PORT", "8080"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()));

        let overrides: EnvOverrides = envy::prefixed("REGISTRY_").from_iter(vars).unwrap();
        let mut config = Config::default();
        config.apply_overrides(overrides);

        assert_eq!(config.server.bind_address, "127.0.0.1:0");
        assert!(!config.self_preservation.enabled);
        assert_eq!(config.registry.identity_policy, IdentityPolicy::Reuse);
    }

    #[test]
    fn huge_lease_values_do_not_overflow() {
        let mut config = Config::default();
        config.registry.default_lease_duration_secs = u64::MAX;
        config.registry.max_lease_duration_secs = u64::MAX;
        config.registry.eviction_timeout_factor = 3;

        assert!(config.sweep_interval() >= Duration::from_secs(u64::MAX / 2));
        assert_eq!(
            config.registry.default_eviction_timeout(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut config = Config::default();
        config.self_preservation.threshold = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.self_preservation.threshold = 0.85;
        config.server.bind_address = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
