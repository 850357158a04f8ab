use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::services::bootstrap::{BootstrapPolicy, BootstrapRequest};
use crate::services::registry::RegisterRequest;

/// 注册中心客户端配置
#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    /// 注册中心地址
    pub base_url: String,
    /// 单次请求超时时间
    pub request_timeout: Duration,
    /// 连接超时时间
    pub connect_timeout: Duration,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8761".to_string(),
            request_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        }
    }
}

/// 重试退避配置
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 最多尝试次数（含首次）
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: Some(6),
            max_elapsed: Some(Duration::from_secs(60)),
        }
    }
}

// 注册失败后的启动策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPolicy {
    /// 重试耗尽即视为启动失败
    #[default]
    FailFast,
    /// 以不可发现状态继续运行，并在后台重试注册
    Degraded,
}

/// 服务实例注册配置
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    /// 租约时长，同时也是心跳间隔
    pub lease_duration: Duration,
    pub eviction_timeout: Option<Duration>,
    pub call_timeout: Duration,
    pub deregister_timeout: Duration,
    pub mark_up_after_register: bool,
    pub startup_policy: StartupPolicy,
    pub retry: RetryConfig,
}

impl RegistrationConfig {
    pub fn new(service_name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            service_name: service_name.into(),
            host: host.into(),
            port,
            metadata: HashMap::new(),
            lease_duration: Duration::from_secs(30),
            eviction_timeout: None,
            call_timeout: Duration::from_secs(5),
            deregister_timeout: Duration::from_secs(3),
            mark_up_after_register: true,
            startup_policy: StartupPolicy::FailFast,
            retry: RetryConfig::default(),
        }
    }

    pub fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            service_name: self.service_name.clone(),
            host: self.host.clone(),
            port: self.port,
            metadata: self.metadata.clone(),
            lease_duration_seconds: Some(self.lease_duration.as_secs().max(1)),
            eviction_timeout_seconds: self.eviction_timeout.map(|t| t.as_secs()),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.lease_duration.as_secs().max(1))
    }
}

/// 服务发现缓存配置
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub refresh_interval: Duration,
    /// 超过该时长未刷新成功则不再提供缓存数据
    pub max_staleness: Duration,
    pub call_timeout: Duration,
    /// 仅关注的服务；为空时拉取全量
    pub services: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            max_staleness: Duration::from_secs(90),
            call_timeout: Duration::from_secs(5),
            services: Vec::new(),
        }
    }
}

fn default_registry_url() -> String {
    RegistryClientConfig::default().base_url
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_profile() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_lease_duration_secs() -> u64 {
    30
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

fn default_deregister_timeout_ms() -> u64 {
    3_000
}

fn default_refresh_interval_secs() -> u64 {
    30
}

fn default_max_staleness_secs() -> u64 {
    90
}

fn default_retry_initial_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_retry_max_attempts() -> u32 {
    6
}

fn default_retry_max_elapsed_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Client-side settings read from `REGISTRY_CLIENT_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    pub service_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    /// `key=value` pairs separated by commas
    #[serde(default)]
    pub metadata: Option<String>,
    #[serde(default)]
    pub config_server_url: Option<String>,
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default)]
    pub bootstrap_policy: BootstrapPolicy,
    #[serde(default)]
    pub startup_policy: StartupPolicy,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default)]
    pub eviction_timeout_secs: Option<u64>,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    #[serde(default = "default_deregister_timeout_ms")]
    pub deregister_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub mark_up_after_register: bool,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_max_staleness_secs")]
    pub max_staleness_secs: u64,
    /// Comma-separated watch list for the discovery cache
    #[serde(default)]
    pub watch_services: Option<String>,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_max_elapsed_secs")]
    pub retry_max_elapsed_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl ClientSettings {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("REGISTRY_CLIENT_").from_env()
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn registry_client_config(&self) -> RegistryClientConfig {
        RegistryClientConfig {
            base_url: self.registry_url.clone(),
            request_timeout: self.call_timeout(),
            ..RegistryClientConfig::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.retry_initial_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: 2.0,
            max_attempts: Some(self.retry_max_attempts),
            max_elapsed: Some(Duration::from_secs(self.retry_max_elapsed_secs)),
        }
    }

    pub fn registration_config(&self) -> RegistrationConfig {
        RegistrationConfig {
            metadata: parse_pairs(self.metadata.as_deref()),
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            eviction_timeout: self.eviction_timeout_secs.map(Duration::from_secs),
            call_timeout: self.call_timeout(),
            deregister_timeout: Duration::from_millis(self.deregister_timeout_ms),
            mark_up_after_register: self.mark_up_after_register,
            startup_policy: self.startup_policy,
            retry: self.retry_config(),
            ..RegistrationConfig::new(&self.service_name, &self.host, self.port)
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            max_staleness: Duration::from_secs(self.max_staleness_secs),
            call_timeout: self.call_timeout(),
            services: self
                .watch_services
                .as_deref()
                .map(|list| {
                    list.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn bootstrap_request(&self) -> BootstrapRequest {
        BootstrapRequest::new(&self.service_name, &self.profile).with_policy(self.bootstrap_policy)
    }
}

// 解析 "k=v,k2=v2" 形式的元数据
fn parse_pairs(raw: Option<&str>) -> HashMap<String, String> {
    raw.unwrap_or_default()
        .split(',')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}
