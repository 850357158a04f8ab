//! Remote configuration fetched before a service registers.
//!
//! The registry core only depends on [`ConfigBootstrap::fetch`]; how the
//! properties are served is up to the implementation.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

pub type PropertyMap = BTreeMap<String, String>;

/// 配置拉取错误
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("Config server unreachable: {0}")]
    Unreachable(String),
    #[error("No configuration for {application}/{profile}")]
    NotFound { application: String, profile: String },
    #[error("Config server returned status {0}")]
    Server(u16),
    #[error("Invalid config document: {0}")]
    Invalid(String),
}

#[async_trait]
pub trait ConfigBootstrap: Send + Sync {
    async fn fetch(&self, application: &str, profile: &str) -> Result<PropertyMap, BootstrapError>;
}

// 拉取失败时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapPolicy {
    #[default]
    FailFast,
    FallbackToDefaults,
}

#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub application: String,
    pub profile: String,
    pub policy: BootstrapPolicy,
    /// Local defaults; remote values take precedence.
    pub defaults: PropertyMap,
}

impl BootstrapRequest {
    pub fn new(application: impl Into<String>, profile: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            profile: profile.into(),
            policy: BootstrapPolicy::FailFast,
            defaults: PropertyMap::new(),
        }
    }

    pub fn with_policy(mut self, policy: BootstrapPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_defaults(mut self, defaults: PropertyMap) -> Self {
        self.defaults = defaults;
        self
    }
}

/// Runs the fetch and applies the request's failure policy.
pub async fn load(source: &dyn ConfigBootstrap, request: &BootstrapRequest) -> Result<PropertyMap, BootstrapError> {
    match source.fetch(&request.application, &request.profile).await {
        Ok(mut properties) => {
            for (key, value) in &request.defaults {
                properties.entry(key.clone()).or_insert_with(|| value.clone());
            }
            tracing::info!(
                application = %request.application,
                profile = %request.profile,
                properties = properties.len(),
                "Fetched remote configuration"
            );
            Ok(properties)
        }
        Err(e) => match request.policy {
            BootstrapPolicy::FailFast => {
                tracing::error!(
                    application = %request.application,
                    profile = %request.profile,
                    error = %e,
                    "Config bootstrap failed"
                );
                Err(e)
            }
            BootstrapPolicy::FallbackToDefaults => {
                tracing::warn!(
                    application = %request.application,
                    profile = %request.profile,
                    error = %e,
                    "Config bootstrap failed, continuing with local defaults"
                );
                Ok(request.defaults.clone())
            }
        },
    }
}

/// Fixed properties, for processes that run without a config server.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigBootstrap {
    properties: PropertyMap,
}

impl StaticConfigBootstrap {
    pub fn new(properties: PropertyMap) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl ConfigBootstrap for StaticConfigBootstrap {
    async fn fetch(&self, _application: &str, _profile: &str) -> Result<PropertyMap, BootstrapError> {
        Ok(self.properties.clone())
    }
}

/// Config server client for `GET {base}/{application}/{profile}`.
#[derive(Debug, Clone)]
pub struct HttpConfigBootstrap {
    base_url: String,
    http: reqwest::Client,
}

impl HttpConfigBootstrap {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BootstrapError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BootstrapError::Unreachable(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }
}

#[async_trait]
impl ConfigBootstrap for HttpConfigBootstrap {
    async fn fetch(&self, application: &str, profile: &str) -> Result<PropertyMap, BootstrapError> {
        let url = format!("{}/{application}/{profile}", self.base_url);
        tracing::debug!(url = %url, "Fetching remote configuration");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BootstrapError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(BootstrapError::NotFound {
                application: application.to_string(),
                profile: profile.to_string(),
            });
        }
        if !status.is_success() {
            return Err(BootstrapError::Server(status.as_u16()));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| BootstrapError::Invalid(e.to_string()))?;
        parse_document(&document)
    }
}

/// Accepts either a flat object or a document with `propertySources`,
/// where earlier sources win.
pub fn parse_document(document: &Value) -> Result<PropertyMap, BootstrapError> {
    let Value::Object(root) = document else {
        return Err(BootstrapError::Invalid("expected a JSON object".into()));
    };

    let mut properties = PropertyMap::new();
    match root.get("propertySources") {
        Some(Value::Array(sources)) => {
            for source in sources {
                let Some(Value::Object(values)) = source.get("source") else {
                    continue;
                };
                let mut flat = PropertyMap::new();
                for (key, value) in values {
                    flatten_into(&mut flat, key, value);
                }
                for (key, value) in flat {
                    properties.entry(key).or_insert(value);
                }
            }
        }
        Some(_) => return Err(BootstrapError::Invalid("propertySources must be an array".into())),
        None => {
            for (key, value) in root {
                flatten_into(&mut properties, key, value);
            }
        }
    }
    Ok(properties)
}

fn flatten_into(out: &mut PropertyMap, prefix: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => {
            out.insert(prefix.to_string(), s.clone());
        }
        Value::Bool(_) | Value::Number(_) => {
            out.insert(prefix.to_string(), value.to_string());
        }
        Value::Array(items) => {
            for (index, item) in items.iter().enumerate() {
                flatten_into(out, &format!("{prefix}[{index}]"), item);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                flatten_into(out, &format!("{prefix}.{key}"), item);
            }
        }
    }
}
