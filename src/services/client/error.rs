use std::time::Duration;

use crate::services::bootstrap::BootstrapError;
use crate::services::registry::RegistryError;

/// 注册中心客户端错误类型
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("Registration conflict: {0}")]
    Conflict(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Registry unreachable: {0}")]
    Unreachable(String),
    #[error("Timeout error")]
    Timeout,
    #[error("Unexpected registry response {status}: {message}")]
    Server { status: u16, message: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Config bootstrap failed: {0}")]
    ConfigBootstrap(#[from] BootstrapError),
    #[error("Registration failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ClientError> },
    #[error("Cancelled by shutdown")]
    Cancelled,
}

impl ClientError {
    /// Network-level failures worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Unreachable(_) | ClientError::Timeout => true,
            ClientError::Server { status, .. } => *status >= 500,
            ClientError::NotFound(_)
            | ClientError::Conflict(_)
            | ClientError::InvalidRequest(_)
            | ClientError::Serialization(_)
            | ClientError::ConfigBootstrap(_)
            | ClientError::RetriesExhausted { .. }
            | ClientError::Cancelled => false,
        }
    }
}

impl From<RegistryError> for ClientError {
    fn from(error: RegistryError) -> Self {
        match error {
            RegistryError::NotFound(id) => ClientError::NotFound(id),
            RegistryError::Conflict(msg) => ClientError::Conflict(msg),
            RegistryError::InvalidRequest(msg) => ClientError::InvalidRequest(msg),
            RegistryError::Encoding(msg) => ClientError::Serialization(msg),
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            ClientError::Timeout
        } else if error.is_decode() {
            ClientError::Serialization(error.to_string())
        } else {
            ClientError::Unreachable(error.to_string())
        }
    }
}

/// 服务发现缓存读取错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery cache has not been populated yet")]
    NotReady,
    #[error("Discovery cache is stale ({age:?} since last successful refresh)")]
    Stale { age: Duration },
}
