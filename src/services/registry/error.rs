use http::StatusCode;

/// 注册表错误类型
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Instance not found: {0}")]
    NotFound(String),
    #[error("Instance identity already registered: {0}")]
    Conflict(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl RegistryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RegistryError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "not_found",
            RegistryError::Conflict(_) => "conflict",
            RegistryError::InvalidRequest(_) => "invalid_request",
            RegistryError::Encoding(_) => "encoding",
        }
    }
}
