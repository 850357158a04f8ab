use async_trait::async_trait;
use reqwest::StatusCode;

use super::config::RegistryClientConfig;
use super::error::ClientError;
use super::transport::RegistryTransport;
use crate::services::registry::types::ErrorBody;
use crate::services::registry::{
    Application, InstanceStatus, RegisterRequest, RegisterResponse, RegistrySnapshot,
    StatusUpdateRequest,
};

/// HTTP handle to the registry server.
///
/// Created once per process and shared; cloning is cheap.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    config: RegistryClientConfig,
    http: reqwest::Client,
}

impl RegistryClient {
    /// 创建新的注册中心客户端
    pub fn new(config: RegistryClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ClientError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { config, http })
    }

    /// 便捷的创建方法，使用默认配置
    pub fn connect(base_url: &str) -> Result<Self, ClientError> {
        let config = RegistryClientConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        };
        Self::new(config)
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    // 将非 2xx 响应映射为错误
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.message)
            .unwrap_or(text);

        Err(match status {
            StatusCode::NOT_FOUND => ClientError::NotFound(message),
            StatusCode::CONFLICT => ClientError::Conflict(message),
            StatusCode::BAD_REQUEST => ClientError::InvalidRequest(message),
            other => ClientError::Server {
                status: other.as_u16(),
                message,
            },
        })
    }
}

#[async_trait]
impl RegistryTransport for RegistryClient {
    async fn register(&self, request: &RegisterRequest) -> Result<String, ClientError> {
        let response = self
            .http
            .post(self.url("/registry/instances"))
            .json(request)
            .send()
            .await?;
        let body: RegisterResponse = Self::check(response).await?.json().await?;
        Ok(body.instance_id)
    }

    async fn renew(&self, instance_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .put(self.url(&format!("/registry/instances/{instance_id}/renew")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), ClientError> {
        let response = self
            .http
            .put(self.url(&format!("/registry/instances/{instance_id}/status")))
            .json(&StatusUpdateRequest { status })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/registry/instances/{instance_id}")))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn query(&self, service_name: &str) -> Result<Application, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/registry/apps/{service_name}")))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn query_all(&self) -> Result<RegistrySnapshot, ClientError> {
        let response = self.http.get(self.url("/registry/apps")).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
