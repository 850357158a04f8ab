use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::error::ClientError;
use crate::services::registry::{
    Application, InstanceStatus, RegisterRequest, RegistrySnapshot, RegistryStore,
};

/// The registry operations a client process relies on.
///
/// Implemented over HTTP by [`super::RegistryClient`] and in-process by
/// [`RegistryStore`].
#[async_trait]
pub trait RegistryTransport: Send + Sync + 'static {
    async fn register(&self, request: &RegisterRequest) -> Result<String, ClientError>;

    async fn renew(&self, instance_id: &str) -> Result<(), ClientError>;

    async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), ClientError>;

    async fn deregister(&self, instance_id: &str) -> Result<(), ClientError>;

    async fn query(&self, service_name: &str) -> Result<Application, ClientError>;

    async fn query_all(&self) -> Result<RegistrySnapshot, ClientError>;
}

// 为单次注册表调用加上超时上限
pub(crate) async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| ClientError::Timeout)?
}

// 进程内直连注册表
#[async_trait]
impl RegistryTransport for RegistryStore {
    async fn register(&self, request: &RegisterRequest) -> Result<String, ClientError> {
        Ok(RegistryStore::register(self, request.clone())?)
    }

    async fn renew(&self, instance_id: &str) -> Result<(), ClientError> {
        Ok(RegistryStore::renew(self, instance_id)?)
    }

    async fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), ClientError> {
        Ok(RegistryStore::update_status(self, instance_id, status)?)
    }

    async fn deregister(&self, instance_id: &str) -> Result<(), ClientError> {
        Ok(RegistryStore::deregister(self, instance_id)?)
    }

    async fn query(&self, service_name: &str) -> Result<Application, ClientError> {
        Ok(RegistryStore::query(self, service_name))
    }

    async fn query_all(&self) -> Result<RegistrySnapshot, ClientError> {
        Ok(RegistryStore::query_all(self))
    }
}
