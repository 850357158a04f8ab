use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::error::RegistryError;
use super::types::{
    Application, InstanceIdentity, InstanceStatus, InstanceView, Lease, RegisterRequest,
    RegistrySnapshot, ServiceInstance, normalize_service_name,
};
use crate::services::lease::policy::{RenewalMeter, expected_renewals};

// 同一身份重复注册时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// Drop the live instance and issue a fresh id.
    #[default]
    Replace,
    /// Keep the existing id and reset its lease.
    Reuse,
    /// Refuse while a live instance holds the identity.
    Reject,
}

// 注册表配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub eager_up: bool,
    pub identity_policy: IdentityPolicy,
    pub default_lease_duration_secs: u64,
    pub max_lease_duration_secs: u64,
    pub eviction_timeout_factor: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            eager_up: false,
            identity_policy: IdentityPolicy::Replace,
            default_lease_duration_secs: 30,
            max_lease_duration_secs: 300,
            eviction_timeout_factor: 3,
        }
    }
}

impl StoreConfig {
    pub fn default_eviction_timeout(&self) -> Duration {
        Duration::from_secs(
            self.default_lease_duration_secs
                .saturating_mul(u64::from(self.eviction_timeout_factor)),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub instances: usize,
    pub by_status: BTreeMap<String, usize>,
    pub version: u64,
}

#[derive(Debug)]
struct StoreInner {
    // 实例ID -> 实例记录（含租约）
    instances: DashMap<String, ServiceInstance>,
    // 身份 -> 实例ID
    identities: DashMap<InstanceIdentity, String>,
    version: AtomicU64,
    renewals: RenewalMeter,
    config: StoreConfig,
}

/// In-memory directory of registered instances.
///
/// Every mutation goes through a per-instance map entry, so a renew and an
/// eviction of the same instance never interleave. Reads copy what they see.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    inner: Arc<StoreInner>,
}

impl Default for RegistryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl RegistryStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                instances: DashMap::new(),
                identities: DashMap::new(),
                version: AtomicU64::new(0),
                renewals: RenewalMeter::default(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn renewals(&self) -> &RenewalMeter {
        &self.inner.renewals
    }

    pub fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.instances.is_empty()
    }

    pub fn register(&self, request: RegisterRequest) -> Result<String, RegistryError> {
        self.register_at(request, Instant::now())
    }

    pub fn register_at(&self, request: RegisterRequest, now: Instant) -> Result<String, RegistryError> {
        let service_name = normalize_service_name(&request.service_name);
        let host = request.host.trim().to_string();
        if service_name.is_empty() {
            return Err(RegistryError::InvalidRequest("serviceName must not be empty".into()));
        }
        if host.is_empty() {
            return Err(RegistryError::InvalidRequest("host must not be empty".into()));
        }
        if request.port == 0 {
            return Err(RegistryError::InvalidRequest("port must not be 0".into()));
        }
        let (duration, eviction_timeout) = self.lease_terms(&request)?;

        let status = if self.inner.config.eager_up {
            InstanceStatus::Up
        } else {
            InstanceStatus::Starting
        };
        let identity = InstanceIdentity {
            service_name: service_name.clone(),
            host: host.clone(),
            port: request.port,
        };
        let fresh = |instance_id: String| ServiceInstance {
            instance_id,
            service_name: service_name.clone(),
            host: host.clone(),
            port: request.port,
            metadata: request.metadata.clone(),
            status,
            lease: Lease::new(duration, eviction_timeout, now),
        };

        // 持有身份条目锁期间写入实例表，锁顺序固定为 identities -> instances
        let instance_id = match self.inner.identities.entry(identity) {
            Entry::Vacant(entry) => {
                let instance_id = Uuid::new_v4().to_string();
                self.inner.instances.insert(instance_id.clone(), fresh(instance_id.clone()));
                entry.insert(instance_id.clone());
                instance_id
            }
            Entry::Occupied(mut entry) => {
                let existing_id = entry.get().clone();
                let live = self
                    .inner
                    .instances
                    .get(&existing_id)
                    .is_some_and(|instance| !instance.lease.is_expired(now));

                match (live, self.inner.config.identity_policy) {
                    (true, IdentityPolicy::Reject) => {
                        tracing::warn!(
                            service_name = %service_name,
                            instance_id = %existing_id,
                            "Rejected duplicate registration"
                        );
                        return Err(RegistryError::Conflict(format!(
                            "{service_name} at {host}:{} is already registered as {existing_id}",
                            request.port
                        )));
                    }
                    (true, IdentityPolicy::Reuse) => {
                        let reused = match self.inner.instances.get_mut(&existing_id) {
                            Some(mut instance) => {
                                instance.metadata = request.metadata.clone();
                                instance.status = status;
                                instance.lease = Lease::new(duration, eviction_timeout, now);
                                true
                            }
                            None => false,
                        };
                        if reused {
                            existing_id
                        } else {
                            let instance_id = Uuid::new_v4().to_string();
                            self.inner.instances.insert(instance_id.clone(), fresh(instance_id.clone()));
                            entry.insert(instance_id.clone());
                            instance_id
                        }
                    }
                    (true, IdentityPolicy::Replace) | (false, _) => {
                        if self.inner.instances.remove(&existing_id).is_some() {
                            tracing::info!(
                                service_name = %service_name,
                                instance_id = %existing_id,
                                "Replaced previous instance with the same identity"
                            );
                        }
                        let instance_id = Uuid::new_v4().to_string();
                        self.inner.instances.insert(instance_id.clone(), fresh(instance_id.clone()));
                        entry.insert(instance_id.clone());
                        instance_id
                    }
                }
            }
        };

        self.bump_version();
        tracing::info!(
            service_name = %service_name,
            instance_id = %instance_id,
            address = %format!("{host}:{}", request.port),
            lease_secs = duration.as_secs(),
            status = %status,
            "Registered service instance"
        );
        Ok(instance_id)
    }

    pub fn renew(&self, instance_id: &str) -> Result<(), RegistryError> {
        self.renew_at(instance_id, Instant::now())
    }

    /// Renews with an explicit timestamp. Older timestamps are accepted but
    /// never move the lease backwards.
    pub fn renew_at(&self, instance_id: &str, now: Instant) -> Result<(), RegistryError> {
        match self.inner.instances.get_mut(instance_id) {
            Some(mut instance) => {
                instance.lease.renew(now);
            }
            None => {
                tracing::debug!(instance_id = %instance_id, "Renew for unknown instance");
                return Err(RegistryError::NotFound(instance_id.to_string()));
            }
        }
        self.inner.renewals.record(now);
        Ok(())
    }

    pub fn update_status(&self, instance_id: &str, status: InstanceStatus) -> Result<(), RegistryError> {
        let previous = match self.inner.instances.get_mut(instance_id) {
            Some(mut instance) => std::mem::replace(&mut instance.status, status),
            None => return Err(RegistryError::NotFound(instance_id.to_string())),
        };

        if previous != status {
            self.bump_version();
            tracing::info!(
                instance_id = %instance_id,
                from = %previous,
                to = %status,
                "Updated instance status"
            );
        }
        Ok(())
    }

    pub fn deregister(&self, instance_id: &str) -> Result<(), RegistryError> {
        match self.inner.instances.remove(instance_id) {
            Some((_, instance)) => {
                self.release_identity(&instance);
                self.bump_version();
                tracing::info!(
                    service_name = %instance.service_name,
                    instance_id = %instance_id,
                    "Deregistered service instance"
                );
                Ok(())
            }
            None => Err(RegistryError::NotFound(instance_id.to_string())),
        }
    }

    /// Ids whose lease has expired at `now`. Only a hint: the eviction
    /// itself re-checks under the entry lock.
    pub fn expired_candidates(&self, now: Instant) -> Vec<String> {
        self.inner
            .instances
            .iter()
            .filter(|entry| entry.value().lease.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn evict_if_expired(&self, instance_id: &str, now: Instant) -> Option<ServiceInstance> {
        let (_, instance) = self
            .inner
            .instances
            .remove_if(instance_id, |_, instance| instance.lease.is_expired(now))?;
        self.release_identity(&instance);
        self.bump_version();
        Some(instance)
    }

    pub fn query(&self, service_name: &str) -> Application {
        self.query_at(service_name, Instant::now())
    }

    pub fn query_at(&self, service_name: &str, now: Instant) -> Application {
        let service_name = normalize_service_name(service_name);
        let mut instances: Vec<InstanceView> = self
            .inner
            .instances
            .iter()
            .filter(|entry| entry.service_name == service_name && entry.is_visible(now))
            .map(|entry| entry.to_view())
            .collect();
        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));

        Application {
            service_name,
            instances,
        }
    }

    pub fn query_all(&self) -> RegistrySnapshot {
        self.query_all_at(Instant::now())
    }

    pub fn query_all_at(&self, now: Instant) -> RegistrySnapshot {
        let version = self.version();
        let mut applications: BTreeMap<String, Application> = BTreeMap::new();

        for entry in self.inner.instances.iter() {
            if !entry.is_visible(now) {
                continue;
            }
            applications
                .entry(entry.service_name.clone())
                .or_insert_with(|| Application {
                    service_name: entry.service_name.clone(),
                    instances: Vec::new(),
                })
                .instances
                .push(entry.to_view());
        }
        for app in applications.values_mut() {
            app.instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        }

        RegistrySnapshot {
            version,
            applications,
        }
    }

    // 获取单个实例（不论状态）
    pub fn instance(&self, instance_id: &str) -> Option<InstanceView> {
        self.inner
            .instances
            .get(instance_id)
            .map(|entry| entry.value().to_view())
    }

    /// Renewals an on-time population would have sent inside `window`.
    pub fn expected_renewals(&self, now: Instant, window: Duration) -> f64 {
        self.inner
            .instances
            .iter()
            .map(|entry| {
                let lease = &entry.value().lease;
                let age = now.saturating_duration_since(lease.registered_at);
                expected_renewals(age, lease.duration, window) as f64
            })
            .sum()
    }

    pub fn stats(&self) -> StoreStats {
        let mut by_status = BTreeMap::new();
        for entry in self.inner.instances.iter() {
            *by_status.entry(entry.status.as_str().to_string()).or_insert(0) += 1;
        }

        StoreStats {
            instances: by_status.values().sum(),
            by_status,
            version: self.version(),
        }
    }

    fn lease_terms(&self, request: &RegisterRequest) -> Result<(Duration, Duration), RegistryError> {
        let config = &self.inner.config;
        let duration_secs = request
            .lease_duration_seconds
            .unwrap_or(config.default_lease_duration_secs);
        if duration_secs == 0 || duration_secs > config.max_lease_duration_secs {
            return Err(RegistryError::InvalidRequest(format!(
                "leaseDurationSeconds must be within 1..={}",
                config.max_lease_duration_secs
            )));
        }

        let eviction_secs = request
            .eviction_timeout_seconds
            .unwrap_or(duration_secs.saturating_mul(u64::from(config.eviction_timeout_factor.max(1))));
        if eviction_secs < duration_secs {
            return Err(RegistryError::InvalidRequest(
                "evictionTimeoutSeconds must not be shorter than leaseDurationSeconds".into(),
            ));
        }

        Ok((Duration::from_secs(duration_secs), Duration::from_secs(eviction_secs)))
    }

    fn release_identity(&self, instance: &ServiceInstance) {
        self.inner
            .identities
            .remove_if(&instance.identity(), |_, id| *id == instance.instance_id);
    }

    fn bump_version(&self) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
    }
}
