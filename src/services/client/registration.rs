use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::backoff::Backoff;
use super::config::{RegistrationConfig, StartupPolicy};
use super::error::ClientError;
use super::transport::{RegistryTransport, bounded};
use crate::services::bootstrap::{self, BootstrapRequest, ConfigBootstrap, PropertyMap};
use crate::services::registry::InstanceStatus;

// 注册状态机
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered { instance_id: String },
    Deregistering,
    Deregistered,
}

impl RegistrationState {
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            RegistrationState::Registered { instance_id } => Some(instance_id),
            RegistrationState::Unregistered
            | RegistrationState::Registering
            | RegistrationState::Deregistering
            | RegistrationState::Deregistered => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.instance_id().is_some()
    }
}

// 后台任务下一步要做的事
enum Resume {
    Heartbeat { instance_id: String, promoted: bool },
    RegisterAfter(Duration),
}

enum HeartbeatExit {
    LeaseLost,
    Cancelled,
}

struct Inner {
    transport: Arc<dyn RegistryTransport>,
    config: RegistrationConfig,
    state: watch::Sender<RegistrationState>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Keeps one service instance registered for the lifetime of the process.
///
/// `start` registers (with bounded retries) and spawns the heartbeat loop;
/// `shutdown` stops it and makes one best-effort deregistration.
#[derive(Clone)]
pub struct RegistrationClient {
    inner: Arc<Inner>,
}

impl RegistrationClient {
    pub fn new(transport: Arc<dyn RegistryTransport>, config: RegistrationConfig) -> Self {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                state,
                started: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &RegistrationConfig {
        &self.inner.config
    }

    pub fn state(&self) -> RegistrationState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.inner.state.subscribe()
    }

    pub fn instance_id(&self) -> Option<String> {
        self.inner.state.borrow().instance_id().map(str::to_string)
    }

    /// Waits until the instance is registered; `None` if the client shuts
    /// down first.
    pub async fn wait_until_registered(&self) -> Option<String> {
        let mut receiver = self.subscribe();
        let state = receiver
            .wait_for(|state| {
                matches!(
                    state,
                    RegistrationState::Registered { .. }
                        | RegistrationState::Deregistering
                        | RegistrationState::Deregistered
                )
            })
            .await
            .ok()?;
        state.instance_id().map(str::to_string)
    }

    /// Fetches remote configuration, then starts registration.
    pub async fn start_with_bootstrap(
        &self,
        source: &dyn ConfigBootstrap,
        request: &BootstrapRequest,
    ) -> Result<PropertyMap, ClientError> {
        let properties = bootstrap::load(source, request).await?;
        self.start().await?;
        Ok(properties)
    }

    pub async fn start(&self) -> Result<(), ClientError> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                service_name = %self.inner.config.service_name,
                "Registration client already started"
            );
            return Ok(());
        }

        match self.inner.establish().await {
            Ok((instance_id, promoted)) => {
                self.spawn_lifecycle(Resume::Heartbeat { instance_id, promoted });
                Ok(())
            }
            Err(e @ ClientError::RetriesExhausted { .. })
                if self.inner.config.startup_policy == StartupPolicy::Degraded =>
            {
                self.inner.set_state(RegistrationState::Unregistered);
                tracing::warn!(
                    service_name = %self.inner.config.service_name,
                    error = %e,
                    "Starting in degraded mode: instance is not discoverable, registration continues in background"
                );
                self.spawn_lifecycle(Resume::RegisterAfter(self.inner.config.retry.max_delay));
                Ok(())
            }
            Err(ClientError::Cancelled) => Err(ClientError::Cancelled),
            Err(e) => {
                self.inner.set_state(RegistrationState::Unregistered);
                tracing::error!(
                    service_name = %self.inner.config.service_name,
                    error = %e,
                    "Registration failed, aborting startup"
                );
                Err(e)
            }
        }
    }

    /// Stops the heartbeat and deregisters within `deregister_timeout`.
    /// Never fails: an unreachable registry lets the lease expire instead.
    pub async fn shutdown(&self) {
        if *self.inner.state.borrow() == RegistrationState::Deregistered {
            return;
        }

        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let instance_id = self.instance_id();
        self.inner.set_state(RegistrationState::Deregistering);

        if let Some(instance_id) = instance_id {
            let timeout = self.inner.config.deregister_timeout;
            let service_name = &self.inner.config.service_name;
            match tokio::time::timeout(timeout, self.inner.transport.deregister(&instance_id)).await {
                Ok(Ok(())) => {
                    tracing::info!(service_name = %service_name, instance_id = %instance_id, "Deregistered from registry");
                }
                Ok(Err(ClientError::NotFound(_))) => {
                    tracing::debug!(instance_id = %instance_id, "Instance already absent from registry");
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        error = %e,
                        "Deregistration failed, registry will expire the lease"
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Deregistration timed out, registry will expire the lease"
                    );
                }
            }
        }

        self.inner.set_state(RegistrationState::Deregistered);
    }

    fn spawn_lifecycle(&self, resume: Resume) {
        let inner = self.inner.clone();
        self.inner.tasks.spawn(inner.run(resume));
    }
}

impl Inner {
    fn set_state(&self, state: RegistrationState) {
        let previous = self.state.send_replace(state.clone());
        if previous != state {
            tracing::debug!(
                service_name = %self.config.service_name,
                from = ?previous,
                to = ?state,
                "Registration state changed"
            );
        }
    }

    async fn run(self: Arc<Self>, resume: Resume) {
        let mut next = resume;
        loop {
            let (instance_id, promoted) = match next {
                Resume::Heartbeat { instance_id, promoted } => (instance_id, promoted),
                Resume::RegisterAfter(delay) => {
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    match self.establish().await {
                        Ok(registered) => registered,
                        Err(ClientError::Cancelled) => return,
                        Err(e @ ClientError::RetriesExhausted { .. }) => {
                            self.set_state(RegistrationState::Unregistered);
                            tracing::warn!(
                                service_name = %self.config.service_name,
                                error = %e,
                                "Registry still unreachable, instance remains undiscoverable"
                            );
                            next = Resume::RegisterAfter(self.config.retry.max_delay);
                            continue;
                        }
                        Err(e) => {
                            self.set_state(RegistrationState::Unregistered);
                            tracing::error!(
                                service_name = %self.config.service_name,
                                error = %e,
                                "Registration rejected by registry, giving up"
                            );
                            return;
                        }
                    }
                }
            };

            next = match self.heartbeat(&instance_id, promoted).await {
                HeartbeatExit::Cancelled => return,
                HeartbeatExit::LeaseLost => Resume::RegisterAfter(Duration::ZERO),
            };
        }
    }

    // 注册并（按需）标记为 UP
    async fn establish(&self) -> Result<(String, bool), ClientError> {
        let instance_id = self.register_with_retry().await?;
        let promoted = self.promote(&instance_id).await;
        self.set_state(RegistrationState::Registered {
            instance_id: instance_id.clone(),
        });
        Ok((instance_id, promoted))
    }

    async fn register_with_retry(&self) -> Result<String, ClientError> {
        self.set_state(RegistrationState::Registering);
        let request = self.config.register_request();
        let mut backoff = Backoff::new(self.config.retry.clone());

        loop {
            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return Err(ClientError::Cancelled),
                result = bounded(self.config.call_timeout, self.transport.register(&request)) => result,
            };

            match result {
                Ok(instance_id) => {
                    tracing::info!(
                        service_name = %self.config.service_name,
                        instance_id = %instance_id,
                        attempts = backoff.attempts() + 1,
                        "Registered with registry"
                    );
                    return Ok(instance_id);
                }
                Err(e) if e.is_transient() => {
                    let Some(delay) = backoff.next_delay() else {
                        return Err(ClientError::RetriesExhausted {
                            attempts: backoff.attempts(),
                            last: Box::new(e),
                        });
                    };
                    tracing::warn!(
                        service_name = %self.config.service_name,
                        attempt = backoff.attempts(),
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registration attempt failed, retrying"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(ClientError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn promote(&self, instance_id: &str) -> bool {
        if !self.config.mark_up_after_register {
            return true;
        }

        let call = self.transport.update_status(instance_id, InstanceStatus::Up);
        match bounded(self.config.call_timeout, call).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    error = %e,
                    "Failed to mark instance UP, retrying after next heartbeat"
                );
                false
            }
        }
    }

    async fn heartbeat(&self, instance_id: &str, mut promoted: bool) -> HeartbeatExit {
        let period = self.config.heartbeat_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return HeartbeatExit::Cancelled,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return HeartbeatExit::Cancelled,
                result = bounded(self.config.call_timeout, self.transport.renew(instance_id)) => result,
            };

            match result {
                Ok(()) => {
                    if failures > 0 {
                        tracing::info!(instance_id = %instance_id, failures, "Heartbeat recovered");
                    }
                    failures = 0;
                    tracing::trace!(instance_id = %instance_id, "Lease renewed");
                    if !promoted {
                        promoted = self.promote(instance_id).await;
                    }
                }
                Err(ClientError::NotFound(_)) => {
                    tracing::warn!(
                        service_name = %self.config.service_name,
                        instance_id = %instance_id,
                        "Registry no longer knows this instance, re-registering"
                    );
                    return HeartbeatExit::LeaseLost;
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(
                        instance_id = %instance_id,
                        consecutive_failures = failures,
                        error = %e,
                        "Heartbeat failed, retrying at next tick"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_registered_state_carries_an_id() {
        let registered = RegistrationState::Registered {
            instance_id: "abc".into(),
        };
        assert_eq!(registered.instance_id(), Some("abc"));
        assert!(registered.is_registered());

        for state in [
            RegistrationState::Unregistered,
            RegistrationState::Registering,
            RegistrationState::Deregistering,
            RegistrationState::Deregistered,
        ] {
            assert!(!state.is_registered());
        }
    }
}
