use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::policy::{EvictionDecision, RenewalRates, evaluate};
use crate::services::registry::RegistryStore;

// 自我保护配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelfPreservationConfig {
    pub enabled: bool,
    pub threshold: f64,
    pub window_secs: u64,
}

impl Default for SelfPreservationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.85,
            window_secs: 60,
        }
    }
}

impl SelfPreservationConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }
}

// 单次清理结果
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub evaluated: usize,
    pub evicted: Vec<String>,
    pub decision: EvictionDecision,
    pub rates: Option<RenewalRates>,
}

/// Periodically evicts instances whose lease ran out.
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: RegistryStore,
    sweep_interval: Duration,
    preservation: SelfPreservationConfig,
    self_preserving: Arc<AtomicBool>,
}

impl LeaseManager {
    pub fn new(store: RegistryStore, sweep_interval: Duration, preservation: SelfPreservationConfig) -> Self {
        Self {
            store,
            sweep_interval: sweep_interval.max(Duration::from_millis(100)),
            preservation,
            self_preserving: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn preservation(&self) -> &SelfPreservationConfig {
        &self.preservation
    }

    pub fn is_self_preserving(&self) -> bool {
        self.self_preserving.load(Ordering::Acquire)
    }

    pub fn renewal_rates(&self, now: Instant) -> RenewalRates {
        let window = self.preservation.window();
        let expected = self.store.expected_renewals(now, window);
        let observed = self.store.renewals().count_within(now, window);
        RenewalRates::from_counts(expected, observed, window)
    }

    pub fn decide(&self, now: Instant) -> (EvictionDecision, Option<RenewalRates>) {
        if !self.preservation.enabled {
            return (EvictionDecision::EvictNormally, None);
        }
        let rates = self.renewal_rates(now);
        let decision = evaluate(rates.expected_per_min, rates.observed_per_min, self.preservation.threshold);
        (decision, Some(rates))
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let candidates = self.store.expired_candidates(now);
        let (decision, rates) = self.decide(now);
        self.track_mode(decision, rates);

        let mut report = SweepReport {
            evaluated: candidates.len(),
            evicted: Vec::new(),
            decision,
            rates,
        };

        if candidates.is_empty() {
            return report;
        }

        if decision == EvictionDecision::SuspendEviction {
            tracing::warn!(
                expired_count = candidates.len(),
                "Self-preservation active, skipping eviction of expired leases"
            );
            return report;
        }

        // 逐个实例判定后驱逐，不持有全局锁
        for instance_id in candidates {
            if let Some(instance) = self.store.evict_if_expired(&instance_id, now) {
                tracing::warn!(
                    service_name = %instance.service_name,
                    instance_id = %instance_id,
                    silent_secs = now.saturating_duration_since(instance.lease.last_renewed_at).as_secs(),
                    timeout_secs = instance.lease.eviction_timeout.as_secs(),
                    "Evicted instance after lease expiry"
                );
                report.evicted.push(instance_id);
            }
        }

        if !report.evicted.is_empty() {
            tracing::info!(evicted_count = report.evicted.len(), "Eviction sweep completed");
        }
        report
    }

    // 仅在模式切换时记录日志
    fn track_mode(&self, decision: EvictionDecision, rates: Option<RenewalRates>) {
        let active = decision == EvictionDecision::SuspendEviction;
        let was_active = self.self_preserving.swap(active, Ordering::AcqRel);
        if active == was_active {
            return;
        }

        let (expected, observed) = rates
            .map(|r| (r.expected_per_min, r.observed_per_min))
            .unwrap_or_default();
        if active {
            tracing::warn!(
                expected_per_min = expected,
                observed_per_min = observed,
                threshold = self.preservation.threshold,
                "Renewal rate below threshold, entering self-preservation"
            );
        } else {
            tracing::info!(
                expected_per_min = expected,
                observed_per_min = observed,
                "Renewal rate recovered, leaving self-preservation"
            );
        }
    }

    // 启动定期清理任务
    pub fn spawn(&self, tracker: &TaskTracker, shutdown: CancellationToken) {
        let manager = self.clone();
        tracker.spawn(async move {
            let mut interval = tokio::time::interval(manager.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(
                interval_ms = manager.sweep_interval.as_millis() as u64,
                self_preservation = manager.preservation.enabled,
                "Lease manager started"
            );

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tracing::debug!("Executing lease expiration sweep...");
                manager.sweep();
            }
            tracing::info!("Lease manager stopped");
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::services::registry::{RegisterRequest, StoreConfig};

    fn eager_store() -> RegistryStore {
        RegistryStore::new(StoreConfig {
            eager_up: true,
            ..StoreConfig::default()
        })
    }

    fn register(store: &RegistryStore, port: u16, now: Instant) -> String {
        store
            .register_at(
                RegisterRequest {
                    service_name: "svc".into(),
                    host: "h".into(),
                    port,
                    metadata: HashMap::new(),
                    lease_duration_seconds: Some(1),
                    eviction_timeout_seconds: Some(2),
                },
                now,
            )
            .unwrap()
    }

    #[test]
    fn sweep_evicts_silent_instances() {
        let store = eager_store();
        let manager = LeaseManager::new(store.clone(), Duration::from_secs(1), SelfPreservationConfig::disabled());
        let start = Instant::now();
        let silent = register(&store, 80, start);
        let alive = register(&store, 81, start);

        let later = start + Duration::from_secs(3);
        store.renew_at(&alive, later).unwrap();

        let report = manager.sweep_at(later);
        assert_eq!(report.evaluated, 1);
        assert_eq!(report.evicted, vec![silent.clone()]);
        assert!(store.instance(&silent).is_none());
        assert!(store.instance(&alive).is_some());
    }

    #[test]
    fn self_preservation_blocks_mass_eviction() {
        let store = eager_store();
        let manager = LeaseManager::new(store.clone(), Duration::from_secs(1), SelfPreservationConfig::default());
        let start = Instant::now();
        let ids: Vec<String> = (0..4).map(|i| register(&store, 80 + i, start)).collect();

        // 所有实例同时失联，观察到的续约为 0
        let later = start + Duration::from_secs(10);
        let report = manager.sweep_at(later);

        assert_eq!(report.decision, EvictionDecision::SuspendEviction);
        assert!(report.evicted.is_empty());
        assert!(manager.is_self_preserving());
        for id in &ids {
            assert!(store.instance(id).is_some());
        }
    }

    #[test]
    fn eviction_resumes_once_rate_recovers() {
        let store = eager_store();
        let preservation = SelfPreservationConfig {
            enabled: true,
            threshold: 0.5,
            window_secs: 10,
        };
        let manager = LeaseManager::new(store.clone(), Duration::from_secs(1), preservation);
        let start = Instant::now();
        let silent = register(&store, 80, start);
        let healthy: Vec<String> = (1..4).map(|i| register(&store, 80 + i, start)).collect();

        let partitioned = start + Duration::from_secs(10);
        assert_eq!(manager.sweep_at(partitioned).decision, EvictionDecision::SuspendEviction);

        // 三个实例恢复心跳，一个依旧沉默
        let mut now = partitioned;
        for _ in 0..10 {
            now += Duration::from_secs(1);
            for id in &healthy {
                store.renew_at(id, now).unwrap();
            }
        }

        let report = manager.sweep_at(now);
        assert_eq!(report.decision, EvictionDecision::EvictNormally);
        assert_eq!(report.evicted, vec![silent]);
        assert!(!manager.is_self_preserving());
    }
}
