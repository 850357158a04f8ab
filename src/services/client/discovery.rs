use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::wrappers::WatchStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::config::DiscoveryConfig;
use super::error::{ClientError, DiscoveryError};
use super::transport::{RegistryTransport, bounded};
use crate::services::registry::{InstanceView, RegistrySnapshot};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct CachedSnapshot {
    snapshot: Arc<RegistrySnapshot>,
    fetched_at: Instant,
}

struct DiscoveryInner {
    transport: Arc<dyn RegistryTransport>,
    config: DiscoveryConfig,
    cache: watch::Sender<Option<CachedSnapshot>>,
    // 轮询游标
    cursor: AtomicUsize,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Locally cached view of the registry, refreshed in the background.
///
/// Lookups never hit the network. A cache older than `max_staleness` is
/// reported as [`DiscoveryError::Stale`] rather than served.
#[derive(Clone)]
pub struct DiscoveryClient {
    inner: Arc<DiscoveryInner>,
}

impl DiscoveryClient {
    pub fn new(transport: Arc<dyn RegistryTransport>, mut config: DiscoveryConfig) -> Self {
        config.refresh_interval = config.refresh_interval.max(MIN_REFRESH_INTERVAL);
        let (cache, _) = watch::channel(None);
        Self {
            inner: Arc::new(DiscoveryInner {
                transport,
                config,
                cache,
                cursor: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Spawns the periodic refresh loop. The first refresh runs immediately.
    pub fn start(&self) {
        let inner = self.inner.clone();
        self.inner.tasks.spawn(inner.run());
    }

    pub async fn refresh_now(&self) -> Result<Arc<RegistrySnapshot>, ClientError> {
        self.inner.refresh().await
    }

    pub fn snapshot(&self) -> Result<Arc<RegistrySnapshot>, DiscoveryError> {
        self.snapshot_at(Instant::now())
    }

    fn snapshot_at(&self, now: Instant) -> Result<Arc<RegistrySnapshot>, DiscoveryError> {
        let cache = self.inner.cache.borrow();
        let Some(cached) = cache.as_ref() else {
            return Err(DiscoveryError::NotReady);
        };

        let age = now.saturating_duration_since(cached.fetched_at);
        if age > self.inner.config.max_staleness {
            return Err(DiscoveryError::Stale { age });
        }
        Ok(cached.snapshot.clone())
    }

    pub fn instances(&self, service_name: &str) -> Result<Vec<InstanceView>, DiscoveryError> {
        Ok(self.snapshot()?.instances(service_name).to_vec())
    }

    /// Round-robin pick among the cached instances of `service_name`.
    pub fn next_instance(&self, service_name: &str) -> Result<Option<InstanceView>, DiscoveryError> {
        let snapshot = self.snapshot()?;
        let instances = snapshot.instances(service_name);
        if instances.is_empty() {
            return Ok(None);
        }

        let idx = self.inner.cursor.fetch_add(1, Ordering::Relaxed);
        Ok(Some(instances[idx % instances.len()].clone()))
    }

    /// Time since the last successful refresh.
    pub fn age(&self) -> Option<Duration> {
        self.inner
            .cache
            .borrow()
            .as_ref()
            .map(|cached| cached.fetched_at.elapsed())
    }

    /// Yields the current snapshot, then every snapshot that differs from
    /// the previous one.
    pub fn changes(&self) -> impl Stream<Item = Arc<RegistrySnapshot>> + Send + 'static {
        WatchStream::new(self.inner.cache.subscribe())
            .filter_map(|cached| cached.map(|cached| cached.snapshot))
    }

    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

impl DiscoveryInner {
    async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = self.refresh() => result,
            };

            if let Err(e) = result {
                tracing::warn!(error = %e, "Discovery refresh failed, keeping cached snapshot");
            }
        }

        tracing::debug!("Discovery refresh loop stopped");
    }

    async fn refresh(&self) -> Result<Arc<RegistrySnapshot>, ClientError> {
        let timeout = self.config.call_timeout;
        let snapshot = if self.config.services.is_empty() {
            bounded(timeout, self.transport.query_all()).await?
        } else {
            let queries = self
                .config
                .services
                .iter()
                .map(|service_name| bounded(timeout, self.transport.query(service_name)));

            let mut applications = BTreeMap::new();
            for result in join_all(queries).await {
                let application = result?;
                if !application.instances.is_empty() {
                    applications.insert(application.service_name.clone(), application);
                }
            }
            // 按服务拉取时没有全局版本号
            RegistrySnapshot {
                version: 0,
                applications,
            }
        };

        let snapshot = Arc::new(snapshot);
        let fetched_at = Instant::now();
        // 续约只推进时间戳，不算作变更；快照本身仍替换为最新
        let changed = self.cache.send_if_modified(|cache| {
            let changed = cache
                .as_ref()
                .is_none_or(|current| !same_membership(&current.snapshot, &snapshot));
            *cache = Some(CachedSnapshot {
                snapshot: snapshot.clone(),
                fetched_at,
            });
            changed
        });

        if changed {
            tracing::debug!(
                version = snapshot.version,
                applications = snapshot.applications.len(),
                instances = snapshot.instance_count(),
                "Discovery snapshot updated"
            );
        }
        Ok(snapshot)
    }
}

// 比较成员与状态，忽略续约时间戳和版本号
fn same_membership(a: &RegistrySnapshot, b: &RegistrySnapshot) -> bool {
    a.applications.len() == b.applications.len()
        && a.applications.iter().zip(&b.applications).all(|((name_a, app_a), (name_b, app_b))| {
            name_a == name_b
                && app_a.instances.len() == app_b.instances.len()
                && app_a.instances.iter().zip(&app_b.instances).all(|(x, y)| {
                    x.instance_id == y.instance_id
                        && x.status == y.status
                        && x.host == y.host
                        && x.port == y.port
                        && x.metadata == y.metadata
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::registry::{RegisterRequest, RegistryStore, StoreConfig};
    use futures::FutureExt;
    use std::collections::HashMap;

    fn request(name: &str, port: u16) -> RegisterRequest {
        RegisterRequest {
            service_name: name.to_string(),
            host: "10.0.0.1".to_string(),
            port,
            metadata: HashMap::new(),
            lease_duration_seconds: Some(30),
            eviction_timeout_seconds: None,
        }
    }

    fn eager_store() -> RegistryStore {
        RegistryStore::new(StoreConfig {
            eager_up: true,
            ..StoreConfig::default()
        })
    }

    #[tokio::test]
    async fn lookups_fail_before_first_refresh() {
        let client = DiscoveryClient::new(Arc::new(eager_store()), DiscoveryConfig::default());
        assert_eq!(client.snapshot().unwrap_err(), DiscoveryError::NotReady);
        assert!(client.age().is_none());
    }

    #[tokio::test]
    async fn round_robin_cycles_through_instances() {
        let store = eager_store();
        store.register(request("product-service", 9001)).unwrap();
        store.register(request("product-service", 9002)).unwrap();

        let client = DiscoveryClient::new(Arc::new(store), DiscoveryConfig::default());
        client.refresh_now().await.unwrap();

        let picks: Vec<u16> = (0..4)
            .map(|_| client.next_instance("product-service").unwrap().unwrap().port)
            .collect();
        assert_eq!(picks[0], picks[2]);
        assert_eq!(picks[1], picks[3]);
        assert_ne!(picks[0], picks[1]);
        assert_eq!(client.next_instance("missing").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_cache_is_not_served() {
        let config = DiscoveryConfig {
            max_staleness: Duration::from_secs(10),
            ..DiscoveryConfig::default()
        };
        let client = DiscoveryClient::new(Arc::new(eager_store()), config);
        client.refresh_now().await.unwrap();
        assert!(client.snapshot().is_ok());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(matches!(client.snapshot(), Err(DiscoveryError::Stale { .. })));
    }

    #[tokio::test]
    async fn watch_list_only_fetches_named_services() {
        let store = eager_store();
        store.register(request("product-service", 9001)).unwrap();
        store.register(request("user-service", 9100)).unwrap();

        let config = DiscoveryConfig {
            services: vec!["user-service".into(), "absent".into()],
            ..DiscoveryConfig::default()
        };
        let client = DiscoveryClient::new(Arc::new(store), config);
        let snapshot = client.refresh_now().await.unwrap();

        assert_eq!(snapshot.applications.len(), 1);
        assert_eq!(snapshot.instances("USER-SERVICE").len(), 1);
        assert!(snapshot.instances("product-service").is_empty());
    }

    #[tokio::test]
    async fn changes_skip_identical_snapshots() {
        let store = eager_store();
        let client = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
        let mut changes = Box::pin(client.changes());

        client.refresh_now().await.unwrap();
        let first = changes.next().await.unwrap();
        assert!(first.is_empty());

        // 内容相同，不应触发通知
        client.refresh_now().await.unwrap();
        store.register(request("cloud-config", 8888)).unwrap();
        client.refresh_now().await.unwrap();

        let second = changes.next().await.unwrap();
        assert_eq!(second.instance_count(), 1);
    }

    #[tokio::test]
    async fn renewals_alone_do_not_notify() {
        let store = eager_store();
        let id = store.register(request("cloud-config", 8888)).unwrap();
        let client = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
        let mut changes = Box::pin(client.changes());

        client.refresh_now().await.unwrap();
        let first = changes.next().await.unwrap();
        let renewed_before = first.instances("cloud-config")[0].last_renewed_at;

        // 保证墙钟毫秒前进
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.renew(&id).unwrap();
        client.refresh_now().await.unwrap();

        assert!(changes.next().now_or_never().is_none());
        // 缓存仍替换为最新数据
        let cached = client.snapshot().unwrap();
        assert!(cached.instances("cloud-config")[0].last_renewed_at > renewed_before);

        store.update_status(&id, crate::services::registry::InstanceStatus::Down).unwrap();
        client.refresh_now().await.unwrap();
        let second = changes.next().await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refresh_interval_still_populates_cache() {
        let store = eager_store();
        store.register(request("product-service", 9001)).unwrap();
        let config = DiscoveryConfig {
            refresh_interval: Duration::ZERO,
            ..DiscoveryConfig::default()
        };
        let client = DiscoveryClient::new(Arc::new(store), config);
        client.start();

        let mut changes = Box::pin(client.changes());
        let snapshot = tokio::time::timeout(Duration::from_secs(1), changes.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.instances("product-service").len(), 1);
        assert!(client.snapshot().is_ok());

        client.shutdown().await;
    }
}
