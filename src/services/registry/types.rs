use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::time::Instant;

// 实例状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Starting,
    Up,
    Down,
    OutOfService,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Up => "UP",
            InstanceStatus::Down => "DOWN",
            InstanceStatus::OutOfService => "OUT_OF_SERVICE",
            InstanceStatus::Unknown => "UNKNOWN",
        }
    }

    /// Whether instances in this status are handed out to callers.
    pub fn is_routable(&self) -> bool {
        match self {
            InstanceStatus::Up => true,
            InstanceStatus::Starting
            | InstanceStatus::Down
            | InstanceStatus::OutOfService
            | InstanceStatus::Unknown => false,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTING" => Ok(InstanceStatus::Starting),
            "UP" => Ok(InstanceStatus::Up),
            "DOWN" => Ok(InstanceStatus::Down),
            "OUT_OF_SERVICE" => Ok(InstanceStatus::OutOfService),
            "UNKNOWN" => Ok(InstanceStatus::Unknown),
            other => Err(format!("unknown instance status: {other}")),
        }
    }
}

// 以字符串形式序列化，JSON 与 XML 共用同一表示
impl Serialize for InstanceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for InstanceStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Time-bounded membership of one instance.
///
/// Monotonic timestamps drive expiry; the `*_ms` fields are wall-clock
/// copies kept only for display.
#[derive(Debug, Clone)]
pub struct Lease {
    pub duration: Duration,
    pub eviction_timeout: Duration,
    pub registered_at: Instant,
    pub last_renewed_at: Instant,
    pub registered_at_ms: u64,
    pub last_renewed_at_ms: u64,
}

impl Lease {
    pub fn new(duration: Duration, eviction_timeout: Duration, now: Instant) -> Self {
        let wall = epoch_millis();
        Self {
            duration,
            eviction_timeout,
            registered_at: now,
            last_renewed_at: now,
            registered_at_ms: wall,
            last_renewed_at_ms: wall,
        }
    }

    // 续约时间只允许前移
    pub fn renew(&mut self, now: Instant) -> bool {
        if now <= self.last_renewed_at {
            return false;
        }
        self.last_renewed_at = now;
        self.last_renewed_at_ms = self.last_renewed_at_ms.max(epoch_millis());
        true
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_renewed_at) > self.eviction_timeout
    }
}

// 实例身份（服务名 + 地址），用于判定重复注册
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentity {
    pub service_name: String,
    pub host: String,
    pub port: u16,
}

// 注册表中的实例记录，租约内嵌其中
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub metadata: HashMap<String, String>,
    pub status: InstanceStatus,
    pub lease: Lease,
}

impl ServiceInstance {
    pub fn identity(&self) -> InstanceIdentity {
        InstanceIdentity {
            service_name: self.service_name.clone(),
            host: self.host.clone(),
            port: self.port,
        }
    }

    pub fn is_visible(&self, now: Instant) -> bool {
        self.status.is_routable() && !self.lease.is_expired(now)
    }

    pub fn to_view(&self) -> InstanceView {
        InstanceView {
            instance_id: self.instance_id.clone(),
            service_name: self.service_name.clone(),
            host: self.host.clone(),
            port: self.port,
            status: self.status,
            metadata: self.metadata.clone(),
            lease_duration_seconds: self.lease.duration.as_secs(),
            eviction_timeout_seconds: self.lease.eviction_timeout.as_secs(),
            registered_at: self.lease.registered_at_ms,
            last_renewed_at: self.lease.last_renewed_at_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub service_name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eviction_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

// 对外暴露的实例视图
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceView {
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub status: InstanceStatus,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub lease_duration_seconds: u64,
    pub eviction_timeout_seconds: u64,
    pub registered_at: u64,
    pub last_renewed_at: u64,
}

impl InstanceView {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub service_name: String,
    #[serde(default)]
    pub instances: Vec<InstanceView>,
}

/// Point-in-time copy of every routable instance, keyed by service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub version: u64,
    #[serde(default)]
    pub applications: BTreeMap<String, Application>,
}

impl RegistrySnapshot {
    pub fn application(&self, service_name: &str) -> Option<&Application> {
        self.applications.get(&normalize_service_name(service_name))
    }

    pub fn instances(&self, service_name: &str) -> &[InstanceView] {
        self.application(service_name)
            .map(|app| app.instances.as_slice())
            .unwrap_or_default()
    }

    pub fn instance_count(&self) -> usize {
        self.applications.values().map(|app| app.instances.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.applications.is_empty()
    }
}

// 服务名统一为大写
pub fn normalize_service_name(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_uses_upper_snake_case_on_the_wire() {
        let json = serde_json::to_string(&InstanceStatus::OutOfService).unwrap();
        assert_eq!(json, "\"OUT_OF_SERVICE\"");

        let parsed: InstanceStatus = serde_json::from_str("\"up\"").unwrap();
        assert_eq!(parsed, InstanceStatus::Up);
        assert!(serde_json::from_str::<InstanceStatus>("\"SLEEPING\"").is_err());
    }

    #[test]
    fn only_up_is_routable() {
        assert!(InstanceStatus::Up.is_routable());
        for status in [
            InstanceStatus::Starting,
            InstanceStatus::Down,
            InstanceStatus::OutOfService,
            InstanceStatus::Unknown,
        ] {
            assert!(!status.is_routable(), "{status} should not be routable");
        }
    }

    #[test]
    fn lease_never_moves_backwards() {
        let start = Instant::now();
        let mut lease = Lease::new(Duration::from_secs(1), Duration::from_secs(2), start);

        let later = start + Duration::from_millis(1500);
        assert!(lease.renew(later));
        assert!(!lease.renew(start + Duration::from_millis(500)));
        assert_eq!(lease.last_renewed_at, later);
    }

    #[test]
    fn lease_expires_after_eviction_timeout() {
        let start = Instant::now();
        let lease = Lease::new(Duration::from_secs(1), Duration::from_secs(2), start);

        assert!(!lease.is_expired(start + Duration::from_secs(2)));
        assert!(lease.is_expired(start + Duration::from_millis(2001)));
    }

    #[test]
    fn register_request_accepts_minimal_payload() {
        let body = r#"{"serviceName":"cloud-config","host":"h","port":8888}"#;
        let request: RegisterRequest = serde_json::from_str(body).unwrap();

        assert_eq!(request.service_name, "cloud-config");
        assert!(request.metadata.is_empty());
        assert_eq!(request.lease_duration_seconds, None);
    }

    #[test]
    fn snapshot_lookup_ignores_case() {
        let mut snapshot = RegistrySnapshot::default();
        snapshot.applications.insert(
            "CLOUD-CONFIG".to_string(),
            Application {
                service_name: "CLOUD-CONFIG".to_string(),
                instances: Vec::new(),
            },
        );

        assert!(snapshot.application("cloud-config").is_some());
        assert!(snapshot.instances("user-service").is_empty());
    }
}
