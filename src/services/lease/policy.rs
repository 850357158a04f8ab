use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Longest window a [`RenewalMeter`] keeps buckets for.
pub const MAX_RENEWAL_WINDOW: Duration = Duration::from_secs(15 * 60);

// 驱逐决策
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionDecision {
    EvictNormally,
    SuspendEviction,
}

// 续约速率（每分钟）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenewalRates {
    pub expected_per_min: f64,
    pub observed_per_min: f64,
}

impl RenewalRates {
    pub fn from_counts(expected: f64, observed: u64, window: Duration) -> Self {
        let scale = 60.0 / window.as_secs_f64().max(1.0);
        Self {
            expected_per_min: expected * scale,
            observed_per_min: observed as f64 * scale,
        }
    }
}

/// Self-preservation check.
///
/// Evictions are suspended while the observed renewal rate sits below
/// `threshold` of the expected rate. Nothing expected means nothing to
/// protect, so eviction proceeds.
pub fn evaluate(expected_per_min: f64, observed_per_min: f64, threshold: f64) -> EvictionDecision {
    if expected_per_min <= 0.0 || threshold <= 0.0 || !expected_per_min.is_finite() {
        return EvictionDecision::EvictNormally;
    }

    if observed_per_min < expected_per_min * threshold {
        EvictionDecision::SuspendEviction
    } else {
        EvictionDecision::EvictNormally
    }
}

/// Renewals an on-time client produces inside `(now - window, now]`.
///
/// A client renews at `registered_at + k * duration` for `k >= 1`.
pub fn expected_renewals(age: Duration, duration: Duration, window: Duration) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    let period = duration.as_millis();
    let total = age.as_millis() / period;
    let before_window = age.saturating_sub(window).as_millis() / period;
    (total - before_window) as u64
}

/// Rolling count of successful renewals in one-second buckets.
#[derive(Debug)]
pub struct RenewalMeter {
    origin: Instant,
    buckets: Mutex<VecDeque<(u64, u64)>>,
}

impl Default for RenewalMeter {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl RenewalMeter {
    pub fn new(origin: Instant) -> Self {
        Self {
            origin,
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    pub fn started_at(&self) -> Instant {
        self.origin
    }

    pub fn record(&self, now: Instant) {
        let second = now.saturating_duration_since(self.origin).as_secs();
        let retention = MAX_RENEWAL_WINDOW.as_secs();

        if let Ok(mut buckets) = self.buckets.lock() {
            // 并发记录时可能拿到稍早的时间，计入最新桶即可
            let merged = match buckets.back_mut() {
                Some((last, count)) if *last >= second => {
                    *count += 1;
                    true
                }
                _ => false,
            };
            if !merged {
                buckets.push_back((second, 1));
            }

            while let Some((oldest, _)) = buckets.front() {
                if second.saturating_sub(*oldest) >= retention {
                    buckets.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    pub fn count_within(&self, now: Instant, window: Duration) -> u64 {
        let second = now.saturating_duration_since(self.origin).as_secs();
        let window = window.min(MAX_RENEWAL_WINDOW).as_secs();

        self.buckets
            .lock()
            .map(|buckets| {
                buckets
                    .iter()
                    .filter(|(bucket, _)| bucket + window > second)
                    .map(|(_, count)| count)
                    .sum()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_when_rate_is_healthy() {
        assert_eq!(evaluate(120.0, 118.0, 0.85), EvictionDecision::EvictNormally);
        assert_eq!(evaluate(120.0, 102.0, 0.85), EvictionDecision::EvictNormally);
    }

    #[test]
    fn suspends_when_rate_drops_below_threshold() {
        assert_eq!(evaluate(120.0, 101.0, 0.85), EvictionDecision::SuspendEviction);
        assert_eq!(evaluate(120.0, 0.0, 0.85), EvictionDecision::SuspendEviction);
    }

    #[test]
    fn nothing_expected_means_normal_eviction() {
        assert_eq!(evaluate(0.0, 0.0, 0.85), EvictionDecision::EvictNormally);
        assert_eq!(evaluate(f64::NAN, 0.0, 0.85), EvictionDecision::EvictNormally);
        assert_eq!(evaluate(10.0, 0.0, 0.0), EvictionDecision::EvictNormally);
    }

    #[test]
    fn expected_renewals_follow_the_renewal_schedule() {
        let secs = Duration::from_secs;
        // 尚未到第一次续约
        assert_eq!(expected_renewals(secs(29), secs(30), secs(60)), 0);
        assert_eq!(expected_renewals(secs(30), secs(30), secs(60)), 1);
        assert_eq!(expected_renewals(secs(60), secs(30), secs(60)), 2);
        // 窗口已满，稳定在 window / duration
        assert_eq!(expected_renewals(secs(600), secs(30), secs(60)), 2);
        assert_eq!(expected_renewals(secs(601), secs(1), secs(60)), 60);
        assert_eq!(expected_renewals(secs(10), Duration::ZERO, secs(60)), 0);
    }

    #[test]
    fn meter_counts_only_inside_window() {
        let origin = Instant::now();
        let meter = RenewalMeter::new(origin);

        meter.record(origin + Duration::from_secs(1));
        meter.record(origin + Duration::from_secs(1));
        meter.record(origin + Duration::from_secs(50));
        meter.record(origin + Duration::from_secs(70));

        let now = origin + Duration::from_secs(70);
        assert_eq!(meter.count_within(now, Duration::from_secs(60)), 2);
        assert_eq!(meter.count_within(now, Duration::from_secs(120)), 4);
        assert_eq!(meter.count_within(now, Duration::from_secs(1)), 1);
    }

    #[test]
    fn meter_drops_buckets_past_retention() {
        let origin = Instant::now();
        let meter = RenewalMeter::new(origin);

        meter.record(origin);
        meter.record(origin + MAX_RENEWAL_WINDOW + Duration::from_secs(5));

        let buckets = meter.buckets.lock().unwrap();
        assert_eq!(buckets.len(), 1);
    }

    #[test]
    fn rates_are_scaled_per_minute() {
        let rates = RenewalRates::from_counts(4.0, 3, Duration::from_secs(30));
        assert_eq!(rates.expected_per_min, 8.0);
        assert_eq!(rates.observed_per_min, 6.0);
    }
}
