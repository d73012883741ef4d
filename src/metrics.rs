use std::sync::Mutex;
use std::time::{Duration, SystemTime};

/// Server-advertised quota, taken from the most recent response's
/// `x-ratelimit-*` headers. `None` fields mean the server has not advertised
/// a value yet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RateLimitStatus {
    pub remaining: Option<i64>,
    pub reset_at: Option<SystemTime>,
    pub limit: Option<i64>,
}

/// Point-in-time view of the client's request statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientMetrics {
    pub request_count: u64,
    pub average_response_time: Duration,
    /// Fraction of completed attempts that failed, in `[0, 1]`.
    pub error_rate: f64,
    pub rate_limit: RateLimitStatus,
}

#[derive(Debug, Default)]
struct Inner {
    request_count: u64,
    average_response_time: Duration,
    error_rate: f64,
    rate_limit: RateLimitStatus,
}

/// Aggregates per-attempt timings into a running mean and error rate.
///
/// State lives and dies with the owning client instance; there is no
/// persistence and no reset short of recreating the client.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    inner: Mutex<Inner>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed attempt.
    pub fn record(&self, response_time: Duration, is_error: bool) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        let n = inner.request_count + 1;
        let prior = inner.average_response_time.as_secs_f64() * inner.request_count as f64;
        inner.average_response_time =
            Duration::from_secs_f64((prior + response_time.as_secs_f64()) / n as f64);
        let errors = inner.error_rate * inner.request_count as f64 + if is_error { 1.0 } else { 0.0 };
        inner.error_rate = errors / n as f64;
        inner.request_count = n;
    }

    /// Record the rate-limit headers observed on the latest response.
    pub fn set_rate_limit(&self, status: RateLimitStatus) {
        self.inner.lock().expect("metrics lock poisoned").rate_limit = status;
    }

    pub fn snapshot(&self) -> ClientMetrics {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        ClientMetrics {
            request_count: inner.request_count,
            average_response_time: inner.average_response_time,
            error_rate: inner.error_rate,
            rate_limit: inner.rate_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_mean_matches_incremental_formula() {
        let metrics = MetricsCollector::new();
        metrics.record(Duration::from_millis(100), false);
        metrics.record(Duration::from_millis(300), false);
        metrics.record(Duration::from_millis(200), false);

        let snap = metrics.snapshot();
        assert_eq!(snap.request_count, 3);
        let avg_ms = snap.average_response_time.as_secs_f64() * 1000.0;
        assert!((avg_ms - 200.0).abs() < 1e-6, "avg={avg_ms}");
    }

    #[test]
    fn error_rate_is_a_running_fraction() {
        let metrics = MetricsCollector::new();
        metrics.record(Duration::from_millis(10), true);
        metrics.record(Duration::from_millis(10), false);
        metrics.record(Duration::from_millis(10), false);
        metrics.record(Duration::from_millis(10), true);

        let snap = metrics.snapshot();
        assert!((snap.error_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn rate_limit_snapshot_reflects_latest_headers() {
        let metrics = MetricsCollector::new();
        let status = RateLimitStatus {
            remaining: Some(42),
            reset_at: Some(SystemTime::now()),
            limit: Some(1000),
        };
        metrics.set_rate_limit(status);
        assert_eq!(metrics.snapshot().rate_limit.remaining, Some(42));
        assert_eq!(metrics.snapshot().rate_limit.limit, Some(1000));
    }
}
