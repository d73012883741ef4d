use rand::random;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::SystemTime;
use tokio::time::Duration;

/// Function mapping attempt number to wait duration before retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * 2^(attempt-1)`.
    #[default]
    Exponential,
}

/// Retry policy for transient REST failures.
///
/// Retries are attempted only for network errors, 5xx responses, and 429.
/// Other 4xx statuses surface immediately (401 takes the token-refresh path
/// instead; see the dispatch loop).
///
/// # Default
///
/// - `max_retries = 3` (attempts after the initial request)
/// - Exponential backoff from 1s, capped at 30s
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum retries after the initial attempt.
    pub max_retries: u32,
    /// Initial backoff delay.
    pub base_delay: Duration,
    /// Maximum backoff delay, before jitter.
    pub max_delay: Duration,
    /// Backoff growth strategy.
    pub strategy: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry_number` (1-based).
    ///
    /// The strategy delay is clamped to `max_delay`, then up to 10% of the
    /// clamped value is added as uniform jitter, so the result lies in
    /// `[delay, 1.1 * delay]`.
    pub fn backoff_delay(&self, retry_number: u32) -> Duration {
        let factor = match self.strategy {
            BackoffStrategy::Exponential => 2f64.powi(retry_number.saturating_sub(1) as i32),
            BackoffStrategy::Linear => retry_number.max(1) as f64,
        };
        let mut delay = self.base_delay.mul_f64(factor);
        if delay > self.max_delay {
            delay = self.max_delay;
        }
        delay + delay.mul_f64(random::<f64>() * 0.1)
    }
}

pub(crate) fn retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub(crate) fn retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Parse a `Retry-After` header as either delta-seconds or an HTTP date.
pub(crate) fn retry_after_delay(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?;
    let text = value.to_str().ok()?.trim();

    if let Ok(seconds) = text.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let ts = httpdate::parse_http_date(text).ok()?;
    let delta = ts.duration_since(SystemTime::now()).ok()?;
    Some(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn exponential_delay_lies_within_jitter_band() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        };
        for retry_number in 1..=5u32 {
            let expected = Duration::from_millis(100 * 2u64.pow(retry_number - 1));
            let delay = config.backoff_delay(retry_number);
            assert!(delay >= expected, "retry {retry_number}: {delay:?}");
            assert!(
                delay <= expected.mul_f64(1.1),
                "retry {retry_number}: {delay:?}"
            );
        }
    }

    #[test]
    fn linear_delay_lies_within_jitter_band() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(200),
            strategy: BackoffStrategy::Linear,
            ..Default::default()
        };
        for retry_number in 1..=4u32 {
            let expected = Duration::from_millis(200 * retry_number as u64);
            let delay = config.backoff_delay(retry_number);
            assert!(delay >= expected);
            assert!(delay <= expected.mul_f64(1.1));
        }
    }

    #[test]
    fn delay_clamped_to_max_before_jitter() {
        let config = RetryConfig {
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(15),
            strategy: BackoffStrategy::Exponential,
            ..Default::default()
        };
        let delay = config.backoff_delay(5);
        assert!(delay >= Duration::from_secs(15));
        assert!(delay <= Duration::from_secs(15).mul_f64(1.1));
    }

    #[test]
    fn only_server_errors_and_429_are_retryable() {
        assert!(retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retryable_status(StatusCode::BAD_GATEWAY));
        assert!(retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!retryable_status(StatusCode::BAD_REQUEST));
        assert!(!retryable_status(StatusCode::UNAUTHORIZED));
        assert!(!retryable_status(StatusCode::NOT_FOUND));
    }

    #[test]
    fn retry_after_parses_delta_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after_delay(&headers), Some(Duration::from_secs(7)));
    }

    #[test]
    fn retry_after_parses_http_date() {
        let future = SystemTime::now() + Duration::from_secs(60);
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_str(&httpdate::fmt_http_date(future)).unwrap(),
        );
        let delay = retry_after_delay(&headers).unwrap();
        assert!(delay <= Duration::from_secs(60));
        assert!(delay >= Duration::from_secs(55));
    }

    #[test]
    fn retry_after_absent_or_garbage_is_none() {
        assert_eq!(retry_after_delay(&HeaderMap::new()), None);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after_delay(&headers), None);
    }
}
