//! Exponential backoff with full jitter
//!
//! Used wherever the hub waits on something outside its control: a spawned
//! server opening its port, an HTTP endpoint leaving 5xx, a process exiting
//! after a signal, a managed service being replaced after a crash.

use crate::error::{HubError, HubResult};
use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Parameters for [`exponential_backoff`]
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Upper bound of the first sleep
    #[serde(with = "secs_f64")]
    pub start_wait: Duration,
    /// Multiplier applied to the sleep bound after each attempt
    pub scale_factor: f64,
    /// Ceiling for the sleep bound
    #[serde(with = "secs_f64")]
    pub max_wait: Duration,
    /// Total time before giving up
    #[serde(with = "secs_f64")]
    pub timeout: Duration,
    /// Fraction of `timeout` by which the deadline is jittered either way
    pub timeout_tolerance: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            start_wait: Duration::from_millis(200),
            scale_factor: 2.0,
            max_wait: Duration::from_secs(5),
            timeout: Duration::from_secs(10),
            timeout_tolerance: 0.1,
        }
    }
}

impl Backoff {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Latest point at which a call can still be running
    pub fn max_duration(&self) -> Duration {
        self.timeout.mul_f64(1.0 + self.timeout_tolerance.max(0.0))
    }
}

fn uniform(low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    rand::thread_rng().gen_range(low..=high)
}

/// Evaluate `pass` until it yields `Some`, sleeping a jittered, growing
/// interval between attempts.
///
/// Each sleep is drawn from `[0, min(start_wait * scale, max_wait)]` and
/// clipped to the remaining time. The deadline itself is moved by up to
/// `timeout * timeout_tolerance` in either direction so that many waiters
/// started together do not all expire together.
pub async fn exponential_backoff<T, F, Fut>(
    backoff: &Backoff,
    fail_message: &str,
    mut pass: F,
) -> HubResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let timeout = backoff.timeout.as_secs_f64();
    let tolerance = timeout * backoff.timeout_tolerance.max(0.0);
    let total = (timeout + uniform(-tolerance, tolerance)).max(0.0);
    let deadline = Instant::now() + Duration::from_secs_f64(total);

    let start_wait = backoff.start_wait.as_secs_f64();
    let max_wait = backoff.max_wait.as_secs_f64();
    let mut scale = 1.0;

    loop {
        if let Some(value) = pass().await {
            return Ok(value);
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }

        let cap = (start_wait * scale).min(max_wait);
        scale *= backoff.scale_factor;
        let remaining = (deadline - now).as_secs_f64();
        let dt = uniform(0.0, cap).min(remaining).max(0.0);
        tokio::time::sleep(Duration::from_secs_f64(dt)).await;
    }

    Err(HubError::Timeout(fail_message.to_string()))
}

mod secs_f64 {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast() -> Backoff {
        Backoff {
            start_wait: Duration::from_millis(5),
            scale_factor: 2.0,
            max_wait: Duration::from_millis(50),
            timeout: Duration::from_millis(300),
            timeout_tolerance: 0.1,
        }
    }

    #[test]
    fn test_default_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.start_wait, Duration::from_millis(200));
        assert_eq!(backoff.scale_factor, 2.0);
        assert_eq!(backoff.max_wait, Duration::from_secs(5));
        assert_eq!(backoff.timeout, Duration::from_secs(10));
        assert_eq!(backoff.timeout_tolerance, 0.1);
        assert_eq!(backoff.max_duration(), Duration::from_secs(11));
    }

    #[test]
    fn test_parse_backoff_seconds() {
        let backoff: Backoff = toml::from_str("start_wait = 0.5\ntimeout = 30").unwrap();
        assert_eq!(backoff.start_wait, Duration::from_millis(500));
        assert_eq!(backoff.timeout, Duration::from_secs(30));
        assert_eq!(backoff.max_wait, Duration::from_secs(5));

        assert!(toml::from_str::<Backoff>("timeout = -1").is_err());
    }

    #[tokio::test]
    async fn test_returns_value_once_predicate_passes() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let value = exponential_backoff(&fast(), "never passed", move || {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n >= 3 {
                    Some(n)
                } else {
                    None
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_immediate_success_does_not_sleep() {
        let started = std::time::Instant::now();
        let value = exponential_backoff(&Backoff::default(), "unused", || async { Some("ready") })
            .await
            .unwrap();
        assert_eq!(value, "ready");
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_passes_after_delay_within_timeout() {
        let started = std::time::Instant::now();
        let ready_after = Duration::from_millis(80);

        let result = exponential_backoff(&fast(), "too slow", move || async move {
            (started.elapsed() >= ready_after).then_some(())
        })
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let backoff = fast();
        let started = std::time::Instant::now();

        let err = exponential_backoff(&backoff, "Server never showed up", || async { None::<()> })
            .await
            .unwrap_err();

        let elapsed = started.elapsed();
        assert!(matches!(err, HubError::Timeout(ref msg) if msg == "Server never showed up"));
        assert!(elapsed >= backoff.timeout.mul_f64(1.0 - backoff.timeout_tolerance));
        // scheduler slack on top of the jittered deadline
        assert!(elapsed <= backoff.max_duration() + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_zero_timeout_tries_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let backoff = Backoff {
            timeout: Duration::ZERO,
            ..fast()
        };

        let result = exponential_backoff(&backoff, "nope", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { None::<()> }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
