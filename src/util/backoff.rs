//! Exponential Backoff
//!
//! A typed backoff policy plus a retry driver. Used for shark connection
//! setup and node-directory polling; streaming failures are never run
//! through this.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Backoff policy
#[derive(Debug, Clone)]
pub struct Backoff {
    /// Delay before the first retry
    pub initial: Duration,
    /// Ceiling for any single delay
    pub max: Duration,
    /// Multiplier between consecutive delays
    pub factor: f64,
    /// Fraction of each delay randomized away (0.0 disables jitter)
    pub jitter: f64,
    /// Total attempts, including the first
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 3,
        }
    }
}

impl Backoff {
    /// Policy matching the shark connect retry defaults: 2 retries,
    /// 100 ms initial, 10 s ceiling.
    pub fn for_connect(retries: u32, min: Duration, max: Duration) -> Self {
        Self {
            initial: min,
            max,
            factor: 2.0,
            jitter: 0.2,
            max_attempts: retries + 1,
        }
    }

    /// Delay before retry number `attempt` (0-based). None once attempts
    /// are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }
        let exp = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        let capped = exp.min(self.max.as_millis() as f64);
        let jittered = if self.jitter > 0.0 {
            let spread = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };
        Some(Duration::from_millis(jittered as u64))
    }
}

/// Run `op` until it succeeds, retrying per `policy`. The final error is
/// returned unchanged when attempts run out.
pub async fn retry<T, E, F, Fut>(policy: &Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => match policy.delay(attempt) {
                Some(delay) => {
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                None => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_grow_and_cap() {
        let policy = Backoff {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(policy.delay(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay(2), Some(Duration::from_millis(400)));
        // capped at max
        assert_eq!(policy.delay(5), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_attempts_exhaust() {
        let policy = Backoff {
            max_attempts: 3,
            jitter: 0.0,
            ..Backoff::default()
        };
        assert!(policy.delay(0).is_some());
        assert!(policy.delay(1).is_some());
        assert!(policy.delay(2).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventually_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = Backoff {
            initial: Duration::from_millis(10),
            jitter: 0.0,
            max_attempts: 5,
            ..Backoff::default()
        };
        let result: Result<u32, &str> = retry(&policy, |_attempt| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("transient")
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_surfaces_final_error() {
        let policy = Backoff {
            initial: Duration::from_millis(10),
            jitter: 0.0,
            max_attempts: 2,
            ..Backoff::default()
        };
        let result: Result<(), &str> = retry(&policy, |_| async { Err("down") }).await;
        assert_eq!(result, Err("down"));
    }
}
