//! Retry pacing: exponential backoff with a ceiling, and fixed-interval
//! bounded retries.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Backoff {
    max: Duration,
    next: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            max,
            next: initial.min(max),
        }
    }

    /// Delay to wait now; doubles the following one up to the ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.max);
        delay
    }
}

/// Run `op` up to `attempts` times, `interval` apart, stopping at the first
/// success. `None` once every attempt failed or `cancel` fired between
/// attempts.
pub async fn retry_fixed<T, E, F, Fut>(
    attempts: u32,
    interval: Duration,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Some(value),
            Err(e) => tracing::warn!("Failed to {} (attempt {} of {}): {}", what, attempt, attempts, e),
        }
        if attempt == attempts {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_doubles_up_to_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(600));
        let delays: Vec<u64> = (0..13).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 600, 600, 600]
        );
    }

    #[test]
    fn test_never_exceeds_ceiling() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(600));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(600));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let result = retry_fixed(10, Duration::from_secs(10), &CancellationToken::new(), "finish", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n < 2 { Err("unavailable") } else { Ok(n) } }
        })
        .await;

        assert_eq!(result, Some(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let calls = AtomicU32::new(0);
        let result: Option<()> = retry_fixed(10, Duration::from_secs(10), &CancellationToken::new(), "finish", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down") }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result: Option<()> = retry_fixed(10, Duration::from_secs(10), &cancel, "finish", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down") }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
