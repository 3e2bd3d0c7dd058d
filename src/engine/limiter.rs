use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use tokio_util::sync::CancellationToken;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// QPS values above this are treated as "no limit".
pub const MAX_QPS: u32 = 9999;

/// The wait was cut short by shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interrupted;

/// Shared gate for bulk sends: a per-second quota and/or a fixed spacing.
pub struct QpsLimiter {
    qps: Option<DirectLimiter>,
    spacing: Option<DirectLimiter>,
}

impl QpsLimiter {
    /// `None` when neither a QPS limit nor a delay is configured.
    pub fn new(qps: u32, delay: Duration) -> Option<Self> {
        let qps = NonZeroU32::new(qps)
            .filter(|q| q.get() <= MAX_QPS)
            .map(|q| RateLimiter::direct(Quota::per_second(q)));
        let spacing = Quota::with_period(delay).map(RateLimiter::direct);
        if qps.is_none() && spacing.is_none() {
            return None;
        }
        Some(QpsLimiter { qps, spacing })
    }

    /// Waits for a slot; only this wait blocks, never unrelated bookkeeping.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<(), Interrupted> {
        if let Some(lim) = self.spacing.as_ref() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Interrupted),
                _ = lim.until_ready() => {}
            }
        }
        if let Some(lim) = self.qps.as_ref() {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Interrupted),
                _ = lim.until_ready() => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[test]
    fn disabled_without_limits() {
        assert!(QpsLimiter::new(0, Duration::ZERO).is_none());
        assert!(QpsLimiter::new(MAX_QPS + 1, Duration::ZERO).is_none());
        assert!(QpsLimiter::new(10, Duration::ZERO).is_some());
        assert!(QpsLimiter::new(0, Duration::from_millis(100)).is_some());
    }

    #[tokio::test]
    async fn spacing_delays_second_acquire() {
        let lim = QpsLimiter::new(0, Duration::from_millis(100)).unwrap();
        let token = CancellationToken::new();
        let start = Instant::now();
        lim.acquire(&token).await.unwrap();
        lim.acquire(&token).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn cancelled_wait_is_interrupted() {
        let lim = QpsLimiter::new(0, Duration::from_secs(30)).unwrap();
        let token = CancellationToken::new();
        lim.acquire(&token).await.unwrap();
        token.cancel();
        assert_eq!(lim.acquire(&token).await, Err(Interrupted));
    }
}
