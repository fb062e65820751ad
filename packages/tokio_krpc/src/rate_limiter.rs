use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};
use std::time::{
    Duration,
    Instant,
};

use tokio::{
    sync::Mutex,
    time,
};

/// Default bound on sends waiting for the token bucket to refill (spec
/// §5: "excess sends queue up to a bounded length (default 2 048
/// messages), then fail with `Backpressure`").
const DEFAULT_QUEUE_CAPACITY: usize = 2_048;

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("egress queue exceeded {0} pending sends")]
    QueueFull(usize),
}

/// Token-bucket egress limiter (spec §5): default 500 KiB/s sustained,
/// burst 1 MiB. Grounded in the original implementation's
/// `network/rate_limiter.hpp`.
pub struct RateLimiter {
    state: Mutex<State>,
    queued: AtomicUsize,
    queue_capacity: usize,
    rate_bytes_per_sec: f64,
    burst_bytes: f64,
}

struct State {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> RateLimiter {
        RateLimiter {
            state: Mutex::new(State {
                tokens: burst_bytes as f64,
                last_refill: Instant::now(),
            }),
            queued: AtomicUsize::new(0),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            rate_bytes_per_sec: rate_bytes_per_sec as f64,
            burst_bytes: burst_bytes as f64,
        }
    }

    pub fn default_dht() -> RateLimiter {
        RateLimiter::new(500 * 1024, 1024 * 1024)
    }

    /// Waits until `bytes` worth of tokens are available, then spends
    /// them. Never blocks longer than it takes the bucket to refill, even
    /// under sustained overload. Rejects outright once `queue_capacity`
    /// sends are already waiting on the bucket (spec §5 bounded queue).
    pub async fn acquire(&self, bytes: usize) -> Result<(), RateLimitError> {
        let already_queued = self.queued.fetch_add(1, Ordering::SeqCst);
        if already_queued >= self.queue_capacity {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(RateLimitError::QueueFull(self.queue_capacity));
        }

        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);

                if state.tokens >= bytes as f64 {
                    state.tokens -= bytes as f64;
                    self.queued.fetch_sub(1, Ordering::SeqCst);
                    return Ok(());
                }

                let deficit = bytes as f64 - state.tokens;
                Duration::from_secs_f64(deficit / self.rate_bytes_per_sec)
            };

            time::sleep(wait).await;
        }
    }

    fn refill(&self, state: &mut State) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_bytes_per_sec).min(self.burst_bytes);
        state.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_is_immediately_available() {
        let limiter = RateLimiter::new(500 * 1024, 1024 * 1024);
        limiter.acquire(1024 * 1024).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_bucket_waits_for_refill() {
        let limiter = RateLimiter::new(1024, 1024);
        limiter.acquire(1024).await.unwrap();

        let acquire = tokio::spawn(async move {
            limiter.acquire(512).await.unwrap();
        });

        time::sleep(Duration::from_millis(600)).await;
        acquire.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn queue_beyond_capacity_fails_with_backpressure() {
        let limiter = Arc::new(RateLimiter::new(1, 1));
        limiter.queued.store(limiter.queue_capacity, Ordering::SeqCst);

        let result = limiter.acquire(1).await;
        assert!(matches!(result, Err(RateLimitError::QueueFull(_))));
    }
}
