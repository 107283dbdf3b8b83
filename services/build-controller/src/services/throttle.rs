use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Client-side token bucket in front of the API server.
pub struct Throttle {
    bucket: Option<Mutex<Bucket>>,
}

struct Bucket {
    qps: f64,
    burst: f64,
    tokens: f64,
    last: Instant,
}

impl Bucket {
    fn new(qps: f64, burst: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps,
            burst,
            tokens: burst,
            last: now,
        }
    }

    /// Takes one token and returns how long the caller must wait for it.
    /// Tokens may go negative; that debt is what later callers queue behind.
    fn reserve(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.qps).min(self.burst);
        self.last = now;

        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.qps)
        }
    }
}

impl Throttle {
    /// A `qps` of zero disables throttling.
    pub fn new(qps: f64, burst: u32) -> Self {
        let bucket = (qps > 0.0).then(|| Mutex::new(Bucket::new(qps, burst, Instant::now())));
        Self { bucket }
    }

    pub async fn acquire(&self) {
        let Some(bucket) = &self.bucket else {
            return;
        };
        let wait = bucket.lock().await.reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_is_free_then_calls_are_spaced() {
        let start = Instant::now();
        let mut bucket = Bucket::new(10.0, 2, start);

        assert_eq!(bucket.reserve(start), Duration::ZERO);
        assert_eq!(bucket.reserve(start), Duration::ZERO);

        let wait = bucket.reserve(start);
        assert!((wait.as_secs_f64() - 0.1).abs() < 1e-9);
        let wait = bucket.reserve(start);
        assert!((wait.as_secs_f64() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn tokens_refill_up_to_the_burst() {
        let start = Instant::now();
        let mut bucket = Bucket::new(1.0, 3, start);
        for _ in 0..3 {
            bucket.reserve(start);
        }

        let later = start + Duration::from_secs(60);
        for _ in 0..3 {
            assert_eq!(bucket.reserve(later), Duration::ZERO);
        }
        assert!(bucket.reserve(later) > Duration::ZERO);
    }

    #[tokio::test]
    async fn disabled_throttle_never_waits() {
        let throttle = Throttle::new(0.0, 0);
        assert!(throttle.bucket.is_none());
        throttle.acquire().await;
    }
}
