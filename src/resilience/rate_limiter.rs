use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Upper bound on a single sleep inside [`RateLimiter::wait_for_tokens`].
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Token bucket for rate limiting.
///
/// Tokens refill continuously from elapsed time; there is no background
/// timer. The invariant `0 <= tokens <= capacity` holds after every call.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket refilling at `refill_rate` tokens per second.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate: refill_rate.max(0.0),
            last_refill: Instant::now(),
        }
    }

    /// Bucket sized for a per-minute budget.
    pub fn per_minute(limit: u32) -> Self {
        Self::new(limit, limit as f64 / 60.0)
    }

    /// Takes `count` tokens if available. Leaves the bucket untouched otherwise.
    pub fn consume(&mut self, count: u32) -> bool {
        self.refill();
        if self.tokens >= count as f64 {
            self.tokens -= count as f64;
            true
        } else {
            false
        }
    }

    /// Returns tokens to the bucket; anything above capacity is discarded.
    pub fn add(&mut self, count: u32) {
        self.refill();
        self.tokens = (self.tokens + count as f64).min(self.capacity as f64);
    }

    /// Time until `count` tokens are available, zero if they already are.
    pub fn time_until_tokens(&mut self, count: u32) -> Duration {
        self.refill();
        if self.tokens >= count as f64 {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 {
            return Duration::MAX;
        }
        let needed = count as f64 - self.tokens;
        Duration::try_from_secs_f64(needed / self.refill_rate).unwrap_or(Duration::MAX)
    }

    /// Current token count after refilling.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = now;
    }
}

/// Named collection of token buckets.
///
/// Names without a registered bucket are unlimited.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the bucket for `name`.
    pub fn add_limit(&self, name: impl Into<String>, capacity: u32, refill_rate: f64) {
        let name = name.into();
        tracing::debug!(limit = %name, capacity, refill_rate, "Registered rate limit");
        self.buckets
            .lock()
            .insert(name, TokenBucket::new(capacity, refill_rate));
    }

    /// Returns true if `name` has a registered bucket.
    pub fn has_limit(&self, name: &str) -> bool {
        self.buckets.lock().contains_key(name)
    }

    /// Takes `tokens` from the bucket `name`. Always true for unknown names.
    pub fn acquire(&self, name: &str, tokens: u32) -> bool {
        match self.buckets.lock().get_mut(name) {
            Some(bucket) => bucket.consume(tokens),
            None => true,
        }
    }

    /// Gives `tokens` back to the bucket `name`, capped at its capacity.
    pub fn release(&self, name: &str, tokens: u32) {
        if let Some(bucket) = self.buckets.lock().get_mut(name) {
            bucket.add(tokens);
        }
    }

    /// Tokens currently available in `name`, `None` if unlimited.
    pub fn tokens_available(&self, name: &str) -> Option<f64> {
        self.buckets.lock().get_mut(name).map(TokenBucket::available)
    }

    /// Time until `tokens` are available in `name`.
    pub fn time_until_available(&self, name: &str, tokens: u32) -> Duration {
        self.buckets
            .lock()
            .get_mut(name)
            .map(|bucket| bucket.time_until_tokens(tokens))
            .unwrap_or(Duration::ZERO)
    }

    /// Waits until `tokens` can be taken from `name`, giving up after `timeout`.
    ///
    /// Sleeps at most 100ms between checks. Dropping the future stops waiting
    /// without consuming anything.
    pub async fn wait_for_tokens(&self, name: &str, tokens: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if self.acquire(name, tokens) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(limit = name, tokens, "Timed out waiting for tokens");
                return false;
            }

            let wait = self
                .time_until_available(name, tokens)
                .min(WAIT_POLL_INTERVAL)
                .min(deadline - now)
                .max(Duration::from_millis(1));
            sleep(wait).await;
        }
    }
}
