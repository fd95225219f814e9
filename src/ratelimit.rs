//! Token-bucket rate limiter (spec §5 "Shared resources", §6 GitOps
//! surface): gates outbound calls to quota-limited APIs like the git
//! provider. No crate in the pack specializes in this (`governor` isn't
//! used anywhere), and the algorithm is small and fully specified by the
//! spec itself, so it's hand-rolled here rather than pulled in as a
//! dependency.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::errors::RateLimitError;
use crate::time::SharedClock;

/// `Wait` polls at this cadence until a token frees up or the context is
/// cancelled (spec §5).
const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct BucketState {
    tokens: f64,
    last_refill: chrono::DateTime<chrono::Utc>,
}

/// A token bucket of `capacity` tokens, refilled at `refill_per_period`
/// tokens every `period`. `allow()` is non-blocking; `wait()` polls.
pub struct RateLimiter {
    capacity: f64,
    refill_per_period: f64,
    period: Duration,
    state: Mutex<BucketState>,
    clock: SharedClock,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_period: u32, period: Duration, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            capacity: capacity as f64,
            refill_per_period: refill_per_period as f64,
            period,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: now,
            }),
            clock,
        }
    }

    async fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.signed_duration_since(state.last_refill);
        let elapsed_secs = elapsed.num_milliseconds().max(0) as f64 / 1000.0;
        let period_secs = self.period.as_secs_f64().max(f64::EPSILON);

        let refilled = elapsed_secs / period_secs * self.refill_per_period;
        if refilled > 0.0 {
            state.tokens = (state.tokens + refilled).min(self.capacity);
            state.last_refill = now;
        }
    }

    /// Non-blocking: consumes one token and returns `true`, or returns
    /// `false` immediately if none are available.
    pub async fn allow(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state).await;
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Blocks (via a 100ms poll) until a token is available or `cancel`
    /// fires, whichever comes first (spec §5).
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), RateLimitError> {
        loop {
            if self.allow().await {
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Err(RateLimitError::Exceeded(POLL_INTERVAL));
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = cancel.cancelled() => return Err(RateLimitError::Exceeded(POLL_INTERVAL)),
            }
        }
    }
}
