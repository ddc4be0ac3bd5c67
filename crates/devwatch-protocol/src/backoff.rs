use rand::Rng;
use std::time::Duration;

/// Client-side reconnection policy for the event stream.
///
/// The delay before attempt `n` (0-based) is `base * 2^n + jitter`, capped
/// at `cap`. After `max_attempts` consecutive failures the client gives up.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
    /// Upper bound of the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 10,
            max_jitter: Duration::from_millis(1_000),
        }
    }
}

impl ReconnectPolicy {
    /// Delay without jitter for a 0-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let capped = attempt.min(31);
        let mult = 1u64 << capped;
        let millis = self.base.as_millis() as u64;
        let raw = millis.saturating_mul(mult);
        Duration::from_millis(raw.min(self.cap.as_millis() as u64))
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        (self.base_delay(attempt) + Duration::from_millis(jitter)).min(self.cap)
    }
}

/// Tracks consecutive failed attempts against a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Reconnector {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Reconnector {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to wait before the next attempt, or `None` once the ceiling is hit.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Call after a connection has been established.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
