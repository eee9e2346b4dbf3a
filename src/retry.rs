use std::time::Duration;

const MIN_DELAY: Duration = Duration::from_millis(50);

/// Exponential backoff policy used between failed event-loop polls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetrySettings {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl RetrySettings {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let initial = initial.max(MIN_DELAY);
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.clamp(1.1, 10.0),
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5), 2.0)
    }
}

pub struct RetryBackoff {
    policy: RetrySettings,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(policy: RetrySettings) -> Self {
        let current = policy.initial;
        Self { policy, current }
    }

    pub fn on_success(&mut self) {
        self.current = self.policy.initial;
    }

    /// Returns the delay to wait now and advances the next one.
    pub fn on_failure(&mut self) -> Duration {
        let delay = self.current.max(MIN_DELAY);
        let next = (delay.as_millis() as f64 * self.policy.multiplier)
            .round()
            .max(self.policy.initial.as_millis() as f64);
        let capped = next.min(self.policy.max.as_millis() as f64);
        self.current = std::cmp::min(Duration::from_millis(capped as u64), self.policy.max);
        delay
    }
}
