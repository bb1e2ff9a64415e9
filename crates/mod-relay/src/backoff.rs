use std::time::Duration;

const CALM_WINDOW_FAILURES: u32 = 10;
const BUSY_CONSECUTIVE_FAILURES: u32 = 10;
const BUSY_WINDOW_FAILURES: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
    /// How long a connection must be the latest one before the windowed
    /// failure counter is cleared.
    pub window: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(10),
            medium: Duration::from_secs(60),
            long: Duration::from_secs(120),
            window: Duration::from_secs(3600),
        }
    }
}

impl ReconnectPolicy {
    pub fn wait_for(&self, consecutive: u32, within_window: u32) -> Duration {
        if consecutive == 0 && within_window < CALM_WINDOW_FAILURES {
            self.short
        } else if consecutive < BUSY_CONSECUTIVE_FAILURES && within_window < BUSY_WINDOW_FAILURES {
            self.medium
        } else {
            self.long
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    generation: u64,
    consecutive_failures: u32,
    failures_within_hour: u32,
}

impl ConnectionState {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn failures_within_hour(&self) -> u32 {
        self.failures_within_hour
    }

    pub fn on_connected(&mut self) -> u64 {
        self.generation += 1;
        self.consecutive_failures = 0;
        self.generation
    }

    /// Clears the windowed counter only if no reconnect happened since
    /// `generation` was issued.
    pub fn hourly_reset(&mut self, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        self.failures_within_hour = 0;
        true
    }

    pub fn record_reconnect(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.failures_within_hour = self.failures_within_hour.saturating_add(1);
    }

    pub fn reconnect_wait(&self, policy: &ReconnectPolicy) -> Duration {
        policy.wait_for(self.consecutive_failures, self.failures_within_hour)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.unit.saturating_mul(attempt.saturating_pow(3))
    }
}
