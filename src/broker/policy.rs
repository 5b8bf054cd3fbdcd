use std::time::Duration;

use tokio::time::Instant;

/// Growing delay between broker reachability probes at startup.
///
/// Starts at 100ms and grows by 20% per attempt; gives up once the next
/// delay would pass the cap.
#[derive(Debug, Clone)]
pub struct StartupBackoff {
    delay: Duration,
    cap: Duration,
    waited: Duration,
}

impl StartupBackoff {
    pub const INITIAL: Duration = Duration::from_millis(100);
    pub const CAP: Duration = Duration::from_secs(3600);

    pub fn new() -> Self {
        Self::with_limits(Self::INITIAL, Self::CAP)
    }

    pub fn with_limits(initial: Duration, cap: Duration) -> Self {
        Self {
            delay: initial,
            cap,
            waited: Duration::ZERO,
        }
    }

    /// Returns the delay before the next probe, or `None` when out of patience.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.delay > self.cap {
            return None;
        }
        let current = self.delay;
        self.waited += current;
        self.delay = current.mul_f64(1.2);
        Some(current)
    }

    pub fn total_waited(&self) -> Duration {
        self.waited
    }
}

impl Default for StartupBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Internal reconnect delay of the network loop: 1s doubling up to 6 minutes.
#[derive(Debug, Clone)]
pub struct LinkBackoff {
    attempt: u32,
}

impl LinkBackoff {
    const MIN: Duration = Duration::from_secs(1);
    const MAX: Duration = Duration::from_secs(360);

    pub fn new() -> Self {
        Self { attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = Self::MIN
            .saturating_mul(1u32 << self.attempt.min(16))
            .min(Self::MAX);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for LinkBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Decides when a connection that stays down gets an explicit reconnect.
///
/// The timer starts when the connection is lost (or at construction) and
/// restarts after each attempt, so attempts are at least `threshold` apart.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    threshold: Duration,
    down_since: Option<Instant>,
}

impl ReconnectPolicy {
    pub const THRESHOLD: Duration = Duration::from_secs(60);

    pub fn new(now: Instant) -> Self {
        Self::with_threshold(Self::THRESHOLD, now)
    }

    pub fn with_threshold(threshold: Duration, now: Instant) -> Self {
        Self {
            threshold,
            down_since: Some(now),
        }
    }

    pub fn on_connected(&mut self) {
        self.down_since = None;
    }

    /// Starts the timer unless it is already running.
    pub fn on_disconnected(&mut self, now: Instant) {
        self.down_since.get_or_insert(now);
    }

    pub fn disconnected_for(&self, now: Instant) -> Option<Duration> {
        self.down_since.map(|since| now.saturating_duration_since(since))
    }

    /// True when an attempt is due; the timer is restarted in that case.
    pub fn should_reconnect(&mut self, now: Instant) -> bool {
        match self.disconnected_for(now) {
            Some(elapsed) if elapsed >= self.threshold => {
                self.down_since = Some(now);
                true
            }
            _ => false,
        }
    }
}
