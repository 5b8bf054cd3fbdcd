use std::time::Duration;

use tokio::time::Instant;

const HOUR: Duration = Duration::from_secs(3600);

/// Admits at most `max_per_hour` events per hour, spread evenly.
///
/// The first event is always admitted; after that an event is admitted only
/// when `3600s / max_per_hour` has passed since the last admitted one.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    interval: Duration,
    last_admitted: Option<Instant>,
}

impl RateLimiter {
    pub fn per_hour(max_per_hour: u32) -> Self {
        Self {
            interval: HOUR / max_per_hour.max(1),
            last_admitted: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_admitted {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_admitted = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_from_rate() {
        assert_eq!(RateLimiter::per_hour(60).interval(), Duration::from_secs(60));
        assert_eq!(RateLimiter::per_hour(3600).interval(), Duration::from_secs(1));
        assert_eq!(RateLimiter::per_hour(1).interval(), HOUR);
        assert_eq!(RateLimiter::per_hour(720).interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_first_event_admitted_then_spaced() {
        let start = Instant::now();
        let mut limiter = RateLimiter::per_hour(60);
        assert!(limiter.admit(start));
        assert!(!limiter.admit(start + Duration::from_secs(1)));
        assert!(!limiter.admit(start + Duration::from_millis(59_999)));
        assert!(limiter.admit(start + Duration::from_secs(60)));
        assert!(!limiter.admit(start + Duration::from_secs(61)));
    }

    #[test]
    fn test_admissions_bounded_over_window() {
        // Telegrams every second against several ceilings
        for rate in [1u32, 12, 60, 720, 1800] {
            let start = Instant::now();
            let mut limiter = RateLimiter::per_hour(rate);
            let window = 2 * 3600u64;
            let admitted = (0..window)
                .filter(|s| limiter.admit(start + Duration::from_secs(*s)))
                .count() as u64;
            let bound = (window * rate as u64).div_ceil(3600) + 1;
            assert!(admitted <= bound, "rate {rate}: {admitted} > {bound}");
            assert!(admitted >= bound - 2, "rate {rate}: only {admitted}");
        }
    }

    #[test]
    fn test_unlimited_when_rate_matches_meter() {
        let start = Instant::now();
        let mut limiter = RateLimiter::per_hour(3600);
        for s in 0..10 {
            assert!(limiter.admit(start + Duration::from_secs(s)));
        }
    }
}
