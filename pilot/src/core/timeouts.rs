//! Run-time limits for launched commands.

use std::time::Duration;

/// Values below this are taken to be seconds rather than milliseconds.
const SECONDS_THRESHOLD: i64 = 1000;

/// Minimum and maximum wall-clock time a command may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimeLimits {
    /// Output is not evaluated as finished before this elapses.
    pub min: Duration,
    /// The process is force-terminated once this elapses.
    pub max: Duration,
}

impl RunTimeLimits {
    pub fn from_millis(min_ms: u64, max_ms: u64) -> Self {
        Self {
            min: Duration::from_millis(min_ms),
            max: Duration::from_millis(max_ms),
        }
    }

    /// Resolve a requested timeout into the effective run time.
    ///
    /// Missing or negative requests use `max`. Small values are seconds.
    /// The result always lies in `[min, max]`.
    pub fn normalize(&self, requested: Option<i64>) -> Duration {
        let requested = match requested {
            Some(value) if value >= 0 => value,
            _ => return self.max,
        };
        let millis = if requested < SECONDS_THRESHOLD {
            requested.saturating_mul(1000)
        } else {
            requested
        };
        let millis = u64::try_from(millis).unwrap_or(u64::MAX);
        Duration::from_millis(millis).clamp(self.min, self.max.max(self.min))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RunTimeLimits {
        RunTimeLimits::from_millis(2000, 60_000)
    }

    #[test]
    fn missing_or_negative_uses_max() {
        assert_eq!(limits().normalize(None), Duration::from_secs(60));
        assert_eq!(limits().normalize(Some(-5)), Duration::from_secs(60));
    }

    /// Verifies small values are seconds, large ones milliseconds, both clamped.
    #[test]
    fn values_are_scaled_then_clamped() {
        assert_eq!(limits().normalize(Some(30)), Duration::from_secs(30));
        assert_eq!(limits().normalize(Some(1)), Duration::from_secs(2));
        assert_eq!(limits().normalize(Some(5000)), Duration::from_secs(5));
        assert_eq!(limits().normalize(Some(900_000)), Duration::from_secs(60));
        assert_eq!(limits().normalize(Some(0)), Duration::from_secs(2));
    }
}
