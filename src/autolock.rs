//! Auto-lock interval and deadline bookkeeping.
//!
//! This is the pure half of the auto-lock state machine: interval values,
//! their persisted millisecond encodings, and the wall-deadline arithmetic.
//! The timer itself lives in [`crate::passcode::PasscodeManager`], which
//! drives this state from visibility events.

use tokio::time::{Duration, Instant};

/// Idle interval before the application re-locks after going to background.
///
/// Persisted as numeric milliseconds under an encrypted setting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoLockInterval {
    /// Never auto-lock
    #[default]
    None,
    /// Lock as soon as the application leaves the foreground
    Immediate,
    OneMinute,
    FiveMinutes,
    OneHour,
}

impl AutoLockInterval {
    /// Millisecond encoding used for persistence
    pub fn as_millis(self) -> u64 {
        match self {
            AutoLockInterval::None => 0,
            AutoLockInterval::Immediate => 1,
            AutoLockInterval::OneMinute => 60_000,
            AutoLockInterval::FiveMinutes => 300_000,
            AutoLockInterval::OneHour => 3_600_000,
        }
    }

    /// Decode a persisted millisecond value; unknown values are `None`
    pub fn from_millis(ms: u64) -> Option<Self> {
        match ms {
            0 => Some(AutoLockInterval::None),
            1 => Some(AutoLockInterval::Immediate),
            60_000 => Some(AutoLockInterval::OneMinute),
            300_000 => Some(AutoLockInterval::FiveMinutes),
            3_600_000 => Some(AutoLockInterval::OneHour),
            _ => Option::None,
        }
    }

    /// Timer duration for this interval; `None` when auto-lock is off
    pub fn duration(self) -> Option<Duration> {
        match self {
            AutoLockInterval::None => Option::None,
            other => Some(Duration::from_millis(other.as_millis())),
        }
    }

    /// The choices offered in the settings UI
    pub fn options() -> &'static [IntervalOption] {
        &[
            IntervalOption {
                value: AutoLockInterval::None,
                label: "Off",
            },
            IntervalOption {
                value: AutoLockInterval::Immediate,
                label: "Immediately",
            },
            IntervalOption {
                value: AutoLockInterval::OneMinute,
                label: "1m",
            },
            IntervalOption {
                value: AutoLockInterval::FiveMinutes,
                label: "5m",
            },
            IntervalOption {
                value: AutoLockInterval::OneHour,
                label: "1h",
            },
        ]
    }
}

/// An interval together with its UI label
#[derive(Debug, Clone, Copy)]
pub struct IntervalOption {
    pub value: AutoLockInterval,
    pub label: &'static str,
}

/// Wall-deadline fallback for the idle timer.
///
/// The timer alone is not enough: if the machine sleeps, timers do not fire.
/// A deadline recorded when the application goes to background lets the
/// foreground handler detect the missed lock. Intentionally never persisted;
/// losing the process loses the keys anyway, which is a stricter lock.
#[derive(Debug, Default)]
pub struct LockDeadline {
    deadline: Option<Instant>,
}

impl LockDeadline {
    /// Arm the deadline at `now` + interval. Returns the armed instant,
    /// or `None` when the interval disables auto-lock.
    pub fn arm(&mut self, now: Instant, interval: AutoLockInterval) -> Option<Instant> {
        self.deadline = interval.duration().map(|d| now + d);
        self.deadline
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Whether the deadline has passed. Boundary is inclusive: exactly at
    /// the deadline counts as expired.
    pub fn expired(&self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millisecond_encodings_roundtrip() {
        for option in AutoLockInterval::options() {
            assert_eq!(
                AutoLockInterval::from_millis(option.value.as_millis()),
                Some(option.value)
            );
        }
    }

    #[test]
    fn unknown_encoding_decodes_to_nothing() {
        assert_eq!(AutoLockInterval::from_millis(1234), Option::None);
    }

    #[test]
    fn off_interval_has_no_duration() {
        assert!(AutoLockInterval::None.duration().is_none());
        assert_eq!(
            AutoLockInterval::OneMinute.duration(),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn arming_with_off_interval_does_nothing() {
        let mut deadline = LockDeadline::default();
        assert!(deadline
            .arm(Instant::now(), AutoLockInterval::None)
            .is_none());
        assert!(!deadline.is_armed());
    }

    #[test]
    fn expiry_is_inclusive_at_the_boundary() {
        let mut deadline = LockDeadline::default();
        let now = Instant::now();
        deadline.arm(now, AutoLockInterval::OneMinute);

        assert!(!deadline.expired(now));
        assert!(!deadline.expired(now + Duration::from_secs(59)));
        assert!(deadline.expired(now + Duration::from_secs(60)));
        assert!(deadline.expired(now + Duration::from_secs(61)));
    }

    #[test]
    fn cleared_deadline_never_expires() {
        let mut deadline = LockDeadline::default();
        let now = Instant::now();
        deadline.arm(now, AutoLockInterval::Immediate);
        deadline.clear();

        assert!(!deadline.expired(now + Duration::from_secs(3600)));
    }
}
