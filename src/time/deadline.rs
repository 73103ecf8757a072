//! Deadline: a monotonic time point with an unreachable sentinel.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as MemOrdering};
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime};

/// Anchor for the coarse clock; all cached readings are nanoseconds past it.
fn clock_anchor() -> Instant {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    *ANCHOR.get_or_init(Instant::now)
}

/// Last coarse reading, nanoseconds past the anchor. Zero means "never read".
static COARSE_NOW_NANOS: AtomicU64 = AtomicU64::new(0);

/// Refreshes the coarse clock from the real monotonic clock.
///
/// Called from the worker and timer loops. The cached value only ever lags the
/// real clock, which is what keeps [`Deadline::is_surely_reached_approx`] free
/// of false positives.
pub(crate) fn refresh_coarse_now() {
    let nanos = Instant::now()
        .saturating_duration_since(clock_anchor())
        .as_nanos();
    COARSE_NOW_NANOS.store(u64::try_from(nanos).unwrap_or(u64::MAX), MemOrdering::Relaxed);
}

/// Returns the last coarse reading, or `None` if nobody has refreshed it yet.
fn coarse_now() -> Option<Instant> {
    match COARSE_NOW_NANOS.load(MemOrdering::Relaxed) {
        0 => None,
        nanos => clock_anchor().checked_add(Duration::from_nanos(nanos)),
    }
}

/// An immutable monotonic time point bounding a blocking call.
///
/// The default value is the *unreachable* sentinel: a deadline that never
/// arrives and orders greater than every reachable one. Blocking calls treat
/// it as "wait forever".
///
/// A `Deadline` is a pure value; none of its queries have side effects.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use strand::Deadline;
///
/// let never = Deadline::unreachable();
/// let soon = Deadline::from_duration(Duration::from_millis(50));
/// assert!(never > soon);
/// assert!(!never.is_reachable());
/// assert!(soon.is_reachable());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Deadline {
    /// `None` is the unreachable sentinel.
    when: Option<Instant>,
}

impl Deadline {
    /// A deadline that never arrives. Same as `Deadline::default()`.
    #[must_use]
    pub const fn unreachable() -> Self {
        Self { when: None }
    }

    /// A deadline that has already passed.
    #[must_use]
    pub fn passed() -> Self {
        Self {
            when: Some(Instant::now()),
        }
    }

    /// A deadline `duration` from now.
    ///
    /// A magnitude that overflows the clock representation when added to "now"
    /// yields an unreachable deadline and a non-fatal diagnostic.
    #[must_use]
    pub fn from_duration(duration: Duration) -> Self {
        match Instant::now().checked_add(duration) {
            Some(when) => Self { when: Some(when) },
            None => {
                tracing::warn!(
                    duration_secs = duration.as_secs(),
                    "deadline duration overflows the clock, treating as unreachable"
                );
                Self::unreachable()
            }
        }
    }

    /// A deadline a signed number of nanoseconds from now.
    ///
    /// A negative offset produces a deadline that has already passed. This is
    /// the signed-duration constructor: `std::time::Duration` is unsigned, so
    /// "negative duration means already elapsed" is carried by the sign here.
    #[must_use]
    pub fn from_signed_nanos(nanos: i64) -> Self {
        if nanos >= 0 {
            #[allow(clippy::cast_sign_loss)]
            Self::from_duration(Duration::from_nanos(nanos as u64))
        } else {
            let behind = Duration::from_nanos(nanos.unsigned_abs());
            match Instant::now().checked_sub(behind) {
                Some(when) => Self { when: Some(when) },
                None => Self::passed(),
            }
        }
    }

    /// A deadline at an exact monotonic time point.
    #[must_use]
    pub const fn from_time_point(when: Instant) -> Self {
        Self { when: Some(when) }
    }

    /// A deadline from a wall-clock time point.
    ///
    /// The foreign clock is converted via duration arithmetic against "now" on
    /// both clocks, which accepts some inaccuracy.
    #[must_use]
    pub fn from_system_time(when: SystemTime) -> Self {
        match when.duration_since(SystemTime::now()) {
            Ok(ahead) => Self::from_duration(ahead),
            Err(behind) => match Instant::now().checked_sub(behind.duration()) {
                Some(when) => Self { when: Some(when) },
                None => Self::passed(),
            },
        }
    }

    /// Returns true unless this is the unreachable sentinel.
    #[must_use]
    pub const fn is_reachable(&self) -> bool {
        self.when.is_some()
    }

    /// Returns true if the deadline has arrived. Exact; reads the real clock.
    #[must_use]
    pub fn is_reached(&self) -> bool {
        match self.when {
            Some(when) => when <= Instant::now(),
            None => false,
        }
    }

    /// Approximate [`Deadline::is_reached`] against the coarse cached clock.
    ///
    /// May answer `false` for a deadline that has in fact been reached (the
    /// cache lags), but never answers `true` for one that has not. Intended
    /// for hot paths that cannot afford a clock read.
    #[must_use]
    pub fn is_surely_reached_approx(&self) -> bool {
        match (self.when, coarse_now()) {
            (Some(when), Some(now)) => when <= now,
            _ => false,
        }
    }

    /// Time remaining until the deadline; zero if reached, `Duration::MAX`
    /// if unreachable.
    #[must_use]
    pub fn time_left(&self) -> Duration {
        match self.when {
            Some(when) => when.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// [`Deadline::time_left`] against the coarse cached clock.
    ///
    /// May overestimate the remaining time, never underestimates relative to
    /// the moment the cache was refreshed.
    #[must_use]
    pub fn time_left_approx(&self) -> Duration {
        match self.when {
            Some(when) => {
                let now = coarse_now().unwrap_or_else(Instant::now);
                when.saturating_duration_since(now)
            }
            None => Duration::MAX,
        }
    }

}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    /// Unreachable orders greater than any reachable deadline.
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.when, other.when) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => a.cmp(&b),
        }
    }
}
