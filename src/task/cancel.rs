//! Cancellation reasons and the scoped cancellation gate.

use std::fmt;

use crate::task::cx::TaskCx;

/// Why a task's cancellation was requested.
///
/// The first reason to arrive wins; later requests keep the original reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    /// Explicit [`TaskHandle::request_cancel`](crate::TaskHandle::request_cancel).
    UserRequest,
    /// The task's own deadline expired.
    Deadline,
    /// The processor refused the task under load.
    Overload,
    /// The task's handle was dropped without detaching.
    Abandoned,
    /// The processor was shutting down when the task was spawned.
    Shutdown,
}

impl CancelReason {
    /// Zero is reserved for "no cancellation requested".
    pub(crate) const fn as_u8(self) -> u8 {
        match self {
            Self::UserRequest => 1,
            Self::Deadline => 2,
            Self::Overload => 3,
            Self::Abandoned => 4,
            Self::Shutdown => 5,
        }
    }

    pub(crate) const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::UserRequest),
            2 => Some(Self::Deadline),
            3 => Some(Self::Overload),
            4 => Some(Self::Abandoned),
            5 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::UserRequest => "user request",
            Self::Deadline => "deadline",
            Self::Overload => "overload",
            Self::Abandoned => "abandoned",
            Self::Shutdown => "shutdown",
        })
    }
}

/// Scoped guard making the current task non-cancellable.
///
/// While alive, pending and new cancellation requests are recorded but not
/// delivered: `should_cancel` answers false and suspension points do not
/// resolve to the cancellation wakeup. Dropping the guard restores the prior
/// gate value, so blockers nest correctly and unwind-safely.
///
/// ```ignore
/// let _blocker = CancellationBlocker::new(&cx);
/// // cleanup that must not be interrupted
/// ```
#[must_use = "the gate is restored when the blocker is dropped"]
pub struct CancellationBlocker<'a> {
    cx: &'a TaskCx,
    prev: bool,
}

impl<'a> CancellationBlocker<'a> {
    /// Blocks cancellation delivery for the current task until drop.
    pub fn new(cx: &'a TaskCx) -> Self {
        let prev = cx.context().set_cancellable(false);
        Self { cx, prev }
    }
}

impl Drop for CancellationBlocker<'_> {
    fn drop(&mut self) {
        self.cx.context().set_cancellable(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_round_trips_through_atomic_encoding() {
        for reason in [
            CancelReason::UserRequest,
            CancelReason::Deadline,
            CancelReason::Overload,
            CancelReason::Abandoned,
            CancelReason::Shutdown,
        ] {
            assert_eq!(CancelReason::from_u8(reason.as_u8()), Some(reason));
        }
        assert_eq!(CancelReason::from_u8(0), None);
    }

    #[test]
    fn blocker_nests_and_restores() {
        let cx = TaskCx::for_testing();
        assert!(cx.context().is_cancellable());
        {
            let _outer = CancellationBlocker::new(&cx);
            assert!(!cx.context().is_cancellable());
            {
                let _inner = CancellationBlocker::new(&cx);
                assert!(!cx.context().is_cancellable());
            }
            assert!(!cx.context().is_cancellable());
        }
        assert!(cx.context().is_cancellable());
    }

    #[test]
    fn blocked_cancellation_is_not_observed() {
        let cx = TaskCx::for_testing();
        {
            let _blocker = CancellationBlocker::new(&cx);
            cx.context().request_cancel(CancelReason::UserRequest);
            assert!(!cx.should_cancel());
        }
        assert!(cx.should_cancel());
        assert_eq!(cx.cancellation_reason(), Some(CancelReason::UserRequest));
    }
}
