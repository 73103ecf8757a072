//! Monotonic deadlines for blocking calls.
//!
//! - [`Deadline`]: an immutable monotonic time point with an unreachable
//!   sentinel; accepted as an optional bound by every blocking call
//! - a process-wide coarse clock backing the approximate deadline queries on
//!   hot paths, refreshed by the worker and timer loops

mod deadline;

pub use deadline::Deadline;
pub(crate) use deadline::refresh_coarse_now;
