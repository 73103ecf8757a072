//! Strand: the concurrency core of an asynchronous application runtime.
//!
//! # Overview
//!
//! Strand is a user-space cooperative task scheduler: M worker OS threads run
//! N lightweight logical tasks. A task occupies its worker thread until it
//! explicitly suspends (blocks on a wait-list-backed primitive, waits idle on
//! its shard, or yields) or finishes. There is no pre-emption; a task that
//! never reaches a suspension point starves its worker.
//!
//! # Core Guarantees
//!
//! - **Race-free handoff**: a parked task is resumed exactly once, even when a
//!   wakeup races a timeout or cancellation on the same wait slot
//! - **Cooperative cancellation**: cancellation is a flag with a reason,
//!   observed only at suspension points and explicit cancellation points;
//!   code between two cancellation points is atomic with respect to it
//! - **Deadline-bounded blocking**: every blocking call accepts a [`Deadline`]
//!   and reports deadline expiry as an ordinary return value, never an abort
//! - **No hidden locking on dispatch**: the ready path is sharded per worker;
//!   idle workers sleep on their shard instead of spinning
//!
//! # Module Structure
//!
//! - [`time`]: monotonic [`Deadline`] with an unreachable sentinel
//! - [`task`]: task contexts, cancellation, the worker pool and ready queue
//! - [`sync`]: coroutine-level [`Mutex`], [`ConditionVariable`], wait lists
//! - [`util`]: lock-free intrusive stack and walkable pool
//! - [`error`]: the cancellation signal and task failure types
//!
//! # Quick Start
//!
//! ```ignore
//! use strand::{spawn, TaskProcessor, TaskProcessorConfig};
//!
//! let processor = TaskProcessor::new(TaskProcessorConfig::new().worker_threads(4));
//! let handle = spawn(&processor, |cx| async move {
//!     cx.cancellation_point()?;
//!     Ok(1 + 1)
//! });
//! assert_eq!(handle.get_blocking(), Ok(2));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod error;
pub mod sync;
pub mod task;
pub mod test_utils;
pub mod time;
pub mod util;

pub use error::{Cancelled, TaskError};
pub use sync::{ConditionVariable, CvStatus, Mutex, MutexGuard, WaitList, WaitListLight};
pub use task::{
    spawn, spawn_with_deadline, CancelReason, CancellationBlocker, TaskCx, TaskHandle, TaskId,
    TaskProcessor, TaskProcessorConfig,
};
pub use time::Deadline;
pub use util::{IntrusiveStack, IntrusiveWalkablePool};
