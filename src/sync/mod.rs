//! Task-level synchronization primitives.
//!
//! All of these suspend the calling *task*, not its worker thread, and every
//! blocking entry point takes the caller's [`TaskCx`](crate::TaskCx) plus an
//! optional [`Deadline`](crate::Deadline) bound.

mod condvar;
mod mutex;
pub(crate) mod wait_list;
mod wait_list_light;

pub use condvar::{ConditionVariable, CvStatus};
pub use mutex::{Mutex, MutexGuard};
pub use wait_list::WaitList;
pub use wait_list_light::WaitListLight;
