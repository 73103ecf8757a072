//! The cancellation signal and task failure types.

use crate::task::CancelReason;

/// The cancellation signal.
///
/// Returned from every suspension point of a task whose cancellation has been
/// requested and observed. Intermediate code propagates it with `?`; when it
/// reaches the task body's return, the scheduler records the task as finished
/// by cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("task was cancelled: {reason}")]
pub struct Cancelled {
    /// Why cancellation was requested.
    pub reason: CancelReason,
}

/// How a task failed, as seen through its [`TaskHandle`](crate::TaskHandle).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task finished by cancellation.
    #[error("task was cancelled: {0}")]
    Cancelled(CancelReason),
    /// The task body panicked; the payload is the panic message if it was a
    /// string, or a placeholder otherwise.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The *calling* task was cancelled while waiting for the result.
    #[error("wait for task result interrupted: {0}")]
    WaitInterrupted(CancelReason),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_reason() {
        let err = Cancelled {
            reason: CancelReason::Deadline,
        };
        assert_eq!(err.to_string(), "task was cancelled: deadline");

        let err = TaskError::Panicked("boom".into());
        assert_eq!(err.to_string(), "task panicked: boom");
    }
}
