//! Pollable operation handle
//!
//! An [`AsyncOperation`] owns the private state of one engine run. Each call to
//! [`AsyncOperation::poll_once`] advances that state by exactly one stage. The state
//! is dropped the first time the operation becomes terminal, which releases every
//! resource the engine acquired.

use pollfs_types::{
    AsyncStatus, Error, ErrorResult, FileMode, IoStep, OperationId, Progress, Result,
};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{debug, trace, warn};

/// Handle to an in-progress file operation
pub struct AsyncOperation<'a> {
    id: OperationId,
    mode: FileMode,
    state: Option<Box<dyn IoStep + 'a>>,
    status: AsyncStatus,
    error: Option<Error>,
    steps: u64,
}

impl<'a> AsyncOperation<'a> {
    /// Wrap engine state in a pending operation
    pub fn new<S: IoStep + 'a>(mode: FileMode, state: S) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            mode,
            state: Some(Box::new(state)),
            status: AsyncStatus::Pending,
            error: None,
            steps: 0,
        }
    }

    /// An operation that is already complete
    pub fn completed(mode: FileMode) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            mode,
            state: None,
            status: AsyncStatus::Completed,
            error: None,
            steps: 0,
        }
    }

    /// An operation that failed before any resource was touched
    pub fn failed(mode: FileMode, error: Error) -> Self {
        debug!("Operation rejected before start: {}", error);
        Self {
            id: uuid::Uuid::new_v4(),
            mode,
            state: None,
            status: AsyncStatus::Failed,
            error: Some(error),
            steps: 0,
        }
    }

    /// Validate, short-circuit empty transfers, otherwise build the engine state
    ///
    /// Validation runs first so a malformed request fails even when it asks for
    /// zero bytes.
    pub fn start<S, F>(mode: FileMode, validation: Result<()>, byte_count: u64, build: F) -> Self
    where
        S: IoStep + 'a,
        F: FnOnce() -> S,
    {
        match validation {
            Err(error) => Self::failed(mode, error),
            Ok(()) if byte_count == 0 => Self::completed(mode),
            Ok(()) => Self::new(mode, build()),
        }
    }

    /// Unique id of this operation
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Strategy serving this operation
    pub fn mode(&self) -> FileMode {
        self.mode
    }

    /// Current status
    pub fn status(&self) -> AsyncStatus {
        self.status
    }

    /// Whether more steps remain
    pub fn is_pending(&self) -> bool {
        self.status == AsyncStatus::Pending
    }

    /// Error recorded by the failing step, if any
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Flattened error code and message; code 0 unless the operation failed
    pub fn error_result(&self) -> ErrorResult {
        self.error.as_ref().map_or_else(ErrorResult::none, ErrorResult::from)
    }

    /// Number of steps performed so far
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Stage the next step will run, while pending
    pub fn stage(&self) -> Option<&'static str> {
        self.state.as_ref().map(|state| state.stage())
    }

    /// Advance the operation by one stage and return the resulting status
    ///
    /// Polling a terminal operation is a no-op that returns the stored status.
    pub fn poll_once(&mut self) -> AsyncStatus {
        let Some(state) = self.state.as_mut() else {
            if self.status == AsyncStatus::Pending {
                // Only reachable if the state vanished without a terminal status
                self.status = AsyncStatus::Failed;
            } else {
                warn!("Operation {} polled after reaching {:?}", self.id, self.status);
            }
            return self.status;
        };

        self.steps += 1;
        let stage = state.stage();
        match state.step() {
            Ok(Progress::Pending) => {
                trace!("Operation {} finished stage {}", self.id, stage);
            }
            Ok(Progress::Done) => {
                debug!(
                    "Operation {} ({}) completed after {} steps",
                    self.id, self.mode, self.steps
                );
                self.finish(AsyncStatus::Completed, None);
            }
            Err(error) => {
                debug!(
                    "Operation {} ({}) failed in stage {}: {}",
                    self.id, self.mode, stage, error
                );
                self.finish(AsyncStatus::Failed, Some(error));
            }
        }
        self.status
    }

    /// Abort a pending operation, releasing its resources
    ///
    /// Returns `false` if the operation was already terminal.
    pub fn cancel(&mut self) -> bool {
        if self.status != AsyncStatus::Pending {
            return false;
        }
        debug!("Operation {} cancelled", self.id);
        self.finish(AsyncStatus::Failed, Some(Error::Cancelled));
        true
    }

    /// Outcome of a terminal operation
    pub fn result(&self) -> Result<()> {
        match self.status {
            AsyncStatus::Completed => Ok(()),
            AsyncStatus::Failed => Err(self
                .error
                .clone()
                .unwrap_or_else(|| Error::ring("operation failed without an error"))),
            AsyncStatus::Pending => Err(Error::invalid_argument(
                "operation is still pending",
            )),
        }
    }

    fn finish(&mut self, status: AsyncStatus, error: Option<Error>) {
        // Dropping the state runs the engine's disposer exactly once
        self.state = None;
        self.status = status;
        self.error = error;
    }
}

impl fmt::Debug for AsyncOperation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncOperation")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("status", &self.status)
            .field("stage", &self.stage())
            .field("error", &self.error)
            .field("steps", &self.steps)
            .finish()
    }
}

impl Future for AsyncOperation<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.poll_once() == AsyncStatus::Pending {
            cx.waker().wake_by_ref();
            Poll::Pending
        } else {
            Poll::Ready(this.result())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Countdown {
        remaining: u32,
        fail_at: Option<u32>,
        drops: Arc<AtomicUsize>,
    }

    impl IoStep for Countdown {
        fn step(&mut self) -> Result<Progress> {
            if Some(self.remaining) == self.fail_at {
                return Err(Error::invalid_argument("boom"));
            }
            self.remaining -= 1;
            Ok(if self.remaining == 0 {
                Progress::Done
            } else {
                Progress::Pending
            })
        }

        fn stage(&self) -> &'static str {
            "Countdown"
        }
    }

    impl Drop for Countdown {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn countdown(remaining: u32, fail_at: Option<u32>) -> (AsyncOperation<'static>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let state = Countdown {
            remaining,
            fail_at,
            drops: Arc::clone(&drops),
        };
        (AsyncOperation::new(FileMode::Standard, state), drops)
    }

    #[test]
    fn test_steps_until_completed() {
        let (mut op, drops) = countdown(3, None);
        assert_eq!(op.poll_once(), AsyncStatus::Pending);
        assert_eq!(op.poll_once(), AsyncStatus::Pending);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(op.poll_once(), AsyncStatus::Completed);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(op.steps(), 3);
        assert!(!op.error_result().is_error());
        assert!(op.result().is_ok());
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let (mut op, drops) = countdown(1, None);
        assert_eq!(op.poll_once(), AsyncStatus::Completed);
        assert_eq!(op.poll_once(), AsyncStatus::Completed);
        assert_eq!(op.steps(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failure_releases_state() {
        let (mut op, drops) = countdown(3, Some(2));
        assert_eq!(op.poll_once(), AsyncStatus::Pending);
        assert_eq!(op.poll_once(), AsyncStatus::Failed);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(matches!(op.error(), Some(Error::InvalidArgument { .. })));
        assert_eq!(op.error_result().code, Error::invalid_argument("").code());
        assert!(op.stage().is_none());
    }

    #[test]
    fn test_cancel_pending() {
        let (mut op, drops) = countdown(5, None);
        op.poll_once();
        assert!(op.cancel());
        assert_eq!(op.status(), AsyncStatus::Failed);
        assert_eq!(op.error(), Some(&Error::Cancelled));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert!(!op.cancel());
    }

    #[test]
    fn test_drop_while_pending_releases_state() {
        let (mut op, drops) = countdown(5, None);
        op.poll_once();
        drop(op);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_short_circuits() {
        let op = AsyncOperation::start(FileMode::Mmap, Ok(()), 0, || Countdown {
            remaining: 1,
            fail_at: None,
            drops: Arc::new(AtomicUsize::new(0)),
        });
        assert_eq!(op.status(), AsyncStatus::Completed);

        let op = AsyncOperation::start(
            FileMode::Mmap,
            Err(Error::null_argument("path")),
            0,
            || Countdown {
                remaining: 1,
                fail_at: None,
                drops: Arc::new(AtomicUsize::new(0)),
            },
        );
        assert_eq!(op.status(), AsyncStatus::Failed);
        assert_eq!(op.error_result().code, 1);
    }

    #[tokio::test]
    async fn test_await_as_future() {
        let (op, drops) = countdown(4, None);
        op.await.unwrap();
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_future_reports_failure() {
        let (op, _drops) = countdown(4, Some(1));
        let error = op.await.unwrap_err();
        assert!(matches!(error, Error::InvalidArgument { .. }));
    }
}
