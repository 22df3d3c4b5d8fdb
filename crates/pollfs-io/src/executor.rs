//! Drivers that poll operations to completion
//!
//! Scheduling is cooperative and single-threaded: an operation only yields when a
//! step returns. [`await_op`] drives one operation; [`await_all`] interleaves many
//! in round-robin passes.

use crate::AsyncOperation;
use pollfs_types::AsyncStatus;
use tracing::{debug, trace};

/// What the executor does between passes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpinPolicy {
    /// Poll again immediately
    #[default]
    Busy,
    /// Yield the thread to the OS scheduler between passes
    Yield,
}

/// Counters collected while driving operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    /// Full passes over an operation set
    pub passes: u64,
    /// Individual steps performed
    pub steps: u64,
    /// Operations that finished `Completed`
    pub completed: u64,
    /// Operations that finished `Failed`
    pub failed: u64,
}

/// Poll loop with a configurable spin policy
#[derive(Debug, Default)]
pub struct Executor {
    policy: SpinPolicy,
    stats: ExecutorStats,
}

impl Executor {
    /// Create an executor with the given spin policy
    pub fn new(policy: SpinPolicy) -> Self {
        Self {
            policy,
            stats: ExecutorStats::default(),
        }
    }

    /// Spin policy in use
    pub fn policy(&self) -> SpinPolicy {
        self.policy
    }

    /// Counters so far
    pub fn stats(&self) -> ExecutorStats {
        self.stats
    }

    /// Poll one operation until it is terminal
    pub fn run(&mut self, op: &mut AsyncOperation<'_>) -> AsyncStatus {
        while op.is_pending() {
            self.stats.steps += 1;
            if op.poll_once() == AsyncStatus::Pending {
                self.pause();
            }
        }
        self.record(op.status());
        op.status()
    }

    /// Poll every operation until none is pending; returns the number of passes
    pub fn run_all(&mut self, ops: &mut [AsyncOperation<'_>]) -> usize {
        let mut passes = 0;
        loop {
            let mut pending = 0usize;
            for op in ops.iter_mut().filter(|op| op.is_pending()) {
                self.stats.steps += 1;
                match op.poll_once() {
                    AsyncStatus::Pending => pending += 1,
                    status => self.record(status),
                }
            }
            passes += 1;
            self.stats.passes += 1;
            trace!("Pass {} left {} operations pending", passes, pending);

            if pending == 0 {
                break;
            }
            self.pause();
        }
        debug!("Drove {} operations in {} passes", ops.len(), passes);
        passes
    }

    fn pause(&self) {
        if self.policy == SpinPolicy::Yield {
            std::thread::yield_now();
        }
    }

    fn record(&mut self, status: AsyncStatus) {
        match status {
            AsyncStatus::Completed => self.stats.completed += 1,
            AsyncStatus::Failed => self.stats.failed += 1,
            AsyncStatus::Pending => {}
        }
    }
}

/// Busy-poll one operation until it is terminal
pub fn await_op(op: &mut AsyncOperation<'_>) -> AsyncStatus {
    Executor::default().run(op)
}

/// Busy-poll a set of operations until none is pending; returns the number of passes
pub fn await_all(ops: &mut [AsyncOperation<'_>]) -> usize {
    Executor::default().run_all(ops)
}
