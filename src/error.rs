//! Error taxonomy for command execution.
//!
//! Every failure mode is a distinguishable variant and carries its cause
//! as a `#[source]`, never a flattened string. Variants that may be
//! handed back more than once (sticky start failures, repeated waits)
//! keep their causes behind `Arc` so the enum stays `Clone`.

use std::io;
use std::sync::Arc;

use nix::sys::signal::Signal;
use thiserror::Error;

use crate::pipes::PipeError;

/// Why `run` could not start the child.
#[derive(Debug, Error)]
pub enum StartError {
    /// Pipe or PTY acquisition failed before the child existed.
    #[error("failed creating pipes: {0}")]
    FailedCreating(#[source] PipeError),

    /// The OS refused to spawn the child (missing binary, permissions).
    #[error("failed spawning process: {0}")]
    Spawn(#[source] io::Error),
}

/// Errors produced over a command's lifecycle.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The child could not be started. Sticky: once recorded at run
    /// time, every later `wait` returns the same error.
    #[error("failed starting command")]
    FailedStarting(#[source] Arc<StartError>),

    /// A drain worker could not read stdout or stderr.
    #[error("failed reading from child")]
    FailedReading(#[source] Arc<io::Error>),

    /// The stdin worker could not feed the child.
    #[error("failed writing to child")]
    FailedWriting(#[source] Arc<io::Error>),

    /// The wall-clock deadline elapsed before the child exited.
    /// Takes precedence over signal and exit-code classification.
    #[error("command timed out")]
    Timeout,

    /// The caller's cancellation token fired before the child exited.
    #[error("command execution cancelled")]
    Cancelled,

    /// The child was terminated by an unhandled signal.
    #[error("command terminated by signal {0}")]
    Signaled(Signal),

    /// The child exited with a non-zero code.
    #[error("command exited with code {0}")]
    ExecutionFailed(i32),

    /// Signal delivery failed (process gone, or never started running).
    #[error("failed sending signal")]
    FailedSendingSignal(#[source] Arc<io::Error>),

    /// `run` was called on a command that is already running.
    #[error("command already started")]
    AlreadyStarted,

    /// `run` or `wait` was called after the result was produced.
    #[error("command already finished")]
    AlreadyFinished,

    /// `wait` or `signal` was called before `run`.
    #[error("command not started")]
    NotStarted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn start_failure_keeps_cause_chain() {
        let cause = io::Error::new(io::ErrorKind::NotFound, "no such binary");
        let err = ExecError::FailedStarting(Arc::new(StartError::Spawn(cause)));
        let source = err.source().expect("source");
        assert!(source.to_string().contains("no such binary"));
    }

    #[test]
    fn sticky_clone_shares_cause() {
        let err = ExecError::FailedStarting(Arc::new(StartError::Spawn(io::Error::other("boom"))));
        let again = err.clone();
        match (&err, &again) {
            (ExecError::FailedStarting(a), ExecError::FailedStarting(b)) => {
                assert!(Arc::ptr_eq(a, b));
            }
            _ => panic!("clone changed variant"),
        }
    }
}
