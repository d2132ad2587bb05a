//! cmdrig: subprocess engine for CLI test harnesses.
//!
//! Launches real binaries as children of a test process, feeds stdin
//! from ordered sources, captures stdout and stderr (optionally through
//! a pseudo-terminal), enforces a per-command wall-clock timeout,
//! delivers signals, and reports one structured result per command.
//!
//! ```ignore
//! let mut cmd = Command::new("printf");
//! cmd.with_args(["one"]);
//! cmd.run()?;
//! let result = cmd.wait().await?;
//! assert_eq!(result.stdout, "one");
//! ```
//!
//! Unix only: stream plumbing is built on pipes, PTYs, and signals.

// Error documentation is deferred - the errors are self-explanatory from types
#![allow(clippy::missing_errors_doc)]

pub mod command;
mod env;
pub mod error;
pub mod log;
pub mod pipes;
pub mod platform;
pub mod pty;

pub use command::{Command, DEFAULT_TIMEOUT, ExecResult};
pub use error::{ExecError, StartError};
pub use log::{Logger, TestReporter};
pub use pipes::{Feeder, PipeError};
pub use platform::CancelFn;
pub use pty::PtyError;

pub use nix::sys::signal::Signal;
pub use tokio_util::sync::CancellationToken;
