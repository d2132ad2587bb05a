//! Command execution: configuration, lifecycle, result classification.
//!
//! A [`Command`] is configured through builder methods, started with
//! [`Command::run`], and reaped with [`Command::wait`], which tears the
//! stream plumbing down in order and produces exactly one
//! [`ExecResult`]. Misuse (double run, wait before run, anything after
//! the result exists) is reported through the diagnostic variants of
//! [`ExecError`] rather than panicking.
//!
//! `run`, `wait`, and `signal` must be called from within a Tokio
//! runtime; the background I/O workers and the child watcher live on
//! it.

use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncRead;
use tokio::process::Child;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::env;
use crate::error::{ExecError, StartError};
use crate::log::Logger;
use crate::pipes::{Feeder, StdPipes, WorkerError};
use crate::platform::{self, CancelFn};

/// Wall-clock bound applied when a command configures none.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// The outcome of one executed command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Everything the child wrote to stdout. With a merged PTY this
    /// also contains the stderr bytes, in arrival order.
    pub stdout: String,
    /// Everything the child wrote to stderr; empty with a merged PTY.
    pub stderr: String,
    /// The child's exit code, or `-1` when no meaningful code exists
    /// (startup failure, signal termination, deadline).
    pub exit_code: i32,
    /// The signal that terminated the child, if one did.
    pub signal: Option<Signal>,
    /// Wall-clock time from `run` to `wait` completion.
    pub duration: Duration,
    /// The environment the child was actually given, as `KEY=VAL`.
    pub environ: Vec<String>,
}

/// Live state of a started command.
struct Execution {
    child: Child,
    pipes: Option<StdPipes>,
    deadline: Instant,
    started_at: Instant,
    environ: Vec<String>,
    logger: Logger,
}

/// An external command to execute under the harness.
pub struct Command {
    binary: String,
    prepend_args: Vec<String>,
    args: Vec<String>,
    wrap_binary: Option<String>,
    wrap_args: Vec<String>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    env_blacklist: Vec<String>,
    env_whitelist: Vec<String>,
    feeders: Vec<Feeder>,
    pty_stdin: bool,
    pty_stdout: bool,
    pty_stderr: bool,
    logger: Logger,
    cancel: Option<CancellationToken>,
    cancel_hook: Option<CancelFn>,

    execution: Option<Execution>,
    result: Option<ExecResult>,
    sticky: Option<ExecError>,
}

impl Command {
    /// Create a command for the given binary name or path.
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            prepend_args: Vec::new(),
            args: Vec::new(),
            wrap_binary: None,
            wrap_args: Vec::new(),
            timeout: Duration::ZERO,
            working_dir: None,
            env: Vec::new(),
            env_blacklist: Vec::new(),
            env_whitelist: Vec::new(),
            feeders: Vec::new(),
            pty_stdin: false,
            pty_stdout: false,
            pty_stderr: false,
            logger: Logger::null(),
            cancel: None,
            cancel_hook: None,
            execution: None,
            result: None,
            sticky: None,
        }
    }

    /// Configuration is frozen once `run` has been called (successfully
    /// or not); later builder calls silently do nothing.
    fn frozen(&self) -> bool {
        self.execution.is_some() || self.result.is_some() || self.sticky.is_some()
    }

    /// Append arguments.
    pub fn with_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.frozen() {
            self.args.extend(args.into_iter().map(Into::into));
        }
        self
    }

    /// Append arguments placed before [`Self::with_args`] arguments.
    pub fn with_prepend_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.frozen() {
            self.prepend_args.extend(args.into_iter().map(Into::into));
        }
        self
    }

    /// Wrap the invocation: `wrapper wrap_args binary args`.
    pub fn with_wrapper<I, S>(&mut self, binary: impl Into<String>, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.frozen() {
            self.wrap_binary = Some(binary.into());
            self.wrap_args = args.into_iter().map(Into::into).collect();
        }
        self
    }

    /// Bound the wall-clock lifetime. Zero means "use the default".
    pub fn with_timeout(&mut self, timeout: Duration) -> &mut Self {
        if !self.frozen() {
            self.timeout = timeout;
        }
        self
    }

    /// Set the child's working directory.
    pub fn with_working_dir(&mut self, dir: impl Into<PathBuf>) -> &mut Self {
        if !self.frozen() {
            self.working_dir = Some(dir.into());
        }
        self
    }

    /// Inject an environment pair, bypassing the filters.
    pub fn with_env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if !self.frozen() {
            self.env.push((key.into(), value.into()));
        }
        self
    }

    /// Add inherited-environment blacklist needles.
    pub fn with_env_blacklist<I, S>(&mut self, needles: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.frozen() {
            self.env_blacklist
                .extend(needles.into_iter().map(Into::into));
        }
        self
    }

    /// Add inherited-environment whitelist needles; a non-empty
    /// whitelist overrides the blacklist for entries it matches.
    pub fn with_env_whitelist<I, S>(&mut self, needles: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if !self.frozen() {
            self.env_whitelist
                .extend(needles.into_iter().map(Into::into));
        }
        self
    }

    /// Attach a pseudo-terminal to any subset of the three streams.
    /// When stdout and stderr both request one, they share it and the
    /// merged output lands in `stdout`.
    pub fn with_pty(&mut self, stdin: bool, stdout: bool, stderr: bool) -> &mut Self {
        if !self.frozen() {
            self.pty_stdin = stdin;
            self.pty_stdout = stdout;
            self.pty_stderr = stderr;
        }
        self
    }

    /// Add a stdin source. Feeders are drained into the child strictly
    /// in insertion order, each invoked only after the previous one has
    /// been copied to completion.
    pub fn with_feeder<F, R>(&mut self, feeder: F) -> &mut Self
    where
        F: Fn() -> R + Send + Sync + 'static,
        R: AsyncRead + Send + 'static,
    {
        if !self.frozen() {
            self.feeders.push(Arc::new(move || {
                Box::pin(feeder()) as Pin<Box<dyn AsyncRead + Send>>
            }));
        }
        self
    }

    /// Add a stdin source from in-memory bytes; shorthand for a feeder
    /// returning a reader over them.
    pub fn feed(&mut self, data: impl Into<Vec<u8>>) -> &mut Self {
        let data = data.into();
        self.with_feeder(move || std::io::Cursor::new(data.clone()))
    }

    /// Attach a debug logger; engine traces for this command go
    /// through it.
    pub fn with_logger(&mut self, logger: Logger) -> &mut Self {
        if !self.frozen() {
            self.logger = logger;
        }
        self
    }

    /// Attach a caller-owned cancellation token; cancelling it while
    /// the command runs terminates the child and classifies the wait
    /// as cancelled.
    pub fn with_cancellation_token(&mut self, token: CancellationToken) -> &mut Self {
        if !self.frozen() {
            self.cancel = Some(token);
        }
        self
    }

    /// Replace the default terminate-the-process-group cancellation
    /// with a custom routine. The routine must actually terminate the
    /// child; `wait` blocks on the reap.
    pub fn with_cancel_hook(&mut self, hook: CancelFn) -> &mut Self {
        if !self.frozen() {
            self.cancel_hook = Some(hook);
        }
        self
    }

    /// The child's OS process id while it is running.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.execution.as_ref().and_then(|exec| exec.child.id())
    }

    /// The stored result, available after `wait` or a failed `run`.
    #[must_use]
    pub fn result(&self) -> Option<&ExecResult> {
        self.result.as_ref()
    }

    /// Start the child in the background.
    ///
    /// Returns once the child is running; stream capture and the
    /// deadline proceed concurrently until [`Self::wait`]. A command
    /// that fails to start is permanently finished: the startup error
    /// is sticky and a placeholder result is recorded.
    pub fn run(&mut self) -> Result<(), ExecError> {
        if self.result.is_some() || self.sticky.is_some() {
            return Err(ExecError::AlreadyFinished);
        }
        if self.execution.is_some() {
            return Err(ExecError::AlreadyStarted);
        }

        let timeout = if self.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            self.timeout
        };
        let started_at = Instant::now();
        let deadline = started_at + timeout;

        let logger = self.logger.with_field("binary", &self.binary);
        let environ = env::compose(
            std::env::vars_os()
                .filter_map(|(key, value)| Some(format!("{}={}", key.into_string().ok()?, value.into_string().ok()?))),
            &self.env_blacklist,
            &self.env_whitelist,
            &self.env,
        );

        // The pipe set gets its own logger, silenced unless a host
        // wires one up explicitly.
        let mut pipes = match StdPipes::new(
            Logger::null(),
            self.pty_stdin,
            self.pty_stdout,
            self.pty_stderr,
            self.feeders.clone(),
        ) {
            Ok(pipes) => pipes,
            Err(err) => {
                logger.log(&format!("failed creating pipes: {err}"));
                return Err(self.finish_failed_start(
                    StartError::FailedCreating(err),
                    started_at,
                    environ,
                ));
            }
        };

        let (program, args) = self.effective_argv();
        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(&args);
        cmd.env_clear();
        for entry in &environ {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        let (stdin, stdout, stderr) = pipes.child_stdio();
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);
        platform::prepare(&mut cmd, self.pty_stdin);

        logger.log(&format!("running {program} {args:?}"));
        debug!(%program, "starting child");

        match cmd.spawn() {
            Ok(child) => {
                self.execution = Some(Execution {
                    child,
                    pipes: Some(pipes),
                    deadline,
                    started_at,
                    environ,
                    logger,
                });
                Ok(())
            }
            Err(err) => {
                logger.log(&format!("failed starting: {err}"));
                // Aborts the I/O workers and releases every descriptor.
                drop(pipes);
                Err(self.finish_failed_start(StartError::Spawn(err), started_at, environ))
            }
        }
    }

    /// Record a sticky startup failure and the placeholder result.
    fn finish_failed_start(
        &mut self,
        cause: StartError,
        started_at: Instant,
        environ: Vec<String>,
    ) -> ExecError {
        let err = ExecError::FailedStarting(Arc::new(cause));
        self.sticky = Some(err.clone());
        self.result = Some(ExecResult {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: -1,
            signal: None,
            duration: started_at.elapsed(),
            environ,
        });
        err
    }

    /// Block until the child exits, the deadline fires, or the caller
    /// cancels; tear down the stream plumbing; classify the outcome.
    ///
    /// Returns the result on a clean zero exit. Every other outcome is
    /// an [`ExecError`]; the result (including partial captures after
    /// a timeout or cancellation) stays retrievable through
    /// [`Self::result`].
    pub async fn wait(&mut self) -> Result<ExecResult, ExecError> {
        if let Some(err) = &self.sticky {
            return Err(err.clone());
        }
        if self.result.is_some() {
            return Err(ExecError::AlreadyFinished);
        }
        let Some(mut exec) = self.execution.take() else {
            return Err(ExecError::NotStarted);
        };

        enum Outcome {
            Exited(ExitStatus),
            TimedOut,
            Cancelled,
        }

        let token = self.cancel.clone().unwrap_or_default();
        let outcome = tokio::select! {
            status = exec.child.wait() => match status {
                Ok(status) => Some(Outcome::Exited(status)),
                Err(err) => {
                    warn!(%err, "waiting for child failed");
                    None
                }
            },
            () = tokio::time::sleep_until(exec.deadline) => Some(Outcome::TimedOut),
            () = token.cancelled() => Some(Outcome::Cancelled),
        };

        let (status, timed_out, cancelled) = match outcome {
            Some(Outcome::Exited(status)) => (Some(status), false, false),
            Some(Outcome::TimedOut) => {
                self.cancel_child(&mut exec);
                (exec.child.wait().await.ok(), true, false)
            }
            Some(Outcome::Cancelled) => {
                self.cancel_child(&mut exec);
                (exec.child.wait().await.ok(), false, true)
            }
            None => (None, false, false),
        };

        let (stdout, stderr, worker_err) = match exec.pipes.take() {
            Some(pipes) => pipes.teardown().await,
            None => (String::new(), String::new(), None),
        };

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let signal = status
            .and_then(|s| s.signal())
            .and_then(|s| Signal::try_from(s).ok());

        let result = ExecResult {
            stdout,
            stderr,
            exit_code,
            signal,
            duration: exec.started_at.elapsed(),
            environ: exec.environ,
        };

        let error = if timed_out {
            Some(ExecError::Timeout)
        } else if cancelled {
            Some(ExecError::Cancelled)
        } else if let Some(sig) = signal {
            Some(ExecError::Signaled(sig))
        } else if exit_code != 0 {
            Some(ExecError::ExecutionFailed(exit_code))
        } else {
            worker_err.map(|err| match err {
                WorkerError::Read(err) => ExecError::FailedReading(Arc::new(err)),
                WorkerError::Write(err) => ExecError::FailedWriting(Arc::new(err)),
            })
        };

        exec.logger.log(&format!(
            "finished: exit_code={exit_code} signal={signal:?} duration={:?}",
            result.duration
        ));

        self.result = Some(result.clone());
        match error {
            None => Ok(result),
            Some(err) => Err(err),
        }
    }

    /// Deliver a signal to the running child.
    ///
    /// Only valid between `run` and `wait`. Best effort: delivery can
    /// succeed without affecting a child that is exiting concurrently.
    pub fn signal(&mut self, sig: Signal) -> Result<(), ExecError> {
        if self.result.is_some() || self.sticky.is_some() {
            return Err(ExecError::FailedSendingSignal(Arc::new(io::Error::other(
                "process already finished",
            ))));
        }
        let Some(exec) = &self.execution else {
            return Err(ExecError::NotStarted);
        };
        let Some(pid) = exec.child.id() else {
            return Err(ExecError::FailedSendingSignal(Arc::new(io::Error::other(
                "process already reaped",
            ))));
        };

        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid::from_raw(pid as i32);
        signal::kill(pid, sig).map_err(|err| ExecError::FailedSendingSignal(Arc::new(err.into())))
    }

    /// Terminate the child through the configured hook, or the platform
    /// default.
    fn cancel_child(&self, exec: &mut Execution) {
        exec.logger.log("terminating child");
        match &self.cancel_hook {
            Some(hook) => hook(&mut exec.child),
            None => platform::terminate(&mut exec.child),
        }
    }

    /// The program and argument list actually executed.
    fn effective_argv(&self) -> (String, Vec<String>) {
        let args: Vec<String> = self
            .prepend_args
            .iter()
            .chain(self.args.iter())
            .cloned()
            .collect();

        match &self.wrap_binary {
            Some(wrapper) => {
                let mut full = self.wrap_args.clone();
                full.push(self.binary.clone());
                full.extend(args);
                (wrapper.clone(), full)
            }
            None => (self.binary.clone(), args),
        }
    }
}

impl Clone for Command {
    /// An independent copy with fresh execution state. The feeder list
    /// is a new vector sharing the individual source factories.
    fn clone(&self) -> Self {
        Self {
            binary: self.binary.clone(),
            prepend_args: self.prepend_args.clone(),
            args: self.args.clone(),
            wrap_binary: self.wrap_binary.clone(),
            wrap_args: self.wrap_args.clone(),
            timeout: self.timeout,
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            env_blacklist: self.env_blacklist.clone(),
            env_whitelist: self.env_whitelist.clone(),
            feeders: self.feeders.clone(),
            pty_stdin: self.pty_stdin,
            pty_stdout: self.pty_stdout,
            pty_stderr: self.pty_stderr,
            logger: self.logger.clone(),
            cancel: self.cancel.clone(),
            cancel_hook: self.cancel_hook.clone(),
            execution: None,
            result: None,
            sticky: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_concatenates_prepend_before_args() {
        let mut cmd = Command::new("prog");
        cmd.with_args(["b"]).with_prepend_args(["a"]);
        let (program, args) = cmd.effective_argv();
        assert_eq!(program, "prog");
        assert_eq!(args, vec!["a", "b"]);
    }

    #[test]
    fn wrapper_prefixes_the_invocation() {
        let mut cmd = Command::new("prog");
        cmd.with_args(["x"]).with_wrapper("sudo", ["-n"]);
        let (program, args) = cmd.effective_argv();
        assert_eq!(program, "sudo");
        assert_eq!(args, vec!["-n", "prog", "x"]);
    }

    #[tokio::test]
    async fn default_timeout_applies_at_run_time() {
        let mut cmd = Command::new("true");
        cmd.run().expect("run true");
        let exec = cmd.execution.as_ref().expect("running");
        assert_eq!(exec.deadline - exec.started_at, DEFAULT_TIMEOUT);
        let _ = cmd.wait().await;
    }

    #[tokio::test]
    async fn configuration_freezes_once_running() {
        let mut cmd = Command::new("true");
        cmd.run().expect("run true");
        cmd.with_args(["ignored"]).with_timeout(Duration::from_secs(1));
        assert!(cmd.args.is_empty());
        assert_eq!(cmd.timeout, Duration::ZERO);
        let _ = cmd.wait().await;
    }

    #[tokio::test]
    async fn clone_resets_execution_state() {
        let mut cmd = Command::new("true");
        cmd.feed("x");
        cmd.run().expect("run true");
        let _ = cmd.wait().await;

        let copy = cmd.clone();
        assert!(copy.execution.is_none());
        assert!(copy.result.is_none());
        assert!(copy.sticky.is_none());
        assert_eq!(copy.feeders.len(), 1);
    }
}
