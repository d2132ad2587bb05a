//! Platform-specific process attributes and cancellation.
//!
//! # Safety
//!
//! This module uses unsafe code for pre-exec hooks (setsid, ioctl).
//! These run between fork and exec and are restricted to
//! async-signal-safe operations.

#![allow(unsafe_code)]

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::sync::Arc;
use tokio::process::Child;
use tracing::warn;

/// A caller-supplied cancellation routine, invoked with the running
/// child when the deadline fires or the caller's token is cancelled.
/// When absent, [`terminate`] is the default.
pub type CancelFn = Arc<dyn Fn(&mut Child) + Send + Sync>;

/// Apply platform process attributes to a command about to be spawned.
///
/// Without a controlling terminal the child gets its own process group
/// so cancellation can reach its descendants. With one (stdin is a PTY
/// slave), the pre-exec hook instead creates a new session and claims
/// the slave as the controlling terminal; the new session already
/// implies a fresh process group.
pub(crate) fn prepare(cmd: &mut tokio::process::Command, controlling_tty: bool) {
    if controlling_tty {
        // SAFETY: only async-signal-safe syscalls between fork and exec.
        // Stdio is already redirected when pre-exec hooks run, so fd 0
        // is the PTY slave.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(io::Error::from)?;
                if libc::ioctl(0, libc::TIOCSCTTY, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }
    } else {
        cmd.process_group(0);
    }
}

/// Terminate a running child and its descendants.
///
/// Kills the child's process group; falls back to a direct kill when
/// the group is already gone. Failures are logged, not surfaced; the
/// caller is about to reap whatever is left.
pub(crate) fn terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    #[allow(clippy::cast_possible_wrap)]
    let pgid = Pid::from_raw(pid as i32);
    if let Err(err) = signal::killpg(pgid, Signal::SIGKILL) {
        warn!(%pid, %err, "process group kill failed, killing child directly");
        if let Err(err) = child.start_kill() {
            warn!(%pid, %err, "failed to kill child");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[tokio::test]
    async fn terminate_kills_process_group() {
        let mut cmd = tokio::process::Command::new("sleep");
        cmd.arg("30").stdin(Stdio::null());
        prepare(&mut cmd, false);
        let mut child = cmd.spawn().expect("spawn sleep");

        terminate(&mut child);

        let status = child.wait().await.expect("wait");
        assert!(!status.success());
    }

    #[tokio::test]
    async fn terminate_on_reaped_child_is_a_noop() {
        let mut cmd = tokio::process::Command::new("true");
        cmd.stdin(Stdio::null());
        let mut child = cmd.spawn().expect("spawn true");
        child.wait().await.expect("wait");

        // id() is None once reaped; nothing to kill, nothing to panic.
        terminate(&mut child);
    }
}
