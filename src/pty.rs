//! PTY acquisition.
//!
//! Opens a master/slave pair for commands that request a terminal on
//! any of their standard streams. The slave is switched to raw mode so
//! the line discipline does not echo or translate the captured bytes,
//! and the master is made non-blocking for async I/O.

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::{self, SetArg};
use std::os::unix::io::OwnedFd;
use thiserror::Error;

/// Errors that can occur during PTY acquisition.
#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open PTY: {0}")]
    OpenPty(#[source] nix::Error),

    #[error("failed to set raw mode: {0}")]
    RawMode(#[source] nix::Error),

    #[error("failed to set non-blocking: {0}")]
    NonBlocking(#[source] nix::Error),
}

/// An open master/slave pair.
pub(crate) struct Pty {
    /// The master side, non-blocking, retained by the parent.
    pub master: OwnedFd,
    /// The slave side, raw mode, handed to the child as its stdio.
    pub slave: OwnedFd,
}

/// Open a PTY pair with a default window size.
pub(crate) fn open() -> Result<Pty, PtyError> {
    let winsize = Winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };

    let OpenptyResult { master, slave } = openpty(&winsize, None).map_err(PtyError::OpenPty)?;

    // Raw mode: no echo, no CR/NL translation. Captures must contain
    // exactly the bytes the child wrote.
    let mut term = termios::tcgetattr(&slave).map_err(PtyError::RawMode)?;
    termios::cfmakeraw(&mut term);
    termios::tcsetattr(&slave, SetArg::TCSANOW, &term).map_err(PtyError::RawMode)?;

    set_nonblocking(&master).map_err(PtyError::NonBlocking)?;

    Ok(Pty { master, slave })
}

/// Put a descriptor into non-blocking mode.
pub(crate) fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_retain(flags);
    flags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::termios::LocalFlags;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn open_returns_distinct_fds() {
        let pty = open().expect("open pty");
        assert_ne!(pty.master.as_raw_fd(), pty.slave.as_raw_fd());
    }

    #[test]
    fn slave_is_raw() {
        let pty = open().expect("open pty");
        let term = termios::tcgetattr(&pty.slave).expect("tcgetattr");
        assert!(!term.local_flags.contains(LocalFlags::ECHO));
        assert!(!term.local_flags.contains(LocalFlags::ICANON));
    }

    #[test]
    fn master_is_nonblocking() {
        let pty = open().expect("open pty");
        let flags = fcntl(&pty.master, FcntlArg::F_GETFL).expect("fcntl");
        assert!(OFlag::from_bits_retain(flags).contains(OFlag::O_NONBLOCK));
    }
}
