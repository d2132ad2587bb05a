//! Standard-stream plumbing around a child process.
//!
//! The pipe set owns the three stream pairs. Per stream it decides
//! whether the child end is an OS-pipe half or a PTY slave, supervises
//! the background I/O workers (one feeding stdin, one draining each of
//! stdout and stderr), and hands back the captured bytes once the
//! workers have joined.
//!
//! PTY-backed streams share a single master behind an `Arc`, so the
//! descriptor closes exactly once no matter how many streams alias it.

use std::io;
use std::os::unix::io::OwnedFd;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nix::unistd;
use thiserror::Error;
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::log::Logger;
use crate::pty::{self, PtyError};

/// How long the I/O workers get to flush after the child has been
/// reaped before they are forcibly torn down.
pub(crate) const IO_GRACE: Duration = Duration::from_millis(100);

/// A stdin source factory: invoked at most once by the stdin worker,
/// returns a fresh reader to copy into the child.
pub type Feeder = Arc<dyn Fn() -> Pin<Box<dyn AsyncRead + Send>> + Send + Sync>;

/// Errors from building the pipe set.
#[derive(Debug, Error)]
pub enum PipeError {
    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error("failed to create pipe: {0}")]
    CreatePipe(#[source] nix::Error),

    #[error("failed to set non-blocking: {0}")]
    NonBlocking(#[source] nix::Error),

    #[error("failed to duplicate PTY slave: {0}")]
    DupSlave(#[source] io::Error),

    #[error("failed to register descriptor with the runtime: {0}")]
    Register(#[source] io::Error),
}

/// An I/O worker failure, classified by direction.
#[derive(Debug, Error)]
pub(crate) enum WorkerError {
    #[error("drain failed: {0}")]
    Read(#[source] io::Error),

    #[error("feed failed: {0}")]
    Write(#[source] io::Error),
}

/// A parent-side stream endpoint: an async-registered descriptor,
/// possibly shared across streams when PTY-backed.
#[derive(Clone)]
struct Endpoint {
    fd: Arc<AsyncFd<OwnedFd>>,
    pty: bool,
}

impl Endpoint {
    fn new(fd: OwnedFd, pty: bool) -> Result<Self, PipeError> {
        Ok(Self {
            fd: Arc::new(AsyncFd::new(fd).map_err(PipeError::Register)?),
            pty,
        })
    }

    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fd, &other.fd)
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| unistd::read(inner.get_ref(), buf).map_err(io::Error::from))
            {
                Ok(Ok(n)) => return Ok(n),
                Ok(Err(err)) => {
                    // A PTY master reports EIO once every slave handle
                    // is closed; for our purposes that is EOF.
                    if self.pty && err.raw_os_error() == Some(libc::EIO) {
                        return Ok(0);
                    }
                    return Err(err);
                }
                Err(_would_block) => {}
            }
        }
    }

    async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let mut guard = self.fd.writable().await?;
            match guard.try_io(|inner| unistd::write(inner.get_ref(), data).map_err(io::Error::from))
            {
                Ok(Ok(n)) => data = &data[n..],
                Ok(Err(err)) => return Err(err),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }
}

/// One PTY pair shared by every stream that requested a terminal.
struct SharedPty {
    master: Endpoint,
    slave: OwnedFd,
}

/// Duplicate the slave for a child stream and hand out the shared
/// master, opening the pair on first use.
fn pty_ends(shared: &mut Option<SharedPty>) -> Result<(OwnedFd, Endpoint), PipeError> {
    match shared {
        Some(p) => Ok((
            p.slave.try_clone().map_err(PipeError::DupSlave)?,
            p.master.clone(),
        )),
        None => {
            let pty = pty::open()?;
            let master = Endpoint::new(pty.master, true)?;
            let child = pty.slave.try_clone().map_err(PipeError::DupSlave)?;
            let ends = (child, master.clone());
            *shared = Some(SharedPty {
                master,
                slave: pty.slave,
            });
            Ok(ends)
        }
    }
}

/// Create an OS pipe whose parent half is async-registered.
/// `parent_reads` selects which half stays in the parent.
fn os_pipe(parent_reads: bool) -> Result<(OwnedFd, Endpoint), PipeError> {
    let (read, write) = unistd::pipe().map_err(PipeError::CreatePipe)?;
    let (child, parent) = if parent_reads {
        (write, read)
    } else {
        (read, write)
    };
    pty::set_nonblocking(&parent).map_err(PipeError::NonBlocking)?;
    Ok((child, Endpoint::new(parent, false)?))
}

/// The three stream pairs plus their I/O workers.
pub(crate) struct StdPipes {
    stdin_child: Option<OwnedFd>,
    stdout_child: Option<OwnedFd>,
    stderr_child: Option<OwnedFd>,
    /// Keeps a PTY-backed stdin master open for the whole execution;
    /// the stdin worker owns the only reference when stdin is a pipe,
    /// so finishing the feed closes it and the child sees EOF.
    _stdin_keepalive: Option<Endpoint>,
    stdout_buf: Arc<Mutex<Vec<u8>>>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    workers: JoinSet<Result<(), WorkerError>>,
    logger: Logger,
}

impl StdPipes {
    /// Build the stream pairs and start the I/O workers.
    ///
    /// Dropping the returned set aborts the workers and releases every
    /// descriptor, so a failed start needs no explicit cleanup.
    pub(crate) fn new(
        logger: Logger,
        pty_stdin: bool,
        pty_stdout: bool,
        pty_stderr: bool,
        feeders: Vec<Feeder>,
    ) -> Result<Self, PipeError> {
        let mut shared: Option<SharedPty> = None;

        let (stdin_child, stdin_writer) = if pty_stdin {
            let (child, master) = pty_ends(&mut shared)?;
            (Some(child), Some(master))
        } else if feeders.is_empty() {
            // Unattached stdin: the child gets /dev/null so readers
            // waiting for EOF never hang.
            (None, None)
        } else {
            let (child, writer) = os_pipe(false)?;
            (Some(child), Some(writer))
        };

        let (stdout_child, stdout_reader) = if pty_stdout {
            pty_ends(&mut shared)?
        } else {
            os_pipe(true)?
        };

        let (stderr_child, stderr_reader) = if pty_stderr {
            pty_ends(&mut shared)?
        } else {
            os_pipe(true)?
        };

        // The dups handed to the child keep the slave alive; the
        // original closes here.
        drop(shared.take().map(|p| p.slave));

        let merged = stderr_reader.same_as(&stdout_reader);
        let mut pipes = Self {
            stdin_child,
            stdout_child: Some(stdout_child),
            stderr_child: Some(stderr_child),
            _stdin_keepalive: stdin_writer.clone().filter(|w| w.pty),
            stdout_buf: Arc::new(Mutex::new(Vec::new())),
            stderr_buf: Arc::new(Mutex::new(Vec::new())),
            workers: JoinSet::new(),
            logger,
        };

        if let Some(writer) = stdin_writer {
            if !feeders.is_empty() {
                pipes.workers.spawn(feed_stdin(writer, feeders));
            }
        }
        pipes
            .workers
            .spawn(drain(stdout_reader, Arc::clone(&pipes.stdout_buf)));
        if !merged {
            pipes
                .workers
                .spawn(drain(stderr_reader, Arc::clone(&pipes.stderr_buf)));
        }

        Ok(pipes)
    }

    /// Take the child-side handles for spawning. Handing them to the
    /// spawner consumes them in the parent, which is what lets the
    /// drain workers see EOF once the child is gone.
    pub(crate) fn child_stdio(&mut self) -> (Stdio, Stdio, Stdio) {
        let take = |fd: &mut Option<OwnedFd>| fd.take().map_or_else(Stdio::null, Stdio::from);
        (
            take(&mut self.stdin_child),
            take(&mut self.stdout_child),
            take(&mut self.stderr_child),
        )
    }

    /// Join the I/O workers, then release the caller-side endpoints.
    ///
    /// Workers that outlive the grace period are aborted; whatever made
    /// it into the buffers is still returned. Returns the captured
    /// stdout, captured stderr, and the first worker failure if any.
    pub(crate) async fn teardown(mut self) -> (String, String, Option<WorkerError>) {
        let mut failure = None;
        let grace = tokio::time::sleep(IO_GRACE);
        tokio::pin!(grace);
        let mut aborted = false;

        loop {
            tokio::select! {
                joined = self.workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(err))) => {
                        self.logger.log(&format!("I/O worker failed: {err}"));
                        warn!(%err, "I/O worker failed");
                        failure.get_or_insert(err);
                    }
                    Some(Err(join_err)) if join_err.is_cancelled() => {}
                    Some(Err(join_err)) => {
                        warn!(%join_err, "I/O worker panicked");
                    }
                },
                () = &mut grace, if !aborted => {
                    debug!("I/O grace elapsed, aborting remaining workers");
                    aborted = true;
                    self.workers.abort_all();
                }
            }
        }

        let stdout = take_buffer(&self.stdout_buf);
        let stderr = take_buffer(&self.stderr_buf);
        // Dropping `self` releases the caller-side endpoints. Closing a
        // descriptor cannot meaningfully fail here, and per policy close
        // problems never change the result.
        (stdout, stderr, failure)
    }
}

fn take_buffer(buf: &Arc<Mutex<Vec<u8>>>) -> String {
    let bytes = buf.lock().unwrap_or_else(PoisonError::into_inner);
    String::from_utf8_lossy(&bytes).into_owned()
}

/// Copy each feeder's reader into the child's stdin, in order.
///
/// A feeder is not invoked until the previous one has been fully
/// drained. When the feed is done, a pipe writer drops (EOF for the
/// child); a PTY master stays open via the keepalive reference, since
/// closing it would end the session.
async fn feed_stdin(
    writer: Endpoint,
    feeders: Vec<Feeder>,
) -> Result<(), WorkerError> {
    let mut chunk = [0u8; 8192];
    for feeder in feeders {
        let mut reader = feeder();
        loop {
            let n = reader
                .read(&mut chunk)
                .await
                .map_err(WorkerError::Write)?;
            if n == 0 {
                break;
            }
            match writer.write_all(&chunk[..n]).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {
                    // The child stopped reading; not a harness fault.
                    debug!("child closed stdin mid-feed");
                    return Ok(());
                }
                Err(err) => return Err(WorkerError::Write(err)),
            }
        }
    }
    Ok(())
}

/// Drain a reader into the shared capture buffer until EOF.
///
/// Appends incrementally so partial output survives a timeout or
/// cancellation teardown.
async fn drain(reader: Endpoint, sink: Arc<Mutex<Vec<u8>>>) -> Result<(), WorkerError> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await.map_err(WorkerError::Read)?;
        if n == 0 {
            return Ok(());
        }
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn literal_feeder(data: &'static [u8]) -> Feeder {
        Arc::new(move || Box::pin(Cursor::new(data)) as Pin<Box<dyn AsyncRead + Send>>)
    }

    #[tokio::test]
    async fn merged_pty_skips_duplicate_drain() {
        let pipes = StdPipes::new(Logger::null(), false, true, true, Vec::new())
            .expect("build pipes");
        // One drain worker for the shared master, no stdin worker.
        assert_eq!(pipes.workers.len(), 1);
    }

    #[tokio::test]
    async fn split_pty_keeps_both_drains() {
        let pipes = StdPipes::new(Logger::null(), false, true, false, Vec::new())
            .expect("build pipes");
        assert_eq!(pipes.workers.len(), 2);
    }

    #[tokio::test]
    async fn no_feeders_leaves_stdin_unattached() {
        let mut pipes = StdPipes::new(Logger::null(), false, false, false, Vec::new())
            .expect("build pipes");
        assert!(pipes.stdin_child.is_none());
        // Taking the handles twice must not panic; the second take
        // yields null handles.
        let _ = pipes.child_stdio();
        let _ = pipes.child_stdio();
    }

    #[tokio::test]
    async fn feeders_run_in_order_and_close_the_pipe() {
        let mut pipes = StdPipes::new(
            Logger::null(),
            false,
            false,
            false,
            vec![literal_feeder(b"first "), literal_feeder(b"second")],
        )
        .expect("build pipes");

        // Read the child end of stdin directly, standing in for the
        // child process. Non-blocking so the single-threaded test
        // runtime can keep driving the feed worker between reads.
        let stdin = pipes.stdin_child.take().expect("stdin pipe");
        pty::set_nonblocking(&stdin).expect("set non-blocking");
        let mut collected = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
            match unistd::read(&stdin, &mut chunk) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(nix::Error::EAGAIN) => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(err) => panic!("read stdin: {err}"),
            }
        }
        assert_eq!(collected, b"first second");
    }
}
