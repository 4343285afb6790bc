//! The subprocess channel: child process ownership and framed I/O.
//!
//! One channel serves every compilation of a host instance. Writes are
//! serialized under a single async mutex so frames are never interleaved
//! on the wire; a supervised read-loop task decodes compiler messages and
//! hands them to the [`Router`] in emission order; a second task copies
//! the child's stderr to the host's stderr line by line.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use cascade_proto::{InboundMessage, OutboundMessage};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::router::Router;

/// How long `close` waits for the child to exit after stdin closes
/// before killing it.
pub(crate) const CLOSE_GRACE: Duration = Duration::from_secs(2);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Owner of the compiler subprocess and its pipes.
pub(crate) struct Channel {
    /// Wire write half; taken on close. The mutex serializes frames.
    writer: Mutex<Option<BoxedWriter>>,
    /// Child process handle; taken on close for reaping.
    child: Mutex<Option<Child>>,
    /// Destination for decoded compiler messages.
    router: Arc<Router>,
    /// Set once, by whichever path closes the channel first.
    closed: AtomicBool,
    /// Read-loop and stderr-pump handles, stopped on close.
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Launches the compiler subprocess and starts its I/O tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(launcher: &Launcher, router: Arc<Router>) -> Result<Arc<Self>> {
        let mut child = launcher
            .command()
            .spawn()
            .map_err(|e| Error::Launch(format!("{}: {e}", launcher.program().display())))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Launch("child stdin was not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Launch("child stdout was not captured".into()))?;
        let stderr = child.stderr.take();

        let channel = Arc::new(Self {
            writer: Mutex::new(Some(Box::new(stdin) as BoxedWriter)),
            child: Mutex::new(Some(child)),
            router,
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let mut tasks = vec![tokio::spawn(read_loop(
            Box::new(stdout) as BoxedReader,
            Arc::downgrade(&channel),
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_pump(stderr, Arc::downgrade(&channel))));
        }
        if let Ok(mut slot) = channel.tasks.lock() {
            *slot = tasks;
        }

        Ok(channel)
    }

    /// Builds a channel over arbitrary stream halves, for driving the
    /// session machinery against a scripted peer.
    #[cfg(test)]
    pub(crate) fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        router: Arc<Router>,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            writer: Mutex::new(Some(Box::new(writer) as BoxedWriter)),
            child: Mutex::new(None),
            router,
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(Vec::new()),
        });
        let task = tokio::spawn(read_loop(
            Box::new(reader) as BoxedReader,
            Arc::downgrade(&channel),
        ));
        if let Ok(mut slot) = channel.tasks.lock() {
            slot.push(task);
        }
        channel
    }

    /// Encodes and writes one envelope as a single frame, then flushes.
    ///
    /// Any I/O failure closes the channel; the caller and every live
    /// session observe [`Error::Closed`].
    pub(crate) async fn send(self: &Arc<Self>, message: &InboundMessage) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        match cascade_proto::send(writer, message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                drop(guard);
                warn!(error = %e, "write to compiler failed; closing channel");
                self.shutdown(Error::Closed).await;
                Err(Error::Closed)
            }
        }
    }

    /// `true` once the channel has closed for any reason.
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the channel: fails live sessions, drops stdin, and reaps
    /// the child. Idempotent.
    pub(crate) async fn close(self: &Arc<Self>) {
        self.shutdown(Error::Closed).await;
    }

    /// Terminal path shared by `close`, write failures, and the read
    /// loop. The first caller wins; later calls return immediately.
    pub(crate) async fn shutdown(self: &Arc<Self>, cause: Error) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(%cause, "closing compiler channel");
        self.router.fail_all(&cause);

        // Dropping stdin signals the child to exit.
        self.writer.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if tokio::time::timeout(CLOSE_GRACE, child.wait())
                .await
                .is_err()
            {
                warn!("compiler did not exit within the close grace period; killing it");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }

        let tasks = self
            .tasks
            .lock()
            .map(|mut slot| std::mem::take(&mut *slot))
            .unwrap_or_default();
        for task in tasks {
            task.abort();
        }
    }
}

/// Decodes compiler messages until EOF, decode failure, or close.
async fn read_loop(mut reader: BoxedReader, weak: Weak<Channel>) {
    loop {
        match cascade_proto::recv::<OutboundMessage>(&mut reader).await {
            Ok(message) => {
                trace!(compilation_id = ?message.compilation_id(), "message from compiler");
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                if let Err(violation) = channel.router.route(message) {
                    channel.shutdown(Error::Protocol(violation)).await;
                    return;
                }
            }
            Err(e) => {
                let Some(channel) = weak.upgrade() else {
                    return;
                };
                let cause = if e.kind() == io::ErrorKind::InvalidData {
                    Error::Protocol(e.to_string())
                } else {
                    // EOF or a broken pipe: the subprocess is gone.
                    Error::Closed
                };
                channel.shutdown(cause).await;
                return;
            }
        }
    }
}

/// Copies child stderr to host stderr line by line.
#[allow(clippy::print_stderr)]
async fn stderr_pump(stderr: tokio::process::ChildStderr, weak: Weak<Channel>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => eprintln!("{line}"),
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "reading compiler stderr failed");
                if let Some(channel) = weak.upgrade() {
                    channel.shutdown(Error::Closed).await;
                }
                return;
            }
        }
    }
}
