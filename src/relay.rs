//! Socket Relay
//!
//! Bidirectional byte pump between two duplex endpoints, used for every
//! accepted connection of a local, remote or dynamic forward.
//!
//! Each direction copies through its own reusable buffer and flushes after
//! every write. When one direction ends (EOF, error, cancellation) it cancels
//! the relay's token so the other direction unblocks, and both write sides are
//! shut down. There is no graceful drain.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default copy buffer per direction (8 KiB)
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Upper bound on the best-effort shutdown of a write side
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Activity timestamps of one endpoint
#[derive(Debug)]
pub struct Activity {
    created_at: Instant,
    last_active: Mutex<Instant>,
}

impl Activity {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_active: Mutex::new(now),
        }
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_active_at(&self) -> Instant {
        *self.last_active.lock()
    }

    /// Time since the last successful non-empty read or write
    pub fn idle_duration(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_active_at())
    }
}

/// A duplex endpoint with activity tracking and idempotent close
pub struct TrackedStream<S> {
    inner: S,
    activity: Arc<Activity>,
    closed: bool,
}

impl<S> TrackedStream<S> {
    /// Wrap a raw connection
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            activity: Arc::new(Activity::new()),
            closed: false,
        }
    }

    /// Shared activity handle, still valid while the stream is being relayed
    pub fn activity(&self) -> Arc<Activity> {
        self.activity.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.activity.created_at()
    }

    pub fn idle_duration(&self) -> Duration {
        self.activity.idle_duration()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S: AsyncWrite + Unpin> TrackedStream<S> {
    /// Write all of `data` and flush
    pub async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.write_all(data).await?;
        self.flush().await
    }

    /// Close the stream. Repeated calls are no-ops and failures are only logged.
    ///
    /// The write side is shut down on the socket. Afterwards reads yield
    /// end-of-stream and writes fail with `BrokenPipe`, whatever the peer does;
    /// the socket itself is released when the stream is dropped.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match tokio::time::timeout(SHUTDOWN_GRACE, self.inner.shutdown()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Best-effort close failed: {}", e),
            Err(_) => debug!("Best-effort close timed out"),
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Ok(()));
        }
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            if buf.filled().len() > before {
                this.activity.touch();
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            if *n > 0 {
                this.activity.touch();
            }
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Relay tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOptions {
    pub buffer_size: usize,
    /// End the relay once both sides have been idle this long
    pub idle_timeout: Option<Duration>,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            idle_timeout: None,
        }
    }
}

/// Why a relay ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// One side reached end-of-stream
    Eof,
    /// The caller's token was cancelled (forward stopped)
    Cancelled,
    IdleTimeout,
    /// A read or write failed
    Error,
}

#[derive(Debug)]
pub struct RelayResult {
    pub a_to_b: u64,
    pub b_to_a: u64,
    pub end: RelayEnd,
    /// First I/O error seen, if any
    pub error: Option<io::Error>,
}

struct PumpOutcome {
    bytes: u64,
    error: Option<io::Error>,
}

/// Relay bytes between `a` and `b` until either side ends or `cancel` fires.
///
/// Returns once both directions have terminated and both write sides have
/// been shut down.
pub async fn relay<A, B>(
    a: TrackedStream<A>,
    b: TrackedStream<B>,
    options: &RelayOptions,
    cancel: &CancellationToken,
) -> RelayResult
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let token = cancel.child_token();
    let a_activity = a.activity();
    let b_activity = b.activity();
    let buffer_size = options.buffer_size.max(1);

    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a, idled) = tokio::join!(
        pump(a_read, b_write, buffer_size, &token),
        pump(b_read, a_write, buffer_size, &token),
        idle_watchdog(options.idle_timeout, a_activity, b_activity, &token),
    );

    let mut error = a_to_b.error;
    if error.is_none() {
        error = b_to_a.error;
    }

    let end = if cancel.is_cancelled() {
        RelayEnd::Cancelled
    } else if idled {
        RelayEnd::IdleTimeout
    } else if error.is_some() {
        RelayEnd::Error
    } else {
        RelayEnd::Eof
    };

    debug!(
        "Relay ended ({:?}): {} bytes a->b, {} bytes b->a",
        end, a_to_b.bytes, b_to_a.bytes
    );

    RelayResult {
        a_to_b: a_to_b.bytes,
        b_to_a: b_to_a.bytes,
        end,
        error,
    }
}

async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    token: &CancellationToken,
) -> PumpOutcome
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let error = loop {
        let read = tokio::select! {
            biased;
            _ = token.cancelled() => break None,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break None,
            Ok(n) => {
                let write = async {
                    writer.write_all(&buf[..n]).await?;
                    writer.flush().await
                };
                let written = tokio::select! {
                    biased;
                    _ = token.cancelled() => break None,
                    written = write => written,
                };
                if let Err(e) = written {
                    debug!("Relay write error: {}", e);
                    break Some(e);
                }
                bytes += n as u64;
            }
            Err(e) => {
                debug!("Relay read error: {}", e);
                break Some(e);
            }
        }
    };

    // Unblock the opposite direction, then close our write side
    token.cancel();
    match tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Relay shutdown error: {}", e),
        Err(_) => debug!("Relay shutdown timed out"),
    }

    PumpOutcome { bytes, error }
}

/// Returns true if it ended the relay because both sides went idle
async fn idle_watchdog(
    idle_timeout: Option<Duration>,
    a: Arc<Activity>,
    b: Arc<Activity>,
    token: &CancellationToken,
) -> bool {
    let Some(limit) = idle_timeout else {
        token.cancelled().await;
        return false;
    };

    loop {
        let idle = a.idle_duration().min(b.idle_duration());
        if idle >= limit {
            debug!("Relay idle for {}s, closing", idle.as_secs());
            token.cancel();
            return true;
        }
        tokio::select! {
            _ = token.cancelled() => return false,
            _ = tokio::time::sleep(limit - idle) => {}
        }
    }
}

/// Check whether `port` can currently be bound on all interfaces.
///
/// Only a hint for picking defaults; another process may take the port
/// right after this returns.
pub async fn is_port_available(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let probe = || -> io::Result<()> {
        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let _listener = socket.listen(1)?;
        Ok(())
    };
    probe().is_ok()
}

/// First available port in `start..=end`
pub async fn find_available_port(start: u16, end: u16) -> Option<u16> {
    for port in start..=end {
        if is_port_available(port).await {
            return Some(port);
        }
    }
    None
}
