//! Connection-level timeouts for the listener (spec §4.6: read timeout 15s,
//! write timeout 60s, idle timeout 120s). `axum::serve` has no built-in
//! equivalent of Go's `net/http.Server.ReadTimeout`/`WriteTimeout`/
//! `IdleTimeout`, but it accepts anything implementing `axum::serve::Listener`,
//! so we wrap the accepted `TcpStream` before handing it to axum instead of
//! reaching for a lower-level hyper server builder.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Sleep;
use tokio_io_timeout::TimeoutStream;
use tracing::warn;

/// Closes the connection after this much wall-clock time with no read *or*
/// write progress at all — distinct from the narrower per-operation
/// `read_timeout`/`write_timeout` applied by the [`TimeoutStream`]
/// underneath. `S` is required to be `Unpin` (true of `TimeoutStream<TcpStream>`),
/// which keeps `IdleGuard` itself `Unpin` with a plain boxed deadline timer
/// instead of pin-projecting through it.
struct IdleGuard<S> {
    inner: S,
    idle_timeout: Duration,
    deadline: Pin<Box<Sleep>>,
}

impl<S> IdleGuard<S> {
    fn new(inner: S, idle_timeout: Duration) -> Self {
        Self {
            inner,
            idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle_timeout)),
        }
    }
}

fn idle_timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "connection idle timeout")
}

impl<S: AsyncRead + Unpin> AsyncRead for IdleGuard<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(idle_timeout_error()));
        }
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if matches!(&res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            let idle_timeout = self.idle_timeout;
            self.deadline
                .as_mut()
                .reset(tokio::time::Instant::now() + idle_timeout);
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for IdleGuard<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.deadline.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(idle_timeout_error()));
        }
        let res = Pin::new(&mut self.inner).poll_write(cx, data);
        if matches!(res, Poll::Ready(Ok(n)) if n > 0) {
            let idle_timeout = self.idle_timeout;
            self.deadline
                .as_mut()
                .reset(tokio::time::Instant::now() + idle_timeout);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Fixed per spec §4.6; not meant to be user-configurable.
const READ_TIMEOUT: Duration = Duration::from_secs(15);
const WRITE_TIMEOUT: Duration = Duration::from_secs(60);
const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub type TimedConn = IdleGuard<TimeoutStream<TcpStream>>;

/// Wraps a bound [`TcpListener`] so every accepted connection enforces
/// spec §4.6's read/write/idle timeouts, while still satisfying
/// `axum::serve::Listener` so it can be handed straight to `axum::serve`.
pub struct TimeoutListener {
    inner: TcpListener,
}

impl TimeoutListener {
    pub fn new(inner: TcpListener) -> Self {
        Self { inner }
    }
}

impl axum::serve::Listener for TimeoutListener {
    type Io = TimedConn;
    type Addr = std::net::SocketAddr;

    fn accept(&mut self) -> impl Future<Output = (Self::Io, Self::Addr)> + Send {
        async move {
            loop {
                match self.inner.accept().await {
                    Ok((stream, addr)) => {
                        let _ = stream.set_nodelay(true);
                        let mut timeouts = TimeoutStream::new(stream);
                        timeouts.set_read_timeout(Some(READ_TIMEOUT));
                        timeouts.set_write_timeout(Some(WRITE_TIMEOUT));
                        return (IdleGuard::new(timeouts, IDLE_TIMEOUT), addr);
                    }
                    Err(e) => {
                        warn!(error = %e, "accept() failed, retrying");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
