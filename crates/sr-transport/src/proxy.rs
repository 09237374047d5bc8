//! Proxy pair engine
//!
//! Relays bytes between two duplex transports until either side ends. The two
//! directions share one cancellation scope: whichever direction stops first
//! (end of data, error, or idle timeout) cancels it, and the other direction
//! stops at once, even while blocked in a read or write.
//!
//! The idle deadline is shared by the pair. Traffic in either direction
//! pushes it forward; the pair is torn down only when neither side has moved
//! a byte for the whole window.

use std::fmt;
use std::io;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default idle window for a proxy pair
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of the per-direction copy buffer
const COPY_BUFFER_SIZE: usize = 32 * 1024;

/// Which way bytes flow inside a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client connection to agent stream
    Upstream,
    /// Agent stream to client connection
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => write!(f, "client->stream"),
            Direction::Downstream => write!(f, "stream->client"),
        }
    }
}

/// Idle deadline shared by both directions of a pair
struct IdleDeadline {
    window: Duration,
    last_activity: Mutex<Instant>,
}

impl IdleDeadline {
    fn new(window: Duration) -> Self {
        Self {
            window,
            last_activity: Mutex::new(Instant::now()),
        }
    }

    fn refresh(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn deadline(&self) -> Instant {
        *self.last_activity.lock() + self.window
    }

    fn expired(&self) -> bool {
        Instant::now() >= self.deadline()
    }
}

/// Outcome of a finished proxy pair
#[derive(Debug, Default)]
pub struct PairReport {
    /// Bytes copied from the client to the stream
    pub upstream_bytes: u64,
    /// Bytes copied from the stream to the client
    pub downstream_bytes: u64,
    /// The first error that ended the pair, if any
    pub error: Option<io::Error>,
}

impl PairReport {
    /// Whether the pair ended without an error (end of data or cancellation)
    pub fn is_clean(&self) -> bool {
        self.error.is_none()
    }
}

/// Relay bytes between `client` and `stream` until either side ends.
///
/// The pair's scope is a child of `parent`; cancelling `parent` stops the
/// pair too. When both directions are done the write side of `stream` is
/// shut down so the remote end learns that the logical stream is finished.
/// `client` is dropped (and thereby closed) when this returns.
pub async fn run_pair<A, B>(
    parent: &CancellationToken,
    client: A,
    stream: B,
    idle_timeout: Duration,
) -> PairReport
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let scope = parent.child_token();
    let idle = IdleDeadline::new(idle_timeout);

    let (mut client_rd, mut client_wr) = tokio::io::split(client);
    let (mut stream_rd, mut stream_wr) = tokio::io::split(stream);

    let ((upstream_bytes, upstream), (downstream_bytes, downstream)) = tokio::join!(
        copy_direction(
            Direction::Upstream,
            &mut client_rd,
            &mut stream_wr,
            &scope,
            &idle
        ),
        copy_direction(
            Direction::Downstream,
            &mut stream_rd,
            &mut client_wr,
            &scope,
            &idle
        ),
    );

    tracing::debug!(
        upstream_bytes,
        downstream_bytes,
        "Proxy pair finished, closing stream"
    );
    if let Err(e) = stream_wr.shutdown().await {
        tracing::debug!("Error closing stream side of proxy pair: {}", e);
    }

    PairReport {
        upstream_bytes,
        downstream_bytes,
        error: upstream.err().or(downstream.err()),
    }
}

/// Copy `src` into `dst` until end of data, error, idle expiry, or until the
/// shared scope is cancelled by the sister direction.
///
/// Always cancels `scope` before returning.
async fn copy_direction<R, W>(
    direction: Direction,
    src: &mut R,
    dst: &mut W,
    scope: &CancellationToken,
    idle: &IdleDeadline,
) -> (u64, io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = match read_until_idle(src, &mut buf, scope, idle).await {
            Step::Cancelled => {
                tracing::trace!(%direction, "Sister direction ended, stopping");
                break Ok(());
            }
            Step::Done(Ok(0)) => {
                // End of data is a normal finish; looping here would spin
                tracing::debug!(%direction, "Nothing more to copy");
                break Ok(());
            }
            Step::Done(Ok(n)) => n,
            Step::Done(Err(e)) => break Err(e),
        };

        let write = async {
            dst.write_all(&buf[..n]).await?;
            dst.flush().await?;
            Ok::<(), io::Error>(())
        };
        let written = tokio::select! {
            biased;
            _ = scope.cancelled() => break Ok(()),
            written = tokio::time::timeout(idle.window, write) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => break Err(e),
            Err(_) => break Err(idle_error(idle.window)),
        }

        total += n as u64;
        idle.refresh();
        tracing::trace!(%direction, bytes = n, "Copied");
    };

    scope.cancel();

    if let Err(e) = &result {
        tracing::debug!(%direction, "Proxy copy error: {}", e);
    }
    (total, result)
}

enum Step {
    Cancelled,
    Done(io::Result<usize>),
}

/// Read once, giving up when the shared idle deadline passes without any
/// traffic in either direction.
async fn read_until_idle<R>(
    src: &mut R,
    buf: &mut [u8],
    scope: &CancellationToken,
    idle: &IdleDeadline,
) -> Step
where
    R: AsyncRead + Unpin,
{
    let read = src.read(buf);
    tokio::pin!(read);

    loop {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return Step::Cancelled,
            result = &mut read => return Step::Done(result),
            _ = tokio::time::sleep_until(idle.deadline()) => {
                if idle.expired() {
                    return Step::Done(Err(idle_error(idle.window)));
                }
                // The other direction moved data; wait out the new deadline
            }
        }
    }
}

fn idle_error(window: Duration) -> io::Error {
    io::Error::new(
        io::ErrorKind::TimedOut,
        format!("no traffic for {:?}", window),
    )
}
