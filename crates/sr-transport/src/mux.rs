//! Multiplexed session over a single tunnel transport
//!
//! A yamux [`Connection`](yamux::Connection) only makes progress while it is
//! polled, and it cannot be shared. [`MuxSession`] therefore moves the
//! connection into a driver task and exposes a cloneable handle:
//!
//! - `open_stream()` sends a request to the driver, which opens an outbound
//!   stream (the relay always acts as the initiator). The stream is announced
//!   to the peer right away, so protocols where the server speaks first work.
//! - Inbound streams are delivered through [`Incoming`] (used by the agent).
//! - `closed()` resolves once the driver stops, i.e. when the physical
//!   transport died or the session was closed locally.

use std::collections::VecDeque;
use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt as _};
use tokio::sync::{mpsc, oneshot};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;

/// A logical stream, adapted to tokio's I/O traits
pub type MuxStream = Compat<yamux::Stream>;

/// Upper bound on the graceful close handshake with the peer
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue depth for pending open requests
const OPEN_REQUEST_CAPACITY: usize = 64;

type OpenReply = oneshot::Sender<Result<yamux::Stream, yamux::ConnectionError>>;

/// Something that can open logical streams and report when it has died.
///
/// The listener manager only needs this much from a multiplexed session.
#[async_trait]
pub trait StreamOpener: Send + Sync {
    /// The stream type produced
    type Stream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static;

    /// Open a new logical stream towards the peer
    async fn open_stream(&self) -> Result<Self::Stream, TransportError>;

    /// Resolve once the session can no longer open streams
    async fn closed(&self);
}

/// Handle to a yamux session running in its own task
#[derive(Clone)]
pub struct MuxSession {
    open_tx: mpsc::Sender<OpenReply>,
    /// Cancelled to request a graceful close
    shutdown: CancellationToken,
    /// Cancelled by the driver when it exits
    closed: CancellationToken,
}

/// Inbound streams opened by the peer
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<yamux::Stream>,
}

impl Incoming {
    /// Wait for the next stream the peer opens.
    ///
    /// Returns `None` once the session has ended.
    pub async fn accept(&mut self) -> Option<MuxStream> {
        self.rx.recv().await.map(FuturesAsyncReadCompatExt::compat)
    }
}

impl MuxSession {
    /// Start a session over `socket` in the given role.
    ///
    /// Must be called from within a tokio runtime; the driver is spawned
    /// immediately.
    pub fn new<T>(socket: T, mode: yamux::Mode) -> (Self, Incoming)
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let connection = yamux::Connection::new(socket, yamux::Config::default(), mode);
        let (open_tx, open_rx) = mpsc::channel(OPEN_REQUEST_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let closed = CancellationToken::new();

        tokio::spawn(drive(
            connection,
            open_rx,
            inbound_tx,
            shutdown.clone(),
            closed.clone(),
        ));

        let session = Self {
            open_tx,
            shutdown,
            closed,
        };
        (session, Incoming { rx: inbound_rx })
    }

    /// Start a session in the initiator role (the relay side)
    pub fn client<T>(socket: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(socket, yamux::Mode::Client).0
    }

    /// Open a new outbound stream
    pub async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.open_tx
            .send(reply_tx)
            .await
            .map_err(|_| TransportError::SessionClosed)?;

        match reply_rx.await {
            Ok(Ok(mut stream)) => {
                // yamux defers the SYN to the first data frame; an empty
                // write sends it now so the peer can accept immediately
                stream.write(&[]).await?;
                Ok(stream.compat())
            }
            Ok(Err(e)) => Err(TransportError::Mux(e)),
            Err(_) => Err(TransportError::SessionClosed),
        }
    }

    /// Close the session and the transport underneath it.
    ///
    /// Waits for the driver to finish; calling it more than once is harmless.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.closed.cancelled().await;
    }

    /// Resolve once the session has ended
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl StreamOpener for MuxSession {
    type Stream = MuxStream;

    async fn open_stream(&self) -> Result<MuxStream, TransportError> {
        MuxSession::open_stream(self).await
    }

    async fn closed(&self) {
        MuxSession::closed(self).await
    }
}

/// Why the driver loop stopped
enum Exit {
    /// The peer closed the connection
    Ended,
    /// The connection failed
    Failed(yamux::ConnectionError),
    /// Every handle was dropped
    Abandoned,
}

async fn drive<T>(
    mut connection: yamux::Connection<T>,
    mut open_rx: mpsc::Receiver<OpenReply>,
    inbound_tx: mpsc::UnboundedSender<yamux::Stream>,
    shutdown: CancellationToken,
    closed: CancellationToken,
) where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut pending: VecDeque<OpenReply> = VecDeque::new();

    let exit = tokio::select! {
        exit = poll_fn(|cx| poll_connection(&mut connection, cx, &mut open_rx, &mut pending, &inbound_tx)) => Some(exit),
        _ = shutdown.cancelled() => None,
    };

    let close_locally = match exit {
        Some(Exit::Ended) => {
            tracing::debug!("Multiplexed session ended by peer");
            false
        }
        Some(Exit::Failed(e)) => {
            tracing::debug!("Multiplexed session failed: {}", e);
            false
        }
        Some(Exit::Abandoned) => {
            tracing::debug!("Multiplexed session abandoned, closing");
            true
        }
        None => true,
    };

    if close_locally {
        match tokio::time::timeout(CLOSE_TIMEOUT, poll_fn(|cx| connection.poll_close(cx))).await {
            Ok(Ok(())) => tracing::debug!("Multiplexed session closed"),
            Ok(Err(e)) => tracing::debug!("Error closing multiplexed session: {}", e),
            Err(_) => tracing::warn!("Timed out closing multiplexed session"),
        }
    }

    // Dropping the queued replies fails their open requests
    drop(pending);
    closed.cancel();
}

fn poll_connection<T>(
    connection: &mut yamux::Connection<T>,
    cx: &mut Context<'_>,
    open_rx: &mut mpsc::Receiver<OpenReply>,
    pending: &mut VecDeque<OpenReply>,
    inbound_tx: &mpsc::UnboundedSender<yamux::Stream>,
) -> Poll<Exit>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        match open_rx.poll_recv(cx) {
            Poll::Ready(Some(reply)) => pending.push_back(reply),
            Poll::Ready(None) => {
                if pending.is_empty() {
                    return Poll::Ready(Exit::Abandoned);
                }
                break;
            }
            Poll::Pending => break,
        }
    }

    while !pending.is_empty() {
        match connection.poll_new_outbound(cx) {
            Poll::Ready(result) => {
                if let Some(reply) = pending.pop_front() {
                    // The requester may have given up; the stream is then dropped
                    let _ = reply.send(result);
                }
            }
            Poll::Pending => break,
        }
    }

    loop {
        match connection.poll_next_inbound(cx) {
            Poll::Ready(Some(Ok(stream))) => {
                if inbound_tx.send(stream).is_err() {
                    tracing::trace!("Dropping inbound stream, nobody is accepting");
                }
            }
            Poll::Ready(Some(Err(e))) => return Poll::Ready(Exit::Failed(e)),
            Poll::Ready(None) => return Poll::Ready(Exit::Ended),
            Poll::Pending => return Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::compat::TokioAsyncReadCompatExt;

    fn session_pair() -> (MuxSession, (MuxSession, Incoming)) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let client = MuxSession::client(a.compat());
        let server = MuxSession::new(b.compat(), yamux::Mode::Server);
        (client, server)
    }

    #[tokio::test]
    async fn test_open_and_accept_stream() {
        let (client, (_server, mut incoming)) = session_pair();

        let mut outbound = client.open_stream().await.unwrap();
        outbound.write_all(b"hello").await.unwrap();
        outbound.flush().await.unwrap();

        let mut inbound = incoming.accept().await.expect("stream");
        let mut buf = [0u8; 5];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        inbound.write_all(b"world").await.unwrap();
        inbound.flush().await.unwrap();
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_peer_accepts_before_any_data() {
        let (client, (_server, mut incoming)) = session_pair();

        let mut outbound = client.open_stream().await.unwrap();

        // Nothing was written by the opener; the peer still sees the stream
        let mut inbound = tokio::time::timeout(Duration::from_secs(5), incoming.accept())
            .await
            .expect("stream should be announced on open")
            .expect("stream");

        inbound.write_all(b"220 ready\r\n").await.unwrap();
        inbound.flush().await.unwrap();

        let mut buf = [0u8; 11];
        outbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"220 ready\r\n");
    }

    #[tokio::test]
    async fn test_streams_are_independent() {
        let (client, (_server, mut incoming)) = session_pair();

        let mut first = client.open_stream().await.unwrap();
        let mut second = client.open_stream().await.unwrap();
        first.write_all(b"one").await.unwrap();
        first.flush().await.unwrap();
        second.write_all(b"two").await.unwrap();
        second.flush().await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let mut stream = incoming.accept().await.expect("stream");
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await.unwrap();
            seen.push(buf.to_vec());
        }
        seen.sort();
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_close_is_observed_by_peer() {
        let (client, (server, _incoming)) = session_pair();

        client.close().await;
        assert!(client.is_closed());

        tokio::time::timeout(Duration::from_secs(5), server.closed())
            .await
            .expect("peer should observe close");
        assert!(server.open_stream().await.is_err());
    }

    #[tokio::test]
    async fn test_transport_loss_closes_session() {
        let (a, b) = tokio::io::duplex(1024);
        let session = MuxSession::client(a.compat());
        drop(b);

        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("session should end with its transport");
        assert!(matches!(
            session.open_stream().await,
            Err(TransportError::SessionClosed)
                | Err(TransportError::Mux(_))
                | Err(TransportError::Io(_))
        ));
    }
}
