//! WebSocket byte-stream adapter
//!
//! Agents reach the relay through an HTTP upgrade, so the physical tunnel is a
//! WebSocket carrying binary messages. yamux needs an ordered byte stream, so
//! [`WsConn`] flattens inbound messages into a read buffer and wraps every
//! write into a single binary message.
//!
//! The adapter is generic over the message type so the same code serves the
//! relay (axum's `WebSocket`) and the agent (tokio-tungstenite's
//! `WebSocketStream`).

use std::borrow::Cow;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use futures::io::{AsyncRead, AsyncWrite};
use futures::{Sink, Stream};

/// What a received WebSocket message means for the byte stream
#[derive(Debug)]
pub enum WsPayload {
    /// Bytes to hand to the reader
    Data(Bytes),
    /// Ping/pong and raw frames; the WebSocket layer answers these itself
    Control,
    /// The peer started the closing handshake
    Close,
}

/// A WebSocket message type that can carry tunnel bytes
pub trait WsMessage: Sized {
    /// Classify a received message
    fn into_payload(self) -> WsPayload;

    /// Wrap outgoing bytes in a binary message
    fn binary(data: Vec<u8>) -> Self;

    /// A close message with the normal-closure status code
    fn normal_close() -> Self;
}

impl WsMessage for axum::extract::ws::Message {
    fn into_payload(self) -> WsPayload {
        use axum::extract::ws::Message;

        match self {
            Message::Binary(data) => WsPayload::Data(Bytes::from(data)),
            Message::Text(text) => WsPayload::Data(Bytes::from(text)),
            Message::Ping(_) | Message::Pong(_) => WsPayload::Control,
            Message::Close(_) => WsPayload::Close,
        }
    }

    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn normal_close() -> Self {
        Self::Close(Some(axum::extract::ws::CloseFrame {
            code: axum::extract::ws::close_code::NORMAL,
            reason: Cow::Borrowed(""),
        }))
    }
}

impl WsMessage for tokio_tungstenite::tungstenite::Message {
    fn into_payload(self) -> WsPayload {
        use tokio_tungstenite::tungstenite::Message;

        match self {
            Message::Binary(data) => WsPayload::Data(Bytes::from(data)),
            Message::Text(text) => WsPayload::Data(Bytes::from(text)),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => WsPayload::Control,
            Message::Close(_) => WsPayload::Close,
        }
    }

    fn binary(data: Vec<u8>) -> Self {
        Self::Binary(data)
    }

    fn normal_close() -> Self {
        use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
        use tokio_tungstenite::tungstenite::protocol::CloseFrame;

        Self::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed(""),
        }))
    }
}

/// A WebSocket viewed as a `futures::io` byte stream
///
/// Reads return 0 once the peer sends a close message or the socket ends.
/// Closing the writer sends a normal-closure close message before closing the
/// underlying sink.
pub struct WsConn<S> {
    inner: S,
    /// Unread remainder of the last data message
    pending: Bytes,
    read_closed: bool,
    close_sent: bool,
}

impl<S> WsConn<S> {
    /// Wrap an upgraded WebSocket
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            read_closed: false,
            close_sent: false,
        }
    }
}

fn to_io_error<E>(err: E) -> io::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    io::Error::new(io::ErrorKind::Other, err)
}

impl<S, M, E> AsyncRead for WsConn<S>
where
    S: Stream<Item = Result<M, E>> + Unpin,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        loop {
            if !this.pending.is_empty() {
                let n = buf.len().min(this.pending.len());
                buf[..n].copy_from_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(n));
            }

            if this.read_closed {
                return Poll::Ready(Ok(0));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(message)) => match message.into_payload() {
                    WsPayload::Data(data) => this.pending = data,
                    WsPayload::Control => {}
                    WsPayload::Close => this.read_closed = true,
                },
                Some(Err(err)) => return Poll::Ready(Err(to_io_error(err))),
                None => this.read_closed = true,
            }
        }
    }
}

impl<S, M, E> AsyncWrite for WsConn<S>
where
    S: Stream<Item = Result<M, E>> + Sink<M, Error = E> + Unpin,
    M: WsMessage,
    E: std::error::Error + Send + Sync + 'static,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        ready!(<S as Sink<M>>::poll_ready(Pin::new(&mut this.inner), cx)).map_err(to_io_error)?;
        <S as Sink<M>>::start_send(Pin::new(&mut this.inner), M::binary(buf.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        <S as Sink<M>>::poll_flush(Pin::new(&mut this.inner), cx).map_err(to_io_error)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.close_sent {
            ready!(<S as Sink<M>>::poll_ready(Pin::new(&mut this.inner), cx))
                .map_err(to_io_error)?;
            <S as Sink<M>>::start_send(Pin::new(&mut this.inner), M::normal_close())
                .map_err(to_io_error)?;
            this.close_sent = true;
        }

        <S as Sink<M>>::poll_close(Pin::new(&mut this.inner), cx).map_err(to_io_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::io::DuplexStream;
    use tokio_tungstenite::tungstenite::protocol::Role;
    use tokio_tungstenite::WebSocketStream;

    async fn socket_pair() -> (
        WsConn<WebSocketStream<DuplexStream>>,
        WsConn<WebSocketStream<DuplexStream>>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (WsConn::new(client), WsConn::new(server))
    }

    #[tokio::test]
    async fn test_bytes_cross_in_both_directions() {
        let (mut client, mut server) = socket_pair().await;

        client.write_all(b"ping").await.unwrap();
        client.flush().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        server.flush().await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_large_message_is_read_in_pieces() {
        let (mut client, mut server) = socket_pair().await;

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        client.flush().await.unwrap();

        let mut received = Vec::new();
        let mut chunk = [0u8; 1000];
        while received.len() < payload.len() {
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0 && n <= chunk.len());
            received.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_close_reads_as_end_of_data() {
        let (mut client, mut server) = socket_pair().await;

        client.write_all(b"bye").await.unwrap();
        client.close().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye");

        // Further reads keep reporting end of data
        let mut buf = [0u8; 8];
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
    }

    #[test]
    fn test_tungstenite_message_classification() {
        use tokio_tungstenite::tungstenite::Message;

        assert!(matches!(
            Message::Binary(vec![1, 2]).into_payload(),
            WsPayload::Data(d) if d.as_ref() == [1, 2]
        ));
        assert!(matches!(
            Message::Ping(vec![]).into_payload(),
            WsPayload::Control
        ));
        assert!(matches!(
            <Message as WsMessage>::normal_close().into_payload(),
            WsPayload::Close
        ));
    }

    #[test]
    fn test_axum_normal_close_code() {
        use axum::extract::ws::{close_code, Message};

        match <Message as WsMessage>::normal_close() {
            Message::Close(Some(frame)) => assert_eq!(frame.code, close_code::NORMAL),
            other => panic!("Expected close frame, got {:?}", other),
        }
    }
}
