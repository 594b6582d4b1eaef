//! Duplex frame channel a [`Session`](crate::session::Session) is built on.
//!
//! A [`Transport`] is a pair of boxed halves: a [`Sink`] of outgoing
//! [`Frame`]s and a [`Stream`] of incoming ones. Adapters exist for the axum
//! server socket, the tokio-tungstenite client socket, and an in-memory pair
//! driven by a [`MemoryPeer`].

use std::{io, net::SocketAddr, pin::Pin};

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt, channel::mpsc, future};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{self, Message as WsMessage},
};

use crate::message::ChatMessage;

/// The two frame kinds the relay cares about. Pings, pongs and binary
/// frames are answered or discarded by the adapters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error("server websocket error: {0}")]
    Server(#[from] axum::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("transport closed")]
    Closed,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

pub struct Transport {
    sink: FrameSink,
    stream: FrameStream,
    peer: Option<SocketAddr>,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Frame, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<Frame, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            peer: None,
        }
    }

    /// Wraps a socket accepted by the axum upgrade handler.
    pub fn from_axum(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(frame_to_axum(frame))));
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(AxumMessage::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(AxumMessage::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::from(err))),
            })
        });
        Self::new(sink, stream)
    }

    /// Wraps a client socket established with tokio-tungstenite.
    pub fn from_tungstenite<S>(socket: WebSocketStream<S>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(frame_to_tungstenite(frame))));
        let stream = stream.filter_map(|item| {
            future::ready(match item {
                Ok(WsMessage::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(WsMessage::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => None,
                Err(err) => Some(Err(TransportError::from(err))),
            })
        });
        Self::new(sink, stream)
    }

    /// Creates a transport whose far end is driven in-process.
    pub fn in_memory() -> (Self, MemoryPeer) {
        let (to_session, session_rx) = mpsc::unbounded();
        let (session_tx, from_session) = mpsc::unbounded();
        let sink = session_tx.sink_map_err(|_| TransportError::Closed);
        let transport = Self::new(sink, session_rx);
        (
            transport,
            MemoryPeer {
                to_session,
                from_session,
            },
        )
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub(crate) fn into_parts(self) -> (FrameSink, FrameStream) {
        (self.sink, self.stream)
    }
}

fn frame_to_axum(frame: Frame) -> AxumMessage {
    match frame {
        Frame::Text(text) => AxumMessage::Text(text),
        Frame::Close => AxumMessage::Close(None),
    }
}

fn frame_to_tungstenite(frame: Frame) -> WsMessage {
    match frame {
        Frame::Text(text) => WsMessage::Text(text),
        Frame::Close => WsMessage::Close(None),
    }
}

/// Far end of an in-memory [`Transport`].
///
/// Frames pushed here are what the session reads; frames the session writes
/// come out of [`MemoryPeer::next_frame`]. Dropping the peer ends the
/// session's input stream.
pub struct MemoryPeer {
    to_session: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    from_session: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    pub fn send_text(&self, text: impl Into<String>) {
        self.push(Ok(Frame::Text(text.into())));
    }

    pub fn send_message(&self, message: &ChatMessage) {
        self.send_text(message.encode());
    }

    pub fn send_close(&self) {
        self.push(Ok(Frame::Close));
    }

    /// Makes the session's next read fail with `error`.
    pub fn fail(&self, error: TransportError) {
        self.push(Err(error));
    }

    /// Stops accepting frames, so every later session write fails.
    pub fn refuse_writes(&mut self) {
        self.from_session.close();
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.from_session.next().await
    }

    /// Returns a frame only if one is already buffered.
    pub fn try_next_frame(&mut self) -> Option<Frame> {
        self.from_session.next().now_or_never().flatten()
    }

    fn push(&self, item: Result<Frame, TransportError>) {
        // The session may already have dropped its reader.
        let _ = self.to_session.unbounded_send(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_transport_carries_frames_both_ways() {
        let (transport, mut peer) = Transport::in_memory();
        let (mut sink, mut stream) = transport.into_parts();

        peer.send_text("ping");
        let read = stream.next().await.expect("frame").expect("ok frame");
        assert_eq!(read, Frame::Text("ping".into()));

        sink.send(Frame::Close).await.expect("write close");
        assert_eq!(peer.next_frame().await, Some(Frame::Close));
    }

    #[tokio::test]
    async fn refused_writes_surface_as_errors() {
        let (transport, mut peer) = Transport::in_memory();
        let (mut sink, _stream) = transport.into_parts();

        peer.refuse_writes();
        let result = sink.send(Frame::Text("lost".into())).await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn dropping_peer_ends_stream() {
        let (transport, peer) = Transport::in_memory();
        let (_sink, mut stream) = transport.into_parts();

        drop(peer);
        assert!(stream.next().await.is_none());
    }
}
