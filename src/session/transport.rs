//! Adapters from concrete WebSocket transports to [`FrameSink`] / [`FrameStream`].
//!
//! Outbound sessions run on `tokio-tungstenite`, inbound sessions on axum's
//! WebSocket. Both end up as the same pair of halves so the rest of the
//! crate never sees either library's message type.

use std::io;

use async_trait::async_trait;
use axum::extract::ws::{self as axum_ws, WebSocket};
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use super::{CloseReason, Frame, FrameSink, FrameStream, TransportError};

/// Classify a tungstenite error.
pub fn classify_tungstenite(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::Closing
        }
        tungstenite::Error::Protocol(ProtocolError::SendAfterClosing) => TransportError::Closing,
        tungstenite::Error::Io(e) => classify_io(&e),
        other => TransportError::Fatal(other.to_string()),
    }
}

/// Classify a raw I/O error.
pub fn classify_io(err: &io::Error) -> TransportError {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            TransportError::Transient(err.to_string())
        }
        _ => TransportError::Fatal(err.to_string()),
    }
}

/// Classify an axum WebSocket error by unwrapping the tungstenite error inside.
pub fn classify_axum(err: axum::Error) -> TransportError {
    match err.into_inner().downcast::<tungstenite::Error>() {
        Ok(inner) => classify_tungstenite(*inner),
        Err(other) => match other.downcast::<io::Error>() {
            Ok(io_err) => classify_io(&io_err),
            Err(other) => TransportError::Fatal(other.to_string()),
        },
    }
}

fn into_tungstenite(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(data) => Message::Binary(data.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    }
}

fn from_tungstenite(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
        Message::Ping(data) => Some(Frame::Ping(data.to_vec())),
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(frame) => Some(Frame::Close(frame.map(|f| {
            CloseReason::new(u16::from(f.code), f.reason.as_str())
        }))),
        // Raw frames only appear when writing.
        Message::Frame(_) => None,
    }
}

fn into_axum(frame: Frame) -> axum_ws::Message {
    match frame {
        Frame::Text(text) => axum_ws::Message::Text(text.into()),
        Frame::Binary(data) => axum_ws::Message::Binary(data.into()),
        Frame::Ping(data) => axum_ws::Message::Ping(data.into()),
        Frame::Pong(data) => axum_ws::Message::Pong(data.into()),
        Frame::Close(reason) => axum_ws::Message::Close(reason.map(|r| axum_ws::CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

fn from_axum(message: axum_ws::Message) -> Frame {
    match message {
        axum_ws::Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        axum_ws::Message::Binary(data) => Frame::Binary(data.to_vec()),
        axum_ws::Message::Ping(data) => Frame::Ping(data.to_vec()),
        axum_ws::Message::Pong(data) => Frame::Pong(data.to_vec()),
        axum_ws::Message::Close(frame) => {
            Frame::Close(frame.map(|f| CloseReason::new(f.code, f.reason.as_str())))
        }
    }
}

/// Write half of a tokio-tungstenite stream.
pub struct TungsteniteSink<S> {
    inner: S,
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner
            .send(into_tungstenite(frame))
            .await
            .map_err(classify_tungstenite)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(classify_tungstenite)
    }
}

/// Write half of an axum WebSocket.
pub struct AxumSink<S> {
    inner: S,
}

#[async_trait]
impl<S> FrameSink for AxumSink<S>
where
    S: Sink<axum_ws::Message, Error = axum::Error> + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Frame) -> Result<(), TransportError> {
        self.inner
            .send(into_axum(frame))
            .await
            .map_err(classify_axum)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await.map_err(classify_axum)
    }
}

/// Split a dialed tokio-tungstenite stream into crate halves.
pub fn split_tungstenite<T>(ws: WebSocketStream<T>) -> (Box<dyn FrameSink>, FrameStream)
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let stream = stream
        .filter_map(|item| async move {
            match item {
                Ok(message) => from_tungstenite(message).map(Ok),
                Err(e) => Some(Err(classify_tungstenite(e))),
            }
        })
        .boxed();
    (Box::new(TungsteniteSink { inner: sink }), stream)
}

/// Split an accepted axum WebSocket into crate halves.
pub fn split_axum(ws: WebSocket) -> (Box<dyn FrameSink>, FrameStream) {
    let (sink, stream) = ws.split();
    let stream = stream
        .map(|item| item.map(from_axum).map_err(classify_axum))
        .boxed();
    (Box::new(AxumSink { inner: sink }), stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_connections_are_benign() {
        assert_eq!(
            classify_tungstenite(tungstenite::Error::ConnectionClosed),
            TransportError::Closing
        );
        assert_eq!(
            classify_tungstenite(tungstenite::Error::AlreadyClosed),
            TransportError::Closing
        );
        assert_eq!(
            classify_tungstenite(tungstenite::Error::Protocol(
                ProtocolError::SendAfterClosing
            )),
            TransportError::Closing
        );
    }

    #[test]
    fn timeouts_are_transient_and_resets_fatal() {
        let timeout = io::Error::new(io::ErrorKind::TimedOut, "deadline");
        assert!(matches!(
            classify_tungstenite(tungstenite::Error::Io(timeout)),
            TransportError::Transient(_)
        ));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(
            classify_tungstenite(tungstenite::Error::Io(reset)),
            TransportError::Fatal(_)
        ));
    }

    #[test]
    fn close_codes_survive_conversion() {
        let frame = Frame::Close(Some(CloseReason::new(1008, "full")));
        let message = into_tungstenite(frame.clone());
        assert_eq!(from_tungstenite(message), Some(frame.clone()));
        assert_eq!(from_axum(into_axum(frame.clone())), frame);
    }
}
