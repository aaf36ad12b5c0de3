//! # WebSocket Transport
//!
//! Production [`Connector`] over a TLS WebSocket.
//!
//! The upgrade request carries the configured `Origin` header, which the
//! servers require. After the handshake the stream is split so reads and
//! writes proceed independently.
//!
//! Close classification follows what the lifecycle needs to know:
//! a close frame with code `Normal` or `Away` is an expected close, any
//! other close code or an I/O or protocol failure is a mid-session drop,
//! and everything else is treated as a one-off read failure.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, instrument, trace};

use crate::error::{ProtocolError, Result};
use crate::transport::{Connector, ReadError, SocketReader, SocketWriter, WireFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens TLS WebSocket connections
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    #[instrument(skip(self))]
    async fn connect(
        &self,
        endpoint: &str,
        origin: &str,
    ) -> Result<(Box<dyn SocketWriter>, Box<dyn SocketReader>)> {
        let mut request = endpoint
            .into_client_request()
            .map_err(|e| ProtocolError::TransportError(format!("invalid endpoint {endpoint}: {e}")))?;

        let origin = HeaderValue::from_str(origin)
            .map_err(|e| ProtocolError::ConfigError(format!("invalid origin header: {e}")))?;
        request.headers_mut().insert(ORIGIN, origin);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ProtocolError::TransportError(format!("websocket handshake failed: {e}")))?;
        debug!(status = %response.status(), "WebSocket upgraded");

        let (sink, stream) = stream.split();
        Ok((
            Box::new(WebSocketWriter { sink }),
            Box::new(WebSocketReader { stream }),
        ))
    }
}

/// Write half of a WebSocket
pub struct WebSocketWriter {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketWriter for WebSocketWriter {
    async fn write(&mut self, frame: WireFrame) -> Result<()> {
        let message = match frame {
            WireFrame::Text(text) => Message::text(text),
            WireFrame::Binary(data) => Message::binary(data),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| ProtocolError::SendFailure(e.to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| ProtocolError::TransportError(e.to_string()))
    }
}

/// Read half of a WebSocket
pub struct WebSocketReader {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl SocketReader for WebSocketReader {
    async fn read(&mut self) -> std::result::Result<WireFrame, ReadError> {
        loop {
            let message = match self.stream.next().await {
                Some(Ok(message)) => message,
                Some(Err(e)) => return Err(classify_error(e)),
                None => return Err(ReadError::Unexpected("stream ended without close frame".into())),
            };

            match message {
                Message::Text(text) => return Ok(WireFrame::Text(text.as_str().to_owned())),
                Message::Binary(data) => return Ok(WireFrame::Binary(data)),
                Message::Close(frame) => {
                    return match frame {
                        None => Err(ReadError::Closed),
                        Some(frame) if matches!(frame.code, CloseCode::Normal | CloseCode::Away) => {
                            Err(ReadError::Closed)
                        }
                        Some(frame) => Err(ReadError::Unexpected(format!(
                            "close code {}: {}",
                            u16::from(frame.code),
                            frame.reason.as_str()
                        ))),
                    };
                }
                // control frames are answered by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    trace!("Skipping control frame");
                }
            }
        }
    }
}

fn classify_error(error: WsError) -> ReadError {
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => ReadError::Closed,
        WsError::Io(e) => ReadError::Unexpected(e.to_string()),
        WsError::Protocol(e) => ReadError::Unexpected(e.to_string()),
        other => ReadError::Transient(other.to_string()),
    }
}
