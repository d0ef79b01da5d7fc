//! WebSocket connection wrapper.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{frame::CloseFrame, Message};
use tokio_tungstenite::tungstenite::{self, error::ProtocolError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use url::Url;

use crate::error::Error;
use crate::API_KEY_HEADER;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket connection wrapper.
///
/// The write and read halves are locked independently so that one task can
/// write while another one reads.
pub struct WebSocket {
    write: Mutex<SplitSink<WsStream, Message>>,
    read: Mutex<SplitStream<WsStream>>,
}

impl WebSocket {
    /// Opens a new WebSocket connection to the given URL with the provided API key.
    pub async fn connect(url: &Url, api_key: &str, conn_timeout: Duration) -> Result<Self, Error> {
        info!(url = %url, "WebSocket connecting");

        let mut request = url.as_str().into_client_request().map_err(Error::Dial)?;
        if !api_key.is_empty() {
            request
                .headers_mut()
                .insert(API_KEY_HEADER, HeaderValue::from_str(api_key)?);
        }

        let (ws_stream, _) = timeout(conn_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| Error::ConnectionTimeout)?
            .map_err(Error::Dial)?;

        info!(url = %url, "WebSocket connected");

        let (write, read) = ws_stream.split();

        Ok(Self {
            write: Mutex::new(write),
            read: Mutex::new(read),
        })
    }

    /// Sends a binary message.
    pub async fn send_binary(&self, data: Vec<u8>) -> Result<(), Error> {
        let mut writer = self.write.lock().await;
        writer.send(Message::Binary(data)).await.map_err(Error::Transport)
    }

    /// Receives the next binary message.
    ///
    /// Returns `Ok(None)` when the server closed the connection gracefully.
    /// Control frames are skipped; text messages are a protocol error.
    pub async fn recv_binary(&self) -> Result<Option<Vec<u8>>, Error> {
        let mut reader = self.read.lock().await;
        loop {
            let msg = match reader.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(Error::Transport(e)),
                None => return Err(Error::Transport(tungstenite::Error::ConnectionClosed)),
            };
            match msg {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Text(text) => {
                    return Err(Error::UnexpectedMessage(format!("websocket text message: {text}")))
                }
                Message::Close(None) => {
                    debug!("WebSocket received close without status");
                    return Ok(None);
                }
                Message::Close(Some(frame)) if frame.code == CloseCode::Normal => {
                    debug!(reason = %frame.reason, "WebSocket received normal close");
                    return Ok(None);
                }
                Message::Close(Some(frame)) => {
                    return Err(Error::RemoteClosed {
                        code: frame.code.into(),
                        reason: frame.reason.into_owned(),
                    })
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                    debug!("WebSocket received control frame");
                }
            }
        }
    }

    /// Closes the WebSocket connection with the given status code.
    pub async fn close(&self, code: CloseCode) -> Result<(), Error> {
        info!(code = %code, "WebSocket closing");
        let mut writer = self.write.lock().await;
        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(""),
        };
        let sent = writer.send(Message::Close(Some(frame))).await;
        let closed = writer.close().await;
        info!("WebSocket closed");
        sent.and(closed).map_err(Error::Transport)
    }
}

/// Returns true for errors raised by closing a connection the peer already
/// tore down.
pub(crate) fn is_closed_race(err: &Error) -> bool {
    match err {
        Error::Transport(tungstenite::Error::ConnectionClosed)
        | Error::Transport(tungstenite::Error::AlreadyClosed)
        | Error::Transport(tungstenite::Error::Protocol(ProtocolError::SendAfterClosing))
        | Error::Transport(tungstenite::Error::Protocol(
            ProtocolError::ResetWithoutClosingHandshake,
        )) => true,
        Error::Transport(tungstenite::Error::Io(e)) => matches!(
            e.kind(),
            ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}
