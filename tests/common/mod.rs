//! In-process mock Kyutai server for integration tests.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use kyutai_streaming::messages::{self, Message};
use std::future::Future;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

pub type ServerStream = WebSocketStream<TcpStream>;

/// What the client sent during the handshake.
#[derive(Debug)]
pub struct Handshake {
    pub path: String,
    pub query: Option<String>,
    pub api_key: Option<String>,
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();
}

/// Accepts a single WebSocket client and runs `handler` on it.
///
/// Returns the base URL to connect to, the handshake details and the
/// handler task.
pub async fn serve<F, Fut>(
    handler: F,
) -> (String, oneshot::Receiver<Handshake>, JoinHandle<Fut::Output>)
where
    F: FnOnce(ServerStream) -> Fut + Send + 'static,
    Fut: Future + Send + 'static,
    Fut::Output: Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (handshake_tx, handshake_rx) = oneshot::channel();

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let _ = handshake_tx.send(Handshake {
                    path: req.uri().path().to_string(),
                    query: req.uri().query().map(str::to_string),
                    api_key: req
                        .headers()
                        .get(kyutai_streaming::API_KEY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string),
                });
                Ok(resp)
            },
        )
        .await
        .unwrap();
        handler(ws).await
    });

    (format!("ws://{addr}"), handshake_rx, handle)
}

pub async fn send(ws: &mut ServerStream, msg: &Message) {
    ws.send(WsMessage::Binary(messages::encode(msg).unwrap()))
        .await
        .unwrap();
}

/// How the client side of a connection ended.
#[derive(Debug, PartialEq)]
pub enum Ending {
    Closed(Option<CloseCode>),
    Dropped,
}

/// Receives the next protocol message, or how the client went away.
pub async fn recv(ws: &mut ServerStream) -> Result<Message, Ending> {
    loop {
        match ws.next().await {
            Some(Ok(WsMessage::Binary(data))) => return Ok(messages::decode(&data).unwrap()),
            Some(Ok(WsMessage::Close(frame))) => return Err(Ending::Closed(frame.map(|f| f.code))),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return Err(Ending::Dropped),
        }
    }
}

/// Discards everything until the client goes away.
pub async fn wait_end(ws: &mut ServerStream) -> Ending {
    loop {
        if let Err(ending) = recv(ws).await {
            return ending;
        }
    }
}
