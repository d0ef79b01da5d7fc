//! Error types for the Kyutai streaming client library.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Error type for Kyutai client operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The server URL could not be parsed.
    #[error("invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The API key cannot be carried in an HTTP header.
    #[error("invalid API key header value")]
    InvalidApiKey(#[from] tungstenite::http::header::InvalidHeaderValue),

    /// The WebSocket handshake failed.
    #[error("failed to dial websocket: {0}")]
    Dial(#[source] tungstenite::Error),

    /// Connection timeout.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// WebSocket transport failure after the connection was established.
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),

    /// The server closed the connection with a non-normal status.
    #[error("server closed the connection: {code} {reason}")]
    RemoteClosed {
        /// Close status code.
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// A message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// A message could not be decoded.
    #[error("failed to decode message: {0}")]
    Decode(#[from] DecodeError),

    /// The server sent something this endpoint does not accept.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// Server returned an error.
    #[error("Server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Input was submitted after `finish()`.
    #[error("Client is stopping")]
    Stopping,

    /// The connection workers are gone and no longer accept input.
    #[error("Channel send error")]
    ChannelSend,

    /// The connection scope was cancelled.
    #[error("connection cancelled")]
    Cancelled,

    /// The connection deadline elapsed.
    #[error("connection deadline exceeded")]
    DeadlineExceeded,

    /// The worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Returns true for outcomes caused by cancellation or a deadline
    /// rather than by a failure of the connection itself.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }
}

/// Error decoding a wire message.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The message is not a MessagePack map.
    #[error("message is not a map")]
    NotAMap,

    /// The discriminator is not a known message type.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// The bytes do not match the expected shape.
    #[error("malformed message: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),

    /// Bytes remain after a complete message.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}
