//! Text-to-Speech client for Kyutai streaming servers.

use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::connection::{spawn_workers, Connection, WorkerContext};
use crate::error::Error;
use crate::messages::{self, Audio, Message, MessageKind, Text};
use crate::ws::WebSocket;
use crate::{endpoint_url, new_session_id, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONNECT_TIMEOUT};
use crate::TTS_PATH;

/// Events emitted by a TTS connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TtsEvent {
    /// The server is ready.
    Ready,
    /// Text echo from server, with its position in the audio when known.
    Text {
        /// The synthesized text.
        text: String,
        /// Start time in seconds.
        start_s: Option<f64>,
        /// Stop time in seconds.
        stop_s: Option<f64>,
    },
    /// Synthesized audio chunk.
    Audio {
        /// Mono float32 PCM at [`crate::SAMPLE_RATE`].
        pcm: Vec<f32>,
    },
}

/// Configuration for the TTS client.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// API key for authentication.
    pub api_key: String,
    /// Voice to use for synthesis, server default when unset.
    pub voice: Option<String>,
    /// Capacity of the input and event queues.
    pub channel_capacity: usize,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Overall deadline for a connection, none by default.
    pub deadline: Option<Duration>,
}

impl TtsConfig {
    /// Creates a new TTS configuration with the server default voice.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            voice: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            deadline: None,
        }
    }

    /// Sets the voice.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = Some(voice.into());
        self
    }

    /// Sets the queue capacity.
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the handshake timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets the connection deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// A TTS connection: submit words, receive audio.
pub type TtsConnection = Connection<String, TtsEvent>;

/// Text-to-Speech client.
#[derive(Debug, Clone)]
pub struct TtsClient {
    config: TtsConfig,
    url: Url,
}

impl TtsClient {
    /// Creates a new TTS client, resolving the streaming endpoint URL.
    pub fn new(config: TtsConfig) -> Result<Self, Error> {
        let url = endpoint_url(&config.url, TTS_PATH, config.voice.as_deref())?;
        Ok(Self { config, url })
    }

    /// Returns the resolved endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Opens a new connection.
    pub async fn connect(&self) -> Result<TtsConnection, Error> {
        self.connect_with_cancel(CancellationToken::new()).await
    }

    /// Opens a new connection whose workers stop when `parent` is cancelled.
    pub async fn connect_with_cancel(
        &self,
        parent: CancellationToken,
    ) -> Result<TtsConnection, Error> {
        let session_id = new_session_id();
        info!(session_id = %session_id, "TTS connecting");

        let ws = WebSocket::connect(&self.url, &self.config.api_key, self.config.connect_timeout)
            .await?;
        let ctx = WorkerContext::new(ws, parent.child_token(), session_id.clone());

        let capacity = self.config.channel_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let workers = spawn_workers(
            ctx.clone(),
            self.config.deadline,
            writer(ctx.clone(), input_rx),
            reader(ctx.clone(), event_tx),
        );

        info!(session_id = %session_id, "TTS connected");
        Ok(Connection::new(session_id, input_tx, event_rx, ctx.cancel, workers))
    }
}

/// Sends each submitted word as a Text message, then Eos once input ends.
async fn writer(ctx: WorkerContext, mut input: mpsc::Receiver<String>) -> Result<(), Error> {
    loop {
        let next = tokio::select! {
            next = input.recv() => next,
            // Nothing left to talk to once the server ended the stream.
            _ = ctx.stream_ended.cancelled() => return Ok(()),
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };
        match next {
            Some(text) => {
                debug!(session_id = %ctx.session_id, text = %text, "Sending TTS text");
                ctx.send(&Message::Text(Text::new(text))).await?;
            }
            None => {
                debug!(session_id = %ctx.session_id, "Sending TTS EOS");
                return ctx.send(&Message::Eos).await;
            }
        }
    }
}

/// Forwards server messages until the server closes the connection.
async fn reader(ctx: WorkerContext, events: mpsc::Sender<TtsEvent>) -> Result<(), Error> {
    loop {
        let Some(payload) = ctx.recv().await? else {
            info!(session_id = %ctx.session_id, "TTS end of stream");
            return Ok(());
        };
        let kind = messages::decode_header(&payload)?;
        let event = match messages::decode_body(kind, &payload)? {
            Message::Ready => {
                info!(session_id = %ctx.session_id, "TTS ready");
                TtsEvent::Ready
            }
            Message::Text(Text {
                text,
                start_s,
                stop_s,
            }) => {
                debug!(session_id = %ctx.session_id, text = %text, "TTS text echo");
                TtsEvent::Text {
                    text,
                    start_s,
                    stop_s,
                }
            }
            Message::Audio(Audio { pcm }) => {
                debug!(session_id = %ctx.session_id, samples = pcm.len(), "TTS audio chunk received");
                TtsEvent::Audio { pcm }
            }
            Message::Eos => {
                debug!(session_id = %ctx.session_id, "TTS ignoring server EOS");
                continue;
            }
            Message::Error(err) => {
                error!(session_id = %ctx.session_id, message = %err.message, "TTS error");
                return Err(Error::Server {
                    message: err.message,
                });
            }
            other => return Err(unexpected(other.kind())),
        };
        ctx.publish(&events, event).await?;
    }
}

fn unexpected(kind: MessageKind) -> Error {
    Error::UnexpectedMessage(format!("{kind} message on the TTS endpoint"))
}
