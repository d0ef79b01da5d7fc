//! Speech-to-Text client for Kyutai streaming servers.
//!
//! Audio is sent in frames of [`FRAME_SIZE`] samples, preceded by one second
//! of silence. Once the caller finishes, the writer pads the last frame,
//! sends a marker with the reserved [`DRAIN_MARKER_ID`] and keeps sending
//! silence until the reader sees that marker come back. The reader then
//! drops `Step` messages until the server reports an empty buffer, which
//! ends the stream.

use futures_util::Stream;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::connection::{spawn_workers, Connection, WorkerContext};
use crate::error::Error;
use crate::framing::{Framer, ONE_SECOND_OF_SILENCE, SAMPLES_PER_SECOND};
use crate::messages::{self, Audio, EndWord, Marker, Message, MessageKind, Step, Word};
use crate::ws::WebSocket;
use crate::{endpoint_url, new_session_id, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONNECT_TIMEOUT};
use crate::{DRAIN_MARKER_ID, FRAME_SIZE, STT_PATH};

/// Period of the silence sent while waiting for the drain marker echo.
const DRAIN_SILENCE_PERIOD: Duration = Duration::from_secs(1);

/// Events emitted by an STT connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// The server is ready to receive audio.
    Ready,
    /// A word was recognized.
    Word {
        /// Recognized text.
        text: String,
        /// Start time in seconds.
        start_time: f64,
    },
    /// End of the last recognized word.
    EndWord {
        /// Stop time in seconds.
        stop_time: f64,
    },
    /// A step of the server processing.
    Step {
        /// Step index.
        step_idx: u64,
        /// Pause probabilities, one per prediction horizon.
        prs: Vec<f32>,
        /// Samples received by the server but not processed yet.
        buffered_pcm: u64,
    },
    /// A marker sent with [`SttConnection::send_marker`] came back.
    Marker {
        /// Marker ID.
        id: i64,
    },
}

impl SttEvent {
    /// Audio held by the server, for `Step` events.
    pub fn buffer_delay(&self) -> Option<Duration> {
        match self {
            SttEvent::Step { buffered_pcm, .. } => Some(Duration::from_secs_f64(
                *buffered_pcm as f64 / SAMPLES_PER_SECOND as f64,
            )),
            _ => None,
        }
    }

    /// Position in the audio stream, for `Word` and `EndWord` events.
    pub fn timestamp(&self) -> Option<Duration> {
        match self {
            SttEvent::Word { start_time, .. } => Duration::try_from_secs_f64(*start_time).ok(),
            SttEvent::EndWord { stop_time } => Duration::try_from_secs_f64(*stop_time).ok(),
            _ => None,
        }
    }
}

/// Units accepted by the STT writer.
#[derive(Debug)]
enum SttInput {
    Audio(Vec<f32>),
    Marker(i64),
}

/// Configuration for the STT client.
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Server base URL, e.g. `ws://127.0.0.1:8080`.
    pub url: String,
    /// API key for authentication.
    pub api_key: String,
    /// Capacity of the input and event queues.
    pub channel_capacity: usize,
    /// Timeout for the WebSocket handshake.
    pub connect_timeout: Duration,
    /// Overall deadline for a connection, none by default.
    pub deadline: Option<Duration>,
}

impl SttConfig {
    /// Creates a new STT configuration.
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            deadline: None,
        }
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

/// Speech-to-Text client.
#[derive(Debug, Clone)]
pub struct SttClient {
    config: SttConfig,
    url: Url,
}

impl SttClient {
    /// Creates a new STT client, resolving the streaming endpoint URL.
    pub fn new(config: SttConfig) -> Result<Self, Error> {
        let url = endpoint_url(&config.url, STT_PATH, None)?;
        Ok(Self { config, url })
    }

    /// Returns the resolved endpoint URL.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Opens a new connection.
    pub async fn connect(&self) -> Result<SttConnection, Error> {
        self.connect_with_cancel(CancellationToken::new()).await
    }

    /// Opens a new connection whose workers stop when `parent` is cancelled.
    pub async fn connect_with_cancel(
        &self,
        parent: CancellationToken,
    ) -> Result<SttConnection, Error> {
        let session_id = new_session_id();
        info!(session_id = %session_id, "STT connecting");

        let ws = WebSocket::connect(&self.url, &self.config.api_key, self.config.connect_timeout)
            .await?;
        let ctx = WorkerContext::new(ws, parent.child_token(), session_id.clone());

        let capacity = self.config.channel_capacity.max(1);
        let (input_tx, input_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (flushed_tx, flushed_rx) = oneshot::channel();

        let workers = spawn_workers(
            ctx.clone(),
            self.config.deadline,
            writer(ctx.clone(), input_rx, flushed_rx),
            reader(ctx.clone(), event_tx, flushed_tx),
        );

        info!(session_id = %session_id, "STT connected");
        Ok(SttConnection {
            inner: Connection::new(session_id, input_tx, event_rx, ctx.cancel, workers),
            marker_ids: AtomicI64::new(DRAIN_MARKER_ID),
        })
    }
}

/// An STT connection: submit samples, receive words.
pub struct SttConnection {
    inner: Connection<SttInput, SttEvent>,
    marker_ids: AtomicI64,
}

impl SttConnection {
    /// Returns the short identifier used in logs for this connection.
    pub fn session_id(&self) -> &str {
        self.inner.session_id()
    }

    /// Enqueues a batch of mono float32 samples at [`crate::SAMPLE_RATE`].
    pub async fn submit(&self, pcm: Vec<f32>) -> Result<(), Error> {
        self.inner.submit(SttInput::Audio(pcm)).await
    }

    /// Sends a correlation marker after the audio submitted so far and
    /// returns its ID. The server echoes it as [`SttEvent::Marker`] once the
    /// preceding audio was processed, which makes it a latency probe.
    ///
    /// IDs start at 1; [`DRAIN_MARKER_ID`] is never returned. No ID is used
    /// up after [`SttConnection::finish`]. An ID can still be skipped when the
    /// connection fails while the marker is queued.
    pub async fn send_marker(&self) -> Result<i64, Error> {
        if self.inner.is_finished() {
            return Err(Error::Stopping);
        }
        let id = self.marker_ids.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.submit(SttInput::Marker(id)).await?;
        Ok(id)
    }

    /// Returns true once [`SttConnection::finish`] was called.
    pub fn is_finished(&self) -> bool {
        self.inner.is_finished()
    }

    /// Signals that no more audio will be submitted, which starts the drain.
    pub fn finish(&mut self) {
        self.inner.finish();
    }

    /// Receives the next event, or `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<SttEvent> {
        self.inner.next_event().await
    }

    /// Returns the remaining events as a stream.
    pub fn events(&mut self) -> impl Stream<Item = SttEvent> + '_ {
        self.inner.events()
    }

    /// Cancels the connection scope.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Returns a handle on the connection scope.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    /// Waits until both workers have stopped and returns the terminal result.
    pub async fn done(self) -> Result<(), Error> {
        self.inner.done().await
    }
}

/// Frames the submitted audio, then runs the writer side of the drain.
async fn writer(
    ctx: WorkerContext,
    mut input: mpsc::Receiver<SttInput>,
    mut flushed: oneshot::Receiver<()>,
) -> Result<(), Error> {
    let mut framer = Framer::new(FRAME_SIZE);
    let silence = messages::encode(&Message::Audio(Audio {
        pcm: ONE_SECOND_OF_SILENCE.to_vec(),
    }))?;

    loop {
        let next = tokio::select! {
            next = input.recv() => next,
            // Nothing left to talk to once the server ended the stream.
            _ = ctx.stream_ended.cancelled() => return Ok(()),
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        };
        match next {
            Some(SttInput::Audio(pcm)) => {
                if framer.prime() {
                    debug!(session_id = %ctx.session_id, "Sending STT priming silence");
                    ctx.send_encoded(silence.clone()).await?;
                }
                framer.extend(&pcm);
                while let Some(frame) = framer.next_frame() {
                    ctx.send(&Message::Audio(Audio { pcm: frame })).await?;
                }
            }
            Some(SttInput::Marker(id)) => {
                debug!(session_id = %ctx.session_id, id = id, "Sending STT marker");
                ctx.send(&Message::Marker(Marker { id })).await?;
            }
            None => break,
        }
    }

    let leftover = framer.len();
    if let Some(frame) = framer.flush() {
        debug!(session_id = %ctx.session_id, leftover = leftover, "Sending STT padded last frame");
        ctx.send(&Message::Audio(Audio { pcm: frame })).await?;
    }
    info!(session_id = %ctx.session_id, "Sending STT drain marker");
    ctx.send(&Message::Marker(Marker {
        id: DRAIN_MARKER_ID,
    }))
    .await?;

    let mut ticker = interval_at(Instant::now() + DRAIN_SILENCE_PERIOD, DRAIN_SILENCE_PERIOD);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                debug!(session_id = %ctx.session_id, "Sending STT drain silence");
                ctx.send_encoded(silence.clone()).await?;
            }
            // Either the echo arrived, or the reader is gone and the
            // coordinator takes it from there.
            _ = &mut flushed => return Ok(()),
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Forwards server messages and runs the reader side of the drain.
async fn reader(
    ctx: WorkerContext,
    events: mpsc::Sender<SttEvent>,
    flushed: oneshot::Sender<()>,
) -> Result<(), Error> {
    let mut flushed = Some(flushed);
    let mut draining = false;

    loop {
        let Some(payload) = ctx.recv().await? else {
            info!(session_id = %ctx.session_id, "STT end of stream");
            return Ok(());
        };
        let kind = messages::decode_header(&payload)?;
        let event = match messages::decode_body(kind, &payload)? {
            Message::Ready => {
                info!(session_id = %ctx.session_id, "STT ready");
                SttEvent::Ready
            }
            Message::Word(Word { text, start_time }) => {
                debug!(session_id = %ctx.session_id, text = %text, start = start_time, "STT word");
                SttEvent::Word { text, start_time }
            }
            Message::EndWord(EndWord { stop_time }) => {
                debug!(session_id = %ctx.session_id, stop = stop_time, "STT end word");
                SttEvent::EndWord { stop_time }
            }
            Message::Step(Step {
                step_idx,
                prs,
                buffered_pcm,
            }) => {
                if draining {
                    if buffered_pcm == 0 {
                        info!(session_id = %ctx.session_id, step_idx = step_idx, "STT drained");
                        return Ok(());
                    }
                    debug!(session_id = %ctx.session_id, buffered_pcm = buffered_pcm, "STT draining");
                    continue;
                }
                SttEvent::Step {
                    step_idx,
                    prs,
                    buffered_pcm,
                }
            }
            Message::Marker(Marker { id }) if id == DRAIN_MARKER_ID => {
                match flushed.take() {
                    Some(tx) => {
                        info!(session_id = %ctx.session_id, "STT drain marker received");
                        let _ = tx.send(());
                        draining = true;
                    }
                    None => warn!(session_id = %ctx.session_id, "STT duplicate drain marker"),
                }
                continue;
            }
            Message::Marker(Marker { id }) => {
                debug!(session_id = %ctx.session_id, id = id, "STT marker");
                SttEvent::Marker { id }
            }
            Message::Error(err) => {
                error!(session_id = %ctx.session_id, message = %err.message, "STT error");
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
    Error::UnexpectedMessage(format!("{kind} message on the STT endpoint"))
}
