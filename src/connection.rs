//! Connection lifecycle shared by the TTS and STT endpoints.
//!
//! A connection runs two workers under one cancellation scope: the writer
//! drains the caller input queue onto the socket, the reader drains the
//! socket into the caller event queue. The first failure cancels the scope,
//! and once both workers are done the socket is closed with a status code
//! matching the outcome.

use futures_util::Stream;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::messages::{self, Message};
use crate::ws::{self, WebSocket};

/// What a worker needs to talk to the socket under the shared scope.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub ws: Arc<WebSocket>,
    pub cancel: CancellationToken,
    pub session_id: String,
    /// Fired when the reader saw the end of the server stream.
    pub stream_ended: CancellationToken,
}

impl WorkerContext {
    pub fn new(ws: WebSocket, cancel: CancellationToken, session_id: String) -> Self {
        Self {
            ws: Arc::new(ws),
            cancel,
            session_id,
            stream_ended: CancellationToken::new(),
        }
    }

    /// Encodes and writes one message, unless the scope is cancelled first.
    pub async fn send(&self, msg: &Message) -> Result<(), Error> {
        self.send_encoded(messages::encode(msg)?).await
    }

    /// Writes an already encoded message, unless the scope is cancelled first.
    pub async fn send_encoded(&self, payload: Vec<u8>) -> Result<(), Error> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = self.ws.send_binary(payload) => res,
        }
    }

    /// Reads the next binary message. `Ok(None)` means a graceful close.
    pub async fn recv(&self) -> Result<Option<Vec<u8>>, Error> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = self.ws.recv_binary() => res,
        }
    }

    /// Publishes an event to the caller, unless the scope is cancelled first.
    pub async fn publish<E>(&self, events: &mpsc::Sender<E>, event: E) -> Result<(), Error> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = events.send(event) => res.map_err(|_| Error::ChannelSend),
        }
    }
}

/// Runs the writer and reader to completion, then closes the socket.
///
/// The returned task resolves to the connection's terminal result.
pub(crate) fn spawn_workers<W, R>(
    ctx: WorkerContext,
    deadline: Option<Duration>,
    writer: W,
    reader: R,
) -> JoinHandle<Result<(), Error>>
where
    W: Future<Output = Result<(), Error>> + Send + 'static,
    R: Future<Output = Result<(), Error>> + Send + 'static,
{
    tokio::spawn(async move {
        let expired = Arc::new(AtomicBool::new(false));
        if let Some(deadline) = deadline {
            let cancel = ctx.cancel.clone();
            let expired = Arc::clone(&expired);
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        expired.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        let first_failure = OnceLock::new();
        let writer = guard(&ctx, &first_failure, Worker::Writer, writer);
        let reader = guard(&ctx, &first_failure, Worker::Reader, async {
            let res = reader.await;
            if res.is_ok() {
                ctx.stream_ended.cancel();
            }
            res
        });
        let (written, read) = tokio::join!(writer, reader);

        // Stops the deadline timer.
        ctx.cancel.cancel();

        let outcome = match aggregate(first_failure.get().copied(), written, read) {
            Err(Error::Cancelled) if expired.load(Ordering::SeqCst) => {
                Err(Error::DeadlineExceeded)
            }
            outcome => outcome,
        };
        finish(&ctx, outcome).await
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Worker {
    Writer,
    Reader,
}

impl Worker {
    fn as_str(&self) -> &'static str {
        match self {
            Worker::Writer => "writer",
            Worker::Reader => "reader",
        }
    }
}

/// Cancels the shared scope as soon as the worker fails, after recording
/// which worker failed first.
async fn guard<F>(
    ctx: &WorkerContext,
    first_failure: &OnceLock<Worker>,
    worker: Worker,
    fut: F,
) -> Result<(), Error>
where
    F: Future<Output = Result<(), Error>>,
{
    let res = fut.await;
    let name = worker.as_str();
    match &res {
        Ok(()) => debug!(session_id = %ctx.session_id, worker = name, "Worker done"),
        Err(e) if e.is_cancellation() => {
            debug!(session_id = %ctx.session_id, worker = name, "Worker cancelled")
        }
        Err(e) => {
            error!(session_id = %ctx.session_id, worker = name, error = %e, "Worker failed");
            let _ = first_failure.set(worker);
            ctx.cancel.cancel();
        }
    }
    res
}

/// Keeps the non-cancellation error of the worker that failed first.
/// Without a recorded failure, the writer's result wins ties.
fn aggregate(
    first_failure: Option<Worker>,
    written: Result<(), Error>,
    read: Result<(), Error>,
) -> Result<(), Error> {
    match (first_failure, written, read) {
        (Some(Worker::Reader), _, Err(r)) if !r.is_cancellation() => Err(r),
        (_, written, read) => prefer_writer(written, read),
    }
}

fn prefer_writer(written: Result<(), Error>, read: Result<(), Error>) -> Result<(), Error> {
    match (written, read) {
        (Err(w), _) if !w.is_cancellation() => Err(w),
        (_, Err(r)) if !r.is_cancellation() => Err(r),
        (Err(w), _) => Err(w),
        (_, Err(r)) => Err(r),
        (Ok(()), Ok(())) => Ok(()),
    }
}

async fn finish(ctx: &WorkerContext, outcome: Result<(), Error>) -> Result<(), Error> {
    match outcome {
        Ok(()) => match ctx.ws.close(CloseCode::Normal).await {
            Err(e) if ws::is_closed_race(&e) => {
                debug!(session_id = %ctx.session_id, error = %e, "Ignoring close race");
                Ok(())
            }
            res => res,
        },
        Err(e) => {
            let code = if e.is_cancellation() {
                CloseCode::Away
            } else {
                CloseCode::Error
            };
            // The close error is discarded, the worker error is what matters.
            if let Err(close_err) = ctx.ws.close(code).await {
                debug!(session_id = %ctx.session_id, error = %close_err, "Close failed");
            }
            Err(e)
        }
    }
}

/// A live streaming connection.
///
/// Input units of type `I` are submitted with [`Connection::submit`] and
/// typed events `E` are read with [`Connection::next_event`] or
/// [`Connection::events`]. Call [`Connection::finish`] once all input is
/// submitted, then [`Connection::done`] for the terminal result.
///
/// Dropping a connection before `done()` cancels its workers.
pub struct Connection<I, E> {
    session_id: String,
    input: Option<mpsc::Sender<I>>,
    events: mpsc::Receiver<E>,
    cancel: CancellationToken,
    workers: Option<JoinHandle<Result<(), Error>>>,
}

impl<I, E> Connection<I, E> {
    pub(crate) fn new(
        session_id: String,
        input: mpsc::Sender<I>,
        events: mpsc::Receiver<E>,
        cancel: CancellationToken,
        workers: JoinHandle<Result<(), Error>>,
    ) -> Self {
        Self {
            session_id,
            input: Some(input),
            events,
            cancel,
            workers: Some(workers),
        }
    }

    /// Returns the short identifier used in logs for this connection.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Enqueues one input unit.
    ///
    /// Waits while the input queue is full. Fails with [`Error::Stopping`]
    /// after [`Connection::finish`], [`Error::Cancelled`] if the scope is
    /// cancelled, and [`Error::ChannelSend`] if the writer already exited.
    pub async fn submit(&self, unit: I) -> Result<(), Error> {
        let input = self.input.as_ref().ok_or(Error::Stopping)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = input.send(unit) => res.map_err(|_| Error::ChannelSend),
        }
    }

    /// Returns true once [`Connection::finish`] was called.
    pub fn is_finished(&self) -> bool {
        self.input.is_none()
    }

    /// Signals that no more input will be submitted.
    pub fn finish(&mut self) {
        if self.input.take().is_some() {
            debug!(session_id = %self.session_id, "Input finished");
        }
    }

    /// Receives the next event, or `None` once the event stream has ended.
    pub async fn next_event(&mut self) -> Option<E> {
        self.events.recv().await
    }

    /// Returns the remaining events as a stream.
    pub fn events(&mut self) -> impl Stream<Item = E> + '_ {
        futures_util::stream::poll_fn(move |cx| self.events.poll_recv(cx))
    }

    /// Cancels the connection scope. Both workers stop at their next
    /// suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns a handle on the connection scope.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits until both workers have stopped and the socket is closed, and
    /// returns the terminal result.
    ///
    /// Events not read yet are discarded.
    pub async fn done(mut self) -> Result<(), Error> {
        self.finish();
        let Some(mut workers) = self.workers.take() else {
            return Ok(());
        };
        // Keep draining so a full event queue cannot block the reader.
        let res = loop {
            tokio::select! {
                res = &mut workers => break res?,
                Some(_) = self.events.recv() => {}
            }
        };
        match &res {
            Ok(()) => info!(session_id = %self.session_id, "Connection done"),
            Err(e) => warn!(session_id = %self.session_id, error = %e, "Connection failed"),
        }
        res
    }
}

impl<I, E> Drop for Connection<I, E> {
    fn drop(&mut self) {
        if self.workers.is_some() {
            self.cancel.cancel();
        }
    }
}
