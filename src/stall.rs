//! Connection stalling.
//!
//! A stalled request gets a `200 text/plain` response whose body never
//! seems to end.  A spawned feeder pushes filler chunks through a channel of
//! capacity one, so a new chunk is produced only after the transport has
//! taken the previous one.  The feeder stops when the peer goes away, when
//! the service shuts down, or after `max_messages` chunks.

use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderValue};
use axum::response::Response;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

/// Filler text, repeated to build one chunk.
pub const HALT_PAYLOAD: &str = "STOP SCANNING";

pub const DEFAULT_MAX_MESSAGES: u64 = 100_000;
pub const DEFAULT_CHUNK_REPEAT: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StallConfig {
    pub enabled: bool,
    /// Upper bound on chunks written to one connection.
    pub max_messages: u64,
    /// How many times [`HALT_PAYLOAD`] is repeated per chunk.
    pub chunk_repeat: usize,
}

impl Default for StallConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_messages: DEFAULT_MAX_MESSAGES,
            chunk_repeat: DEFAULT_CHUNK_REPEAT,
        }
    }
}

impl StallConfig {
    pub fn chunk(&self) -> Bytes {
        Bytes::from(HALT_PAYLOAD.repeat(self.chunk_repeat.max(1)))
    }
}

/// Why a feeder stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallOutcome {
    /// Reached the message cap.
    Exhausted,
    /// The response body was dropped (peer disconnected).
    PeerClosed,
    Shutdown,
}

impl StallOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            StallOutcome::Exhausted => "exhausted",
            StallOutcome::PeerClosed => "peer_closed",
            StallOutcome::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Default)]
pub struct StallMetrics {
    pub active: AtomicU64,
    pub started_total: AtomicU64,
    pub chunks_total: AtomicU64,
    pub exhausted_total: AtomicU64,
    pub peer_closed_total: AtomicU64,
    pub shutdown_total: AtomicU64,
}

impl StallMetrics {
    fn finished(&self, outcome: StallOutcome) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        let counter = match outcome {
            StallOutcome::Exhausted => &self.exhausted_total,
            StallOutcome::PeerClosed => &self.peer_closed_total,
            StallOutcome::Shutdown => &self.shutdown_total,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

type Chunk = Result<Bytes, Infallible>;

/// Write `chunk` into `tx` until one of the stop conditions fires.  Returns
/// the reason and the number of chunks handed to the transport.
pub async fn feed(
    tx: mpsc::Sender<Chunk>,
    chunk: Bytes,
    max_messages: u64,
    mut shutdown: watch::Receiver<bool>,
    metrics: Arc<StallMetrics>,
) -> (StallOutcome, u64) {
    metrics.active.fetch_add(1, Ordering::Relaxed);
    metrics.started_total.fetch_add(1, Ordering::Relaxed);
    let mut sent = 0u64;
    let outcome = loop {
        if sent >= max_messages {
            break StallOutcome::Exhausted;
        }
        if *shutdown.borrow() {
            break StallOutcome::Shutdown;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped sender means the service is gone.
                if changed.is_err() {
                    break StallOutcome::Shutdown;
                }
            }
            res = tx.send(Ok(chunk.clone())) => {
                if res.is_err() {
                    break StallOutcome::PeerClosed;
                }
                sent += 1;
                metrics.chunks_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    };
    metrics.finished(outcome);
    (outcome, sent)
}

/// Start a stall and return the streaming response.  The feeder runs on its
/// own task so only this connection waits on it.
pub fn stall_response(
    cfg: &StallConfig,
    actor: &str,
    shutdown: watch::Receiver<bool>,
    metrics: Arc<StallMetrics>,
) -> Response {
    let (tx, rx) = mpsc::channel::<Chunk>(1);
    let chunk = cfg.chunk();
    let max_messages = cfg.max_messages;
    let actor = actor.to_string();
    tokio::spawn(async move {
        let (outcome, sent) = feed(tx, chunk, max_messages, shutdown, metrics).await;
        tracing::info!(actor = %actor, outcome = outcome.as_str(), sent, "stall finished");
    });

    let mut res = Response::new(Body::from_stream(ReceiverStream::new(rx)));
    res.headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    res
}
