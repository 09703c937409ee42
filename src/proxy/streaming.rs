//! Streaming relay of upstream responses as NDJSON frames
//!
//! A relay emits exactly one `headers` frame, any number of `chunk` frames
//! and then one terminal frame (`end` or `error`). Every live relay holds a
//! [`ConnectionGuard`]; dropping the relay (completion, error, client
//! disconnect) removes it from the [`ConnectionRegistry`] and releases the
//! upstream response it owns.

use crate::proxy::types::ConnectionId;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Message carried by the error frame of a relay cancelled at shutdown
pub const SHUTDOWN_MESSAGE: &str = "Connection closed by server shutdown";

/// One NDJSON frame of a streamed response
#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame {
    Headers {
        status: u16,
        #[serde(rename = "statusText")]
        status_text: String,
        headers: BTreeMap<String, String>,
    },
    Chunk {
        data: String,
    },
    End,
    Error {
        error: String,
    },
}

impl StreamFrame {
    /// Wrap a body fragment, replacing invalid UTF-8 sequences
    pub fn chunk(bytes: &[u8]) -> Self {
        Self::Chunk {
            data: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End | Self::Error { .. })
    }

    /// Serialize as a single newline-terminated JSON line
    pub fn to_ndjson(&self) -> Bytes {
        let mut line = serde_json::to_vec(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","error":"frame serialization failed: {e}"}}"#).into_bytes()
        });
        line.push(b'\n');
        Bytes::from(line)
    }
}

struct ActiveConnection {
    target: String,
    opened_at: Instant,
    cancel: oneshot::Sender<()>,
}

/// Registry of live streaming relays
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<Mutex<HashMap<ConnectionId, ActiveConnection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new relay to `target`.
    ///
    /// The returned receiver resolves when [`close_all`](Self::close_all)
    /// cancels the relay.
    pub fn register(&self, target: impl Into<String>) -> (ConnectionGuard, oneshot::Receiver<()>) {
        let id = ConnectionId::generate();
        let (cancel, cancelled) = oneshot::channel();
        let target = target.into();
        debug!(connection_id = %id, target = %target, "Streaming connection opened");

        self.connections.lock().insert(
            id,
            ActiveConnection {
                target,
                opened_at: Instant::now(),
                cancel,
            },
        );

        (
            ConnectionGuard {
                id,
                registry: self.clone(),
            },
            cancelled,
        )
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel and forget every tracked relay, returning how many were closed
    pub fn close_all(&self) -> usize {
        let drained: Vec<(ConnectionId, ActiveConnection)> =
            self.connections.lock().drain().collect();
        let closed = drained.len();

        for (id, connection) in drained {
            if connection.cancel.send(()).is_err() {
                warn!(connection_id = %id, "Streaming relay already finished during shutdown");
            }
            debug!(
                connection_id = %id,
                target = %connection.target,
                open_for_ms = connection.opened_at.elapsed().as_millis(),
                "Closed streaming connection"
            );
        }

        if closed > 0 {
            info!(closed, "Closed active streaming connections");
        }
        closed
    }

    fn remove(&self, id: &ConnectionId) {
        if let Some(connection) = self.connections.lock().remove(id) {
            debug!(
                connection_id = %id,
                target = %connection.target,
                open_for_ms = connection.opened_at.elapsed().as_millis(),
                "Streaming connection released"
            );
        }
    }
}

/// Registration of one relay; dropping it removes the registry entry
pub struct ConnectionGuard {
    id: ConnectionId,
    registry: ConnectionRegistry,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
    }
}

/// A streamed response: the relay's identifier and its frames
pub struct RelayStream {
    pub connection_id: ConnectionId,
    pub frames: BoxStream<'static, StreamFrame>,
}

impl RelayStream {
    /// A relay that failed before any upstream headers arrived
    pub fn failed(guard: ConnectionGuard, message: impl Into<String>) -> Self {
        let connection_id = guard.id();
        let frame = StreamFrame::error(message);
        let frames = stream::once(async move {
            drop(guard);
            frame
        })
        .boxed();
        Self {
            connection_id,
            frames,
        }
    }
}

/// Incremental UTF-8 decoder that holds back a character split across chunks
#[derive(Debug, Default)]
struct Utf8Carry {
    tail: Vec<u8>,
}

impl Utf8Carry {
    /// Decode `bytes` after any held-back tail; invalid sequences become U+FFFD
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buffer = std::mem::take(&mut self.tail);
        buffer.extend_from_slice(bytes);

        let mut text = String::with_capacity(buffer.len());
        let mut rest = buffer.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.tail = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        text
    }

    /// Whatever is still held back, decoded lossily
    fn finish(&mut self) -> Option<String> {
        let tail = std::mem::take(&mut self.tail);
        (!tail.is_empty()).then(|| String::from_utf8_lossy(&tail).into_owned())
    }
}

/// Body half of a relay: owns the upstream chunks and the registration
struct RelayBody {
    chunks: BoxStream<'static, reqwest::Result<Bytes>>,
    cancelled: oneshot::Receiver<()>,
    idle_timeout: Duration,
    decoder: Utf8Carry,
    _guard: ConnectionGuard,
}

enum RelayState {
    Open(RelayBody),
    /// Upstream finished; only the `end` frame is left
    Ending(RelayBody),
    Done,
}

/// Build the frame sequence for an upstream response whose headers are known
pub fn relay_frames(
    head: StreamFrame,
    chunks: BoxStream<'static, reqwest::Result<Bytes>>,
    guard: ConnectionGuard,
    cancelled: oneshot::Receiver<()>,
    idle_timeout: Duration,
) -> BoxStream<'static, StreamFrame> {
    let body = RelayBody {
        chunks,
        cancelled,
        idle_timeout,
        decoder: Utf8Carry::default(),
        _guard: guard,
    };

    let rest = stream::unfold(RelayState::Open(body), |state| async move {
        let mut body = match state {
            RelayState::Open(body) => body,
            RelayState::Ending(body) => {
                drop(body);
                return Some((StreamFrame::End, RelayState::Done));
            }
            RelayState::Done => return None,
        };
        loop {
            let next = tokio::select! {
                biased;
                _ = &mut body.cancelled => {
                    return Some((StreamFrame::error(SHUTDOWN_MESSAGE), RelayState::Done))
                }
                next = tokio::time::timeout(body.idle_timeout, body.chunks.next()) => next,
            };
            let frame = match next {
                Ok(Some(Ok(bytes))) => {
                    let data = body.decoder.decode(&bytes);
                    if data.is_empty() {
                        continue;
                    }
                    return Some((StreamFrame::Chunk { data }, RelayState::Open(body)));
                }
                Ok(Some(Err(e))) => StreamFrame::error(e.to_string()),
                Ok(None) => match body.decoder.finish() {
                    Some(data) => {
                        return Some((StreamFrame::Chunk { data }, RelayState::Ending(body)))
                    }
                    None => StreamFrame::End,
                },
                Err(_) => StreamFrame::error(format!(
                    "Upstream read timed out after {:?}",
                    body.idle_timeout
                )),
            };
            return Some((frame, RelayState::Done));
        }
    });

    stream::once(async move { head }).chain(rest).boxed()
}
