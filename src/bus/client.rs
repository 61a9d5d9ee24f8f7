//! Thin bus client: `connect → call → decode envelope`.
//!
//! Callers must tolerate the absence of the target daemon; `connect`
//! retries with bounded backoff and gives up with `AppError::Bus`.

use std::time::Duration;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tracing::debug;

use crate::{AppError, Result};

use super::{socket_name, BusSignal, WireFrame, WireRequest};

/// Connection attempts before giving up on an absent peer.
const CONNECT_ATTEMPTS: u32 = 5;
/// Initial backoff between connection attempts; doubles per attempt.
const CONNECT_BACKOFF: Duration = Duration::from_millis(200);

type Stream = interprocess::local_socket::tokio::Stream;

/// A connected bus client for one peer daemon.
pub struct BusClient {
    reader: BufReader<ReadHalf<Stream>>,
    writer: WriteHalf<Stream>,
    next_id: u64,
    /// Signals that arrived while waiting for a method reply.
    buffered_signals: std::collections::VecDeque<BusSignal>,
}

impl BusClient {
    /// Connect to a peer daemon by name, retrying briefly if absent.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` when the peer stays unreachable.
    pub async fn connect(daemon: &str) -> Result<Self> {
        Self::connect_socket(&socket_name(daemon)).await
    }

    /// Connect with a single attempt and no backoff. For callers that
    /// probe optional peers on a hot path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` when the peer is absent.
    pub async fn connect_once(daemon: &str) -> Result<Self> {
        Self::connect_with_attempts(&socket_name(daemon), 1).await
    }

    /// Connect to an explicit socket name (tests use scratch names).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` when the socket stays unreachable.
    pub async fn connect_socket(socket: &str) -> Result<Self> {
        Self::connect_with_attempts(socket, CONNECT_ATTEMPTS).await
    }

    async fn connect_with_attempts(socket: &str, attempts: u32) -> Result<Self> {
        let ns_name = socket
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Bus(format!("invalid socket name '{socket}': {err}")))?;

        let mut backoff = CONNECT_BACKOFF;
        let mut last_err = None;
        for attempt in 1..=attempts {
            match Stream::connect(ns_name.clone()).await {
                Ok(stream) => {
                    let (reader, writer) = tokio::io::split(stream);
                    return Ok(Self {
                        reader: BufReader::new(reader),
                        writer,
                        next_id: 0,
                        buffered_signals: std::collections::VecDeque::new(),
                    });
                }
                Err(err) => {
                    debug!(socket, attempt, %err, "bus connect failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(AppError::Bus(format!(
            "peer '{socket}' unreachable: {}",
            last_err.map_or_else(|| "unknown".to_owned(), |e| e.to_string())
        )))
    }

    /// Call a method and return its envelope.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` on transport failures. Handler-level
    /// failures arrive inside the envelope, not as `Err`.
    pub async fn call(&mut self, method: &str, args: Value) -> Result<Value> {
        let id = self.send(WireRequest {
            id: 0,
            op: "call".to_owned(),
            method: Some(method.to_owned()),
            name: None,
            args: Some(args),
        })
        .await?;
        self.read_reply(id).await
    }

    /// Read a property value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` on transport failures.
    pub async fn property(&mut self, name: &str) -> Result<Value> {
        let id = self.send(WireRequest {
            id: 0,
            op: "property".to_owned(),
            method: None,
            name: Some(name.to_owned()),
            args: None,
        })
        .await?;
        self.read_reply(id).await
    }

    /// Subscribe this connection to broadcast signals.
    ///
    /// After subscribing, use [`next_signal`](Self::next_signal) to
    /// consume them; method replies are still matched by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` on transport failures.
    pub async fn subscribe(&mut self) -> Result<()> {
        let id = self.send(WireRequest {
            id: 0,
            op: "subscribe".to_owned(),
            method: None,
            name: None,
            args: None,
        })
        .await?;
        self.read_reply(id).await.map(|_| ())
    }

    /// Wait for the next broadcast signal on a subscribed connection.
    ///
    /// Signals that arrived interleaved with earlier method replies are
    /// delivered first, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` when the connection closes.
    pub async fn next_signal(&mut self) -> Result<BusSignal> {
        if let Some(buffered) = self.buffered_signals.pop_front() {
            return Ok(buffered);
        }
        loop {
            let frame = self.read_frame().await?;
            if let (Some(signal), payload) = (frame.signal, frame.payload) {
                return Ok(BusSignal {
                    signal,
                    payload: payload.unwrap_or(Value::Null),
                });
            }
        }
    }

    async fn send(&mut self, mut request: WireRequest) -> Result<u64> {
        self.next_id += 1;
        request.id = self.next_id;
        let mut line = serde_json::to_string(&request)
            .map_err(|err| AppError::Bus(format!("request serialization failed: {err}")))?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .map_err(|err| AppError::Bus(format!("write failed: {err}")))?;
        Ok(self.next_id)
    }

    async fn read_reply(&mut self, id: u64) -> Result<Value> {
        loop {
            let frame = self.read_frame().await?;
            if frame.id == Some(id) {
                return Ok(frame.body.unwrap_or(Value::Null));
            }
            // Signals interleave with replies on subscribed connections;
            // hold them for the next `next_signal` call.
            if let (Some(signal), payload) = (frame.signal, frame.payload) {
                self.buffered_signals.push_back(BusSignal {
                    signal,
                    payload: payload.unwrap_or(Value::Null),
                });
            }
        }
    }

    async fn read_frame(&mut self) -> Result<WireFrame> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .await
                .map_err(|err| AppError::Bus(format!("read failed: {err}")))?;
            if read == 0 {
                return Err(AppError::Bus("connection closed".into()));
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return serde_json::from_str(trimmed)
                .map_err(|err| AppError::Bus(format!("invalid frame: {err}")));
        }
    }
}

/// Convenience one-shot call against a peer daemon.
///
/// # Errors
///
/// Returns `AppError::Bus` when the peer is unreachable or the
/// transport fails.
pub async fn call_peer(daemon: &str, method: &str, args: Value) -> Result<Value> {
    let mut client = BusClient::connect(daemon).await?;
    client.call(method, args).await
}

/// Probe whether a peer daemon answers `get_status`.
pub async fn peer_alive(daemon: &str) -> bool {
    matches!(
        call_peer(daemon, "get_status", json!({})).await,
        Ok(body) if body.get("success").and_then(Value::as_bool) == Some(true)
    )
}
