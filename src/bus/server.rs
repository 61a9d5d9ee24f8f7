//! Bus server: accepts local-socket connections, dispatches method
//! calls, answers property reads, and forwards broadcast signals to
//! subscribed connections.

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{AppError, Result};

use super::{envelope_err, MethodRegistry, SignalHub, WireFrame, WireRequest};

/// Running bus server for one daemon.
pub struct BusServer {
    handle: JoinHandle<()>,
}

impl BusServer {
    /// Bind the daemon's socket and start accepting connections.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Bus` if the listener cannot be created, which
    /// usually means another process owns the socket name.
    pub fn spawn(
        socket: &str,
        registry: MethodRegistry,
        hub: SignalHub,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener_name = socket
            .to_ns_name::<GenericNamespaced>()
            .map_err(|err| AppError::Bus(format!("invalid socket name '{socket}': {err}")))?;

        let listener = ListenerOptions::new()
            .name(listener_name)
            .create_tokio()
            .map_err(|err| AppError::Bus(format!("failed to bind bus socket: {err}")))?;

        info!(socket, "bus listening");

        let socket_owned = socket.to_owned();
        let registry = Arc::new(registry);
        let handle = tokio::spawn(async move {
            let span = info_span!("bus_server", socket = %socket_owned);
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("bus server shutting down");
                            break;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok(stream) => {
                                    let registry = Arc::clone(&registry);
                                    let hub = hub.clone();
                                    tokio::spawn(handle_connection(stream, registry, hub));
                                }
                                Err(err) => warn!(%err, "bus accept failed"),
                            }
                        }
                    }
                }
            }
            .instrument(span)
            .await;
        });

        Ok(Self { handle })
    }

    /// Wait for the accept loop to finish after cancellation.
    pub async fn join(self) {
        let _ = self.handle.await;
    }
}

type SharedWriter = Arc<Mutex<WriteHalf<interprocess::local_socket::tokio::Stream>>>;

async fn write_frame(writer: &SharedWriter, frame: &WireFrame) -> std::io::Result<()> {
    let mut line = serde_json::to_string(frame)
        .unwrap_or_else(|_| r#"{"body":{"success":false,"error":"serialization failed"}}"#.into());
    line.push('\n');
    writer.lock().await.write_all(line.as_bytes()).await
}

async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    registry: Arc<MethodRegistry>,
    hub: SignalHub,
) {
    let span = info_span!("bus_conn");
    async move {
        let (reader, writer) = tokio::io::split(stream);
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();
        let mut forwarder: Option<JoinHandle<()>> = None;

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let request: WireRequest = match serde_json::from_str(trimmed) {
                        Ok(request) => request,
                        Err(err) => {
                            let frame = WireFrame {
                                id: None,
                                body: Some(envelope_err(format!("invalid json: {err}"))),
                                signal: None,
                                payload: None,
                            };
                            if write_frame(&writer, &frame).await.is_err() {
                                break;
                            }
                            continue;
                        }
                    };

                    let body = match request.op.as_str() {
                        "call" => dispatch_call(&registry, &request).await,
                        "property" => read_property(&registry, &request),
                        "subscribe" => {
                            if forwarder.is_none() {
                                forwarder =
                                    Some(spawn_forwarder(hub.clone(), Arc::clone(&writer)));
                            }
                            super::envelope_ok(Value::Null)
                        }
                        other => envelope_err(format!("unknown op: {other}")),
                    };

                    let frame = WireFrame {
                        id: Some(request.id),
                        body: Some(body),
                        signal: None,
                        payload: None,
                    };
                    if let Err(err) = write_frame(&writer, &frame).await {
                        warn!(%err, "failed to write bus reply");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "bus read error");
                    break;
                }
            }
        }

        if let Some(task) = forwarder {
            task.abort();
        }
        debug!("bus connection closed");
    }
    .instrument(span)
    .await;
}

/// Run a method handler under its deadline.
///
/// Timed-out handlers are not silently dropped: the spawned task keeps
/// running and a completion logger records its eventual outcome.
async fn dispatch_call(registry: &MethodRegistry, request: &WireRequest) -> Value {
    let Some(method) = request.method.as_deref() else {
        return envelope_err("missing 'method' field");
    };
    let Some((handler, class)) = registry.method(method) else {
        return envelope_err(format!("unknown method: {method}"));
    };

    let args = request.args.clone().unwrap_or(Value::Null);
    let span = info_span!("bus_call", method);
    let fut = handler(args);
    let mut task = tokio::spawn(fut.instrument(span));

    match tokio::time::timeout(class.duration(), &mut task).await {
        Ok(Ok(body)) => body,
        Ok(Err(err)) => {
            warn!(method, %err, "bus handler panicked");
            envelope_err(format!("handler failed: {err}"))
        }
        Err(_) => {
            warn!(method, deadline_secs = class.duration().as_secs(), "bus call timed out");
            let method = method.to_owned();
            tokio::spawn(async move {
                match task.await {
                    Ok(_) => debug!(method, "timed-out bus call completed late"),
                    Err(err) => warn!(method, %err, "timed-out bus call never completed"),
                }
            });
            envelope_err("timed out")
        }
    }
}

fn read_property(registry: &MethodRegistry, request: &WireRequest) -> Value {
    let Some(name) = request.name.as_deref() else {
        return envelope_err("missing 'name' field");
    };
    match registry.property(name) {
        Some(reader) => reader(),
        None => envelope_err(format!("unknown property: {name}")),
    }
}

fn spawn_forwarder(hub: SignalHub, writer: SharedWriter) -> JoinHandle<()> {
    let mut rx = hub.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(signal) => {
                    let frame = WireFrame {
                        id: None,
                        body: None,
                        signal: Some(signal.signal),
                        payload: Some(signal.payload),
                    };
                    if write_frame(&writer, &frame).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "bus subscriber lagged; signals dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
