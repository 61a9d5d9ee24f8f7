//! Host-local service bus.
//!
//! Every daemon owns a well-known bus name (`com.example.Bot<Name>`)
//! backed by a local socket; peers discover each other purely by these
//! names. The wire protocol is one JSON object per line:
//!
//! client → server:
//! ```json
//! {"id": 1, "op": "call", "method": "get_status", "args": {}}
//! {"id": 2, "op": "property", "name": "Running"}
//! {"id": 3, "op": "subscribe"}
//! ```
//!
//! server → client:
//! ```json
//! {"id": 1, "body": {"success": true, "status": "running"}}
//! {"signal": "StatusChanged", "payload": "active"}
//! ```
//!
//! Methods always answer with the `{success, error?, …}` envelope;
//! failures are folded into the envelope and never surfaced as
//! transport errors.

pub mod client;
pub mod server;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// Well-known-name prefix shared by the fleet.
pub const BUS_NAME_PREFIX: &str = "com.example.Bot";

/// Deadline for user-triggered method calls.
pub const USER_CALL_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for bulk method calls.
pub const BULK_CALL_DEADLINE: Duration = Duration::from_secs(60);

/// Capitalize a daemon name for its bus name (`slack` → `Slack`).
fn camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Well-known bus name for a daemon (`com.example.BotSlack`).
#[must_use]
pub fn bus_name(daemon: &str) -> String {
    format!("{BUS_NAME_PREFIX}{}", camel(daemon))
}

/// Object path mirroring the bus name (`/com/example/BotSlack`).
#[must_use]
pub fn object_path(daemon: &str) -> String {
    format!("/com/example/Bot{}", camel(daemon))
}

/// Local socket name backing the bus name.
#[must_use]
pub fn socket_name(daemon: &str) -> String {
    format!("botfleet-{daemon}")
}

/// Build a success envelope, merging `payload` fields in.
#[must_use]
pub fn envelope_ok(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => {
            map.insert("success".to_owned(), Value::Bool(true));
            Value::Object(map)
        }
        Value::Null => json!({"success": true}),
        other => json!({"success": true, "result": other}),
    }
}

/// Build a failure envelope.
#[must_use]
pub fn envelope_err(message: impl Into<String>) -> Value {
    json!({"success": false, "error": message.into()})
}

/// A fire-and-forget signal broadcast to bus subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BusSignal {
    /// Signal name, e.g. `StatusChanged`.
    pub signal: String,
    /// Signal payload.
    pub payload: Value,
}

/// Broadcast hub connecting components to bus subscribers.
///
/// Components hold a clone and emit without knowing whether anyone is
/// listening; the bus server forwards to subscribed connections.
#[derive(Debug, Clone)]
pub struct SignalHub {
    tx: broadcast::Sender<BusSignal>,
}

impl SignalHub {
    /// Create a hub with a bounded fan-out buffer.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Emit a signal. Absent subscribers are not an error.
    pub fn emit(&self, signal: impl Into<String>, payload: Value) {
        let _ = self.tx.send(BusSignal {
            signal: signal.into(),
            payload,
        });
    }

    /// Subscribe to the broadcast stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusSignal> {
        self.tx.subscribe()
    }
}

impl Default for SignalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline class for a registered method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineClass {
    /// User-triggered operation, 30 s.
    User,
    /// Bulk operation, 60 s.
    Bulk,
}

impl DeadlineClass {
    /// The wall-clock deadline for this class.
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::User => USER_CALL_DEADLINE,
            Self::Bulk => BULK_CALL_DEADLINE,
        }
    }
}

type MethodHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Value> + Send + Sync>;
type PropertyReader = Arc<dyn Fn() -> Value + Send + Sync>;

/// Dispatch table: named methods plus read-only properties.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, (MethodHandler, DeadlineClass)>,
    properties: HashMap<String, PropertyReader>,
}

impl MethodRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user-deadline method.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        self.register_with_class(name, DeadlineClass::User, handler);
    }

    /// Register a bulk-deadline method.
    pub fn register_bulk<F, Fut>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        self.register_with_class(name, DeadlineClass::Bulk, handler);
    }

    fn register_with_class<F, Fut>(&mut self, name: impl Into<String>, class: DeadlineClass, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Value> + Send + 'static,
    {
        let handler: MethodHandler = Arc::new(move |args| Box::pin(handler(args)));
        self.methods.insert(name.into(), (handler, class));
    }

    /// Register a read-only property. Readers must not block on I/O.
    pub fn register_property<F>(&mut self, name: impl Into<String>, reader: F)
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.properties.insert(name.into(), Arc::new(reader));
    }

    pub(crate) fn method(&self, name: &str) -> Option<&(MethodHandler, DeadlineClass)> {
        self.methods.get(name)
    }

    pub(crate) fn property(&self, name: &str) -> Option<&PropertyReader> {
        self.properties.get(name)
    }

    /// Registered method names, for introspection.
    #[must_use]
    pub fn method_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Client → server frame.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireRequest {
    pub id: u64,
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

/// Server → client frame: either a reply or a broadcast signal.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct WireFrame {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}
