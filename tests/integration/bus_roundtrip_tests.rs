//! Bus server/client round trips over a scratch socket.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use botfleet::bus::client::BusClient;
use botfleet::bus::server::BusServer;
use botfleet::bus::{envelope_ok, MethodRegistry, SignalHub};

fn scratch_socket() -> String {
    format!("botfleet-test-{}", uuid::Uuid::new_v4())
}

fn echo_registry() -> MethodRegistry {
    let mut registry = MethodRegistry::new();
    registry.register("echo", |args| async move {
        envelope_ok(json!({"echoed": args}))
    });
    registry.register_property("Running", || json!(true));
    registry
}

#[tokio::test]
async fn method_call_round_trips_an_envelope() {
    let socket = scratch_socket();
    let cancel = CancellationToken::new();
    let _server = BusServer::spawn(&socket, echo_registry(), SignalHub::new(), cancel.clone())
        .expect("server");

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");
    let body = client
        .call("echo", json!({"value": 42}))
        .await
        .expect("call");
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["echoed"]["value"], json!(42));

    cancel.cancel();
}

#[tokio::test]
async fn unknown_methods_return_error_envelopes_not_transport_errors() {
    let socket = scratch_socket();
    let cancel = CancellationToken::new();
    let _server = BusServer::spawn(&socket, echo_registry(), SignalHub::new(), cancel.clone())
        .expect("server");

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");
    let body = client.call("nonsense", json!({})).await.expect("call ok");
    assert_eq!(body["success"], json!(false));
    assert!(body["error"]
        .as_str()
        .expect("error string")
        .contains("unknown method"));

    cancel.cancel();
}

#[tokio::test]
async fn properties_read_without_blocking() {
    let socket = scratch_socket();
    let cancel = CancellationToken::new();
    let _server = BusServer::spawn(&socket, echo_registry(), SignalHub::new(), cancel.clone())
        .expect("server");

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");
    let running = client.property("Running").await.expect("property");
    assert_eq!(running, json!(true));

    let missing = client.property("Nope").await.expect("call ok");
    assert_eq!(missing["success"], json!(false));

    cancel.cancel();
}

#[tokio::test]
async fn subscribers_receive_broadcast_signals() {
    let socket = scratch_socket();
    let cancel = CancellationToken::new();
    let hub = SignalHub::new();
    let _server =
        BusServer::spawn(&socket, echo_registry(), hub.clone(), cancel.clone()).expect("server");

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");
    client.subscribe().await.expect("subscribe");

    hub.emit("StatusChanged", json!("active"));

    let signal = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        client.next_signal(),
    )
    .await
    .expect("timely")
    .expect("signal");
    assert_eq!(signal.signal, "StatusChanged");
    assert_eq!(signal.payload, json!("active"));

    cancel.cancel();
}

#[tokio::test]
async fn absent_peer_is_a_clean_bus_error() {
    let missing = BusClient::connect_once("definitely-not-running").await;
    assert!(missing.is_err());
}

#[tokio::test]
async fn calls_interleave_with_signals_on_one_connection() {
    let socket = scratch_socket();
    let cancel = CancellationToken::new();
    let hub = SignalHub::new();
    let _server =
        BusServer::spawn(&socket, echo_registry(), hub.clone(), cancel.clone()).expect("server");

    let mut client = BusClient::connect_socket(&socket).await.expect("connect");
    client.subscribe().await.expect("subscribe");

    // A signal lands between the request and its reply consumption.
    hub.emit("Noise", json!(1));
    let body = client.call("echo", json!({"k": "v"})).await.expect("call");
    assert_eq!(body["success"], json!(true));

    // The earlier signal is still readable afterwards.
    let signal = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        client.next_signal(),
    )
    .await
    .expect("timely")
    .expect("signal");
    assert_eq!(signal.signal, "Noise");

    cancel.cancel();
}

#[tokio::test]
async fn scalar_and_null_payload_envelopes() {
    let value: Value = envelope_ok(Value::Null);
    assert_eq!(value["success"], json!(true));
}
