//! End-to-end tests against a real listener.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use devbus_core::constants::{HEALTH_PATH, SEND_PATH, SSE_PATH, WS_PATH};
use devbus_core::{Envelope, LocalDispatcher, Mode};
use devbus_server::{HostServer, ListenerRegistry, ServerBusConfig, ServerEventBus};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn config() -> ServerBusConfig {
    ServerBusConfig {
        host: "127.0.0.1".into(),
        port: 0,
        debug: false,
        mode: Mode::Active,
    }
}

/// Boot an isolated bus and return it with its port.
async fn boot_bus() -> (ServerEventBus, u16) {
    let bus = ServerEventBus::with_registry(config(), ListenerRegistry::new())
        .with_target(LocalDispatcher::new());
    let port = bus.start().await.unwrap();
    (bus, port)
}

async fn wait_for(cond: impl Fn() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn connect_ws(port: u16, client_id: &str) -> WsStream {
    let url = format!("ws://127.0.0.1:{port}{WS_PATH}?clientId={client_id}");
    let (ws, _) = timeout(TIMEOUT, connect_async(url)).await.unwrap().unwrap();
    ws
}

async fn next_envelope(ws: &mut WsStream) -> Envelope {
    loop {
        let msg = timeout(TIMEOUT, ws.next()).await.unwrap().unwrap().unwrap();
        if let Message::Text(text) = msg {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

/// Read an event stream until the first `data:` line.
async fn next_sse_data(
    stream: &mut (impl futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin),
    buf: &mut String,
) -> String {
    loop {
        if let Some(pos) = buf.find("\n\n") {
            let block: String = buf.drain(..pos + 2).collect();
            if let Some(data) = block.lines().find_map(|l| l.strip_prefix("data:")) {
                return data.trim_start().to_owned();
            }
            continue;
        }
        let chunk = timeout(TIMEOUT, stream.next()).await.unwrap().unwrap().unwrap();
        buf.push_str(std::str::from_utf8(&chunk).unwrap());
    }
}

#[tokio::test]
async fn socket_frames_reach_other_peers_only() {
    let (bus, port) = boot_bus().await;
    let mut a = connect_ws(port, "tab-a").await;
    let mut b = connect_ws(port, "tab-b").await;
    wait_for(|| bus.connection_count() == 2).await;

    let frame = Envelope::new("query:update", json!({"rows": [1, 2]})).encode().unwrap();
    a.send(Message::text(frame)).await.unwrap();

    let got = next_envelope(&mut b).await;
    assert_eq!(got.event_type, "query:update");
    assert_eq!(got.payload, json!({"rows": [1, 2]}));

    // A gets nothing back: the next frame it sees is one B sends.
    b.send(Message::text(Envelope::new("ack", Value::Null).encode().unwrap()))
        .await
        .unwrap();
    assert_eq!(next_envelope(&mut a).await.event_type, "ack");
    bus.stop();
}

#[tokio::test]
async fn post_round_trips_to_event_stream() {
    let (bus, port) = boot_bus().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("http://127.0.0.1:{port}{SSE_PATH}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let mut stream = resp.bytes_stream();
    wait_for(|| bus.connection_count() == 1).await;

    // Key order and number formatting must survive the trip.
    let posted = r#"{"type":"a11y:scan","payload":{"zeta":[{"id":"x","n":1.50}],"alpha":true}}"#;
    let status = client
        .post(format!("http://127.0.0.1:{port}{SEND_PATH}"))
        .header("content-type", "application/json")
        .body(posted)
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 200);

    let mut buf = String::new();
    let data = next_sse_data(&mut stream, &mut buf).await;
    assert_eq!(data, posted);
    bus.stop();
}

#[tokio::test]
async fn malformed_frames_do_not_disturb_peers() {
    let (bus, port) = boot_bus().await;
    let mut sender = connect_ws(port, "s").await;
    let mut receiver = connect_ws(port, "r").await;
    wait_for(|| bus.connection_count() == 2).await;

    sender.send(Message::text("{not json")).await.unwrap();
    sender.send(Message::text(r#"{"type":""}"#)).await.unwrap();
    let status = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{SEND_PATH}"))
        .body("garbage")
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, 400);

    sender
        .send(Message::text(r#"{"type":"still-alive","payload":1}"#))
        .await
        .unwrap();
    assert_eq!(next_envelope(&mut receiver).await.event_type, "still-alive");
    assert_eq!(bus.connection_count(), 2);
    bus.stop();
}

#[tokio::test]
async fn closed_peer_leaves_the_set() {
    let (bus, port) = boot_bus().await;
    let mut ws = connect_ws(port, "gone").await;
    wait_for(|| bus.connection_count() == 1).await;

    ws.close(None).await.unwrap();
    wait_for(|| bus.connection_count() == 0).await;
    bus.stop();
}

#[tokio::test]
async fn stop_closes_own_connections_and_listener() {
    let (bus, port) = boot_bus().await;
    let mut ws = connect_ws(port, "p").await;
    wait_for(|| bus.connection_count() == 1).await;

    bus.stop();
    let end = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_) | Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(end.is_ok());
    assert_eq!(bus.connection_count(), 0);

    let refused = timeout(TIMEOUT, connect_async(format!("ws://127.0.0.1:{port}{WS_PATH}")))
        .await
        .unwrap();
    assert!(refused.is_err());
}

#[tokio::test]
async fn health_reports_connections() {
    let (bus, port) = boot_bus().await;
    let _ws = connect_ws(port, "h").await;
    wait_for(|| bus.connection_count() == 1).await;

    let body: Value = reqwest::get(format!("http://127.0.0.1:{port}{HEALTH_PATH}"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"], 1);
    bus.stop();
}

#[tokio::test]
async fn attached_bus_leaves_host_routes_serving() {
    let base = Router::new().route("/app", get(|| async { "app" }));
    let host = HostServer::bind_with("127.0.0.1", 0, base).await.unwrap();
    let bus = ServerEventBus::attached(config(), Arc::clone(&host))
        .with_target(LocalDispatcher::new());
    let port = bus.start().await.unwrap();

    let health = reqwest::get(format!("http://127.0.0.1:{port}{HEALTH_PATH}"))
        .await
        .unwrap();
    assert_eq!(health.status(), 200);

    let before = host.listener_count();
    bus.stop();
    assert!(host.listener_count() < before);
    assert!(host.local_addr().is_some());

    let app = reqwest::get(format!("http://127.0.0.1:{port}/app")).await.unwrap();
    assert_eq!(app.text().await.unwrap(), "app");
    let gone = reqwest::get(format!("http://127.0.0.1:{port}{HEALTH_PATH}"))
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
    host.close();
}

#[tokio::test]
async fn server_emit_reaches_socket_peers() {
    let (bus, port) = boot_bus().await;
    let mut ws = connect_ws(port, "listener").await;
    wait_for(|| bus.connection_count() == 1).await;

    assert_eq!(bus.emit(&Envelope::new("server:tick", json!(3))), 1);
    let got = next_envelope(&mut ws).await;
    assert_eq!(got.event_type, "server:tick");
    assert_eq!(got.payload, json!(3));
    bus.stop();
}
