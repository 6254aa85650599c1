//! Integration tests: start the relay on a free loopback port and drive it with
//! raw WebSocket clients. Each test shuts its relay down when it ends.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wshub::config::RelayConfig;
use wshub::relay::{self, ChannelStats, RelayState};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestRelay {
    port: u16,
    state: RelayState,
    stop: Option<oneshot::Sender<()>>,
}

impl TestRelay {
    async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind free port");
        let port = listener.local_addr().expect("local_addr").port();
        let state = RelayState::new(RelayConfig {
            port,
            ..RelayConfig::default()
        });
        let (stop, stopped) = oneshot::channel::<()>();
        let serve_state = state.clone();
        tokio::spawn(async move {
            let _ = relay::serve(listener, serve_state, async {
                let _ = stopped.await;
            })
            .await;
        });
        Self {
            port,
            state,
            stop: Some(stop),
        }
    }

    async fn connect(&self, path: &str, is_server: bool) -> Ws {
        let query = if is_server { "?isServer=true" } else { "" };
        let url = format!("ws://127.0.0.1:{}{}{}", self.port, path, query);
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("websocket connect");
        ws
    }

    /// Connect a client and wait until the relay has registered it. With no server
    /// present the sync request is answered by the relay itself.
    async fn client(&self, path: &str) -> Ws {
        let mut ws = self.connect(path, false).await;
        send(&mut ws, json!({"type": "request", "id": "sync", "method": "sync"})).await;
        let res = recv(&mut ws).await;
        assert_eq!(res["id"], "sync");
        assert_eq!(res["error"]["code"], -1);
        ws
    }

    /// Poll the channel until `check` holds.
    async fn wait_for(&self, path: &str, check: impl Fn(&ChannelStats) -> bool) {
        for _ in 0..200 {
            if let Some(channel) = self.state.channels.get(path).await {
                if let Some(stats) = channel.stats().await {
                    if check(&stats) {
                        return;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("channel {} did not reach the expected state within 2s", path);
    }
}

impl Drop for TestRelay {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("send");
}

async fn recv(ws: &mut Ws) -> Value {
    let next = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).expect("json frame"),
                Some(Ok(Message::Close(frame))) => panic!("connection closed: {:?}", frame),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("read error: {}", e),
                None => panic!("connection ended"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), next)
        .await
        .expect("frame within 5s")
}

/// Nothing arrives within a short window.
async fn assert_silent(ws: &mut Ws) {
    let res = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(res.is_err(), "unexpected frame: {:?}", res);
}

/// The connection is closed by the relay within 5s.
async fn assert_closed(ws: &mut Ws) {
    let closed = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), closed)
        .await
        .expect("connection closed within 5s");
}

fn ready() -> Value {
    json!({"type": "notification", "method": "server-ready", "data": null})
}

fn gone() -> Value {
    json!({"type": "notification", "method": "server-gone", "data": null})
}

#[tokio::test]
async fn request_without_server_fails_fast() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect("/X", false).await;
    send(&mut client, json!({"type": "request", "id": 1, "method": "getNote", "params": {"id": "n1"}})).await;
    assert_eq!(
        recv(&mut client).await,
        json!({
            "type": "response",
            "id": 1,
            "method": "getNote",
            "result": null,
            "error": {"code": -1, "message": "no server", "data": null}
        })
    );
}

#[tokio::test]
async fn server_attach_notifies_connected_clients() {
    let relay = TestRelay::start().await;
    let mut early = relay.client("/X").await;
    let _server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut early).await, ready());

    // a client arriving after the server gets its own server-ready
    let mut late = relay.connect("/X", false).await;
    assert_eq!(recv(&mut late).await, ready());
    assert_silent(&mut early).await;
}

#[tokio::test]
async fn response_is_routed_to_the_requesting_client_only() {
    let relay = TestRelay::start().await;
    let mut a = relay.client("/X").await;
    let mut b = relay.client("/X").await;
    let mut server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut a).await, ready());
    assert_eq!(recv(&mut b).await, ready());

    let request = json!({"type": "request", "id": 3, "method": "ping", "params": null});
    send(&mut a, request.clone()).await;
    assert_eq!(recv(&mut server).await, request);

    let response = json!({"type": "response", "id": 3, "method": "ping", "result": {"Ok": true}, "error": null});
    send(&mut server, response.clone()).await;
    assert_eq!(recv(&mut a).await, response);
    assert_silent(&mut b).await;

    // the pending entry was consumed: a duplicate response goes nowhere
    send(&mut server, response).await;
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn ids_correlate_by_json_value() {
    let relay = TestRelay::start().await;
    let mut numeric = relay.client("/X").await;
    let mut textual = relay.client("/X").await;
    let mut server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut numeric).await, ready());
    assert_eq!(recv(&mut textual).await, ready());

    send(&mut numeric, json!({"type": "request", "id": 1, "method": "m"})).await;
    recv(&mut server).await;
    send(&mut textual, json!({"type": "request", "id": "1", "method": "m"})).await;
    recv(&mut server).await;

    send(&mut server, json!({"type": "response", "id": "1", "method": "m", "result": "text", "error": null})).await;
    assert_eq!(recv(&mut textual).await["result"], "text");
    send(&mut server, json!({"type": "response", "id": 1, "method": "m", "result": "number", "error": null})).await;
    assert_eq!(recv(&mut numeric).await["result"], "number");
}

#[tokio::test]
async fn notifications_reach_every_client_and_never_the_server() {
    let relay = TestRelay::start().await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(relay.client("/X").await);
    }
    let mut server = relay.connect("/X", true).await;
    for client in clients.iter_mut() {
        assert_eq!(recv(client).await, ready());
    }

    let tick = json!({"type": "notification", "method": "tick", "data": {"n": 1}});
    send(&mut server, tick.clone()).await;
    for client in clients.iter_mut() {
        assert_eq!(recv(client).await, tick);
    }
    assert_silent(&mut server).await;
}

#[tokio::test]
async fn server_disconnect_broadcasts_gone() {
    let relay = TestRelay::start().await;
    let mut client = relay.client("/X").await;
    let mut server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut client).await, ready());

    send(&mut client, json!({"type": "request", "id": 9, "method": "slow"})).await;
    recv(&mut server).await;
    server.close(None).await.expect("close server");
    drop(server);
    assert_eq!(recv(&mut client).await, gone());

    // no server-ready for newcomers, and requests fail fast again
    let mut late = relay.connect("/X", false).await;
    send(&mut late, json!({"type": "request", "id": 10, "method": "slow"})).await;
    assert_eq!(recv(&mut late).await["error"]["code"], -1);

    // a new server attaches and both clients hear about it
    let _server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut client).await, ready());
    assert_eq!(recv(&mut late).await, ready());
}

#[tokio::test]
async fn second_server_is_refused_and_incumbent_keeps_serving() {
    let relay = TestRelay::start().await;
    let mut client = relay.client("/X").await;
    let mut server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut client).await, ready());

    let mut intruder = relay.connect("/X", true).await;
    assert_closed(&mut intruder).await;
    assert_silent(&mut client).await;
    relay.wait_for("/X", |s| s.has_server).await;

    send(&mut client, json!({"type": "request", "id": 1, "method": "m"})).await;
    assert_eq!(recv(&mut server).await["id"], 1);
}

#[tokio::test]
async fn channels_are_isolated_and_paths_normalized() {
    let relay = TestRelay::start().await;
    let mut notes = relay.client("/notes").await;
    let mut cards = relay.client("/cards").await;

    let mut server = relay.connect("/notes///", true).await;
    assert_eq!(recv(&mut notes).await, ready());
    assert_silent(&mut cards).await;

    send(&mut cards, json!({"type": "request", "id": 1, "method": "m"})).await;
    assert_eq!(recv(&mut cards).await["error"]["code"], -1);
    assert_silent(&mut server).await;
}

#[tokio::test]
async fn ping_is_answered_by_the_relay() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect("/X", false).await;
    send(&mut client, json!({"type": "ping", "send_timestamp": wshub::protocol::now_ms()})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn stale_message_is_still_routed() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect("/X", false).await;
    let old = wshub::protocol::now_ms() - 60_000;
    send(&mut client, json!({"type": "request", "id": 1, "method": "m", "send_timestamp": old})).await;
    assert_eq!(recv(&mut client).await["error"]["code"], -1);
}

#[tokio::test]
async fn odd_send_timestamps_are_tolerated() {
    let relay = TestRelay::start().await;
    let mut client = relay.connect("/X", false).await;
    send(&mut client, json!({"type": "ping", "send_timestamp": 1700000000000.5})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
    send(&mut client, json!({"type": "ping", "send_timestamp": "1700000000000"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
    send(&mut client, json!({"type": "ping", "send_timestamp": "later"})).await;
    assert_eq!(recv(&mut client).await, json!({"type": "pong"}));
}

#[tokio::test]
async fn binary_frames_must_be_utf8() {
    let relay = TestRelay::start().await;
    let mut client = relay.client("/X").await;
    let mut server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut client).await, ready());

    // valid utf-8 in a binary frame is routed like text
    let tick = json!({"type": "notification", "method": "tick", "data": "a"});
    server
        .send(Message::Binary(tick.to_string().into_bytes()))
        .await
        .expect("send");
    assert_eq!(recv(&mut client).await, tick);

    let mut bad = br#"{"type":"notification","method":"tick","data":"a"#.to_vec();
    bad.extend_from_slice(b"\xff\"}");
    server.send(Message::Binary(bad)).await.expect("send");
    assert_closed(&mut server).await;

    // nothing corrupted reaches the client; it only learns the server is gone
    assert_eq!(recv(&mut client).await, gone());
}

#[tokio::test]
async fn malformed_frames_close_only_the_offender() {
    let relay = TestRelay::start().await;
    let mut good = relay.client("/X").await;

    let mut bad = relay.client("/X").await;
    bad.send(Message::Text("{not json".into())).await.expect("send");
    assert_closed(&mut bad).await;

    let mut unknown = relay.client("/X").await;
    send(&mut unknown, json!({"type": "shout", "data": 1})).await;
    assert_closed(&mut unknown).await;

    relay.wait_for("/X", |s| s.clients == 1).await;
    send(&mut good, json!({"type": "request", "id": 2, "method": "m"})).await;
    assert_eq!(recv(&mut good).await["id"], 2);
}

#[tokio::test]
async fn leaving_client_drops_its_pending_requests() {
    let relay = TestRelay::start().await;
    let mut client = relay.client("/X").await;
    let mut server = relay.connect("/X", true).await;
    assert_eq!(recv(&mut client).await, ready());

    send(&mut client, json!({"type": "request", "id": 1, "method": "slow"})).await;
    recv(&mut server).await;
    relay.wait_for("/X", |s| s.pending == 1).await;

    client.close(None).await.expect("close client");
    drop(client);
    relay.wait_for("/X", |s| s.clients == 0 && s.pending == 0).await;

    // the late response is dropped without disturbing the server
    send(&mut server, json!({"type": "response", "id": 1, "method": "slow", "result": null, "error": null})).await;
    assert_silent(&mut server).await;
}

#[tokio::test]
async fn plain_http_returns_health() {
    let relay = TestRelay::start().await;
    let _client = relay.client("/notes").await;

    let url = format!("http://127.0.0.1:{}/", relay.port);
    let json: Value = reqwest::get(&url)
        .await
        .expect("GET health")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(json["runtime"], "running");
    assert_eq!(json["port"], relay.port);
    assert_eq!(
        json["channels"],
        json!([{"path": "/notes", "hasServer": false, "clients": 1, "pending": 0}])
    );
}
