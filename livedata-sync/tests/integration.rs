//! Integration tests for DDP over a real WebSocket.
//!
//! These tests start a real server and connect raw sockets or full
//! clients, verifying the wire protocol and latency compensation.

use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use livedata_core::{Collection, Document, FindOptions, Value};
use livedata_sync::{
    CallOptions, ClientConfig, ClientError, Connection, DdpClient, DdpMessage, DdpServer, ErrorCode, HandlerError,
    InvocationType, MethodError, MethodInvocation, Publication, Rule, RuleMatcher, ServerConfig, StreamStatus,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port after `setup` registered its handlers.
async fn start_test_server(setup: impl FnOnce(&DdpServer)) -> (u16, DdpServer) {
    start_configured_server(ServerConfig::default(), setup).await
}

async fn start_configured_server(config: ServerConfig, setup: impl FnOnce(&DdpServer)) -> (u16, DdpServer) {
    let port = free_port().await;
    let config = ServerConfig { bind_addr: format!("127.0.0.1:{port}"), ..config };
    let server = DdpServer::new(config);
    setup(&server);
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, server)
}

fn doc(j: serde_json::Value) -> Document {
    match Value::from(j) {
        Value::Object(d) => d,
        other => panic!("not an object: {other:?}"),
    }
}

async fn raw_connect(port: u16) -> Ws {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/websocket")).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, msg: DdpMessage) {
    ws.send(Message::Text(msg.encode().unwrap().into())).await.unwrap();
}

async fn recv(ws: &mut Ws) -> DdpMessage {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next()).await.expect("timed out").unwrap().unwrap();
        if let Message::Text(text) = frame {
            return DdpMessage::decode(text.as_str(), &Default::default()).unwrap();
        }
    }
}

/// Everything the server sends until it goes quiet for 200ms.
async fn drain(ws: &mut Ws) -> Vec<DdpMessage> {
    let mut out = Vec::new();
    while let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(200), ws.next()).await {
        if let Message::Text(text) = frame {
            out.push(DdpMessage::decode(text.as_str(), &Default::default()).unwrap());
        }
    }
    out
}

async fn handshake(ws: &mut Ws) -> String {
    send(ws, DdpMessage::Connect { version: "1".into(), support: vec!["1".into()], session: None }).await;
    match recv(ws).await {
        DdpMessage::Connected { session } => session,
        other => panic!("Expected connected, got {other:?}"),
    }
}

fn client(port: u16) -> DdpClient {
    DdpClient::connect(ClientConfig::new(format!("ws://127.0.0.1:{port}/websocket")))
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

async fn login(mut inv: MethodInvocation, params: Vec<Value>) -> Result<Value, HandlerError> {
    let user = params.first().and_then(Value::as_str).map(str::to_string);
    inv.set_user_id(user);
    Ok(Value::Null)
}

async fn insert_item(items: Collection, mut inv: MethodInvocation, params: Vec<Value>) -> Result<Value, HandlerError> {
    let Some(owner) = inv.user_id().map(str::to_string) else {
        return Err(MethodError::new(403, "Not logged in").into());
    };
    let mut doc = match params.into_iter().next() {
        Some(Value::Object(d)) => d,
        _ => Document::new(),
    };
    doc.insert("owner".into(), Value::from(owner));
    doc.insert("stamped".into(), Value::from(true));
    Ok(inv.insert(&items, doc)?)
}

/// Sleeps before answering; passing `true` unblocks the connection first.
async fn slow(mut inv: MethodInvocation, params: Vec<Value>) -> Result<Value, HandlerError> {
    if params.first() == Some(&Value::from(true)) {
        inv.unblock();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    Ok(Value::from("slow"))
}

async fn fast(_inv: MethodInvocation, _params: Vec<Value>) -> Result<Value, HandlerError> {
    Ok(Value::from("fast"))
}

fn call(id: &str, method: &str, params: Vec<Value>) -> DdpMessage {
    DdpMessage::Method { id: id.into(), method: method.into(), params, random_seed: None }
}

/// Ids of the next `n` method results, in arrival order.
async fn result_order(ws: &mut Ws, n: usize) -> Vec<String> {
    let mut ids = Vec::new();
    while ids.len() < n {
        if let DdpMessage::Result { id, .. } = recv(ws).await {
            ids.push(id);
        }
    }
    ids
}

fn owned_items(server: &DdpServer, items: &Collection) {
    let published = items.clone();
    server.publish("items", move |sub, _| match sub.user_id() {
        Some(owner) => Ok(published.find(&Value::from(json!({ "owner": owner })))?.into()),
        None => {
            sub.ready();
            Ok(Publication::Manual)
        }
    });
    server.method("login", login);
    let writable = items.clone();
    server.method("items.insert", move |inv, params| insert_item(writable.clone(), inv, params));
}

#[tokio::test]
async fn test_server_accepts_handshake() {
    let (port, server) = start_test_server(|_| {}).await;
    let mut ws = raw_connect(port).await;

    let session = handshake(&mut ws).await;
    assert!(!session.is_empty());
    wait_until(|| server.stats().active_sessions == 1).await;
}

#[tokio::test]
async fn test_message_before_connect_is_rejected() {
    let (port, _server) = start_test_server(|_| {}).await;
    let mut ws = raw_connect(port).await;

    send(&mut ws, DdpMessage::Sub { id: "s".into(), name: "x".into(), params: vec![] }).await;
    match recv(&mut ws).await {
        DdpMessage::Error { reason, offending_message } => {
            assert_eq!(reason, "Must connect first");
            assert_eq!(offending_message.unwrap()["msg"], "sub");
        }
        other => panic!("Expected error, got {other:?}"),
    }
    // The socket stays usable for a proper handshake.
    handshake(&mut ws).await;
}

#[tokio::test]
async fn test_unsupported_version_gets_failed() {
    let (port, _server) = start_test_server(|_| {}).await;
    let mut ws = raw_connect(port).await;

    send(&mut ws, DdpMessage::Connect { version: "9".into(), support: vec!["9".into(), "pre1".into()], session: None })
        .await;
    assert_eq!(recv(&mut ws).await, DdpMessage::Failed { version: "pre1".into() });
}

#[tokio::test]
async fn test_client_fails_when_no_common_version() {
    let (port, _server) = start_test_server(|_| {}).await;
    let config = ClientConfig {
        supported_versions: vec!["9".into()],
        ..ClientConfig::new(format!("ws://127.0.0.1:{port}/websocket"))
    };
    let client = DdpClient::connect(config);

    let result = timeout(Duration::from_secs(2), client.connected()).await.unwrap();
    assert!(matches!(result, Err(ClientError::ProtocolVersion(_))), "got {result:?}");
    assert!(matches!(client.status(), StreamStatus::Failed(_)));
}

#[tokio::test]
async fn test_unknown_method_returns_404_then_updated() {
    let (port, _server) = start_test_server(|_| {}).await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(&mut ws, DdpMessage::Method { id: "m1".into(), method: "nope".into(), params: vec![], random_seed: None })
        .await;
    match recv(&mut ws).await {
        DdpMessage::Result { id, outcome: Err(e) } => {
            assert_eq!(id, "m1");
            assert_eq!(e.error, ErrorCode::Number(404));
            assert_eq!(e.reason.as_deref(), Some("Method 'nope' not found"));
        }
        other => panic!("Expected result, got {other:?}"),
    }
    assert_eq!(recv(&mut ws).await, DdpMessage::Updated { methods: vec!["m1".into()] });
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let (port, _server) = start_test_server(|_| {}).await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(&mut ws, DdpMessage::Ping { id: Some("42".into()) }).await;
    assert_eq!(recv(&mut ws).await, DdpMessage::Pong { id: Some("42".into()) });
}

#[tokio::test]
async fn test_overlapping_publications_send_one_removed() {
    let items = Collection::new("items");
    items.insert(doc(json!({"_id": "a", "title": "shared", "n": 7}))).unwrap();
    let published = items.clone();
    let (port, _server) = start_test_server(move |server| {
        let titles = published.clone();
        server.publish("titles", move |_, _| {
            let options = FindOptions { fields: Some(Value::from(json!({"title": 1}))), ..Default::default() };
            Ok(titles.find_with(&Value::from(json!({})), options)?.into())
        });
        let full = published.clone();
        server.publish("full", move |_, _| Ok(full.find(&Value::from(json!({"title": "shared"})))?.into()));
    })
    .await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(&mut ws, DdpMessage::Sub { id: "s1".into(), name: "titles".into(), params: vec![] }).await;
    send(&mut ws, DdpMessage::Sub { id: "s2".into(), name: "full".into(), params: vec![] }).await;
    let initial = drain(&mut ws).await;
    assert_eq!(initial.iter().filter(|m| m.kind() == "added").count(), 1);
    assert_eq!(initial.iter().filter(|m| m.kind() == "ready").count(), 2);

    // The document stays visible with only the remaining publication's fields.
    send(&mut ws, DdpMessage::Unsub { id: "s2".into() }).await;
    let partial = drain(&mut ws).await;
    assert!(partial.iter().all(|m| m.kind() != "removed"));
    let cleared = partial.iter().find_map(|m| match m {
        DdpMessage::Changed { fields, .. } => Some(fields.clone()),
        _ => None,
    });
    assert_eq!(cleared.unwrap().get("n"), Some(&None));

    send(&mut ws, DdpMessage::Unsub { id: "s1".into() }).await;
    let teardown = drain(&mut ws).await;
    let removed: Vec<_> = teardown.iter().filter(|m| m.kind() == "removed").collect();
    assert_eq!(removed, vec![&DdpMessage::Removed { collection: "items".into(), id: Value::from("a") }]);
}

#[tokio::test]
async fn test_only_owned_inserts_are_published() {
    let items = Collection::new("items");
    let shared = items.clone();
    let (port, _server) = start_test_server(move |server| owned_items(server, &shared)).await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(
        &mut ws,
        DdpMessage::Method { id: "1".into(), method: "login".into(), params: vec![Value::from("alice")], random_seed: None },
    )
    .await;
    send(&mut ws, DdpMessage::Sub { id: "s".into(), name: "items".into(), params: vec![] }).await;
    let setup = drain(&mut ws).await;
    assert!(setup.contains(&DdpMessage::Ready { subs: vec!["s".into()] }));

    items.insert(doc(json!({"_id": "b1", "owner": "bob"}))).unwrap();
    assert!(drain(&mut ws).await.iter().all(|m| m.kind() != "added"));

    items.insert(doc(json!({"_id": "a1", "owner": "alice"}))).unwrap();
    let added: Vec<_> = drain(&mut ws).await.into_iter().filter(|m| m.kind() == "added").collect();
    assert_eq!(added.len(), 1);
    assert!(matches!(&added[0], DdpMessage::Added { id, .. } if *id == Value::from("a1")));
}

#[tokio::test]
async fn test_unknown_subscription_reports_404() {
    let (port, _server) = start_test_server(|_| {}).await;
    let client = client(port);
    client.connected().await.unwrap();

    let mut handle = client.subscribe("nope", vec![]);
    match timeout(Duration::from_secs(2), handle.ready()).await.unwrap() {
        Err(ClientError::Method(e)) => assert_eq!(e.error, ErrorCode::Number(404)),
        other => panic!("Expected 404, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publication_scoped_to_user() {
    let items = Collection::new("items");
    items.insert(doc(json!({"_id": "a1", "owner": "alice"}))).unwrap();
    items.insert(doc(json!({"_id": "b1", "owner": "bob"}))).unwrap();
    let shared = items.clone();
    let (port, _server) = start_test_server(move |server| owned_items(server, &shared)).await;

    let client = client(port);
    client.connected().await.unwrap();
    let local = client.collection("items");
    let mut handle = client.subscribe("items", vec![]);
    timeout(Duration::from_secs(2), handle.ready()).await.unwrap().unwrap();
    assert!(local.is_empty());

    client.call("login", vec![Value::from("alice")]).await.unwrap();
    wait_until(|| local.len() == 1).await;
    assert!(local.get(&Value::from("a1")).is_some());
    assert!(local.get(&Value::from("b1")).is_none());

    // Switching user swaps the published set.
    client.call("login", vec![Value::from("bob")]).await.unwrap();
    wait_until(|| local.get(&Value::from("b1")).is_some()).await;
    assert_eq!(local.len(), 1);
}

#[tokio::test]
async fn test_stub_result_replaced_by_server_version() {
    let items = Collection::new("items");
    let shared = items.clone();
    let (port, _server) = start_test_server(move |server| owned_items(server, &shared)).await;

    let client = client(port);
    client.connected().await.unwrap();
    client.call("login", vec![Value::from("alice")]).await.unwrap();
    let local = client.collection("items");
    let mut handle = client.subscribe("items", vec![]);
    timeout(Duration::from_secs(2), handle.ready()).await.unwrap().unwrap();

    let stub_store = local.clone();
    client.method_stub("items.insert", move |inv, params| {
        let doc = match params.first() {
            Some(Value::Object(d)) => d.clone(),
            _ => Document::new(),
        };
        inv.insert(&stub_store, doc).map_err(|e| MethodError::new(500, e.to_string()))
    });

    let call = client.apply(
        "items.insert",
        vec![Value::from(json!({"title": "X"}))],
        CallOptions { return_stub_value: true, ..Default::default() },
    );
    let stub_id = call.stub_value().cloned().unwrap();
    let simulated = local.get(&stub_id).unwrap();
    assert_eq!(simulated["title"], Value::from("X"));
    assert!(!simulated.contains_key("stamped"));

    let server_id = timeout(Duration::from_secs(2), call.result()).await.unwrap().unwrap();
    assert_eq!(server_id, stub_id);
    let confirmed = local.get(&stub_id).unwrap();
    assert_eq!(confirmed["stamped"], Value::from(true));
    assert_eq!(confirmed["owner"], Value::from("alice"));
    assert_eq!(items.len(), 1);
}

#[tokio::test]
async fn test_rate_limit_rejects_excess_calls() {
    let (port, _server) = start_test_server(|server| {
        server.method("echo", |_, params| async move {
            Ok::<_, HandlerError>(params.into_iter().next().unwrap_or(Value::Null))
        });
        server.add_rate_limit_rule(
            Rule {
                type_: Some(InvocationType::Method),
                name: RuleMatcher::Exact("echo".into()),
                ..Default::default()
            },
            2,
            60_000,
        );
    })
    .await;

    let client = client(port);
    client.connected().await.unwrap();
    assert_eq!(client.call("echo", vec![Value::from(1)]).await.unwrap(), Value::from(1));
    assert_eq!(client.call("echo", vec![Value::from(2)]).await.unwrap(), Value::from(2));
    match client.call("echo", vec![Value::from(3)]).await {
        Err(ClientError::Method(e)) => {
            assert_eq!(e.error, ErrorCode::Name("too-many-requests".into()));
            assert!(e.time_to_reset().is_some());
        }
        other => panic!("Expected rate limit error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_reconnects_and_resubscribes() {
    let items = Collection::new("items");
    items.insert(doc(json!({"_id": "a", "owner": "x"}))).unwrap();
    let shared = items.clone();
    let connections: Arc<Mutex<Vec<Connection>>> = Arc::default();
    let seen = Arc::clone(&connections);
    let (port, server) = start_test_server(move |server| {
        let published = shared.clone();
        server.publish("all", move |_, _| Ok(published.find(&Value::from(json!({})))?.into()));
        server.on_connection(move |conn| seen.lock().unwrap().push(conn.clone()));
    })
    .await;

    let client = client(port);
    let first_session = client.connected().await.unwrap();
    let local = client.collection("items");
    let mut handle = client.subscribe("all", vec![]);
    timeout(Duration::from_secs(2), handle.ready()).await.unwrap().unwrap();
    assert_eq!(local.len(), 1);

    let first = connections.lock().unwrap()[0].clone();
    first.close();
    wait_until(|| client.session_id().is_some_and(|s| s != first_session)).await;
    assert_eq!(server.stats().total_connections, 2);

    // The resent sub is live on the new session.
    items.insert(doc(json!({"_id": "b", "owner": "y"}))).unwrap();
    wait_until(|| local.len() == 2).await;
    assert!(local.get(&Value::from("a")).is_some());
}

#[tokio::test]
async fn test_methods_run_in_call_order() {
    let (port, _server) = start_test_server(|server| {
        server.method("slow", slow);
        server.method("fast", fast);
    })
    .await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(&mut ws, call("1", "slow", vec![])).await;
    send(&mut ws, call("2", "fast", vec![])).await;
    assert_eq!(result_order(&mut ws, 2).await, vec!["1", "2"]);
}

#[tokio::test]
async fn test_unblock_lets_later_method_finish_first() {
    let (port, _server) = start_test_server(|server| {
        server.method("slow", slow);
        server.method("fast", fast);
    })
    .await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(&mut ws, call("1", "slow", vec![Value::from(true)])).await;
    send(&mut ws, call("2", "fast", vec![])).await;
    assert_eq!(result_order(&mut ws, 2).await, vec!["2", "1"]);
}

#[tokio::test]
async fn test_nosub_waits_for_rerun_output() {
    let things = Collection::new("things");
    things.insert(doc(json!({"_id": "t1", "n": 1}))).unwrap();
    let shared = things.clone();
    let (port, _server) = start_test_server(move |server| {
        server.publish("guests", move |sub, _| match sub.user_id() {
            Some(_) => Err(MethodError::new(403, "Guests only").into()),
            None => Ok(shared.find(&Value::from(json!({})))?.into()),
        });
        server.method("login", login);
    })
    .await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;

    send(&mut ws, DdpMessage::Sub { id: "g".into(), name: "guests".into(), params: vec![] }).await;
    let initial = drain(&mut ws).await;
    assert!(initial.contains(&DdpMessage::Ready { subs: vec!["g".into()] }));

    send(&mut ws, call("1", "login", vec![Value::from("alice")])).await;
    let after = drain(&mut ws).await;
    let removed = after
        .iter()
        .position(|m| *m == DdpMessage::Removed { collection: "things".into(), id: Value::from("t1") })
        .expect("no removed");
    let nosub = after.iter().position(|m| matches!(m, DdpMessage::Nosub { id, .. } if id == "g")).expect("no nosub");
    assert!(removed < nosub, "nosub overtook the rerun's data: {after:?}");
    match &after[nosub] {
        DdpMessage::Nosub { error: Some(e), .. } => assert_eq!(e.error, ErrorCode::Number(403)),
        other => panic!("Expected nosub with error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_closes_silent_session() {
    let config = ServerConfig { heartbeat_interval_ms: 100, heartbeat_timeout_ms: 100, ..Default::default() };
    let (port, server) = start_configured_server(config, |_| {}).await;
    let mut ws = raw_connect(port).await;
    handshake(&mut ws).await;
    wait_until(|| server.stats().active_sessions == 1).await;

    // Read without ever answering; the server pings, then gives up.
    let mut pinged = false;
    loop {
        match timeout(Duration::from_secs(2), ws.next()).await.expect("session never closed") {
            Some(Ok(Message::Text(text))) => {
                if let Ok(DdpMessage::Ping { .. }) = DdpMessage::decode(text.as_str(), &Default::default()) {
                    pinged = true;
                }
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(_)) => {}
        }
    }
    assert!(pinged);
    wait_until(|| server.stats().active_sessions == 0).await;
}

#[tokio::test]
async fn test_client_reconnects_after_missed_pong() {
    let config = ServerConfig { heartbeat_interval_ms: 0, respond_to_pings: false, ..Default::default() };
    let (port, server) = start_configured_server(config, |_| {}).await;
    let client = DdpClient::connect(ClientConfig {
        heartbeat_interval_ms: 100,
        heartbeat_timeout_ms: 100,
        ..ClientConfig::new(format!("ws://127.0.0.1:{port}/websocket"))
    });

    let first_session = client.connected().await.unwrap();
    wait_until(|| client.session_id().is_some_and(|s| s != first_session)).await;
    assert!(server.stats().total_connections >= 2);
}
