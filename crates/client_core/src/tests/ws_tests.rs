use super::*;
use crate::test_support::{eventually, pump_namespace};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Router,
};
use serde_json::json;
use shared::protocol::GenericEvent;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpListener;

#[derive(Clone, Default)]
struct MockServer {
    connections: Arc<AtomicUsize>,
    frames: Arc<Mutex<Vec<ClientFrame>>>,
}

async fn ws_handler(ws: WebSocketUpgrade, State(server): State<MockServer>) -> Response {
    ws.on_upgrade(move |socket| serve_socket(socket, server))
}

// Answers every subscribe with noise plus one event for the namespace. The
// first connection is closed right after that to force a reconnect.
async fn serve_socket(mut socket: WebSocket, server: MockServer) {
    let connection = server.connections.fetch_add(1, Ordering::SeqCst);
    while let Some(Ok(msg)) = socket.recv().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let frame: ClientFrame = serde_json::from_str(&text).expect("client frame");
        server.frames.lock().expect("lock").push(frame.clone());
        let ClientFrame::Subscribe { namespace } = frame else {
            continue;
        };

        let name = if connection == 0 {
            "StateEvent"
        } else {
            "LiveValuesEvent"
        };
        let replies = [
            "not json".to_string(),
            json!({ "namespace": "/machine/9/9/9", "event": { "name": "StateEvent", "data": {} } })
                .to_string(),
            json!({ "error": { "code": "validation", "message": "bad frame" } }).to_string(),
            json!({ "namespace": namespace, "event": { "name": name, "data": { "n": connection } } })
                .to_string(),
        ];
        for reply in replies {
            if socket.send(WsMessage::Text(reply)).await.is_err() {
                return;
            }
        }
        if connection == 0 {
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    }
}

async fn spawn_mock() -> (String, MockServer) {
    let server = MockServer::default();
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(server.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("http://{addr}"), server)
}

fn fast_reconnect() -> WsTransportOptions {
    WsTransportOptions {
        reconnect_delay: Duration::from_millis(20),
    }
}

#[tokio::test]
async fn routes_events_and_resubscribes_after_reconnect() {
    let (server_url, server) = spawn_mock().await;
    let transport = WsEventTransport::connect(&server_url, fast_reconnect()).expect("connect");
    let id = pump_namespace(42);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let subscription = transport.subscribe(
        &id,
        Arc::new(move |event: GenericEvent| {
            sink.lock().expect("lock").push((event.name, event.data["n"].clone()));
        }),
    );
    assert_eq!(transport.subscribed_namespaces(), vec![id.path()]);

    let events = Arc::clone(&seen);
    eventually(move || events.lock().expect("lock").len() == 2).await;
    assert_eq!(
        *seen.lock().expect("lock"),
        vec![
            ("StateEvent".to_string(), json!(0)),
            ("LiveValuesEvent".to_string(), json!(1)),
        ]
    );
    assert_eq!(server.connections.load(Ordering::SeqCst), 2);

    drop(subscription);
    assert!(transport.subscribed_namespaces().is_empty());

    let frames = Arc::clone(&server.frames);
    eventually(move || frames.lock().expect("lock").len() == 3).await;
    let path = id.path();
    assert_eq!(
        *server.frames.lock().expect("lock"),
        vec![
            ClientFrame::Subscribe {
                namespace: path.clone()
            },
            ClientFrame::Subscribe {
                namespace: path.clone()
            },
            ClientFrame::Unsubscribe { namespace: path },
        ]
    );
}

#[tokio::test]
async fn keeps_retrying_until_server_is_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let transport =
        WsEventTransport::connect(&format!("http://{addr}"), fast_reconnect()).expect("connect");
    let _subscription = transport.subscribe(&pump_namespace(1), Arc::new(|_| {}));
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(transport.subscribed_namespaces(), vec![pump_namespace(1).path()]);
}

#[tokio::test]
async fn replaced_subscription_keeps_namespace_on_drop() {
    let (server_url, server) = spawn_mock().await;
    let transport = WsEventTransport::connect(&server_url, fast_reconnect()).expect("connect");
    let id = pump_namespace(5);

    let old = transport.subscribe(&id, Arc::new(|_| {}));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let new = transport.subscribe(
        &id,
        Arc::new(move |event: GenericEvent| sink.lock().expect("lock").push(event.name)),
    );
    drop(old);
    assert_eq!(transport.subscribed_namespaces(), vec![id.path()]);

    let events = Arc::clone(&seen);
    eventually(move || events.lock().expect("lock").len() == 2).await;
    let path = id.path();
    let subscribe = ClientFrame::Subscribe {
        namespace: path.clone(),
    };
    assert_eq!(
        *server.frames.lock().expect("lock"),
        vec![subscribe.clone(), subscribe]
    );

    drop(new);
    let frames = Arc::clone(&server.frames);
    eventually(move || frames.lock().expect("lock").len() == 3).await;
    assert_eq!(
        server.frames.lock().expect("lock").last(),
        Some(&ClientFrame::Unsubscribe { namespace: path })
    );
}

#[test]
fn websocket_url_follows_server_scheme() {
    assert_eq!(
        ws_url("http://127.0.0.1:3001").expect("url").as_str(),
        "ws://127.0.0.1:3001/ws"
    );
    assert_eq!(
        ws_url("https://panel.local/qitech/").expect("url").as_str(),
        "wss://panel.local/qitech/ws"
    );
    assert!(matches!(
        ws_url("ftp://panel.local"),
        Err(TransportError::InvalidUrl { .. })
    ));
}

#[test]
fn connect_requires_a_runtime() {
    let err = WsEventTransport::connect("http://127.0.0.1:3001", WsTransportOptions::default())
        .err()
        .expect("no runtime");
    assert!(matches!(err, TransportError::Connect(_)));
}
