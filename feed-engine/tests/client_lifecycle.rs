//! Connection lifecycle against a local WebSocket server

use feed_engine::{Client, ClientConfig, ConnectionState, Handlers, Stream, StreamError};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{accept_async, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

fn config() -> ClientConfig {
    ClientConfig {
        connection_timeout: Duration::from_secs(2),
        keep_alive: Duration::from_secs(30),
        max_ping_pong_misses: 2,
    }
}

/// Settles `hash` with `value` for messages shaped `{"hash": .., "value": ..}`
fn route(client: &Client<u64>, message: Value) {
    if let (Some(hash), Some(value)) = (message["hash"].as_str(), message["value"].as_u64()) {
        client.resolve(value, hash);
    }
}

/// Accept one WebSocket connection and hand it to `session`
async fn serve<F, Fut>(session: F) -> String
where
    F: FnOnce(WebSocketStream<TcpStream>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        let ws = accept_async(socket).await.unwrap();
        session(ws).await;
    });
    format!("ws://{addr}")
}

async fn drain(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(_)) = ws.next().await {}
}

#[tokio::test]
async fn test_watch_subscribes_once_and_resolves() {
    let url = serve(|mut ws| async move {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            return;
        };
        let request: Value = serde_json::from_str(&text).unwrap();
        if request["op"] == "subscribe" {
            ws.send(Message::Text(json!({"hash": "ticker", "value": 42}).to_string()))
                .await
                .unwrap();
        }
        drain(ws).await;
    })
    .await;

    let stream = Stream::new(config(), route);
    let future = stream.watch(&url, "ticker", Some(json!({"op": "subscribe"})), Some("ticker"));
    assert_eq!(timeout(WAIT, future).await.unwrap(), Ok(42));

    let client = stream.client(&url);
    assert!(client.is_open());
    assert!(client.is_subscribed("ticker"));
    assert!(client.connection_established().is_some());
    assert!(client.pending("ticker").is_none());

    stream.close_all().await;
    assert_eq!(client.status(), ConnectionState::Closed);
    assert!(stream.is_empty());
}

#[tokio::test]
async fn test_malformed_message_is_dropped() {
    let url = serve(|mut ws| async move {
        ws.send(Message::Text("{not json".to_string())).await.unwrap();
        ws.send(Message::Text("pong".to_string())).await.unwrap();
        ws.send(Message::Text(json!({"hash": "a", "value": 7}).to_string()))
            .await
            .unwrap();
        drain(ws).await;
    })
    .await;

    let client = Client::new(url, config(), Handlers::new(route));
    let pending = client.future("a");
    client.connect(Duration::ZERO);
    assert_eq!(timeout(WAIT, pending).await.unwrap(), Ok(7));
    assert!(client.is_open());
    client.close().await;
}

#[tokio::test]
async fn test_server_close_rejects_pending_futures() {
    let url = serve(|mut ws| async move {
        sleep(Duration::from_millis(50)).await;
        let frame = CloseFrame {
            code: CloseCode::Away,
            reason: "maintenance".into(),
        };
        let _ = ws.close(Some(frame)).await;
        drain(ws).await;
    })
    .await;

    let stream = Stream::new(config(), route);
    let pending = stream.watch(&url, "never", None, None);
    let error = timeout(WAIT, pending).await.unwrap().unwrap_err();

    assert_eq!(error, StreamError::RemoteClose { url: url.clone(), code: 1001 });
    // the registry forgets a client closed by the server
    assert!(stream.is_empty());
}

#[tokio::test]
async fn test_connection_timeout() {
    // accepts TCP but never answers the WebSocket handshake
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        sleep(Duration::from_secs(30)).await;
        drop(socket);
    });

    let config = ClientConfig {
        connection_timeout: Duration::from_millis(200),
        ..config()
    };
    let client = Client::new(url.clone(), config, Handlers::new(route));
    let pending = client.future("a");
    let connected = client.connect(Duration::ZERO);

    let expected = StreamError::ConnectionTimeout { url, timeout_ms: 200 };
    assert_eq!(timeout(WAIT, connected).await.unwrap(), Err(expected.clone()));
    assert_eq!(timeout(WAIT, pending).await.unwrap(), Err(expected.clone()));
    assert_eq!(client.status(), ConnectionState::Errored);
    assert_eq!(client.error(), Some(expected));
}

#[tokio::test]
async fn test_backoff_delays_the_connection() {
    let url = serve(drain).await;
    let config = ClientConfig {
        connection_timeout: Duration::from_millis(500),
        ..config()
    };
    let client = Client::new(url, config, Handlers::new(route));
    let connected = client.connect(Duration::from_millis(300));
    // while connecting, the same future is handed out
    assert!(client.connect(Duration::ZERO).same(&connected));

    assert!(timeout(WAIT, connected).await.unwrap().is_ok());
    let started = client.connection_started().unwrap();
    let established = client.connection_established().unwrap();
    assert!(established - started >= 300);
    client.close().await;
}

#[tokio::test]
async fn test_missing_pongs_fail_the_connection() {
    // completes the handshake, then never reads so pings go unanswered
    let url = serve(|ws| async move {
        sleep(Duration::from_secs(30)).await;
        drop(ws);
    })
    .await;

    let config = ClientConfig {
        keep_alive: Duration::from_millis(100),
        max_ping_pong_misses: 2,
        ..config()
    };
    let client = Client::new(url, config, Handlers::new(route));
    let pending = client.future("a");
    assert!(timeout(WAIT, client.connect(Duration::ZERO)).await.unwrap().is_ok());

    let error = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(error, StreamError::KeepaliveTimeout { .. }));
    assert_eq!(client.status(), ConnectionState::Errored);
}

#[tokio::test]
async fn test_client_close_rejects_pending_futures() {
    let url = serve(drain).await;
    let client = Client::new(url, config(), Handlers::new(route));
    let pending = client.future("a");
    assert!(timeout(WAIT, client.connect(Duration::ZERO)).await.unwrap().is_ok());

    client.close().await;
    let error = timeout(WAIT, pending).await.unwrap().unwrap_err();
    assert!(matches!(error, StreamError::ConnectionClosed(_)));
    assert_eq!(client.status(), ConnectionState::Closed);
    assert!(client.send(&json!({"op": "ping"})).is_err());
}
