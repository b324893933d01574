#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use proximity_broker::config::BrokerConfig;
use proximity_broker::persist::Persistence;
use proximity_broker::{serve_http, serve_ws, AppState};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct Harness {
    pub state: AppState,
    pub http: SocketAddr,
    pub ws: SocketAddr,
    pub client: reqwest::Client,
}

impl Harness {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.http, path)
    }

    pub async fn connect(&self, path: &str) -> WsClient {
        let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}{}", self.ws, path))
            .await
            .expect("websocket connect");
        socket
    }

    /// connect on /ws/device and wait until the link is claimed
    pub async fn connect_device(&self) -> WsClient {
        let socket = self.connect("/ws/device").await;
        let link = self.state.link.clone();
        wait_for(|| link.is_linked()).await;
        socket
    }

    pub async fn wait_for_history(&self, len: usize) {
        for _ in 0..200 {
            if self.state.store.history_len().await == len {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("history never reached {len} entries");
    }
}

pub async fn start() -> Harness {
    start_with(Persistence::disabled()).await
}

/// both listeners on loopback ephemeral ports; they live as long as the test runtime
pub async fn start_with(persistence: Persistence) -> Harness {
    let config = BrokerConfig::default();
    let state = AppState::new(&config, persistence);

    let http_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http = http_listener.local_addr().unwrap();
    let ws = ws_listener.local_addr().unwrap();

    tokio::spawn(serve_http(http_listener, state.clone(), std::future::pending()));
    tokio::spawn(serve_ws(ws_listener, state.clone(), std::future::pending()));

    Harness {
        state,
        http,
        ws,
        client: reqwest::Client::new(),
    }
}

pub async fn wait_for<F: FnMut() -> bool>(mut cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

pub async fn send_json(socket: &mut WsClient, value: serde_json::Value) {
    socket.send(Message::Text(value.to_string())).await.expect("websocket send");
}

/// next text frame, or None on close / timeout
pub async fn next_text(socket: &mut WsClient, wait: Duration) -> Option<String> {
    loop {
        match tokio::time::timeout(wait, socket.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

pub async fn next_json(socket: &mut WsClient) -> serde_json::Value {
    let text = next_text(socket, Duration::from_secs(2))
        .await
        .expect("expected a text frame");
    serde_json::from_str(&text).expect("frame is json")
}
