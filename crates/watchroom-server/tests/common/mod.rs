use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use watchroom_core::net::messages::{ClientMessage, RoomJoinedMsg, ServerMessage};
use watchroom_core::net::protocol::{decode_server_message, encode_client_message};
use watchroom_core::test_helpers::join;

use watchroom_server::config::{RoomsConfig, ServerConfig};
use watchroom_server::state::AppState;
use watchroom_server::{build_app, spawn_background_tasks};

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    _shutdown: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub async fn new() -> Self {
        Self::from_config(test_config()).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app(config);
        spawn_background_tasks(&state);

        let handle = tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            state,
            _shutdown: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }
}

/// Defaults with a short migration resync and the periodic clock broadcast
/// off, so tests only see the frames they provoke.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        rooms: RoomsConfig {
            host_resync_delay_ms: 50,
            sync_broadcast_interval_secs: 0,
            ..RoomsConfig::default()
        },
        ..ServerConfig::default()
    }
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn ws_send(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Text(encoded.into())).await.unwrap();
}

pub async fn ws_send_raw(stream: &mut WsStream, text: &str) {
    stream.send(Message::Text(text.into())).await.unwrap();
}

/// Next text frame, skipping control frames. Panics after 5s.
pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, next_text(stream))
        .await
        .expect("Timed out waiting for WebSocket message")
}

/// Like [`ws_read_server_msg`] but returns `None` on timeout.
pub async fn ws_try_read_server_msg(stream: &mut WsStream, timeout_ms: u64) -> Option<ServerMessage> {
    tokio::time::timeout(Duration::from_millis(timeout_ms), next_text(stream))
        .await
        .ok()
}

async fn next_text(stream: &mut WsStream) -> ServerMessage {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                return decode_server_message(text.as_str().as_bytes()).unwrap();
            },
            Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
            Some(Err(e)) => panic!("WebSocket error: {e}"),
            None => panic!("WebSocket stream ended"),
            _ => continue,
        }
    }
}

/// Read until a message matches `pred`, discarding everything before it.
pub async fn ws_read_until(
    stream: &mut WsStream,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let msg = ws_read_server_msg(stream).await;
        if pred(&msg) {
            return msg;
        }
    }
}

/// Collect every message until the stream has been quiet for `quiet_ms`.
pub async fn ws_drain(stream: &mut WsStream, quiet_ms: u64) -> Vec<ServerMessage> {
    let mut out = Vec::new();
    while let Some(msg) = ws_try_read_server_msg(stream, quiet_ms).await {
        out.push(msg);
    }
    out
}

/// Join and return the snapshot; panics if the server answers with an error.
pub async fn ws_join(
    stream: &mut WsStream,
    room_id: &str,
    username: &str,
    user_id: &str,
) -> RoomJoinedMsg {
    ws_send(stream, &join(room_id, username, user_id)).await;
    match ws_read_until(stream, |m| {
        matches!(m, ServerMessage::RoomJoined(_) | ServerMessage::Error(_))
    })
    .await
    {
        ServerMessage::RoomJoined(snapshot) => snapshot,
        other => panic!("Expected room_joined, got: {other:?}"),
    }
}

/// Read until the next `error` frame and return its text.
pub async fn ws_expect_error(stream: &mut WsStream) -> String {
    match ws_read_until(stream, |m| matches!(m, ServerMessage::Error(_))).await {
        ServerMessage::Error(e) => e.message,
        _ => unreachable!(),
    }
}
