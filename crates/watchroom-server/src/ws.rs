use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::extract::ConnectInfo;
use axum::extract::FromRequest;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use watchroom_core::net::messages::{ClientMessage, JoinRoomMsg, ServerMessage};
use watchroom_core::net::protocol::{decode_client_message, encode_server_message};
use watchroom_core::room::{ConnectionId, UserId};
use watchroom_core::time::timestamp_now_ms;

use crate::room_manager::Dispatch;
use crate::state::{AppState, ConnectionGuard, IpConnectionGuard};

pub async fn ws_handler(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Result<axum::response::Response, StatusCode> {
    let max_ws = state.config.limits.max_ws_connections;
    let current = state.ws_connection_count.load(Ordering::Relaxed);
    if current >= max_ws {
        tracing::warn!(current, max = max_ws, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip())
        .unwrap_or(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
    let max_per_ip = state.config.limits.max_ws_per_ip;
    let Some(ip_guard) = IpConnectionGuard::try_acquire(ip, Arc::clone(&state.ws_per_ip), max_per_ip)
    else {
        tracing::warn!(%ip, max_per_ip, "Per-IP WS connection limit reached");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    };

    let ws = WebSocketUpgrade::from_request(request, &state)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, ip_guard))
        .into_response())
}

/// Membership held by one socket after a successful join.
struct Session {
    connection_id: ConnectionId,
    room_code: String,
    user_id: UserId,
}

async fn handle_socket(socket: WebSocket, state: AppState, _ip_guard: IpConnectionGuard) {
    let _guard = ConnectionGuard::new(Arc::clone(&state.ws_connection_count));
    let (ws_sender, mut ws_receiver) = socket.split();

    let (tx, rx) = mpsc::channel::<Bytes>(state.config.limits.player_message_buffer);
    spawn_writer(ws_sender, rx, state.config.heartbeat.interval());

    let mut session = None;
    read_loop(&mut ws_receiver, &state, &tx, &mut session).await;

    if let Some(session) = session {
        leave(&state, session).await;
    }
    // The writer drains what is still queued and closes the socket once the
    // last sender is gone.
}

/// Forward queued frames to the socket and ping the client every
/// `ping_every` so idle connections stay observable.
fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Bytes>,
    ping_every: Duration,
) {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + ping_every, ping_every);
        loop {
            tokio::select! {
                next = rx.recv() => {
                    let Some(data) = next else {
                        break;
                    };
                    let text = match String::from_utf8(data.to_vec()) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Dropping non-UTF-8 outbound frame");
                            continue;
                        },
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                },
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                },
            }
        }
        if let Err(e) = ws_sender.close().await {
            tracing::debug!(error = %e, "WebSocket close failed");
        }
    });
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    tx: &mpsc::Sender<Bytes>,
    session: &mut Option<Session>,
) {
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);
    let idle_timeout = state.config.heartbeat.timeout();

    loop {
        // Any inbound frame, pongs included, proves the peer is alive.
        let frame = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(error = %e, "WebSocket read error");
                break;
            },
            Ok(None) => break,
            Err(_) => {
                tracing::info!(timeout_secs = idle_timeout.as_secs(), "Heartbeat timeout, dropping connection");
                break;
            },
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let msg = match decode_client_message(text.as_str().as_bytes()) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed client frame");
                continue;
            },
        };

        if !msg.is_rate_exempt() && !rate_limiter.allow() {
            tracing::warn!(
                connection_id = session.as_ref().map(|s| s.connection_id),
                event = msg.event_name(),
                "Rate limited"
            );
            continue;
        }

        handle_client_message(state, tx, session, msg).await;
    }
}

async fn handle_client_message(
    state: &AppState,
    tx: &mpsc::Sender<Bytes>,
    session: &mut Option<Session>,
    msg: ClientMessage,
) {
    match msg {
        ClientMessage::JoinRoom(req) => join(state, tx, session, req).await,
        ClientMessage::LeaveRoom => {
            if let Some(current) = session.take() {
                leave(state, current).await;
            }
        },
        other => {
            let Some(current) = session.as_ref() else {
                send_error(tx, "Join a room first");
                return;
            };
            let event = other.event_name();
            let outcome = state
                .rooms
                .read()
                .await
                .dispatch(current.connection_id, other, timestamp_now_ms());
            match outcome {
                Dispatch::Handled => {},
                Dispatch::Rejected(e) => {
                    tracing::debug!(
                        connection_id = current.connection_id,
                        room = %current.room_code,
                        event,
                        kind = e.kind(),
                        error = %e,
                        "Command rejected"
                    );
                    send_error(tx, e.message());
                },
                Dispatch::NotInRoom => {
                    tracing::debug!(
                        connection_id = current.connection_id,
                        room = %current.room_code,
                        "Connection no longer belongs to its room"
                    );
                    *session = None;
                    send_error(tx, "You are no longer in a room");
                },
            }
        },
    }
}

async fn join(
    state: &AppState,
    tx: &mpsc::Sender<Bytes>,
    session: &mut Option<Session>,
    req: JoinRoomMsg,
) {
    let result = state
        .rooms
        .write()
        .await
        .join(&req, tx.clone(), timestamp_now_ms());

    match result {
        Ok(outcome) => {
            tracing::info!(
                connection_id = outcome.connection_id,
                room = %outcome.room_code,
                user_id = %outcome.user_id,
                is_host = outcome.is_host,
                created = outcome.created,
                reconnected = outcome.reconnected,
                "Joined room"
            );
            let joined = Session {
                connection_id: outcome.connection_id,
                room_code: outcome.room_code,
                user_id: outcome.user_id,
            };
            // Switching rooms leaves the previous one. Rejoining the same
            // room with the same user id already superseded the old
            // connection, so that leave is a no-op.
            if let Some(previous) = session.replace(joined) {
                leave(state, previous).await;
            }
        },
        Err(e) => {
            tracing::info!(
                room = %req.room_id,
                kind = e.kind(),
                error = %e,
                "Join rejected"
            );
            send_error(tx, e.message());
        },
    }
}

async fn leave(state: &AppState, session: Session) {
    let outcome = state
        .rooms
        .write()
        .await
        .leave(session.connection_id, timestamp_now_ms());
    let Some(outcome) = outcome else {
        tracing::debug!(
            connection_id = session.connection_id,
            room = %session.room_code,
            "Connection already detached from its room"
        );
        return;
    };

    tracing::info!(
        connection_id = session.connection_id,
        room = %outcome.room_code,
        user_id = %session.user_id,
        room_destroyed = outcome.room_destroyed,
        new_host = outcome.new_host.as_deref(),
        "Left room"
    );
    if outcome.new_host.is_some() {
        spawn_host_resync(state, outcome.room_code);
    }
}

/// Resend the playback state a moment after a migration, once the new
/// host's player has had time to load.
fn spawn_host_resync(state: &AppState, room_code: String) {
    let rooms = Arc::clone(&state.rooms);
    let delay = state.config.rooms.host_resync_delay();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        rooms.read().await.resync_host(&room_code);
    });
}

fn send_error(tx: &mpsc::Sender<Bytes>, message: &str) {
    match encode_server_message(&ServerMessage::error(message)) {
        Ok(text) => {
            if let Err(e) = tx.try_send(Bytes::from(text)) {
                tracing::debug!(error = %e, "Failed to queue error for client");
            }
        },
        Err(e) => tracing::warn!(error = %e, "Failed to encode error message"),
    }
}
