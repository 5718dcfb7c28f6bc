use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{ConnectInfo, FromRequest, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};

use realm_core::participant::ParticipantId;
use realm_core::protocol::{MAX_MESSAGE_SIZE, decode_client_message};

use crate::game_loop::{Frame, GameCommand};
use crate::state::{AppState, ConnectionGuard};

/// Close code sent with a kick or shutdown.
const CLOSE_POLICY: u16 = 1008;

pub async fn ws_handler(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Result<axum::response::Response, StatusCode> {
    let max = state.config.limits.max_connections;
    let Some(guard) = ConnectionGuard::try_acquire(Arc::clone(&state.ws_connection_count), max)
    else {
        tracing::warn!(max, "WS connection limit reached");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };

    // The peer address is the network fingerprint used by the collusion
    // checks. Without it every connection gets its own.
    let fingerprint = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let ws = WebSocketUpgrade::from_request(request, &state)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, fingerprint, guard))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    fingerprint: String,
    _guard: ConnectionGuard,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::channel::<Frame>(state.config.limits.outbound_buffer);
    let (reply_tx, reply_rx) = oneshot::channel();

    let connect = GameCommand::Connect {
        fingerprint,
        outbound: tx,
        reply: reply_tx,
    };
    if state.commands.send(connect).await.is_err() {
        return;
    }
    let Ok(id) = reply_rx.await else {
        return;
    };
    tracing::info!(participant_id = id, "Participant connected");

    let writer = spawn_writer(ws_sender, rx);
    read_loop(&mut ws_receiver, &state, id).await;

    let _ = state.commands.send(GameCommand::Disconnect { id }).await;
    // The loop drops our sender on disconnect, which ends the writer.
    let _ = writer.await;
    tracing::info!(participant_id = id, "Participant disconnected");
}

fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if ws_sender.send(Message::Text(text.as_ref().into())).await.is_err() {
                        break;
                    }
                },
                Frame::Close(reason) => {
                    let close = CloseFrame {
                        code: CLOSE_POLICY,
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(close))).await;
                    break;
                },
            }
        }
    })
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

async fn read_loop(ws_receiver: &mut SplitStream<WebSocket>, state: &AppState, id: ParticipantId) {
    let rate = state.config.limits.message_rate_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            Message::Binary(_) => {
                forward(state, GameCommand::Malformed { id }).await;
                continue;
            },
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::debug!(participant_id = id, "Rate limited");
            forward(state, GameCommand::Malformed { id }).await;
            continue;
        }

        let cmd = match decode_client_message(text.as_str()) {
            Ok(msg) => GameCommand::Message { id, msg },
            Err(e) => {
                tracing::debug!(participant_id = id, error = %e, "Dropped malformed frame");
                GameCommand::Malformed { id }
            },
        };
        if !forward(state, cmd).await {
            break;
        }
    }
}

/// Returns false once the control loop is gone.
async fn forward(state: &AppState, cmd: GameCommand) -> bool {
    state.commands.send(cmd).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limiter_drains_and_refills() {
        let mut limiter = RateLimiter::new(2.0, 100.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(limiter.allow());
    }

    #[tokio::test]
    async fn rate_limiter_without_refill_stays_empty() {
        let mut limiter = RateLimiter::new(1.0, 0.0);
        assert!(limiter.allow());
        assert!(!limiter.allow());
        assert!(!limiter.allow());
    }
}
