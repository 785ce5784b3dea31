use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Message as ChatMessage, MessageStatus};
use crate::state::AppState;

use super::events::{wrap_outbound_payload, ClientFrame, ServerFrame};

/// Gateway Client Session: the per-connection state machine taking a socket
/// from OPENED through AUTHENTICATING, READY, SERVING, and finally CLOSED.
///
/// GET /ws — the upgrade handler itself does no authentication; the first
/// frame on the socket must be an `auth` envelope, not a query-string token,
/// so the upgrade always succeeds and the state machine below decides
/// whether the connection survives past AUTHENTICATING.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// `last_activity`, refreshed on every inbound frame and polled once a
/// second by the watchdog. Stored as milliseconds elapsed since the
/// session's own monotonic start rather than a wall-clock timestamp, so a
/// single `AtomicU64` suffices.
struct ActivityClock {
    start: Instant,
    last_millis: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        ActivityClock {
            start: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_millis.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_millis.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }
}

/// Why the SERVING read loop ended, decides what teardown steps the CLOSED
/// state performs.
enum CloseReason {
    /// Socket closed, errored, or sent a frame the session cannot trust
    /// (malformed envelope); own the registry slot, so full teardown runs.
    SocketClosed,
    /// The 1 Hz watchdog observed `DEAD_AFTER` inactivity; own the registry
    /// slot, so full teardown runs.
    Watchdog,
    /// A later authentication for the same `user_id` evicted this session.
    /// The new session already owns the registry slot and the presence
    /// marker; this session must not unregister or clear presence out from
    /// under it, only stop its own tasks and close its socket.
    Evicted,
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // ── AUTHENTICATING ──────────────────────────────────────────────────
    let first_frame =
        tokio::time::timeout(state.config.auth_deadline, ws_receiver.next()).await;

    let (user_id, token) = match first_frame {
        Ok(Some(Ok(WsMessage::Text(text)))) => match ClientFrame::parse(&text) {
            Ok(ClientFrame::Auth { user_id, token }) => (user_id, token),
            Ok(_) => {
                let _ = ws_sender
                    .send(WsMessage::Text(
                        ServerFrame::auth_ack_failed("first frame must be auth").to_json(),
                    ))
                    .await;
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Malformed first frame during AUTHENTICATING");
                let _ = ws_sender
                    .send(WsMessage::Text(
                        ServerFrame::auth_ack_failed("malformed auth frame").to_json(),
                    ))
                    .await;
                return;
            }
        },
        Ok(_) => {
            // Socket closed, errored, or sent a non-text frame before
            // authenticating; there's no one to send an auth_ack to.
            return;
        }
        Err(_elapsed) => {
            tracing::debug!("AUTH_DEADLINE exceeded before first frame");
            let _ = ws_sender
                .send(WsMessage::Text(
                    ServerFrame::auth_ack_failed("authentication timed out").to_json(),
                ))
                .await;
            return;
        }
    };

    if let Err(e) = state.auth_verifier.verify(&user_id, &token).await {
        tracing::info!(user_id = %user_id, error = %e, "Authentication failed");
        let _ = ws_sender
            .send(WsMessage::Text(
                ServerFrame::auth_ack_failed(e.to_string()).to_json(),
            ))
            .await;
        return;
    }

    // ── READY ────────────────────────────────────────────────────────────
    // auth_ack must be the first server-to-client frame, strictly before
    // registration, presence, refresh, or replay.
    if ws_sender
        .send(WsMessage::Text(
            ServerFrame::auth_ack_success(&user_id).to_json(),
        ))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let shutdown = CancellationToken::new();

    // (a) register with the hub; returns only once the fan-out subscription
    // is confirmed, so the worker can never publish into zero subscribers
    // for a user this session just claimed to be serving.
    if let Err(e) = state.hub.register(&user_id, tx.clone(), shutdown.clone()).await {
        tracing::error!(user_id = %user_id, error = %e, "Failed to register session with hub");
        return;
    }

    // (b) write the presence marker, only after the subscription exists.
    if let Err(e) = state.presence.mark_online(&user_id).await {
        tracing::warn!(user_id = %user_id, error = %e, "Initial presence write failed");
    }

    let activity = Arc::new(ActivityClock::new());

    // (c) presence-refresh coroutine.
    let refresh_task = {
        let token = shutdown.child_token();
        let presence = state.presence.clone();
        let user_id = user_id.clone();
        let interval = state.config.presence_refresh_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick is immediate; presence was just written
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = presence.mark_online(&user_id).await {
                            tracing::warn!(user_id = %user_id, error = %e, "Presence refresh failed");
                        }
                    }
                }
            }
        })
    };

    // (d) watchdog, 1 Hz, closes the session after DEAD_AFTER inactivity.
    let watchdog_task = {
        let token = shutdown.child_token();
        let activity = activity.clone();
        let dead_after = state.config.dead_after;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if activity.idle_for() > dead_after {
                            break;
                        }
                    }
                }
            }
        })
    };

    // Outbound forwarder: serializes writes to the socket, the only writer
    // per connection.
    let mut forwarder_task = {
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => {
                        match received {
                            Some(payload) => {
                                let wrapped = wrap_outbound_payload(&payload);
                                if ws_sender.send(WsMessage::Text(wrapped)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
            let _ = ws_sender.close().await;
        })
    };

    // (e) one-time undelivered replay, unconditionally followed by the
    // initial inbox badge notification.
    let replay_count = match state.replay.replay(&user_id).await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Undelivered replay failed");
            0
        }
    };
    let _ = tx.send(ServerFrame::inbox_notification(&user_id, replay_count).to_json());

    // ── SERVING ──────────────────────────────────────────────────────────
    let mut watchdog_task = watchdog_task;
    let close_reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break CloseReason::Evicted,
            _ = &mut watchdog_task => break CloseReason::Watchdog,
            frame = ws_receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        activity.touch();
                        if !handle_client_frame(&state, &user_id, &text).await {
                            break CloseReason::SocketClosed;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => break CloseReason::SocketClosed,
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary: not part of the wire protocol, but any
                        // frame refreshes last_activity.
                        activity.touch();
                    }
                    Some(Err(e)) => {
                        tracing::debug!(user_id = %user_id, error = %e, "WebSocket receive error");
                        break CloseReason::SocketClosed;
                    }
                    None => break CloseReason::SocketClosed,
                }
            }
        }
    };

    // ── CLOSED ───────────────────────────────────────────────────────────
    // Deterministic teardown: cancel refresh/watchdog, drop the presence
    // marker, unregister from the hub, close the socket.
    shutdown.cancel();
    let _ = refresh_task.await;
    let _ = watchdog_task.await;

    if !matches!(close_reason, CloseReason::Evicted) {
        if let Err(e) = state.presence.clear(&user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to clear presence on teardown");
        }
        state.hub.unregister(&user_id).await;
    }

    forwarder_task.abort();
    let _ = forwarder_task.await;
}

/// Handle one parsed SERVING-state frame. Returns `false` when the frame is
/// malformed and the session must close (logged, then the socket is torn
/// down); `true` otherwise, including for frames the gateway recognizes but
/// chooses to ignore.
async fn handle_client_frame(state: &AppState, user_id: &str, text: &str) -> bool {
    let frame = match ClientFrame::parse(text) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(user_id = %user_id, error = %e, "Malformed frame; closing session");
            return false;
        }
    };

    match frame {
        ClientFrame::Presence => {
            if let Err(e) = state.presence.mark_online(user_id).await {
                tracing::warn!(user_id = %user_id, error = %e, "Presence keep-alive write failed");
            }
            true
        }
        ClientFrame::Chat { recipient_id, msg } => {
            // `recipientId`/`msg` non-emptiness was already enforced by
            // `ClientFrame::parse`; a frame that made it this far is valid.
            let now = Utc::now();
            let message = ChatMessage {
                message_id: Uuid::new_v4(),
                sender_id: user_id.to_string(),
                recipient_id,
                content: msg,
                status: MessageStatus::Sent,
                created_at: now,
                updated_at: now,
            };

            // Fire-and-forget: a queue failure is logged but never surfaced
            // to the client; the client may retry with the same message_id
            // and the repository upsert stays idempotent.
            if let Err(e) = state.bus.enqueue(&message).await {
                tracing::warn!(
                    user_id = %user_id,
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to enqueue chat message"
                );
            }
            true
        }
        ClientFrame::Auth { .. } => {
            tracing::debug!(user_id = %user_id, "Ignoring duplicate auth frame after READY");
            true
        }
        ClientFrame::Unknown { frame_type } => {
            tracing::debug!(user_id = %user_id, frame_type = %frame_type, "Unknown frame type; ignoring");
            true
        }
    }
}
