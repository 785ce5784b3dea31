use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::MessageBus;
use crate::error::AppResult;

/// One registered session's outbound mailbox plus the task feeding it from
/// the bus subscription. Dropping the entry (on unregister) aborts the task,
/// which in turn lets the `PubSub` handle it owns go out of scope and
/// unsubscribe.
///
/// `cancel` is the session's own shutdown token, not the hub's: evicting an
/// entry cancels it so the superseded session's read loop, watchdog, and
/// presence-refresh coroutine all wind down instead of lingering until their
/// own watchdog eventually notices.
struct SessionEntry {
    sender: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    subscriber_task: JoinHandle<()>,
}

impl Drop for SessionEntry {
    fn drop(&mut self) {
        self.subscriber_task.abort();
    }
}

/// Process-wide registry mapping `user_id -> active session`. At most one
/// session per user-id at a time: a later `register` for the same id
/// evicts the earlier one first.
///
/// The hub never holds a reference to the session object itself, only an
/// `mpsc::UnboundedSender<String>`, an opaque send-callback that breaks the
/// session<->hub cyclic reference. Teardown drops that sender first, which
/// is what makes `unregister` safe to call from both the session's own
/// close path and a competing `register` eviction.
#[derive(Clone)]
pub struct Hub {
    bus: MessageBus,
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl Hub {
    pub fn new(bus: MessageBus) -> Self {
        Hub {
            bus,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `user_id`'s new session, evicting any prior one first, and
    /// establish its fan-out subscription. Does not return until the
    /// subscription is confirmed live: callers rely on that ordering to
    /// sequence auth_ack -> register -> presence write correctly.
    ///
    /// `cancel` is the new session's own shutdown token; it is stored so a
    /// *future* eviction can close this session in turn.
    pub async fn register(
        &self,
        user_id: &str,
        sender: mpsc::UnboundedSender<String>,
        cancel: CancellationToken,
    ) -> AppResult<()> {
        self.unregister(user_id).await;

        let mut pubsub = self.bus.subscribe_user(user_id).await?;

        let sessions = self.sessions.clone();
        let uid = user_id.to_string();
        let subscriber_task = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(user_id = %uid, error = ?e, "Malformed pub/sub payload");
                        continue;
                    }
                };

                // Re-read the sender on every message rather than capturing
                // it once: if the session was evicted and re-registered
                // between two publishes, route to whichever session is
                // current. A session that disappeared entirely (unregistered,
                // no replacement) is not an error; the fan-out payload is
                // simply dropped.
                let current = sessions.read().await.get(&uid).map(|e| e.sender.clone());
                if let Some(tx) = current {
                    let _ = tx.send(payload);
                }
            }
        });

        self.sessions.write().await.insert(
            user_id.to_string(),
            SessionEntry {
                sender,
                cancel,
                subscriber_task,
            },
        );
        Ok(())
    }

    /// Remove `user_id`'s session, cancel it, and tear down its
    /// subscription. Idempotent: calling it for a user with no registered
    /// session, or calling it twice for the same session, is a no-op.
    pub async fn unregister(&self, user_id: &str) {
        if let Some(entry) = self.sessions.write().await.remove(user_id) {
            entry.cancel.cancel();
        }
    }

    /// Whether `user_id` currently has a registered session. Used by the
    /// control API's send-to-session endpoint to decide between 200 and 404
    /// without needing a dedicated send-and-report path.
    pub async fn is_registered(&self, user_id: &str) -> bool {
        self.sessions.read().await.contains_key(user_id)
    }

    /// Push a pre-serialized frame directly to `user_id`'s session, bypassing
    /// the bus. Used by the control API for administrative notifications
    /// where the sender is not itself a bus publisher.
    pub async fn send_direct(&self, user_id: &str, payload: &str) -> bool {
        let sessions = self.sessions.read().await;
        match sessions.get(user_id) {
            Some(entry) => entry.sender.send(payload.to_string()).is_ok(),
            None => false,
        }
    }
}
