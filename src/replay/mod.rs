use std::time::Duration;

use crate::bus::MessageBus;
use crate::error::AppResult;
use crate::models::{Message, MessageStatus};
use crate::repository::MessageRepository;

/// Undelivered Replay Coordinator: invoked once per successful session,
/// asks the repository to enumerate `recipient_id`'s undelivered
/// messages and republishes each onto the ingest queue so the delivery
/// worker re-drives them now that the recipient is back online.
#[derive(Clone)]
pub struct ReplayCoordinator {
    repository: MessageRepository,
    bus: MessageBus,
    replay_skew: Duration,
}

impl ReplayCoordinator {
    pub fn new(repository: MessageRepository, bus: MessageBus, replay_skew: Duration) -> Self {
        ReplayCoordinator {
            repository,
            bus,
            replay_skew,
        }
    }

    /// Republish every eligible undelivered message for `user_id` and return
    /// the distinct-sender count for the unconditional inbox badge sent as
    /// the final step of undelivered replay, so the UI renders a correct
    /// initial badge even when the count is zero.
    ///
    /// Messages updated within `REPLAY_SKEW` are skipped by the repository
    /// query itself: they may already be mid-flight to DELIVERED in a
    /// worker, and republishing them too would duplicate delivery on the
    /// client.
    pub async fn replay(&self, user_id: &str) -> AppResult<i64> {
        let pending = self
            .repository
            .list_undelivered(user_id, self.replay_skew)
            .await?;

        for message in &pending {
            // The republished envelope hands the worker a fresh in-flight
            // view rather than mutating the stored row directly; status is
            // reset here and the repository upsert on the other end
            // preserves `created_at` regardless.
            let envelope = Message {
                message_id: message.message_id,
                sender_id: message.sender_id.clone(),
                recipient_id: message.recipient_id.clone(),
                content: message.content.clone(),
                status: MessageStatus::Undelivered,
                created_at: message.created_at,
                updated_at: message.updated_at,
            };

            if let Err(e) = self.bus.enqueue(&envelope).await {
                tracing::warn!(
                    message_id = %message.message_id,
                    user_id,
                    error = ?e,
                    "Failed to republish undelivered message; it remains UNDELIVERED and \
                     will be retried on the next reconnect"
                );
            }
        }

        self.repository
            .count_distinct_senders_undelivered(user_id)
            .await
    }
}
