use std::time::Duration;

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{ConversationSummary, Message, MessageRow, MessageStatus};

/// Durable storage for every message the system has ever seen, keyed by the
/// client-generated `message_id`. This is the single source of truth for a
/// message's lifecycle status; the bus and presence store are transient by
/// comparison.
#[derive(Clone)]
pub struct MessageRepository {
    pool: PgPool,
}

impl MessageRepository {
    pub fn new(pool: PgPool) -> Self {
        MessageRepository { pool }
    }

    /// Insert a new message, or update an existing one's status/content in
    /// place, atomic, so concurrent delivery-worker instances racing on the
    /// same `message_id` never produce a duplicate row. `created_at` is
    /// preserved across updates; only `updated_at` advances.
    pub async fn upsert(&self, message: &Message) -> AppResult<Message> {
        let row = sqlx::query_as::<_, MessageRow>(
            "INSERT INTO messages
                 (message_id, sender_id, recipient_id, content, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, now(), now())
             ON CONFLICT (message_id) DO UPDATE
                 SET status = EXCLUDED.status,
                     content = EXCLUDED.content,
                     updated_at = now()
             RETURNING message_id, sender_id, recipient_id, content, status, created_at, updated_at",
        )
        .bind(message.message_id)
        .bind(&message.sender_id)
        .bind(&message.recipient_id)
        .bind(&message.content)
        .bind(message.status.as_str())
        .fetch_one(&self.pool)
        .await?;

        Message::try_from(row).map_err(AppError::internal)
    }

    pub async fn get_by_message_id(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, sender_id, recipient_id, content, status, created_at, updated_at
             FROM messages WHERE message_id = $1",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => Ok(Some(Message::try_from(r).map_err(AppError::internal)?)),
            None => Ok(None),
        }
    }

    /// Messages addressed to `recipient_id` still in `UNDELIVERED`, oldest
    /// first, excluding anything updated within the last `min_age`. A row
    /// the worker is still in the middle of transitioning must not be
    /// republished out from under it.
    pub async fn list_undelivered(
        &self,
        recipient_id: &str,
        min_age: Duration,
    ) -> AppResult<Vec<Message>> {
        let min_age_secs = min_age.as_secs_f64();
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, sender_id, recipient_id, content, status, created_at, updated_at
             FROM messages
             WHERE recipient_id = $1
               AND status = 'UNDELIVERED'
               AND now() - updated_at > ($2 || ' seconds')::interval
             ORDER BY created_at ASC",
        )
        .bind(recipient_id)
        .bind(min_age_secs.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| Message::try_from(r).map_err(AppError::internal))
            .collect()
    }

    /// Number of distinct senders with at least one undelivered message to
    /// `recipient_id`, used by the debounced undelivered-notification path,
    /// which reports a sender count, not a message count.
    pub async fn count_distinct_senders_undelivered(&self, recipient_id: &str) -> AppResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT sender_id) FROM messages
             WHERE recipient_id = $1 AND status = 'UNDELIVERED'",
        )
        .bind(recipient_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    /// For each distinct counterparty of `user_id`, the most recent message
    /// exchanged (content, timestamp, whether `user_id` sent it) and how
    /// many of the counterparty's messages are still undelivered to
    /// `user_id`.
    pub async fn list_conversations(&self, user_id: &str) -> AppResult<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, ConversationSummary>(
            "WITH convo AS (
                 SELECT
                     CASE WHEN sender_id = $1 THEN recipient_id ELSE sender_id END AS counterparty_id,
                     content,
                     created_at,
                     (sender_id = $1) AS from_me
                 FROM messages
                 WHERE sender_id = $1 OR recipient_id = $1
             ),
             latest AS (
                 SELECT DISTINCT ON (counterparty_id)
                     counterparty_id,
                     content AS last_content,
                     created_at AS last_timestamp,
                     from_me AS last_from_me
                 FROM convo
                 ORDER BY counterparty_id, created_at DESC
             ),
             undelivered AS (
                 SELECT sender_id AS counterparty_id, COUNT(*) AS undelivered_count
                 FROM messages
                 WHERE recipient_id = $1 AND status = 'UNDELIVERED'
                 GROUP BY sender_id
             )
             SELECT
                 l.counterparty_id,
                 l.last_content,
                 l.last_timestamp,
                 l.last_from_me,
                 COALESCE(u.undelivered_count, 0) AS undelivered_count
             FROM latest l
             LEFT JOIN undelivered u ON u.counterparty_id = l.counterparty_id
             ORDER BY l.last_timestamp DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Full message history between two users, oldest first, for building a
    /// conversation view. Not part of the delivery state machine itself.
    pub async fn list_messages_between(
        &self,
        user_a: &str,
        user_b: &str,
    ) -> AppResult<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT message_id, sender_id, recipient_id, content, status, created_at, updated_at
             FROM messages
             WHERE (sender_id = $1 AND recipient_id = $2)
                OR (sender_id = $2 AND recipient_id = $1)
             ORDER BY created_at ASC",
        )
        .bind(user_a)
        .bind(user_b)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| Message::try_from(r).map_err(AppError::internal))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessageStatus as Status;
    use chrono::Utc;
    use serial_test::serial;

    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("DATABASE_URL").ok()?;
        PgPool::connect(&url).await.ok()
    }

    fn sample_message(sender: &str, recipient: &str, status: Status) -> Message {
        Message {
            message_id: Uuid::new_v4(),
            sender_id: sender.to_string(),
            recipient_id: recipient.to_string(),
            content: "hello".to_string(),
            status,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// A fresh user id per call, so tests sharing one long-lived test
    /// database never see each other's rows in `list_conversations` or
    /// `list_messages_between`.
    fn unique_user(label: &str) -> String {
        format!("{label}-{}", Uuid::new_v4())
    }

    #[tokio::test]
    #[serial]
    async fn upsert_is_idempotent_on_message_id() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        let repo = MessageRepository::new(pool);
        let mut msg = sample_message("repo-a", "repo-b", Status::Sent);

        let first = repo.upsert(&msg).await.expect("first upsert");
        msg.status = Status::Delivered;
        let second = repo.upsert(&msg).await.expect("second upsert");

        assert_eq!(first.message_id, second.message_id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.status, Status::Delivered);

        let fetched = repo
            .get_by_message_id(msg.message_id)
            .await
            .expect("fetch")
            .expect("row exists");
        assert_eq!(fetched.status, Status::Delivered);
        assert!(fetched.created_at <= fetched.updated_at);
    }

    #[tokio::test]
    #[serial]
    async fn list_messages_between_returns_chronological_pair_only() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        let repo = MessageRepository::new(pool);
        let a = unique_user("conv-a");
        let b = unique_user("conv-b");
        let outsider = unique_user("conv-outsider");

        let mut first = sample_message(&a, &b, Status::Delivered);
        first.content = "first".to_string();
        repo.upsert(&first).await.expect("upsert first");

        let mut second = sample_message(&b, &a, Status::Delivered);
        second.content = "second".to_string();
        repo.upsert(&second).await.expect("upsert second");

        // A message between `a` and some third party must not leak into
        // the `(a, b)` conversation.
        let mut noise = sample_message(&a, &outsider, Status::Sent);
        noise.content = "noise".to_string();
        repo.upsert(&noise).await.expect("upsert noise");

        let between = repo
            .list_messages_between(&a, &b)
            .await
            .expect("list_messages_between should not fail");

        assert_eq!(between.len(), 2);
        assert_eq!(between[0].content, "first");
        assert_eq!(between[1].content, "second");
        assert!(between[0].created_at <= between[1].created_at);
        assert!(between.iter().all(|m| m.content != "noise"));
    }

    #[tokio::test]
    #[serial]
    async fn list_messages_between_for_unrelated_pair_is_empty() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        let repo = MessageRepository::new(pool);
        let a = unique_user("conv-lonely-a");
        let b = unique_user("conv-lonely-b");

        let between = repo
            .list_messages_between(&a, &b)
            .await
            .expect("list_messages_between should not fail for a pair with no history");
        assert!(between.is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn list_conversations_reports_latest_message_and_undelivered_count() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        let repo = MessageRepository::new(pool);
        let me = unique_user("conv-me");
        let delivered_peer = unique_user("conv-peer-delivered");
        let undelivered_peer = unique_user("conv-peer-undelivered");

        // `delivered_peer`: the latest message is mine and nothing is
        // outstanding, so `undelivered_count` must read zero via COALESCE,
        // not NULL.
        let mut to_peer = sample_message(&me, &delivered_peer, Status::Delivered);
        to_peer.content = "hi from me".to_string();
        repo.upsert(&to_peer).await.expect("upsert to_peer");

        // `undelivered_peer`: two still-undelivered messages addressed to
        // me; `undelivered_count` here counts rows, not distinct senders.
        let mut pending_one = sample_message(&undelivered_peer, &me, Status::Undelivered);
        pending_one.content = "are you there".to_string();
        repo.upsert(&pending_one).await.expect("upsert pending_one");

        let mut pending_two = sample_message(&undelivered_peer, &me, Status::Undelivered);
        pending_two.content = "hello?".to_string();
        repo.upsert(&pending_two).await.expect("upsert pending_two");

        let conversations = repo
            .list_conversations(&me)
            .await
            .expect("list_conversations should not fail");

        let delivered_entry = conversations
            .iter()
            .find(|c| c.counterparty_id == delivered_peer)
            .expect("delivered_peer conversation present");
        assert_eq!(delivered_entry.last_content, "hi from me");
        assert!(delivered_entry.last_from_me);
        assert_eq!(delivered_entry.undelivered_count, 0);

        let undelivered_entry = conversations
            .iter()
            .find(|c| c.counterparty_id == undelivered_peer)
            .expect("undelivered_peer conversation present");
        assert_eq!(undelivered_entry.last_content, "hello?");
        assert!(!undelivered_entry.last_from_me);
        assert_eq!(undelivered_entry.undelivered_count, 2);
    }

    #[tokio::test]
    #[serial]
    async fn list_conversations_for_user_with_no_history_is_empty() {
        let Some(pool) = test_pool().await else {
            eprintln!("skipping: DATABASE_URL not set");
            return;
        };
        let repo = MessageRepository::new(pool);
        let lonely = unique_user("conv-no-history");

        let conversations = repo
            .list_conversations(&lonely)
            .await
            .expect("list_conversations should not fail for a user with no messages");
        assert!(conversations.is_empty());
    }
}
