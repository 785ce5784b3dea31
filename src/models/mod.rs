use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Message lifecycle
// ============================================================================

/// Lifecycle state of a chat message, per the SENT -> DELIVERED/UNDELIVERED
/// state machine. Stored as TEXT in Postgres with a CHECK constraint on the
/// same three values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageStatus {
    Sent,
    Delivered,
    Undelivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "SENT",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Undelivered => "UNDELIVERED",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SENT" => Ok(MessageStatus::Sent),
            "DELIVERED" => Ok(MessageStatus::Delivered),
            "UNDELIVERED" => Ok(MessageStatus::Undelivered),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

// ============================================================================
// Message
// ============================================================================

/// A single chat message as persisted by the message repository.
///
/// `message_id` is client-generated (a UUID) so the repository's upsert can
/// be idempotent: redelivery of the same message never creates a duplicate
/// row.
///
/// The `status` column is a bare `TEXT` with a `CHECK` constraint rather than
/// a native Postgres enum, so rows are fetched into `MessageRow` (whose
/// `status` field is a plain `String`) and converted with `TryFrom`, the
/// same "query into a private row struct, map to the public model" shape the
/// rest of the repository layer uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub status: MessageStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub struct MessageRow {
    pub message_id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = String;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            message_id: row.message_id,
            sender_id: row.sender_id,
            recipient_id: row.recipient_id,
            content: row.content,
            status: row.status.parse()?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// One row of `ListConversations(user_id)`: for each distinct counterparty,
/// the most recent message exchanged and how many of their messages are
/// still sitting undelivered.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ConversationSummary {
    pub counterparty_id: String,
    pub last_content: String,
    pub last_timestamp: DateTime<Utc>,
    pub last_from_me: bool,
    pub undelivered_count: i64,
}

// ============================================================================
// Wire envelope payloads (client-facing DTOs, not persistence rows)
// ============================================================================

/// Payload of a chat message as it travels client <-> gateway: `{type:
/// "message", data: {messageId, senderId, recipientId, content, timestamp,
/// type}}`. Distinct from the repository row: the wire form never carries
/// `updated_at`, and `created_at` is exposed as `timestamp` (the instant the
/// gateway assigned at ingest, never rewritten).
///
/// `content_type` is a `type` discriminator left for future message kinds;
/// every message produced by this gateway today is plain text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub message_id: Uuid,
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub content_type: String,
}

impl From<Message> for ChatMessagePayload {
    fn from(m: Message) -> Self {
        ChatMessagePayload {
            message_id: m.message_id,
            sender_id: m.sender_id,
            recipient_id: m.recipient_id,
            content: m.content,
            timestamp: m.created_at,
            content_type: "text".to_string(),
        }
    }
}

/// Body of `POST /api/send-message` (the gateway control API): `{userId,
/// message}`, an administrative push to one connected session.
/// `message` is forwarded as-is (wrapped the same way any other fan-out
/// payload is), so the caller controls its shape.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub user_id: String,
    pub message: serde_json::Value,
}

/// Body of `POST /api/chat/fetch-undelivered`. The request carries `userId`
/// alongside the bearer token so the handler can verify the pair
/// with the same `AuthVerifier` contract the gateway session uses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchUndeliveredRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct FetchUndeliveredResponse {
    pub count: i64,
}

/// Query params for `GET /api/chat/conversations-with-undelivered-count`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationsUndeliveredQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConversationsUndeliveredResponse {
    pub count: i64,
}
