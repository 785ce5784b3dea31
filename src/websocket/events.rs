use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::models::ChatMessagePayload;

// ============================================================================
// Client -> server
// ============================================================================

/// Every inbound frame, parsed totally: an envelope the gateway doesn't
/// recognize becomes `Unknown` rather than a parse error, logged and
/// ignored instead of closing the session.
#[derive(Debug, Clone)]
pub enum ClientFrame {
    Auth { user_id: String, token: String },
    Presence,
    Chat { recipient_id: String, msg: String },
    Unknown { frame_type: String },
}

/// Shape used only to read the discriminating `type` field before
/// dispatching to the right typed struct below.
#[derive(Debug, Deserialize)]
struct Tagged {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(flatten)]
    rest: Value,
}

#[derive(Debug, Deserialize)]
struct AuthFields {
    #[serde(rename = "userId")]
    user_id: String,
    token: String,
}

/// `recipientId`/`msg` must be non-empty, enforced with the same
/// `validator` derive the rest of the gateway's request DTOs use.
#[derive(Debug, Deserialize, Validate)]
struct ChatFields {
    #[serde(rename = "recipientId")]
    #[validate(length(min = 1, message = "recipientId must not be empty"))]
    recipient_id: String,
    #[validate(length(min = 1, message = "msg must not be empty"))]
    msg: String,
}

impl ClientFrame {
    /// Parse a raw text frame. Returns `Err` only for input that isn't even
    /// valid JSON or lacks a `type` field, genuinely malformed frames the
    /// session must close on. A well-formed envelope with fields that don't
    /// match its declared type (e.g. `chat` missing `msg`) also surfaces as
    /// an error so the caller can apply the same close-the-session policy
    /// without re-deriving field checks.
    pub fn parse(text: &str) -> Result<Self, String> {
        let tagged: Tagged = serde_json::from_str(text).map_err(|e| e.to_string())?;

        match tagged.frame_type.as_str() {
            "auth" => {
                let fields: AuthFields =
                    serde_json::from_value(tagged.rest).map_err(|e| e.to_string())?;
                Ok(ClientFrame::Auth {
                    user_id: fields.user_id,
                    token: fields.token,
                })
            }
            "presence" => Ok(ClientFrame::Presence),
            "chat" => {
                let fields: ChatFields =
                    serde_json::from_value(tagged.rest).map_err(|e| e.to_string())?;
                fields.validate().map_err(|e| e.to_string())?;
                Ok(ClientFrame::Chat {
                    recipient_id: fields.recipient_id,
                    msg: fields.msg,
                })
            }
            other => Ok(ClientFrame::Unknown {
                frame_type: other.to_string(),
            }),
        }
    }
}

// ============================================================================
// Server -> client
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "auth_ack")]
    AuthAck {
        status: AuthAckStatus,
        #[serde(rename = "userId", skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "message")]
    Message { data: ChatMessagePayload },
    #[serde(rename = "notification")]
    Notification {
        #[serde(rename = "subType")]
        sub_type: NotificationSubType,
        count: i64,
        #[serde(rename = "recipientId")]
        recipient_id: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthAckStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSubType {
    Inbox,
}

impl ServerFrame {
    pub fn auth_ack_success(user_id: impl Into<String>) -> Self {
        ServerFrame::AuthAck {
            status: AuthAckStatus::Success,
            user_id: Some(user_id.into()),
            error: None,
        }
    }

    pub fn auth_ack_failed(error: impl Into<String>) -> Self {
        ServerFrame::AuthAck {
            status: AuthAckStatus::Failed,
            user_id: None,
            error: Some(error.into()),
        }
    }

    pub fn message(data: ChatMessagePayload) -> Self {
        ServerFrame::Message { data }
    }

    pub fn inbox_notification(recipient_id: impl Into<String>, count: i64) -> Self {
        ServerFrame::Notification {
            sub_type: NotificationSubType::Inbox,
            count,
            recipient_id: recipient_id.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerFrame is always representable as JSON")
    }
}

/// Wrap a raw fan-out payload for delivery to the client socket.
///
/// A payload published by the delivery worker is a bare persistence
/// `Message` (no `type` tag) and must be wrapped in `{type: "message", data:
/// ...}`. A payload that is already a fully-formed server envelope (it has
/// a `type` field, such as the undelivered-count notification published
/// onto the same channel pre-wrapped) is forwarded verbatim.
pub fn wrap_outbound_payload(raw: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        if map.contains_key("type") {
            return raw.to_string();
        }
    }

    match serde_json::from_str::<crate::models::Message>(raw) {
        Ok(message) => ServerFrame::message(message.into()).to_json(),
        Err(e) => {
            tracing::warn!(error = ?e, "Unwrappable fan-out payload; forwarding raw");
            raw.to_string()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_auth_frame() {
        let frame =
            ClientFrame::parse(r#"{"type":"auth","userId":"u1","token":"tok"}"#).unwrap();
        match frame {
            ClientFrame::Auth { user_id, token } => {
                assert_eq!(user_id, "u1");
                assert_eq!(token, "tok");
            }
            other => panic!("expected Auth, got {other:?}"),
        }
    }

    #[test]
    fn parses_presence_keepalive() {
        let frame = ClientFrame::parse(r#"{"type":"presence"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Presence));
    }

    #[test]
    fn parses_chat_frame() {
        let frame =
            ClientFrame::parse(r#"{"type":"chat","recipientId":"u2","msg":"hi"}"#).unwrap();
        match frame {
            ClientFrame::Chat { recipient_id, msg } => {
                assert_eq!(recipient_id, "u2");
                assert_eq!(msg, "hi");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        let frame = ClientFrame::parse(r#"{"type":"typing"}"#).unwrap();
        match frame {
            ClientFrame::Unknown { frame_type } => assert_eq!(frame_type, "typing"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn missing_type_field_is_malformed() {
        assert!(ClientFrame::parse(r#"{"userId":"u1"}"#).is_err());
    }

    #[test]
    fn chat_missing_fields_is_malformed() {
        assert!(ClientFrame::parse(r#"{"type":"chat","recipientId":"u2"}"#).is_err());
    }

    #[test]
    fn chat_empty_recipient_is_malformed() {
        assert!(
            ClientFrame::parse(r#"{"type":"chat","recipientId":"","msg":"hi"}"#).is_err()
        );
    }

    #[test]
    fn chat_empty_msg_is_malformed() {
        assert!(
            ClientFrame::parse(r#"{"type":"chat","recipientId":"u2","msg":""}"#).is_err()
        );
    }

    #[test]
    fn auth_ack_success_serializes_expected_shape() {
        let json = ServerFrame::auth_ack_success("u1").to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "auth_ack");
        assert_eq!(value["status"], "success");
        assert_eq!(value["userId"], "u1");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn auth_ack_failed_serializes_expected_shape() {
        let json = ServerFrame::auth_ack_failed("bad token").to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "auth_ack");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["error"], "bad token");
    }

    #[test]
    fn notification_serializes_expected_shape() {
        let json = ServerFrame::inbox_notification("u3", 2).to_json();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "notification");
        assert_eq!(value["subType"], "inbox");
        assert_eq!(value["count"], 2);
        assert_eq!(value["recipientId"], "u3");
    }
}
