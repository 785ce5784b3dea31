use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use crate::models::SendMessageRequest;
use crate::state::AppState;

/// `POST /api/send-message`: a synchronous server-to-server push to
/// whichever session `userId` currently has connected, used for
/// administrative notifications rather than chat delivery (chat goes through
/// the ingest queue, not this endpoint). 200 on success, 404 when `userId`
/// is not currently connected, no retry or queuing on either side.
pub async fn send_message(
    State(state): State<AppState>,
    Json(body): Json<SendMessageRequest>,
) -> StatusCode {
    let envelope = json!({ "type": "message", "data": body.message }).to_string();

    if state.hub.send_direct(&body.user_id, &envelope).await {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}
