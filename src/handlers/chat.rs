use axum::extract::{Query, State};
use axum::Json;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;

use crate::error::AppResult;
use crate::models::{
    ConversationsUndeliveredQuery, ConversationsUndeliveredResponse, FetchUndeliveredRequest,
    FetchUndeliveredResponse,
};
use crate::state::AppState;

/// `POST /api/chat/fetch-undelivered`: verify the caller's bearer token
/// against `userId`, then run the Undelivered Replay Coordinator and report
/// the distinct-sender count as the side effect's result.
pub async fn fetch_undelivered(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Json(body): Json<FetchUndeliveredRequest>,
) -> AppResult<Json<FetchUndeliveredResponse>> {
    state
        .auth_verifier
        .verify(&body.user_id, auth.token())
        .await?;

    let count = state.replay.replay(&body.user_id).await?;
    Ok(Json(FetchUndeliveredResponse { count }))
}

/// `GET /api/chat/conversations-with-undelivered-count`: the initial inbox
/// badge, a distinct-sender count with no replay side effect.
pub async fn conversations_with_undelivered_count(
    State(state): State<AppState>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Query(query): Query<ConversationsUndeliveredQuery>,
) -> AppResult<Json<ConversationsUndeliveredResponse>> {
    state
        .auth_verifier
        .verify(&query.user_id, auth.token())
        .await?;

    let count = state
        .repository
        .count_distinct_senders_undelivered(&query.user_id)
        .await?;
    Ok(Json(ConversationsUndeliveredResponse { count }))
}
