use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use beacon_types::api::{Claims, ToggleReactionRequest};
use beacon_types::events::GatewayEvent;

use crate::auth::AppState;

/// Toggle a reaction and fan the update out to everyone who can see the
/// message. Reaction updates are live-only: an offline participant simply
/// misses them, no durable record is queued.
pub async fn toggle_reaction(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleReactionRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let reaction_id = Uuid::new_v4();

    let db = state.db.clone();
    let mid = message_id.to_string();
    let message = tokio::task::spawn_blocking(move || db.get_message(&mid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let db = state.db.clone();
    let rid = reaction_id.to_string();
    let mid = message_id.to_string();
    let uid = claims.sub.to_string();
    let emoji = req.emoji.clone();
    let added = tokio::task::spawn_blocking(move || db.toggle_reaction(&rid, &mid, &uid, &emoji))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    // Everyone who can see the message gets the update on their live handles
    let audience: Vec<Uuid> = if let Some(channel_id) = &message.channel_id {
        let db = state.db.clone();
        let cid = channel_id.clone();
        tokio::task::spawn_blocking(move || db.channel_members(&cid))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            })?
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
            .iter()
            .filter_map(|id| id.parse().ok())
            .collect()
    } else {
        [Some(&message.sender_id), message.recipient_id.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|id| id.parse().ok())
            .collect()
    };

    let event = GatewayEvent::MessageUpdate {
        message_id,
        user_id: claims.sub,
        emoji: req.emoji,
        added,
    };
    for user_id in audience {
        state.dispatcher.send_to_user(user_id, event.clone()).await;
    }

    Ok(Json(serde_json::json!({ "added": added })))
}
