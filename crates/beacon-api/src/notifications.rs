use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;
use uuid::Uuid;

use beacon_gateway::dispatcher::notification_payload;
use beacon_types::api::Claims;
use beacon_types::models::NotificationPayload;

use crate::auth::AppState;

/// The caller's notification feed, newest first, capped at 50.
pub async fn list_notifications(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.recent_notifications(&uid, 50))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let notifications: Vec<NotificationPayload> = rows.iter().map(notification_payload).collect();
    Ok(Json(notifications))
}

/// Flip the read flag on one of the caller's notifications.
pub async fn mark_notification_read(
    State(state): State<AppState>,
    Path(notification_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let nid = notification_id.to_string();
    let uid = claims.sub.to_string();

    let updated = tokio::task::spawn_blocking(move || db.mark_notification_read(&nid, &uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    if updated {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}
