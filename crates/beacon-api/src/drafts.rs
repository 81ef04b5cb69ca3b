use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::SecondsFormat;
use tracing::error;
use uuid::Uuid;

use beacon_db::models::ScheduledRow;
use beacon_types::api::{Claims, CreateDraftRequest, DraftResponse};

use crate::auth::AppState;
use crate::messages::parse_attachments;

/// Create a draft. With a `scheduled_at` it becomes a scheduled item the
/// sweep will promote once due; without one it is a plain draft the sweep
/// never touches. Exactly one of recipient/channel must be set — malformed
/// items are rejected here so the sweep only ever sees them through store
/// corruption.
pub async fn create_draft(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateDraftRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.recipient_id.is_some() == req.channel_id.is_some() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let draft_id = Uuid::new_v4();
    let scheduled_at = req
        .scheduled_at
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true));
    let attachments_json =
        serde_json::to_string(&req.attachments).map_err(|_| StatusCode::BAD_REQUEST)?;

    let db = state.db.clone();
    let did = draft_id.to_string();
    let sid = claims.sub.to_string();
    let rid = req.recipient_id.map(|id| id.to_string());
    let cid = req.channel_id.map(|id| id.to_string());
    let body = req.body.clone();
    let ts = scheduled_at.clone();
    tokio::task::spawn_blocking(move || {
        db.insert_scheduled(
            &did,
            &sid,
            rid.as_deref(),
            cid.as_deref(),
            &body,
            &attachments_json,
            ts.as_deref(),
        )
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok((
        StatusCode::CREATED,
        Json(DraftResponse {
            id: draft_id,
            sender_id: claims.sub,
            recipient_id: req.recipient_id,
            channel_id: req.channel_id,
            body: req.body,
            attachments: req.attachments,
            scheduled_at: req.scheduled_at,
        }),
    ))
}

/// The caller's scheduled items, soonest first.
pub async fn list_scheduled(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let uid = claims.sub.to_string();

    let rows = tokio::task::spawn_blocking(move || db.scheduled_for_sender(&uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let drafts: Vec<DraftResponse> = rows.iter().map(draft_response).collect();
    Ok(Json(drafts))
}

/// Delete one of the caller's drafts or scheduled items.
pub async fn delete_draft(
    State(state): State<AppState>,
    Path(draft_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let did = draft_id.to_string();
    let draft = tokio::task::spawn_blocking(move || db.get_scheduled(&did))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    if draft.sender_id != claims.sub.to_string() {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();
    let did = draft_id.to_string();
    tokio::task::spawn_blocking(move || db.delete_scheduled(&did))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}

fn draft_response(row: &ScheduledRow) -> DraftResponse {
    DraftResponse {
        id: row.id.parse().unwrap_or_default(),
        sender_id: row.sender_id.parse().unwrap_or_default(),
        recipient_id: row.recipient_id.as_deref().and_then(|v| v.parse().ok()),
        channel_id: row.channel_id.as_deref().and_then(|v| v.parse().ok()),
        body: row.body.clone(),
        attachments: parse_attachments(&row.attachments, &row.id),
        scheduled_at: row
            .scheduled_at
            .as_deref()
            .and_then(|v| v.parse().ok()),
    }
}
