use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::SecondsFormat;
use serde::Deserialize;
use tracing::{error, warn};
use uuid::Uuid;

use beacon_db::models::MessageRow;
use beacon_gateway::dispatcher::{DurableSpec, parse_timestamp};
use beacon_types::api::{Claims, ForwardMessageRequest, SendMessageRequest};
use beacon_types::events::GatewayEvent;
use beacon_types::models::{Attachment, MessagePayload, NotificationKind};

use crate::auth::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Send a direct message. The message is committed first (message row,
/// conversation upsert, recipient unread bump), then echoed to the sender's
/// own tabs and handed to the delivery engine for the recipient — live push
/// if they are connected, durable notification otherwise. A failed queue
/// write is logged but never rolls back the committed message.
pub async fn send_direct_message(
    State(state): State<AppState>,
    Path(recipient_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.body.trim().is_empty() && req.attachments.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let sender_id = claims.sub;
    let message_id = Uuid::new_v4();
    let now = chrono::Utc::now();
    let created_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let attachments_json =
        serde_json::to_string(&req.attachments).map_err(|_| StatusCode::BAD_REQUEST)?;

    let db = state.db.clone();
    let rid = recipient_id.to_string();
    let known = tokio::task::spawn_blocking(move || db.user_exists(&rid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !known {
        return Err(StatusCode::NOT_FOUND);
    }

    // Commit message + conversation + counter off the async runtime
    let db = state.db.clone();
    let sid = sender_id.to_string();
    let rid = recipient_id.to_string();
    let mid = message_id.to_string();
    let body = req.body.clone();
    let attachments = attachments_json;
    let ts = created_at;
    let conversation_id = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        let conversation_id =
            db.upsert_conversation(&Uuid::new_v4().to_string(), &sid, &rid, &ts)?;
        db.insert_message(
            &mid,
            &sid,
            Some(rid.as_str()),
            None,
            Some(conversation_id.as_str()),
            &body,
            &attachments,
            None,
            &ts,
        )?;
        db.increment_unread(&conversation_id, &rid, 1)?;
        Ok(conversation_id)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let payload = MessagePayload {
        id: message_id,
        sender_id,
        sender_username: claims.username.clone(),
        recipient_id: Some(recipient_id),
        channel_id: None,
        conversation_id: conversation_id.parse().ok(),
        body: req.body.clone(),
        attachments: req.attachments,
        forwarded_from: None,
        created_at: now,
    };
    let event = GatewayEvent::MessageCreate {
        message: payload.clone(),
    };

    // Echo to every tab the sender has open
    state.dispatcher.send_to_user(sender_id, event.clone()).await;

    let spec = DurableSpec {
        kind: NotificationKind::Personal,
        actor_id: Some(sender_id),
        channel_id: None,
        message_id: Some(message_id),
        title: format!("New message from {}", claims.username),
        body: notification_body(&req.body),
        data: serde_json::json!({ "conversation_id": conversation_id }),
    };
    if let Err(e) = state.dispatcher.deliver(recipient_id, event, Some(spec)).await {
        // Offline recipient permanently loses this notification; the message
        // itself is already committed and must not fail the request.
        error!(
            "Failed to queue notification for {}: {}",
            recipient_id, e
        );
    }

    Ok((StatusCode::CREATED, Json(payload)))
}

/// Message history with a direct-message peer, newest first.
pub async fn get_direct_messages(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub.to_string();
    let peer = peer_id.to_string();
    let limit = query.limit.min(200);

    let rows = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<MessageRow>> {
        match db.find_conversation(&me, &peer)? {
            Some(conversation_id) => db.conversation_messages(&conversation_id, limit),
            None => Ok(vec![]),
        }
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let messages: Vec<MessagePayload> = rows.iter().map(message_payload).collect();
    Ok(Json(messages))
}

/// Reset the caller's unread counter for a conversation. The only path
/// that ever lowers a counter.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Path(peer_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let me = claims.sub.to_string();
    let peer = peer_id.to_string();

    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        if let Some(conversation_id) = db.find_conversation(&me, &peer)? {
            db.reset_unread(&conversation_id, &me)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Forward an existing message to one or more recipients. Each forward is
/// an independent derived message; a notification failure for one recipient
/// never aborts the rest.
pub async fn forward_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ForwardMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.recipient_ids.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let mid = message_id.to_string();
    let original = tokio::task::spawn_blocking(move || db.get_message(&mid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let sender_id = claims.sub;
    let mut forwarded = Vec::with_capacity(req.recipient_ids.len());

    for recipient_id in req.recipient_ids {
        let new_id = Uuid::new_v4();
        let now = chrono::Utc::now();
        let ts = now.to_rfc3339_opts(SecondsFormat::Millis, true);

        let db = state.db.clone();
        let sid = sender_id.to_string();
        let rid = recipient_id.to_string();
        let nid = new_id.to_string();
        let body = original.body.clone();
        let attachments = original.attachments.clone();
        let origin = original.sender_id.clone();
        let ts_clone = ts.clone();
        let committed = tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
            if !db.user_exists(&rid)? {
                anyhow::bail!("unknown recipient");
            }
            let conversation_id =
                db.upsert_conversation(&Uuid::new_v4().to_string(), &sid, &rid, &ts_clone)?;
            db.insert_message(
                &nid,
                &sid,
                Some(rid.as_str()),
                None,
                Some(conversation_id.as_str()),
                &body,
                &attachments,
                Some(origin.as_str()),
                &ts_clone,
            )?;
            db.increment_unread(&conversation_id, &rid, 1)?;
            Ok(conversation_id)
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

        let conversation_id = match committed {
            Ok(id) => id,
            Err(e) => {
                warn!("Forward to {} skipped: {}", recipient_id, e);
                continue;
            }
        };

        let payload = MessagePayload {
            id: new_id,
            sender_id,
            sender_username: claims.username.clone(),
            recipient_id: Some(recipient_id),
            channel_id: None,
            conversation_id: conversation_id.parse().ok(),
            body: original.body.clone(),
            attachments: parse_attachments(&original.attachments, &original.id),
            forwarded_from: original.sender_id.parse().ok(),
            created_at: now,
        };
        let event = GatewayEvent::MessageCreate {
            message: payload.clone(),
        };

        state.dispatcher.send_to_user(sender_id, event.clone()).await;

        let spec = DurableSpec {
            kind: NotificationKind::Personal,
            actor_id: Some(sender_id),
            channel_id: None,
            message_id: Some(new_id),
            title: format!("{} forwarded a message", claims.username),
            body: notification_body(&original.body),
            data: serde_json::json!({ "conversation_id": conversation_id }),
        };
        if let Err(e) = state.dispatcher.deliver(recipient_id, event, Some(spec)).await {
            error!("Failed to queue forward notification for {}: {}", recipient_id, e);
        }

        forwarded.push(payload);
    }

    Ok((StatusCode::CREATED, Json(forwarded)))
}

pub(crate) fn notification_body(body: &str) -> String {
    if body.trim().is_empty() {
        "Sent a file".to_string()
    } else {
        body.to_string()
    }
}

pub(crate) fn parse_attachments(raw: &str, context: &str) -> Vec<Attachment> {
    serde_json::from_str(raw).unwrap_or_else(|e| {
        warn!("Corrupt attachments on '{}': {}", context, e);
        Vec::new()
    })
}

pub(crate) fn message_payload(row: &MessageRow) -> MessagePayload {
    MessagePayload {
        id: row.id.parse().unwrap_or_else(|e| {
            warn!("Corrupt message id '{}': {}", row.id, e);
            Uuid::default()
        }),
        sender_id: row.sender_id.parse().unwrap_or_else(|e| {
            warn!("Corrupt sender_id '{}' on message '{}': {}", row.sender_id, row.id, e);
            Uuid::default()
        }),
        sender_username: row.sender_username.clone(),
        recipient_id: row.recipient_id.as_deref().and_then(|v| v.parse().ok()),
        channel_id: row.channel_id.as_deref().and_then(|v| v.parse().ok()),
        conversation_id: row.conversation_id.as_deref().and_then(|v| v.parse().ok()),
        body: row.body.clone(),
        attachments: parse_attachments(&row.attachments, &row.id),
        forwarded_from: row.forwarded_from.as_deref().and_then(|v| v.parse().ok()),
        created_at: parse_timestamp(&row.created_at, &row.id),
    }
}
