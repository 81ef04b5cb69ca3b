use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::SecondsFormat;
use tracing::error;
use uuid::Uuid;

use beacon_gateway::dispatcher::DurableSpec;
use beacon_types::api::{Claims, ChannelResponse, CreateChannelRequest, SendMessageRequest};
use beacon_types::events::GatewayEvent;
use beacon_types::models::{MessagePayload, NotificationKind};

use crate::auth::AppState;
use crate::messages::{MessageQuery, message_payload, notification_body};

pub async fn create_channel(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateChannelRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.name.trim().is_empty() || req.name.len() > 64 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let channel_id = Uuid::new_v4();
    let db = state.db.clone();
    let cid = channel_id.to_string();
    let name = req.name.clone();
    let description = req.description.clone();
    let creator = claims.sub.to_string();
    tokio::task::spawn_blocking(move || db.create_channel(&cid, &name, &description, &creator))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::CONFLICT)?;

    Ok((
        StatusCode::CREATED,
        Json(ChannelResponse {
            id: channel_id,
            name: req.name,
            description: req.description,
            created_by: claims.sub,
        }),
    ))
}

pub async fn join_channel(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = channel_id.to_string();
    let uid = claims.sub.to_string();

    tokio::task::spawn_blocking(move || -> anyhow::Result<bool> {
        if db.get_channel(&cid)?.is_none() {
            return Ok(false);
        }
        db.add_channel_member(&cid, &uid)?;
        Ok(true)
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?
    .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
    .then_some(StatusCode::NO_CONTENT)
    .ok_or(StatusCode::NOT_FOUND)
}

/// Send a message to a channel. The message is committed once, every member
/// except the sender gets an atomic unread bump, then the event fans out
/// per member through the delivery engine — live push or durable channel
/// notification depending on their presence. The sender's own tabs get an
/// echo. One member's failure never stops the rest of the fan-out.
pub async fn send_channel_message(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
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
    let cid = channel_id.to_string();
    let sid = sender_id.to_string();
    let mid = message_id.to_string();
    let body = req.body.clone();
    let attachments = attachments_json;
    let ts = created_at;
    let committed =
        tokio::task::spawn_blocking(move || -> anyhow::Result<Option<(String, Vec<String>)>> {
            let Some(channel) = db.get_channel(&cid)? else {
                return Ok(None);
            };
            let members = db.channel_members(&cid)?;
            db.insert_message(
                &mid,
                &sid,
                None,
                Some(cid.as_str()),
                None,
                &body,
                &attachments,
                None,
                &ts,
            )?;
            for member in &members {
                if member != &sid {
                    db.increment_unread(&cid, member, 1)?;
                }
            }
            Ok(Some((channel.name, members)))
        })
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let Some((channel_name, members)) = committed else {
        return Err(StatusCode::NOT_FOUND);
    };

    let payload = MessagePayload {
        id: message_id,
        sender_id,
        sender_username: claims.username.clone(),
        recipient_id: None,
        channel_id: Some(channel_id),
        conversation_id: None,
        body: req.body.clone(),
        attachments: req.attachments,
        forwarded_from: None,
        created_at: now,
    };
    let event = GatewayEvent::MessageCreate {
        message: payload.clone(),
    };

    for member in &members {
        let Ok(member_id) = member.parse::<Uuid>() else {
            continue;
        };
        if member_id == sender_id {
            state.dispatcher.send_to_user(sender_id, event.clone()).await;
            continue;
        }

        let spec = DurableSpec {
            kind: NotificationKind::Channel,
            actor_id: Some(sender_id),
            channel_id: Some(channel_id),
            message_id: Some(message_id),
            title: format!("New message in #{} from {}", channel_name, claims.username),
            body: notification_body(&req.body),
            data: serde_json::json!({ "channel_id": channel_id }),
        };
        if let Err(e) = state
            .dispatcher
            .deliver(member_id, event.clone(), Some(spec))
            .await
        {
            error!("Failed to queue channel notification for {}: {}", member_id, e);
        }
    }

    Ok((StatusCode::CREATED, Json(payload)))
}

pub async fn get_channel_messages(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(_claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = channel_id.to_string();
    let limit = query.limit.min(200);

    let rows = tokio::task::spawn_blocking(move || db.channel_messages(&cid, limit))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let messages: Vec<MessagePayload> = rows.iter().map(message_payload).collect();
    Ok(Json(messages))
}

/// Reset the caller's unread counter for a channel.
pub async fn mark_channel_read(
    State(state): State<AppState>,
    Path(channel_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let cid = channel_id.to_string();
    let uid = claims.sub.to_string();

    tokio::task::spawn_blocking(move || db.reset_unread(&cid, &uid))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(StatusCode::NO_CONTENT)
}
