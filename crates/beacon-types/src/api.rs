use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Attachment;

// -- JWT Claims --

/// JWT claims shared across beacon-api (REST middleware) and beacon-gateway
/// (WebSocket authentication). Canonical definition lives here in
/// beacon-types to eliminate duplication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Messages --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardMessageRequest {
    pub recipient_ids: Vec<Uuid>,
}

// -- Channels --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChannelRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct ChannelResponse {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub created_by: Uuid,
}

// -- Reactions --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToggleReactionRequest {
    pub emoji: String,
}

// -- Drafts / scheduled items --

/// Exactly one of `recipient_id` / `channel_id` must be set; `scheduled_at`
/// null means a plain draft that the sweep never touches.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateDraftRequest {
    pub recipient_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct DraftResponse {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub recipient_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub body: String,
    pub attachments: Vec<Attachment>,
    pub scheduled_at: Option<DateTime<Utc>>,
}
