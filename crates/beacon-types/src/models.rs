use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a durable notification record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Personal,
    Channel,
    Call,
    Mention,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personal => "personal",
            Self::Channel => "channel",
            Self::Call => "call",
            Self::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "personal" => Some(Self::Personal),
            "channel" => Some(Self::Channel),
            "call" => Some(Self::Call),
            "mention" => Some(Self::Mention),
            _ => None,
        }
    }
}

/// Descriptor for a file attached to a message. The blob itself lives in
/// external storage — the server only keeps this metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub url: String,
    pub mime_type: String,
}

/// A committed message as pushed over the gateway and returned by the API.
/// Exactly one of `recipient_id` / `channel_id` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub recipient_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub conversation_id: Option<Uuid>,
    pub body: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub forwarded_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A durable notification record as pushed over the gateway and returned by
/// the notification feed. `id` is the de-duplication key for clients: a
/// reconnect flush may deliver the same record to several live devices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub actor_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_str() {
        for kind in [
            NotificationKind::Personal,
            NotificationKind::Channel,
            NotificationKind::Call,
            NotificationKind::Mention,
        ] {
            assert_eq!(NotificationKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(NotificationKind::parse("bogus"), None);
    }
}
