use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{MessagePayload, NotificationPayload};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Snapshot of every currently-online user. Broadcast to all connected
    /// clients whenever the presence key set changes.
    OnlineRoster { user_ids: Vec<Uuid> },

    /// A new message was committed (direct, channel, forwarded or promoted
    /// from a scheduled item — all four take this shape)
    MessageCreate { message: MessagePayload },

    /// A reaction set changed on a message
    MessageUpdate {
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
        added: bool,
    },

    /// A durable notification, pushed live or flushed on reconnect
    Notification { notification: NotificationPayload },

    /// A peer started typing
    TypingStart { from_user_id: Uuid, username: String },

    /// Call signaling relayed between peers
    CallOffer { from_user_id: Uuid, offer: String },
    CallAnswer { from_user_id: Uuid, answer: String },
    CallCandidate { from_user_id: Uuid, candidate: String },
    CallHangUp { from_user_id: Uuid },

    /// Reply to a signaling command whose target had no live connection
    PeerOffline { user_id: Uuid },
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Indicate typing to a direct-message peer. Ephemeral: dropped if the
    /// peer is offline, never queued.
    StartTyping { recipient_id: Uuid },

    /// Call signaling. Same ephemeral policy as typing.
    CallStart { to: Uuid, offer: String },
    CallAnswer { to: Uuid, answer: String },
    CallCandidate { to: Uuid, candidate: String },
    CallHangUp { to: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_tagged_representation() {
        let event = GatewayEvent::OnlineRoster {
            user_ids: vec![Uuid::nil()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "OnlineRoster");
        assert!(json["data"]["user_ids"].is_array());
    }

    #[test]
    fn identify_command_parses() {
        let raw = r#"{"type":"Identify","data":{"token":"abc"}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        assert!(matches!(cmd, GatewayCommand::Identify { token } if token == "abc"));
    }
}
