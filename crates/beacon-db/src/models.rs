/// Database row types — these map directly to SQLite rows.
/// Distinct from beacon-types API models to keep the DB layer independent.

pub struct UserRow {
    pub id: String,
    pub username: String,
    pub password: String,
    pub created_at: String,
}

pub struct ChannelRow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub created_by: String,
}

pub struct MessageRow {
    pub id: String,
    pub sender_id: String,
    pub sender_username: String,
    pub recipient_id: Option<String>,
    pub channel_id: Option<String>,
    pub conversation_id: Option<String>,
    pub body: String,
    pub attachments: String,
    pub forwarded_from: Option<String>,
    pub created_at: String,
}

pub struct NotificationRow {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub actor_id: Option<String>,
    pub channel_id: Option<String>,
    pub message_id: Option<String>,
    pub title: String,
    pub body: String,
    pub data: String,
    pub is_read: bool,
    pub delivered: bool,
    pub created_at: String,
}

pub struct ScheduledRow {
    pub id: String,
    pub sender_id: String,
    pub recipient_id: Option<String>,
    pub channel_id: Option<String>,
    pub body: String,
    pub attachments: String,
    pub scheduled_at: Option<String>,
}
