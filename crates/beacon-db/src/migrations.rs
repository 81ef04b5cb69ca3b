use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            username    TEXT NOT NULL UNIQUE,
            password    TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS channels (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            created_by  TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS channel_members (
            channel_id  TEXT NOT NULL REFERENCES channels(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            joined_at   TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (channel_id, user_id)
        );

        -- Direct conversations. (user_a, user_b) is the canonically ordered
        -- participant pair, so the upsert key is unique per pair.
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            user_a      TEXT NOT NULL REFERENCES users(id),
            user_b      TEXT NOT NULL REFERENCES users(id),
            updated_at  TEXT NOT NULL,
            UNIQUE (user_a, user_b)
        );

        -- A message targets exactly one of recipient / channel.
        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            recipient_id    TEXT REFERENCES users(id),
            channel_id      TEXT REFERENCES channels(id),
            conversation_id TEXT REFERENCES conversations(id),
            body            TEXT NOT NULL DEFAULT '',
            attachments     TEXT NOT NULL DEFAULT '[]',
            forwarded_from  TEXT REFERENCES users(id),
            created_at      TEXT NOT NULL,
            CHECK ((recipient_id IS NULL) <> (channel_id IS NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_channel
            ON messages(channel_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS notifications (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            kind        TEXT NOT NULL,
            actor_id    TEXT,
            channel_id  TEXT,
            message_id  TEXT,
            title       TEXT NOT NULL,
            body        TEXT NOT NULL,
            data        TEXT NOT NULL DEFAULT '{}',
            is_read     INTEGER NOT NULL DEFAULT 0,
            delivered   INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_notifications_user_delivered
            ON notifications(user_id, delivered);
        CREATE INDEX IF NOT EXISTS idx_notifications_created
            ON notifications(created_at);

        -- Drafts. A null scheduled_at is a plain draft the sweep never
        -- touches. Target validation happens at creation; the sweep skips
        -- rows that violate it rather than trusting a constraint.
        CREATE TABLE IF NOT EXISTS scheduled_messages (
            id           TEXT PRIMARY KEY,
            sender_id    TEXT NOT NULL REFERENCES users(id),
            recipient_id TEXT,
            channel_id   TEXT,
            body         TEXT NOT NULL DEFAULT '',
            attachments  TEXT NOT NULL DEFAULT '[]',
            scheduled_at TEXT,
            created_at   TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_scheduled_due
            ON scheduled_messages(scheduled_at);

        -- Per-conversation-or-channel unread counters. context_id is a
        -- conversation id or a channel id.
        CREATE TABLE IF NOT EXISTS unread_counts (
            context_id  TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            count       INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (context_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            user_id     TEXT NOT NULL REFERENCES users(id),
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, user_id, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
