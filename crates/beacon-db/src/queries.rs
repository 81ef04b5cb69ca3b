use crate::Database;
use crate::models::{ChannelRow, MessageRow, NotificationRow, ScheduledRow, UserRow};
use anyhow::{Result, anyhow};
use rusqlite::Connection;

impl Database {
    // -- Users --

    pub fn create_user(&self, id: &str, username: &str, password_hash: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO users (id, username, password) VALUES (?1, ?2, ?3)",
                (id, username, password_hash),
            )?;
            Ok(())
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_username(conn, username))
    }

    pub fn user_exists(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM users WHERE id = ?1", [id], |row| row.get(0))
                .optional()?;
            Ok(found.is_some())
        })
    }

    pub fn get_username_by_id(&self, id: &str) -> Result<String> {
        self.with_conn(|conn| {
            conn.query_row("SELECT username FROM users WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .map_err(|_| anyhow!("User not found: {}", id))
        })
    }

    // -- Channels --

    /// Creates the channel and enrolls the creator as its first member.
    pub fn create_channel(
        &self,
        id: &str,
        name: &str,
        description: &str,
        created_by: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channels (id, name, description, created_by) VALUES (?1, ?2, ?3, ?4)",
                (id, name, description, created_by),
            )?;
            tx.execute(
                "INSERT INTO channel_members (channel_id, user_id) VALUES (?1, ?2)",
                (id, created_by),
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn add_channel_member(&self, channel_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO channel_members (channel_id, user_id) VALUES (?1, ?2)",
                (channel_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn channel_members(&self, channel_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT user_id FROM channel_members WHERE channel_id = ?1")?;
            let rows = stmt
                .query_map([channel_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<ChannelRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, description, created_by FROM channels WHERE id = ?1")?;
            let row = stmt
                .query_row([id], |row| {
                    Ok(ChannelRow {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        created_by: row.get(3)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }

    // -- Conversations --

    /// Create-or-touch the conversation for a participant pair. The pair is
    /// stored in canonical order so both directions hit the same row.
    /// Returns the conversation id.
    pub fn upsert_conversation(
        &self,
        new_id: &str,
        user_x: &str,
        user_y: &str,
        now: &str,
    ) -> Result<String> {
        let (a, b) = if user_x <= user_y {
            (user_x, user_y)
        } else {
            (user_y, user_x)
        };
        self.with_conn_mut(|conn| {
            let id = conn.query_row(
                "INSERT INTO conversations (id, user_a, user_b, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(user_a, user_b) DO UPDATE SET updated_at = excluded.updated_at
                 RETURNING id",
                (new_id, a, b, now),
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    /// Look up the conversation for a participant pair without creating it.
    pub fn find_conversation(&self, user_x: &str, user_y: &str) -> Result<Option<String>> {
        let (a, b) = if user_x <= user_y {
            (user_x, user_y)
        } else {
            (user_y, user_x)
        };
        self.with_conn(|conn| {
            let id = conn
                .query_row(
                    "SELECT id FROM conversations WHERE user_a = ?1 AND user_b = ?2",
                    (a, b),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(id)
        })
    }

    // -- Messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        sender_id: &str,
        recipient_id: Option<&str>,
        channel_id: Option<&str>,
        conversation_id: Option<&str>,
        body: &str,
        attachments: &str,
        forwarded_from: Option<&str>,
        created_at: &str,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO messages
                    (id, sender_id, recipient_id, channel_id, conversation_id,
                     body, attachments, forwarded_from, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    sender_id,
                    recipient_id,
                    channel_id,
                    conversation_id,
                    body,
                    attachments,
                    forwarded_from,
                    created_at
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{MESSAGE_SELECT} WHERE m.id = ?1"))?;
            let row = stmt.query_row([id], message_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn channel_messages(&self, channel_id: &str, limit: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT} WHERE m.channel_id = ?1
                 ORDER BY m.created_at DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![channel_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn conversation_messages(
        &self,
        conversation_id: &str,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{MESSAGE_SELECT} WHERE m.conversation_id = ?1
                 ORDER BY m.created_at DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![conversation_id, limit], message_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    // -- Notifications --

    pub fn insert_notification(&self, n: &NotificationRow) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO notifications
                    (id, user_id, kind, actor_id, channel_id, message_id,
                     title, body, data, is_read, delivered, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    n.id,
                    n.user_id,
                    n.kind,
                    n.actor_id,
                    n.channel_id,
                    n.message_id,
                    n.title,
                    n.body,
                    n.data,
                    n.is_read,
                    n.delivered,
                    n.created_at
                ],
            )?;
            Ok(())
        })
    }

    /// Undelivered backlog for a user, oldest first. The rowid tiebreak keeps
    /// flush order deterministic when two records share a timestamp.
    pub fn pending_notifications(&self, user_id: &str) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{NOTIFICATION_SELECT} WHERE user_id = ?1 AND delivered = 0
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt
                .query_map([user_id], notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Flip delivered on a flushed batch in one statement.
    pub fn mark_notifications_delivered(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.with_conn_mut(|conn| {
            let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "UPDATE notifications SET delivered = 1 WHERE id IN ({})",
                placeholders.join(", ")
            );
            let params: Vec<&dyn rusqlite::types::ToSql> = ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();
            conn.execute(&sql, params.as_slice())?;
            Ok(())
        })
    }

    pub fn recent_notifications(&self, user_id: &str, limit: u32) -> Result<Vec<NotificationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{NOTIFICATION_SELECT} WHERE user_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt
                .query_map(rusqlite::params![user_id, limit], notification_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Returns false when the notification does not exist or belongs to
    /// another user.
    pub fn mark_notification_read(&self, id: &str, user_id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute(
                "UPDATE notifications SET is_read = 1 WHERE id = ?1 AND user_id = ?2",
                (id, user_id),
            )?;
            Ok(changed > 0)
        })
    }

    // -- Scheduled messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_scheduled(
        &self,
        id: &str,
        sender_id: &str,
        recipient_id: Option<&str>,
        channel_id: Option<&str>,
        body: &str,
        attachments: &str,
        scheduled_at: Option<&str>,
    ) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO scheduled_messages
                    (id, sender_id, recipient_id, channel_id, body, attachments, scheduled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id,
                    sender_id,
                    recipient_id,
                    channel_id,
                    body,
                    attachments,
                    scheduled_at
                ],
            )?;
            Ok(())
        })
    }

    /// Items due for promotion: scheduled_at set and <= now. Plain drafts
    /// (null scheduled_at) are never returned.
    pub fn due_scheduled(&self, now: &str) -> Result<Vec<ScheduledRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, recipient_id, channel_id, body, attachments, scheduled_at
                 FROM scheduled_messages
                 WHERE scheduled_at IS NOT NULL AND scheduled_at <= ?1
                 ORDER BY scheduled_at ASC",
            )?;
            let rows = stmt
                .query_map([now], scheduled_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn get_scheduled(&self, id: &str) -> Result<Option<ScheduledRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, recipient_id, channel_id, body, attachments, scheduled_at
                 FROM scheduled_messages WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], scheduled_from_row).optional()?;
            Ok(row)
        })
    }

    pub fn scheduled_for_sender(&self, sender_id: &str) -> Result<Vec<ScheduledRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sender_id, recipient_id, channel_id, body, attachments, scheduled_at
                 FROM scheduled_messages
                 WHERE sender_id = ?1 AND scheduled_at IS NOT NULL
                 ORDER BY scheduled_at ASC",
            )?;
            let rows = stmt
                .query_map([sender_id], scheduled_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn delete_scheduled(&self, id: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let changed = conn.execute("DELETE FROM scheduled_messages WHERE id = ?1", [id])?;
            Ok(changed > 0)
        })
    }

    // -- Unread counters --

    /// Atomic increment-by-delta. Never read-modify-write: concurrent sends
    /// from different producers must not lose an increment.
    pub fn increment_unread(&self, context_id: &str, user_id: &str, delta: i64) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "INSERT INTO unread_counts (context_id, user_id, count) VALUES (?1, ?2, ?3)
                 ON CONFLICT(context_id, user_id) DO UPDATE SET count = count + excluded.count",
                rusqlite::params![context_id, user_id, delta],
            )?;
            Ok(())
        })
    }

    /// Explicit mark-read reset. The only operation that ever lowers a
    /// counter.
    pub fn reset_unread(&self, context_id: &str, user_id: &str) -> Result<()> {
        self.with_conn_mut(|conn| {
            conn.execute(
                "UPDATE unread_counts SET count = 0 WHERE context_id = ?1 AND user_id = ?2",
                (context_id, user_id),
            )?;
            Ok(())
        })
    }

    pub fn unread_count(&self, context_id: &str, user_id: &str) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn
                .query_row(
                    "SELECT count FROM unread_counts WHERE context_id = ?1 AND user_id = ?2",
                    (context_id, user_id),
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.unwrap_or(0))
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if exists, inserts if not.
    /// Returns true when the reaction was added, false when removed.
    pub fn toggle_reaction(
        &self,
        id: &str,
        message_id: &str,
        user_id: &str,
        emoji: &str,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    rusqlite::params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                Ok(false)
            } else {
                conn.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, message_id, user_id, emoji],
                )?;
                Ok(true)
            }
        })
    }
}

const MESSAGE_SELECT: &str = "SELECT m.id, m.sender_id, u.username, m.recipient_id, m.channel_id,
        m.conversation_id, m.body, m.attachments, m.forwarded_from, m.created_at
 FROM messages m
 LEFT JOIN users u ON m.sender_id = u.id";

fn message_from_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        sender_username: row
            .get::<_, Option<String>>(2)?
            .unwrap_or_else(|| "unknown".to_string()),
        recipient_id: row.get(3)?,
        channel_id: row.get(4)?,
        conversation_id: row.get(5)?,
        body: row.get(6)?,
        attachments: row.get(7)?,
        forwarded_from: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const NOTIFICATION_SELECT: &str = "SELECT id, user_id, kind, actor_id, channel_id, message_id,
        title, body, data, is_read, delivered, created_at
 FROM notifications";

fn notification_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<NotificationRow, rusqlite::Error> {
    Ok(NotificationRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        actor_id: row.get(3)?,
        channel_id: row.get(4)?,
        message_id: row.get(5)?,
        title: row.get(6)?,
        body: row.get(7)?,
        data: row.get(8)?,
        is_read: row.get(9)?,
        delivered: row.get(10)?,
        created_at: row.get(11)?,
    })
}

fn scheduled_from_row(
    row: &rusqlite::Row<'_>,
) -> std::result::Result<ScheduledRow, rusqlite::Error> {
    Ok(ScheduledRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        channel_id: row.get(3)?,
        body: row.get(4)?,
        attachments: row.get(5)?,
        scheduled_at: row.get(6)?,
    })
}

fn query_user_by_username(conn: &Connection, username: &str) -> Result<Option<UserRow>> {
    let mut stmt =
        conn.prepare("SELECT id, username, password, created_at FROM users WHERE username = ?1")?;

    let row = stmt
        .query_row([username], |row| {
            Ok(UserRow {
                id: row.get(0)?,
                username: row.get(1)?,
                password: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NotificationRow;

    fn seed_user(db: &Database, name: &str) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        db.create_user(&id, name, "hash").unwrap();
        id
    }

    fn notification(user_id: &str, title: &str, created_at: &str) -> NotificationRow {
        NotificationRow {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind: "personal".to_string(),
            actor_id: None,
            channel_id: None,
            message_id: None,
            title: title.to_string(),
            body: String::new(),
            data: "{}".to_string(),
            is_read: false,
            delivered: false,
            created_at: created_at.to_string(),
        }
    }

    #[test]
    fn pending_notifications_order_oldest_first() {
        let db = Database::open_in_memory().unwrap();
        let user = seed_user(&db, "ana");

        db.insert_notification(&notification(&user, "second", "2026-01-01T10:00:01.000Z"))
            .unwrap();
        db.insert_notification(&notification(&user, "third", "2026-01-01T10:00:02.000Z"))
            .unwrap();
        db.insert_notification(&notification(&user, "first", "2026-01-01T10:00:00.000Z"))
            .unwrap();

        let pending = db.pending_notifications(&user).unwrap();
        let titles: Vec<&str> = pending.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["first", "second", "third"]);
    }

    #[test]
    fn mark_delivered_batch_clears_backlog() {
        let db = Database::open_in_memory().unwrap();
        let user = seed_user(&db, "bo");

        for i in 0..3 {
            db.insert_notification(&notification(
                &user,
                "n",
                &format!("2026-01-01T10:00:0{i}.000Z"),
            ))
            .unwrap();
        }

        let pending = db.pending_notifications(&user).unwrap();
        assert_eq!(pending.len(), 3);

        let ids: Vec<String> = pending.iter().map(|n| n.id.clone()).collect();
        db.mark_notifications_delivered(&ids).unwrap();

        assert!(db.pending_notifications(&user).unwrap().is_empty());
        // the records themselves are never deleted by the delivery engine
        assert_eq!(db.recent_notifications(&user, 50).unwrap().len(), 3);
    }

    #[test]
    fn mark_read_is_scoped_to_owner() {
        let db = Database::open_in_memory().unwrap();
        let owner = seed_user(&db, "cy");
        let other = seed_user(&db, "dee");

        let n = notification(&owner, "hi", "2026-01-01T10:00:00.000Z");
        db.insert_notification(&n).unwrap();

        assert!(!db.mark_notification_read(&n.id, &other).unwrap());
        assert!(db.mark_notification_read(&n.id, &owner).unwrap());
    }

    #[test]
    fn unread_counter_survives_concurrent_increments() {
        let db = Database::open_in_memory().unwrap();
        let user = seed_user(&db, "eve");
        let ctx = "conversation-1";

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..25 {
                        db.increment_unread(ctx, &user, 1).unwrap();
                    }
                });
            }
        });

        assert_eq!(db.unread_count(ctx, &user).unwrap(), 200);

        db.reset_unread(ctx, &user).unwrap();
        assert_eq!(db.unread_count(ctx, &user).unwrap(), 0);
    }

    #[test]
    fn unread_counter_missing_row_reads_zero() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(db.unread_count("nowhere", "nobody").unwrap(), 0);
    }

    #[test]
    fn due_scheduled_honors_boundary_and_skips_plain_drafts() {
        let db = Database::open_in_memory().unwrap();
        let sender = seed_user(&db, "fay");

        db.insert_scheduled(
            "due-now",
            &sender,
            Some("r"),
            None,
            "due",
            "[]",
            Some("2026-01-01T10:00:00.000Z"),
        )
        .unwrap();
        db.insert_scheduled(
            "future",
            &sender,
            Some("r"),
            None,
            "later",
            "[]",
            Some("2026-01-01T10:00:01.000Z"),
        )
        .unwrap();
        db.insert_scheduled("plain", &sender, Some("r"), None, "draft", "[]", None)
            .unwrap();

        let due = db.due_scheduled("2026-01-01T10:00:00.000Z").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, "due-now");

        assert!(db.delete_scheduled("due-now").unwrap());
        assert!(!db.delete_scheduled("due-now").unwrap());
        assert!(db.due_scheduled("2026-01-01T10:00:00.000Z").unwrap().is_empty());
    }

    #[test]
    fn conversation_upsert_is_direction_independent() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "gil");
        let b = seed_user(&db, "hal");

        let first = db
            .upsert_conversation("conv-1", &a, &b, "2026-01-01T10:00:00.000Z")
            .unwrap();
        let second = db
            .upsert_conversation("conv-2", &b, &a, "2026-01-01T10:00:05.000Z")
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first, "conv-1");
    }

    #[test]
    fn toggle_reaction_adds_then_removes() {
        let db = Database::open_in_memory().unwrap();
        let a = seed_user(&db, "ivy");
        let b = seed_user(&db, "jon");
        db.insert_message(
            "m1",
            &a,
            Some(b.as_str()),
            None,
            None,
            "hello",
            "[]",
            None,
            "2026-01-01T10:00:00.000Z",
        )
        .unwrap();

        assert!(db.toggle_reaction("r1", "m1", &b, "👍").unwrap());
        assert!(!db.toggle_reaction("r2", "m1", &b, "👍").unwrap());
        assert!(db.toggle_reaction("r3", "m1", &b, "👍").unwrap());
    }
}
