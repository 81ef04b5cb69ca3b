use std::sync::Arc;

use chrono::SecondsFormat;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

use beacon_db::Database;
use beacon_db::models::NotificationRow;
use beacon_types::events::GatewayEvent;
use beacon_types::models::{NotificationKind, NotificationPayload};

use crate::presence::PresenceRegistry;

/// Result of a single delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Recipient had live connections; the event was pushed to every one.
    DeliveredLive { pushes: usize },
    /// Recipient offline; a durable notification record was queued.
    Queued,
    /// Recipient offline and the event carried no durable spec.
    Dropped,
}

/// Durable half of a delivery request: what to persist when the recipient
/// has no live connection. Events without one (typing, call signaling) are
/// simply dropped for offline recipients.
#[derive(Debug, Clone)]
pub struct DurableSpec {
    pub kind: NotificationKind,
    pub actor_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub title: String,
    pub body: String,
    pub data: serde_json::Value,
}

/// The delivery engine. Owns the presence registry (constructed once at
/// process start, shared by cloning) and decides per event between live
/// push, durable queue and drop. At-least-once: a push is never awaited or
/// acknowledged; the durable record plus flush-on-reconnect is the only
/// retry mechanism.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: RwLock<PresenceRegistry>,
    db: Arc<Database>,

    /// Broadcast channel for roster snapshots — every connected client
    /// receives them.
    broadcast_tx: broadcast::Sender<GatewayEvent>,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>) -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                registry: RwLock::new(PresenceRegistry::new()),
                db,
                broadcast_tx,
            }),
        }
    }

    /// Subscribe to broadcast events. Each gateway connection calls this
    /// once, before registering, so it cannot miss its own roster update.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Broadcast an event to all connected clients.
    pub fn broadcast(&self, event: GatewayEvent) {
        let _ = self.inner.broadcast_tx.send(event);
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.registry.read().await.is_online(user_id)
    }

    pub async fn online_user_ids(&self) -> Vec<Uuid> {
        self.inner.registry.read().await.online_user_ids()
    }

    /// Push an event to every live handle of a user. Fire-and-forget: a
    /// closed handle never blocks the rest. Returns the number of handles
    /// the push was attempted on.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> usize {
        let handles = self.inner.registry.read().await.handles_for(user_id);
        for tx in &handles {
            let _ = tx.send(event.clone());
        }
        handles.len()
    }

    /// Deliver an event to a recipient: live push to every connected device
    /// if online, else queue a durable record (when `durable` is given), else
    /// drop. A store failure surfaces as `Err` — callers log it and carry on
    /// with their already-committed work.
    pub async fn deliver(
        &self,
        recipient_id: Uuid,
        event: GatewayEvent,
        durable: Option<DurableSpec>,
    ) -> anyhow::Result<DeliveryOutcome> {
        let pushes = self.send_to_user(recipient_id, event).await;
        if pushes > 0 {
            return Ok(DeliveryOutcome::DeliveredLive { pushes });
        }

        let Some(spec) = durable else {
            return Ok(DeliveryOutcome::Dropped);
        };

        let row = NotificationRow {
            id: Uuid::new_v4().to_string(),
            user_id: recipient_id.to_string(),
            kind: spec.kind.as_str().to_string(),
            actor_id: spec.actor_id.map(|id| id.to_string()),
            channel_id: spec.channel_id.map(|id| id.to_string()),
            message_id: spec.message_id.map(|id| id.to_string()),
            title: spec.title,
            body: spec.body,
            data: spec.data.to_string(),
            is_read: false,
            delivered: false,
            created_at: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        };

        let db = self.inner.db.clone();
        tokio::task::spawn_blocking(move || db.insert_notification(&row)).await??;

        Ok(DeliveryOutcome::Queued)
    }

    /// Connection (re)registration: register the handle, flush the user's
    /// undelivered backlog oldest-first to ALL of their live devices, mark
    /// the batch delivered, then broadcast the new roster.
    pub async fn on_register(
        &self,
        user_id: Uuid,
        session_id: Uuid,
        sender: mpsc::UnboundedSender<GatewayEvent>,
    ) -> anyhow::Result<()> {
        // Register first so flushed pushes reach this handle.
        self.inner
            .registry
            .write()
            .await
            .register(user_id, session_id, sender);

        let db = self.inner.db.clone();
        let uid = user_id.to_string();
        let pending = tokio::task::spawn_blocking(move || db.pending_notifications(&uid)).await??;

        if !pending.is_empty() {
            let handles = self.inner.registry.read().await.handles_for(user_id);
            let mut flushed = Vec::with_capacity(pending.len());
            for row in &pending {
                let event = GatewayEvent::Notification {
                    notification: notification_payload(row),
                };
                for tx in &handles {
                    let _ = tx.send(event.clone());
                }
                flushed.push(row.id.clone());
            }

            // An unconfirmable push still counts: the batch flips delivered
            // in one statement, and clients de-duplicate by record id.
            let db = self.inner.db.clone();
            tokio::task::spawn_blocking(move || db.mark_notifications_delivered(&flushed))
                .await??;
        }

        self.broadcast_roster().await;
        Ok(())
    }

    /// Connection teardown: drop the handle and broadcast the new roster.
    pub async fn on_disconnect(&self, user_id: Uuid, session_id: Uuid) {
        self.inner
            .registry
            .write()
            .await
            .unregister(user_id, session_id);
        self.broadcast_roster().await;
    }

    async fn broadcast_roster(&self) {
        let user_ids = self.online_user_ids().await;
        self.broadcast(GatewayEvent::OnlineRoster { user_ids });
    }
}

/// Convert a stored notification row into its wire payload. Corrupt fields
/// are logged and defaulted rather than failing the whole flush.
pub fn notification_payload(row: &NotificationRow) -> NotificationPayload {
    NotificationPayload {
        id: parse_uuid("notification id", &row.id),
        user_id: parse_uuid("user_id", &row.user_id),
        kind: NotificationKind::parse(&row.kind).unwrap_or_else(|| {
            warn!("Corrupt notification kind '{}' on '{}'", row.kind, row.id);
            NotificationKind::Personal
        }),
        actor_id: row.actor_id.as_deref().map(|v| parse_uuid("actor_id", v)),
        channel_id: row.channel_id.as_deref().map(|v| parse_uuid("channel_id", v)),
        message_id: row.message_id.as_deref().map(|v| parse_uuid("message_id", v)),
        title: row.title.clone(),
        body: row.body.clone(),
        data: serde_json::from_str(&row.data).unwrap_or_default(),
        read: row.is_read,
        created_at: parse_timestamp(&row.created_at, &row.id),
    }
}

fn parse_uuid(field: &str, value: &str) -> Uuid {
    value.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} '{}': {}", field, value, e);
        Uuid::default()
    })
}

/// Timestamps written by this code are RFC 3339; rows created by SQLite
/// defaults use "YYYY-MM-DD HH:MM:SS" and are parsed as naive UTC.
pub fn parse_timestamp(value: &str, context: &str) -> chrono::DateTime<chrono::Utc> {
    value
        .parse::<chrono::DateTime<chrono::Utc>>()
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").map(|ndt| ndt.and_utc())
        })
        .unwrap_or_else(|e| {
            warn!("Corrupt created_at '{}' on '{}': {}", value, context, e);
            chrono::DateTime::default()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn test_db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    fn seed_user(db: &Database, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        db.create_user(&id.to_string(), name, "hash").unwrap();
        id
    }

    async fn connect(
        dispatcher: &Dispatcher,
        user_id: Uuid,
    ) -> (Uuid, UnboundedReceiver<GatewayEvent>) {
        let session_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.on_register(user_id, session_id, tx).await.unwrap();
        (session_id, rx)
    }

    fn typing_from(user_id: Uuid) -> GatewayEvent {
        GatewayEvent::TypingStart {
            from_user_id: user_id,
            username: "someone".to_string(),
        }
    }

    fn durable_spec(actor: Uuid) -> DurableSpec {
        DurableSpec {
            kind: NotificationKind::Personal,
            actor_id: Some(actor),
            channel_id: None,
            message_id: None,
            title: "New message".to_string(),
            body: "hello".to_string(),
            data: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn online_recipient_gets_one_push_per_handle_and_no_record() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");

        let (_s1, mut rx1) = connect(&dispatcher, recipient).await;
        let (_s2, mut rx2) = connect(&dispatcher, recipient).await;

        let outcome = dispatcher
            .deliver(recipient, typing_from(sender), Some(durable_spec(sender)))
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::DeliveredLive { pushes: 2 });
        assert!(matches!(
            rx1.try_recv().unwrap(),
            GatewayEvent::TypingStart { .. }
        ));
        assert!(matches!(
            rx2.try_recv().unwrap(),
            GatewayEvent::TypingStart { .. }
        ));
        // live path creates no durable record
        assert!(db
            .recent_notifications(&recipient.to_string(), 50)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn offline_recipient_with_durable_spec_is_queued() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");

        let outcome = dispatcher
            .deliver(recipient, typing_from(sender), Some(durable_spec(sender)))
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Queued);

        let pending = db.pending_notifications(&recipient.to_string()).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].delivered);
        assert!(!pending[0].is_read);
    }

    #[tokio::test]
    async fn offline_recipient_without_durable_spec_is_dropped() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");

        let outcome = dispatcher
            .deliver(recipient, typing_from(sender), None)
            .await
            .unwrap();
        assert_eq!(outcome, DeliveryOutcome::Dropped);
        assert!(db
            .recent_notifications(&recipient.to_string(), 50)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn register_flushes_backlog_oldest_first_and_marks_delivered() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let user = seed_user(&db, "ana");

        for (i, title) in ["first", "second", "third"].iter().enumerate() {
            db.insert_notification(&NotificationRow {
                id: Uuid::new_v4().to_string(),
                user_id: user.to_string(),
                kind: "personal".to_string(),
                actor_id: None,
                channel_id: None,
                message_id: None,
                title: title.to_string(),
                body: String::new(),
                data: "{}".to_string(),
                is_read: false,
                delivered: false,
                created_at: format!("2026-01-01T10:00:0{i}.000Z"),
            })
            .unwrap();
        }

        let (_session, mut rx) = connect(&dispatcher, user).await;

        let mut titles = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                GatewayEvent::Notification { notification } => titles.push(notification.title),
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(titles, vec!["first", "second", "third"]);

        assert!(db.pending_notifications(&user.to_string()).unwrap().is_empty());
        let all = db.recent_notifications(&user.to_string(), 50).unwrap();
        assert!(all.iter().all(|n| n.delivered));
    }

    #[tokio::test]
    async fn flush_reaches_every_live_device() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let user = seed_user(&db, "ana");

        let (_s1, mut rx1) = connect(&dispatcher, user).await;

        db.insert_notification(&NotificationRow {
            id: Uuid::new_v4().to_string(),
            user_id: user.to_string(),
            kind: "personal".to_string(),
            actor_id: None,
            channel_id: None,
            message_id: None,
            title: "missed".to_string(),
            body: String::new(),
            data: "{}".to_string(),
            is_read: false,
            delivered: false,
            created_at: "2026-01-01T10:00:00.000Z".to_string(),
        })
        .unwrap();

        // second device connects; the flush targets all live handles
        let (_s2, mut rx2) = connect(&dispatcher, user).await;

        assert!(matches!(
            rx1.recv().await.unwrap(),
            GatewayEvent::Notification { .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            GatewayEvent::Notification { .. }
        ));
    }

    #[tokio::test]
    async fn roster_broadcasts_on_register_and_disconnect() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let user = seed_user(&db, "ana");

        let mut broadcast_rx = dispatcher.subscribe();
        let (session, _rx) = connect(&dispatcher, user).await;

        match broadcast_rx.recv().await.unwrap() {
            GatewayEvent::OnlineRoster { user_ids } => assert_eq!(user_ids, vec![user]),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(dispatcher.is_online(user).await);

        dispatcher.on_disconnect(user, session).await;
        match broadcast_rx.recv().await.unwrap() {
            GatewayEvent::OnlineRoster { user_ids } => assert!(user_ids.is_empty()),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(!dispatcher.is_online(user).await);
    }
}
