//! Scheduled promotion engine.
//!
//! A fixed-period sweep finds due scheduled items and converts each into a
//! live message through the same delivery path a normal send uses. The item
//! is deleted only after the derived message is committed and fan-out was
//! attempted, so a transient failure before the message exists leaves the
//! item due for the next tick. A crash between commit and delete produces a
//! duplicate on retry — accepted at-least-once behavior, there is no
//! distributed transaction across the message and schedule stores.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use beacon_db::Database;
use beacon_db::models::ScheduledRow;
use beacon_gateway::dispatcher::{Dispatcher, DurableSpec};
use beacon_types::events::GatewayEvent;
use beacon_types::models::{MessagePayload, NotificationKind};

#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("scheduled item has no target")]
    MissingTarget,
    #[error("scheduled item has both a recipient and a channel")]
    AmbiguousTarget,
    #[error("channel {0} no longer exists")]
    ChannelGone(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Recurring sweep task. Runs until process shutdown; an abandoned tick is
/// harmless because still-due items are picked up on the next start.
pub async fn run(db: Arc<Database>, dispatcher: Dispatcher, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        match sweep_once(&db, &dispatcher, Utc::now()).await {
            Ok(0) => {}
            Ok(n) => info!("Sweep promoted {} scheduled message(s)", n),
            Err(e) => error!("Sweep tick failed: {}", e),
        }
    }
}

/// One sweep tick. Items are processed independently: a malformed item is
/// skipped with a warning, a failed one stays in the store for the next
/// tick, and neither stops the rest. Yields between items so a large batch
/// cannot starve connection handling on the shared runtime.
pub async fn sweep_once(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let now_ts = now.to_rfc3339_opts(SecondsFormat::Millis, true);
    let due = {
        let db = db.clone();
        tokio::task::spawn_blocking(move || db.due_scheduled(&now_ts)).await??
    };

    let mut promoted = 0;
    for item in due {
        match promote_item(db, dispatcher, &item).await {
            Ok(()) => {
                info!("Promoted scheduled message {}", item.id);
                promoted += 1;
            }
            Err(e @ (PromoteError::MissingTarget | PromoteError::AmbiguousTarget)) => {
                warn!("Skipping malformed scheduled item {}: {}", item.id, e);
            }
            Err(e) => {
                error!("Failed to promote scheduled item {}: {}", item.id, e);
            }
        }
        tokio::task::yield_now().await;
    }

    Ok(promoted)
}

enum Target {
    Direct(String),
    Channel(String),
}

async fn promote_item(
    db: &Arc<Database>,
    dispatcher: &Dispatcher,
    item: &ScheduledRow,
) -> Result<(), PromoteError> {
    let target = match (&item.recipient_id, &item.channel_id) {
        (Some(recipient), None) => Target::Direct(recipient.clone()),
        (None, Some(channel)) => Target::Channel(channel.clone()),
        (None, None) => return Err(PromoteError::MissingTarget),
        (Some(_), Some(_)) => return Err(PromoteError::AmbiguousTarget),
    };

    let sender_username = {
        let db = db.clone();
        let sid = item.sender_id.clone();
        spawn_store(move || db.get_username_by_id(&sid)).await?
    };

    let message_id = Uuid::new_v4();
    let now = Utc::now();
    let created_at = now.to_rfc3339_opts(SecondsFormat::Millis, true);

    match target {
        Target::Direct(recipient) => {
            let conversation_id = {
                let db = db.clone();
                let sid = item.sender_id.clone();
                let rid = recipient.clone();
                let mid = message_id.to_string();
                let body = item.body.clone();
                let attachments = item.attachments.clone();
                let ts = created_at.clone();
                spawn_store(move || -> anyhow::Result<String> {
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
                .await?
            };

            let event = GatewayEvent::MessageCreate {
                message: message_payload(item, message_id, &sender_username, &conversation_id, now),
            };
            let spec = DurableSpec {
                kind: NotificationKind::Personal,
                actor_id: item.sender_id.parse().ok(),
                channel_id: None,
                message_id: Some(message_id),
                title: format!("New message from {}", sender_username),
                body: notification_body(&item.body),
                data: serde_json::json!({ "conversation_id": conversation_id }),
            };
            if let Ok(recipient_id) = recipient.parse::<Uuid>() {
                // Fan-out failure only affects delivery, not message
                // existence — the item is still consumed below.
                if let Err(e) = dispatcher.deliver(recipient_id, event, Some(spec)).await {
                    error!("Failed to queue promoted notification for {}: {}", recipient, e);
                }
            } else {
                warn!("Corrupt recipient '{}' on scheduled item {}", recipient, item.id);
            }
        }

        Target::Channel(channel_id) => {
            let (channel_name, members) = {
                let db = db.clone();
                let cid = channel_id.clone();
                let sid = item.sender_id.clone();
                let mid = message_id.to_string();
                let body = item.body.clone();
                let attachments = item.attachments.clone();
                let ts = created_at.clone();
                spawn_store(move || -> anyhow::Result<Option<(String, Vec<String>)>> {
                    let Some(channel) = db.get_channel(&cid)? else {
                        return Ok(None);
                    };
                    let members = db.channel_members(&cid)?;
                    db.insert_message(
                        &mid, &sid, None, Some(cid.as_str()), None, &body, &attachments, None, &ts,
                    )?;
                    for member in &members {
                        if member != &sid {
                            db.increment_unread(&cid, member, 1)?;
                        }
                    }
                    Ok(Some((channel.name, members)))
                })
                .await?
                .ok_or_else(|| PromoteError::ChannelGone(channel_id.clone()))?
            };

            let event = GatewayEvent::MessageCreate {
                message: message_payload(item, message_id, &sender_username, "", now),
            };
            for member in &members {
                let Ok(member_id) = member.parse::<Uuid>() else {
                    continue;
                };
                if member == &item.sender_id {
                    dispatcher.send_to_user(member_id, event.clone()).await;
                    continue;
                }
                let spec = DurableSpec {
                    kind: NotificationKind::Channel,
                    actor_id: item.sender_id.parse().ok(),
                    channel_id: channel_id.parse().ok(),
                    message_id: Some(message_id),
                    title: format!("New message in #{} from {}", channel_name, sender_username),
                    body: notification_body(&item.body),
                    data: serde_json::json!({ "channel_id": channel_id }),
                };
                if let Err(e) = dispatcher.deliver(member_id, event.clone(), Some(spec)).await {
                    error!("Failed to queue promoted notification for {}: {}", member, e);
                }
            }
        }
    }

    // Consume the item last: the derived message exists and fan-out was
    // attempted. If this delete fails the next tick promotes again — the
    // documented duplicate-on-crash case.
    {
        let db = db.clone();
        let id = item.id.clone();
        spawn_store(move || db.delete_scheduled(&id)).await?;
    }

    Ok(())
}

async fn spawn_store<T: Send + 'static>(
    f: impl FnOnce() -> anyhow::Result<T> + Send + 'static,
) -> Result<T, PromoteError> {
    let result = tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| PromoteError::Store(anyhow::anyhow!("store task join error: {}", e)))?;
    result.map_err(PromoteError::Store)
}

fn message_payload(
    item: &ScheduledRow,
    message_id: Uuid,
    sender_username: &str,
    conversation_id: &str,
    created_at: DateTime<Utc>,
) -> MessagePayload {
    MessagePayload {
        id: message_id,
        sender_id: item.sender_id.parse().unwrap_or_default(),
        sender_username: sender_username.to_string(),
        recipient_id: item.recipient_id.as_deref().and_then(|v| v.parse().ok()),
        channel_id: item.channel_id.as_deref().and_then(|v| v.parse().ok()),
        conversation_id: conversation_id.parse().ok(),
        body: item.body.clone(),
        attachments: serde_json::from_str(&item.attachments).unwrap_or_default(),
        forwarded_from: None,
        created_at,
    }
}

fn notification_body(body: &str) -> String {
    if body.trim().is_empty() {
        "Sent a file".to_string()
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Arc<Database> {
        Arc::new(Database::open_in_memory().unwrap())
    }

    fn seed_user(db: &Database, name: &str) -> String {
        let id = Uuid::new_v4().to_string();
        db.create_user(&id, name, "hash").unwrap();
        id
    }

    fn past() -> &'static str {
        "2026-01-01T09:55:00.000Z"
    }

    fn sweep_time() -> DateTime<Utc> {
        "2026-01-01T10:00:00Z".parse().unwrap()
    }

    #[tokio::test]
    async fn channel_item_promotes_once_and_disappears() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let members: Vec<String> = ["bo", "cy", "dee"]
            .iter()
            .map(|n| seed_user(&db, n))
            .collect();

        let channel_id = Uuid::new_v4().to_string();
        db.create_channel(&channel_id, "general", "", &sender).unwrap();
        for m in &members {
            db.add_channel_member(&channel_id, m).unwrap();
        }

        db.insert_scheduled(
            "item-1",
            &sender,
            None,
            Some(channel_id.as_str()),
            "good morning",
            "[]",
            Some(past()),
        )
        .unwrap();

        let promoted = sweep_once(&db, &dispatcher, sweep_time()).await.unwrap();
        assert_eq!(promoted, 1);

        // exactly one message exists in the channel
        let messages = db.channel_messages(&channel_id, 50).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "good morning");

        // every member except the sender got a counter bump
        for m in &members {
            assert_eq!(db.unread_count(&channel_id, m).unwrap(), 1);
        }
        assert_eq!(db.unread_count(&channel_id, &sender).unwrap(), 0);

        // offline members got durable notifications
        for m in &members {
            let pending = db.pending_notifications(m).unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].kind, "channel");
        }

        // the item is gone and a second sweep finds nothing
        assert!(db.get_scheduled("item-1").unwrap().is_none());
        let again = sweep_once(&db, &dispatcher, sweep_time()).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(db.channel_messages(&channel_id, 50).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn direct_item_reaches_offline_recipient_as_durable_record() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");

        db.insert_scheduled(
            "item-1",
            &sender,
            Some(recipient.as_str()),
            None,
            "see you at ten",
            "[]",
            Some(past()),
        )
        .unwrap();

        sweep_once(&db, &dispatcher, sweep_time()).await.unwrap();

        let conversation_id = db.find_conversation(&sender, &recipient).unwrap().unwrap();
        assert_eq!(db.conversation_messages(&conversation_id, 50).unwrap().len(), 1);
        assert_eq!(db.unread_count(&conversation_id, &recipient).unwrap(), 1);

        let pending = db.pending_notifications(&recipient).unwrap();
        assert_eq!(pending.len(), 1);
        assert!(!pending[0].delivered);

        assert!(db.get_scheduled("item-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn direct_item_pushes_live_to_connected_recipient() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");
        let recipient_id: Uuid = recipient.parse().unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        dispatcher
            .on_register(recipient_id, Uuid::new_v4(), tx)
            .await
            .unwrap();

        db.insert_scheduled(
            "item-1",
            &sender,
            Some(recipient.as_str()),
            None,
            "ping",
            "[]",
            Some(past()),
        )
        .unwrap();

        sweep_once(&db, &dispatcher, sweep_time()).await.unwrap();

        match rx.recv().await.unwrap() {
            GatewayEvent::MessageCreate { message } => assert_eq!(message.body, "ping"),
            other => panic!("unexpected event: {:?}", other),
        }
        // live push, so no durable record was queued
        assert!(db.pending_notifications(&recipient).unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_item_is_skipped_without_stopping_the_sweep() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");

        // both targets set — violates the exactly-one invariant
        db.insert_scheduled(
            "bad",
            &sender,
            Some(recipient.as_str()),
            Some("some-channel"),
            "broken",
            "[]",
            Some(past()),
        )
        .unwrap();
        db.insert_scheduled(
            "good",
            &sender,
            Some(recipient.as_str()),
            None,
            "fine",
            "[]",
            Some(past()),
        )
        .unwrap();

        let promoted = sweep_once(&db, &dispatcher, sweep_time()).await.unwrap();
        assert_eq!(promoted, 1);

        // the malformed item is left in place, the valid one was consumed
        assert!(db.get_scheduled("bad").unwrap().is_some());
        assert!(db.get_scheduled("good").unwrap().is_none());
    }

    #[tokio::test]
    async fn future_items_are_not_touched() {
        let db = test_db();
        let dispatcher = Dispatcher::new(db.clone());
        let sender = seed_user(&db, "ana");
        let recipient = seed_user(&db, "bo");

        db.insert_scheduled(
            "later",
            &sender,
            Some(recipient.as_str()),
            None,
            "not yet",
            "[]",
            Some("2026-01-01T10:05:00.000Z"),
        )
        .unwrap();

        let promoted = sweep_once(&db, &dispatcher, sweep_time()).await.unwrap();
        assert_eq!(promoted, 0);
        assert!(db.get_scheduled("later").unwrap().is_some());
        assert!(db.find_conversation(&sender, &recipient).unwrap().is_none());
    }
}
