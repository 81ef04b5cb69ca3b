use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use beacon_types::events::GatewayEvent;

/// Tracks which users currently hold live gateway connections. A user may
/// have many simultaneous devices/tabs; each is one session entry. Purely
/// in-memory: lifetime equals process lifetime, and clients re-register on
/// reconnect.
///
/// Owned exclusively by the [`Dispatcher`](crate::dispatcher::Dispatcher);
/// nothing else reads or writes it directly.
#[derive(Default)]
pub struct PresenceRegistry {
    /// user_id -> (session_id -> event sender for that connection)
    connections: HashMap<Uuid, HashMap<Uuid, UnboundedSender<GatewayEvent>>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session for a user. Idempotent for a repeated session id.
    pub fn register(
        &mut self,
        user_id: Uuid,
        session_id: Uuid,
        sender: UnboundedSender<GatewayEvent>,
    ) {
        self.connections
            .entry(user_id)
            .or_default()
            .insert(session_id, sender);
    }

    /// Remove a session. A user whose last session goes away is dropped
    /// from the map entirely — no empty-set entries persist.
    pub fn unregister(&mut self, user_id: Uuid, session_id: Uuid) {
        if let Some(sessions) = self.connections.get_mut(&user_id) {
            sessions.remove(&session_id);
            if sessions.is_empty() {
                self.connections.remove(&user_id);
            }
        }
    }

    /// Current live senders for a user, possibly empty.
    pub fn handles_for(&self, user_id: Uuid) -> Vec<UnboundedSender<GatewayEvent>> {
        self.connections
            .get(&user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, user_id: Uuid) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn online_user_ids(&self) -> Vec<Uuid> {
        self.connections.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> UnboundedSender<GatewayEvent> {
        let (tx, _rx) = mpsc::unbounded_channel();
        tx
    }

    #[test]
    fn online_tracks_set_non_emptiness() {
        let mut registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let s1 = Uuid::new_v4();
        let s2 = Uuid::new_v4();

        assert!(!registry.is_online(user));
        assert!(registry.handles_for(user).is_empty());

        registry.register(user, s1, handle());
        registry.register(user, s2, handle());
        assert!(registry.is_online(user));
        assert_eq!(registry.handles_for(user).len(), 2);

        registry.unregister(user, s1);
        assert!(registry.is_online(user));

        registry.unregister(user, s2);
        assert!(!registry.is_online(user));
        // no empty-set entry left behind
        assert!(registry.online_user_ids().is_empty());
    }

    #[test]
    fn register_is_idempotent_per_session() {
        let mut registry = PresenceRegistry::new();
        let user = Uuid::new_v4();
        let session = Uuid::new_v4();

        registry.register(user, session, handle());
        registry.register(user, session, handle());
        assert_eq!(registry.handles_for(user).len(), 1);

        registry.unregister(user, session);
        assert!(!registry.is_online(user));
    }

    #[test]
    fn unregister_unknown_session_is_a_no_op() {
        let mut registry = PresenceRegistry::new();
        let user = Uuid::new_v4();

        registry.unregister(user, Uuid::new_v4());
        assert!(!registry.is_online(user));

        registry.register(user, Uuid::new_v4(), handle());
        registry.unregister(user, Uuid::new_v4());
        assert!(registry.is_online(user));
    }

    #[test]
    fn roster_lists_each_online_user_once() {
        let mut registry = PresenceRegistry::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        registry.register(a, Uuid::new_v4(), handle());
        registry.register(a, Uuid::new_v4(), handle());
        registry.register(b, Uuid::new_v4(), handle());

        let mut roster = registry.online_user_ids();
        roster.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(roster, expected);
    }
}
