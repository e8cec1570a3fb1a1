// Copyright 2025 System76 <info@system76.com>
// SPDX-License-Identifier: MPL-2.0

use crate::channel::{self, Receiver, SendError, Sender};
use crate::protocol::{Response, SubscriptionKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

pub type ConnectionId = u64;

/// Counts the color changes applied by the request loop.
pub type Revision = u64;

/// A live client session as seen by the broadcast path.
///
/// The transport itself is owned by the connection's task. Broadcasts reach
/// it through a bounded update queue.
pub struct Connection {
    id: ConnectionId,
    /// Subscribed keys with the last revision the client already received.
    subscriptions: Mutex<HashMap<SubscriptionKey, Revision>>,
    updates: Sender<Response>,
}

impl Connection {
    #[must_use]
    pub fn new(id: ConnectionId, max_pending_updates: usize) -> (Self, Receiver<Response>) {
        let (updates, receiver) = channel::channel(max_pending_updates);

        let connection = Self {
            id,
            subscriptions: Mutex::new(HashMap::new()),
            updates,
        };

        (connection, receiver)
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Subscribes to `keys`, with the state at `revision` already delivered.
    pub fn subscribe(&self, keys: &[SubscriptionKey], revision: Revision) {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(keys.iter().map(|&key| (key, revision)));
    }

    pub fn unsubscribe(&self, keys: &[SubscriptionKey]) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        for key in keys {
            subscriptions.remove(key);
        }
    }

    #[must_use]
    pub fn is_subscribed(&self, key: SubscriptionKey) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&key)
    }

    /// Whether an update for `key` at `revision` is news to this client.
    #[must_use]
    pub fn wants(&self, key: SubscriptionKey, revision: Revision) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .is_some_and(|&seen| revision > seen)
    }

    /// Queues a broadcast for this connection without waiting for the client.
    ///
    /// # Errors
    ///
    /// Returns error if the client is lagging behind or already gone.
    pub async fn notify(&self, update: Response) -> Result<(), SendError<Response>> {
        self.updates.send(update).await
    }
}

/// Registry of live connections.
///
/// The lock is only held to insert, remove or copy out the current entries.
#[derive(Default)]
pub struct ConnectionSet {
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
}

impl ConnectionSet {
    pub fn register(&self, max_pending_updates: usize) -> (Arc<Connection>, Receiver<Response>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (connection, updates) = Connection::new(id, max_pending_updates);
        let connection = Arc::new(connection);

        let mut connections = self.lock();
        connections.insert(id, connection.clone());
        tracing::info!(id, active = connections.len(), "new connection");

        (connection, updates)
    }

    pub fn remove(&self, id: ConnectionId) {
        let mut connections = self.lock();
        if connections.remove(&id).is_some() {
            tracing::info!(id, active = connections.len(), "connection closed");
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::ColorState;

    #[test]
    fn subscriptions_toggle() {
        let (connection, _updates) = Connection::new(0, 4);
        assert!(!connection.is_subscribed(SubscriptionKey::Color));

        connection.subscribe(&[SubscriptionKey::Color, SubscriptionKey::Color], 0);
        assert!(connection.is_subscribed(SubscriptionKey::Color));

        connection.unsubscribe(&[SubscriptionKey::Color]);
        assert!(!connection.is_subscribed(SubscriptionKey::Color));
    }

    #[test]
    fn updates_already_delivered_on_subscribe_are_skipped() {
        let (connection, _updates) = Connection::new(0, 4);
        assert!(!connection.wants(SubscriptionKey::Color, 1));

        connection.subscribe(&[SubscriptionKey::Color], 3);
        assert!(!connection.wants(SubscriptionKey::Color, 2));
        assert!(!connection.wants(SubscriptionKey::Color, 3));
        assert!(connection.wants(SubscriptionKey::Color, 4));

        connection.unsubscribe(&[SubscriptionKey::Color]);
        assert!(!connection.wants(SubscriptionKey::Color, 4));
    }

    #[test]
    fn registry_tracks_live_connections() {
        let set = ConnectionSet::default();
        let (first, _first_updates) = set.register(4);
        let (second, _second_updates) = set.register(4);
        assert_ne!(first.id(), second.id());
        assert_eq!(set.len(), 2);

        set.remove(first.id());
        set.remove(first.id());

        let remaining = set.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id(), second.id());
    }

    #[tokio::test]
    async fn notify_reaches_the_connection_queue() {
        let (connection, mut updates) = Connection::new(3, 1);
        let update = Response::color(ColorState::default());

        connection.notify(update.clone()).await.unwrap();
        assert!(matches!(
            connection.notify(update.clone()).await,
            Err(SendError::Full(_))
        ));

        assert_eq!(updates.recv().await, Some(update));
    }
}
