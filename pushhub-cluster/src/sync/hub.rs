use async_trait::async_trait;
use parking_lot::RwLock;
use pushhub_core::metrics::{ACTIVE_CONNECTIONS, NOTIFICATIONS_DELIVERED, NOTIFICATIONS_DROPPED};
use pushhub_core::{ClientToken, Notification, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::connection::{Connection, EnqueueOutcome};
use super::Notifier;
use crate::{Error, Result};

/// Connection limits (0 = unlimited)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubLimits {
    pub max_per_user: usize,
    pub max_total: usize,
}

/// Point-in-time registry statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubMetrics {
    pub active_connections: usize,
    pub active_users: usize,
}

#[derive(Default)]
struct HubState {
    users: HashMap<UserId, Vec<Arc<Connection>>>,
    total: usize,
    closed: bool,
}

/// Per-process registry of live connections, keyed by user
///
/// Fan-out takes the read lock; every structural change takes the write lock.
/// Only non-blocking work (queue hand-off, the close action) happens while a
/// lock is held.
pub struct NotificationHub {
    state: RwLock<HubState>,
    limits: HubLimits,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(HubLimits::default())
    }

    #[must_use]
    pub fn with_limits(limits: HubLimits) -> Self {
        Self {
            state: RwLock::new(HubState::default()),
            limits,
        }
    }

    /// Removal callback for [`Connection::new`] that deregisters the
    /// connection from this hub when it closes itself.
    ///
    /// Holds only a weak reference, so a connection outliving the hub is fine.
    pub fn deregister_on_close(self: &Arc<Self>) -> impl FnOnce(&Connection) + Send + 'static {
        let hub = Arc::downgrade(self);
        move |connection: &Connection| {
            if let Some(hub) = hub.upgrade() {
                hub.remove(connection);
            }
        }
    }

    /// Check whether a new connection for `user_id` would be admitted right now.
    ///
    /// Advisory only: [`register`](Self::register) re-checks under the write lock.
    pub fn check_capacity(&self, user_id: UserId) -> Result<()> {
        self.admit(&self.state.read(), user_id)
    }

    fn admit(&self, state: &HubState, user_id: UserId) -> Result<()> {
        if state.closed {
            return Err(Error::ShuttingDown);
        }
        if self.limits.max_total > 0 && state.total >= self.limits.max_total {
            return Err(Error::LimitExceeded(format!(
                "server at capacity ({} connections)",
                self.limits.max_total
            )));
        }
        let user_connections = state.users.get(&user_id).map_or(0, Vec::len);
        if self.limits.max_per_user > 0 && user_connections >= self.limits.max_per_user {
            return Err(Error::LimitExceeded(format!(
                "too many connections for user {user_id} (max {})",
                self.limits.max_per_user
            )));
        }
        Ok(())
    }

    /// Add a connection to its user's list.
    ///
    /// The same user may hold any number of connections (devices, tabs) up to
    /// the configured limits.
    pub fn register(&self, connection: Arc<Connection>) -> Result<()> {
        let mut guard = self.state.write();
        let user_id = connection.user_id();
        self.admit(&guard, user_id)?;

        let state = &mut *guard;
        let connections = state.users.entry(user_id).or_default();
        connections.push(connection.clone());
        state.total += 1;
        ACTIVE_CONNECTIONS.inc();

        info!(
            user_id = %user_id,
            connection_id = %connection.id(),
            user_connections = connections.len(),
            "Connection registered"
        );
        Ok(())
    }

    /// Remove one connection by identity. No-op if it is already gone.
    pub fn remove(&self, connection: &Connection) -> bool {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let user_id = connection.user_id();
        let Some(connections) = state.users.get_mut(&user_id) else {
            return false;
        };
        let Some(index) = connections.iter().position(|c| c.id() == connection.id()) else {
            return false;
        };

        connections.remove(index);
        if connections.is_empty() {
            state.users.remove(&user_id);
        }
        state.total -= 1;
        ACTIVE_CONNECTIONS.dec();

        debug!(
            user_id = %user_id,
            connection_id = %connection.id(),
            "Connection removed"
        );
        true
    }

    /// Queue `notification` on every live connection of `user_id`.
    ///
    /// Never waits on a slow client: a connection whose queue is still full
    /// misses this notification. Returns how many connections it was queued on.
    pub fn notify(&self, user_id: UserId, notification: &Notification) -> usize {
        let state = self.state.read();
        let Some(connections) = state.users.get(&user_id) else {
            return 0;
        };

        let mut queued = 0;
        for connection in connections {
            match connection.enqueue(notification) {
                EnqueueOutcome::Queued => queued += 1,
                EnqueueOutcome::Dropped => {
                    NOTIFICATIONS_DROPPED.inc();
                    warn!(
                        user_id = %user_id,
                        connection_id = %connection.id(),
                        notification_id = notification.id,
                        "Connection is lagging, notification dropped"
                    );
                }
                EnqueueOutcome::Closed => {
                    debug!(
                        user_id = %user_id,
                        connection_id = %connection.id(),
                        "Skipping closed connection"
                    );
                }
            }
        }
        NOTIFICATIONS_DELIVERED.inc_by(queued as u64);

        debug!(
            user_id = %user_id,
            sent_count = queued,
            total = connections.len(),
            "Notification fan-out complete"
        );
        queued
    }

    /// Close and remove every connection of a user (account deleted).
    pub fn evict_user(&self, user_id: UserId) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(connections) = state.users.remove(&user_id) else {
            return 0;
        };
        for connection in &connections {
            connection.close();
        }
        let evicted = connections.len();
        state.total -= evicted;
        ACTIVE_CONNECTIONS.sub(evicted as i64);

        info!(user_id = %user_id, evicted, "Evicted all connections of user");
        evicted
    }

    /// Close and remove only the connections of `user_id` that authenticated
    /// with `token` (one device's credential was revoked).
    pub fn evict_credential(&self, user_id: UserId, token: &ClientToken) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;

        let Some(connections) = state.users.get_mut(&user_id) else {
            return 0;
        };
        let (evicted, kept): (Vec<_>, Vec<_>) = connections
            .drain(..)
            .partition(|connection| connection.token() == token);
        *connections = kept;
        if connections.is_empty() {
            state.users.remove(&user_id);
        }

        for connection in &evicted {
            connection.close();
        }
        state.total -= evicted.len();
        ACTIVE_CONNECTIONS.sub(evicted.len() as i64);

        if !evicted.is_empty() {
            info!(
                user_id = %user_id,
                evicted = evicted.len(),
                "Evicted connections for revoked credential"
            );
        }
        evicted.len()
    }

    /// Close everything and reject later registrations.
    pub fn shutdown(&self) -> usize {
        let mut guard = self.state.write();
        let state = &mut *guard;

        state.closed = true;
        let mut closed = 0;
        for (_, connections) in state.users.drain() {
            for connection in connections {
                connection.close();
                closed += 1;
            }
        }
        state.total = 0;
        ACTIVE_CONNECTIONS.sub(closed as i64);

        info!(closed, "Notification hub shut down");
        closed
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.read().closed
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.read().total
    }

    #[must_use]
    pub fn user_count(&self) -> usize {
        self.state.read().users.len()
    }

    #[must_use]
    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.state.read().users.get(&user_id).map_or(0, Vec::len)
    }

    /// Tokens that currently hold at least one live connection
    #[must_use]
    pub fn connected_tokens(&self) -> Vec<ClientToken> {
        let state = self.state.read();
        let mut tokens: Vec<ClientToken> = state
            .users
            .values()
            .flatten()
            .map(|connection| connection.token().clone())
            .collect();
        tokens.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        tokens.dedup();
        tokens
    }

    #[must_use]
    pub fn metrics(&self) -> HubMetrics {
        let state = self.state.read();
        HubMetrics {
            active_connections: state.total,
            active_users: state.users.len(),
        }
    }
}

#[async_trait]
impl Notifier for NotificationHub {
    async fn notify(&self, user_id: UserId, notification: Notification) {
        Self::notify(self, user_id, &notification);
    }
}
