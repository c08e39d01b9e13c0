use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use shared::domain::UserId;
use tracing::{debug, info};
use uuid::Uuid;

/// Identifies one physical connection, so a stale session can never evict the
/// binding of a newer one for the same user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound half of a live duplex connection.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    fn connection_id(&self) -> ConnectionId;
    async fn send_text(&self, text: String) -> anyhow::Result<()>;
    async fn close(&self);
}

pub type SharedHandle = Arc<dyn ConnectionHandle>;

/// User id -> live connection. One coarse lock guards every operation; it is
/// never held across an await point.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<UserId, SharedHandle>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, SharedHandle>> {
        // The map stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Last bind wins. The superseded handle is returned but not closed.
    pub fn bind(&self, user_id: UserId, handle: SharedHandle) -> Option<SharedHandle> {
        let connection_id = handle.connection_id();
        let previous = self.lock().insert(user_id, handle);
        info!(%user_id, %connection_id, replaced = previous.is_some(), "connection bound");
        previous
    }

    pub fn lookup(&self, user_id: UserId) -> Option<SharedHandle> {
        self.lock().get(&user_id).cloned()
    }

    pub fn unbind(&self, user_id: UserId) -> Option<SharedHandle> {
        let removed = self.lock().remove(&user_id);
        if removed.is_some() {
            info!(%user_id, "connection unbound");
        }
        removed
    }

    /// Removes the binding only if it still points at `connection_id`.
    pub fn unbind_if(&self, user_id: UserId, connection_id: ConnectionId) -> bool {
        let mut guard = self.lock();
        let matches = guard
            .get(&user_id)
            .is_some_and(|handle| handle.connection_id() == connection_id);
        if matches {
            guard.remove(&user_id);
            info!(%user_id, %connection_id, "connection unbound");
        } else {
            debug!(%user_id, %connection_id, "binding already superseded");
        }
        matches
    }

    /// Handles for every listed user that is currently bound.
    pub fn snapshot(&self, user_ids: &[UserId]) -> Vec<(UserId, SharedHandle)> {
        let guard = self.lock();
        user_ids
            .iter()
            .filter_map(|user_id| guard.get(user_id).map(|h| (*user_id, Arc::clone(h))))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
