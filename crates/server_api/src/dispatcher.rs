use std::time::Duration;

use shared::{
    domain::{ChatId, UserId},
    protocol::ServerEvent,
};
use storage::Storage;
use tracing::{debug, warn};

use crate::{
    registry::{ConnectionHandle, ConnectionRegistry, SharedHandle},
    ChatError,
};

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pushes server events to whoever is online. Holds no state of its own.
#[derive(Clone)]
pub struct Dispatcher {
    storage: Storage,
    registry: ConnectionRegistry,
    write_timeout: Duration,
}

impl Dispatcher {
    pub fn new(storage: Storage, registry: ConnectionRegistry, write_timeout: Duration) -> Self {
        Self {
            storage,
            registry,
            write_timeout,
        }
    }

    /// Delivers `event` to every currently bound member of `chat_id`.
    /// Returns how many connections accepted the frame.
    pub async fn broadcast(&self, chat_id: ChatId, event: &ServerEvent) -> Result<usize, ChatError> {
        let members = self.storage.list_members(chat_id).await?;
        let user_ids: Vec<UserId> = members.iter().map(|m| m.id).collect();
        let delivered = self.notify_users(&user_ids, event).await;
        debug!(%chat_id, event = event.name(), members = user_ids.len(), delivered, "broadcast");
        Ok(delivered)
    }

    /// Delivers `event` to the listed users only. Offline users are skipped.
    pub async fn notify_users(&self, user_ids: &[UserId], event: &ServerEvent) -> usize {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, event = event.name(), "failed to encode server event");
                return 0;
            }
        };

        let mut delivered = 0;
        for (user_id, handle) in self.registry.snapshot(user_ids) {
            if self.write(user_id, &handle, text.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// A failed or timed-out write means the connection is dead: drop the
    /// binding, then close it under the same deadline. No retry.
    async fn write(&self, user_id: UserId, handle: &SharedHandle, text: String) -> bool {
        let outcome = tokio::time::timeout(self.write_timeout, handle.send_text(text)).await;
        let error = match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(error)) => error.to_string(),
            Err(_) => format!("write exceeded {:?}", self.write_timeout),
        };

        let connection_id = handle.connection_id();
        warn!(%user_id, %connection_id, %error, "evicting dead connection");
        self.registry.unbind_if(user_id, connection_id);
        if tokio::time::timeout(self.write_timeout, handle.close()).await.is_err() {
            debug!(%user_id, %connection_id, "close did not finish; dropping handle");
        }
        false
    }
}

#[cfg(test)]
#[path = "tests/dispatcher_tests.rs"]
mod tests;
