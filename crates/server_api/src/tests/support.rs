use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::registry::{ConnectionHandle, ConnectionId, SharedHandle};

/// In-memory connection that records every frame written to it.
#[derive(Default)]
pub struct RecordingHandle {
    id: ConnectionId,
    sent: Mutex<Vec<String>>,
    fail: AtomicBool,
    stall: AtomicBool,
    hang_on_close: AtomicBool,
    closed: AtomicBool,
}

impl RecordingHandle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        let handle = Self::new();
        handle.fail.store(true, Ordering::SeqCst);
        handle
    }

    pub fn stalling() -> Arc<Self> {
        let handle = Self::new();
        handle.stall.store(true, Ordering::SeqCst);
        handle
    }

    /// Stalls on every write and never finishes closing either.
    pub fn wedged() -> Arc<Self> {
        let handle = Self::stalling();
        handle.hang_on_close.store(true, Ordering::SeqCst);
        handle
    }

    pub fn shared(self: &Arc<Self>) -> SharedHandle {
        Arc::clone(self) as SharedHandle
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Frames decoded as JSON, in arrival order.
    pub fn events(&self) -> Vec<serde_json::Value> {
        self.sent()
            .iter()
            .map(|raw| serde_json::from_str(raw).expect("frame is json"))
            .collect()
    }

    pub fn event_names(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|v| v["event"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionHandle for RecordingHandle {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        if self.stall.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        if self.fail.load(Ordering::SeqCst) || self.is_closed() {
            anyhow::bail!("connection reset");
        }
        self.sent.lock().expect("sent lock").push(text);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if self.hang_on_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

pub async fn context() -> crate::ApiContext {
    let storage = storage::Storage::new("sqlite::memory:").await.expect("db");
    let auth = auth::Authenticator::new(
        storage.clone(),
        auth::AuthConfig {
            jwt_secret: "test-secret".into(),
            ..auth::AuthConfig::default()
        },
    );
    crate::ApiContext::new(storage, auth, Duration::from_millis(200))
}

/// Creates `<name>@x.com` directly in storage; no password hashing.
pub async fn user(ctx: &crate::ApiContext, name: &str) -> crate::Identity {
    let user_id = ctx
        .storage
        .create_user(name, &format!("{name}@x.com"), "not-a-real-hash")
        .await
        .expect("user");
    crate::Identity {
        user_id,
        username: name.to_string(),
    }
}

/// Binds a fresh recording connection for `identity`.
pub fn connect(ctx: &crate::ApiContext, identity: &crate::Identity) -> Arc<RecordingHandle> {
    let handle = RecordingHandle::new();
    ctx.registry.bind(identity.user_id, handle.shared());
    handle
}
