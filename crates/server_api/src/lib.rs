use std::time::Duration;

use auth::Authenticator;
use shared::{
    domain::{PublicUser, UserId},
    error::ApiError,
    protocol::{PublicKeyResponse, UserProfile},
};
use storage::Storage;
use thiserror::Error;
use tracing::error;

pub mod dispatcher;
pub mod ledger;
pub mod membership;
pub mod registry;
pub mod session;

pub use auth::Identity;
pub use dispatcher::{Dispatcher, DEFAULT_WRITE_TIMEOUT};
pub use registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, SharedHandle};
pub use session::Session;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat not found")]
    ChatNotFound,
    #[error("user not found")]
    UserNotFound,
    #[error("{0}")]
    NotAuthorized(&'static str),
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ChatError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::ChatNotFound | ChatError::UserNotFound => {
                ApiError::not_found(err.to_string())
            }
            ChatError::NotAuthorized(message) => ApiError::forbidden(message),
            ChatError::InvalidInput(message) => ApiError::validation(message),
            ChatError::Storage(source) => internal(source),
        }
    }
}

/// Every component the request handlers and duplex sessions need, built once
/// at startup and passed by reference.
#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub auth: Authenticator,
    pub registry: ConnectionRegistry,
    pub dispatcher: Dispatcher,
}

impl ApiContext {
    pub fn new(storage: Storage, auth: Authenticator, write_timeout: Duration) -> Self {
        let registry = ConnectionRegistry::new();
        let dispatcher = Dispatcher::new(storage.clone(), registry.clone(), write_timeout);
        Self {
            storage,
            auth,
            registry,
            dispatcher,
        }
    }
}

pub async fn profile(ctx: &ApiContext, user_id: UserId) -> Result<UserProfile, ChatError> {
    let user = ctx
        .storage
        .user_by_id(user_id)
        .await?
        .ok_or(ChatError::UserNotFound)?;
    Ok(UserProfile {
        id: user.user_id,
        username: user.username,
        email: user.email,
        public_key: user.public_key,
        created_at: user.created_at,
    })
}

pub async fn search_users(ctx: &ApiContext, term: &str) -> Result<Vec<PublicUser>, ChatError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(ChatError::invalid("search term is required"));
    }
    Ok(ctx.storage.search_users(term).await?)
}

pub async fn public_key_for(
    ctx: &ApiContext,
    user_id: UserId,
) -> Result<PublicKeyResponse, ChatError> {
    let user = ctx
        .storage
        .user_by_id(user_id)
        .await?
        .ok_or(ChatError::UserNotFound)?;
    Ok(PublicKeyResponse {
        user_id,
        public_key: user.public_key.unwrap_or_default(),
    })
}

pub async fn save_public_key(
    ctx: &ApiContext,
    user_id: UserId,
    public_key: &str,
) -> Result<(), ChatError> {
    if public_key.trim().is_empty() {
        return Err(ChatError::invalid("public_key is required"));
    }
    if !ctx.storage.save_public_key(user_id, public_key).await? {
        return Err(ChatError::UserNotFound);
    }
    Ok(())
}

fn internal(err: anyhow::Error) -> ApiError {
    error!(error = %format!("{err:#}"), "internal error");
    ApiError::internal("internal server error")
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
