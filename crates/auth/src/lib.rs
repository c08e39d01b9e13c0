//! Credential Guard: registration, password login with time-boxed lockout,
//! and session token verification.

use chrono::{DateTime, Duration, Utc};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};
use storage::Storage;
use thiserror::Error;
use tracing::{info, warn};

mod password;
mod token;

pub use password::{hash_password, verify_password};
pub use token::{mint_token, verify_token, Claims, TokenKeys};

pub const DEFAULT_MAX_FAILED_ATTEMPTS: i64 = 5;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user not found")]
    NotFound,
    #[error("account is locked until {0}")]
    Locked(DateTime<Utc>),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("invalid token")]
    Invalid,
    #[error("user with this email or username already exists")]
    Conflict,
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let code = match &err {
            AuthError::NotFound => ErrorCode::NotFound,
            AuthError::Locked(_) => ErrorCode::Locked,
            AuthError::InvalidCredentials | AuthError::Invalid => ErrorCode::Unauthorized,
            AuthError::Conflict => ErrorCode::Conflict,
            AuthError::InvalidInput(_) => ErrorCode::Validation,
            AuthError::Internal(_) => ErrorCode::Internal,
        };
        ApiError::new(code, err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub max_failed_attempts: i64,
    pub lockout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl: Duration::hours(24),
            max_failed_attempts: DEFAULT_MAX_FAILED_ATTEMPTS,
            lockout: Duration::minutes(5),
        }
    }
}

/// Caller identity recovered from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: String,
}

#[derive(Clone)]
pub struct Authenticator {
    storage: Storage,
    keys: TokenKeys,
    config: AuthConfig,
}

impl Authenticator {
    pub fn new(storage: Storage, config: AuthConfig) -> Self {
        Self {
            keys: TokenKeys::from_secret(config.jwt_secret.as_bytes()),
            storage,
            config,
        }
    }

    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<UserId, AuthError> {
        let username = username.trim();
        let email = email.trim();
        if username.is_empty() || email.is_empty() || password.is_empty() {
            return Err(AuthError::InvalidInput(
                "username, email and password are required".into(),
            ));
        }

        if self.storage.user_exists(username, email).await? {
            return Err(AuthError::Conflict);
        }

        let password_hash = hash_password(password)?;
        // A concurrent registration can win between the check and the insert.
        let user_id = self
            .storage
            .create_user(username, email, &password_hash)
            .await
            .map_err(|err| {
                if storage::is_unique_violation(&err) {
                    AuthError::Conflict
                } else {
                    AuthError::Internal(err)
                }
            })?;
        info!(%user_id, %username, "user registered");
        Ok(user_id)
    }

    pub async fn authenticate(&self, email: &str, password: &str) -> Result<String, AuthError> {
        self.authenticate_at(email, password, Utc::now()).await
    }

    /// Same as [`Authenticator::authenticate`] with an explicit clock reading
    /// for the lock window.
    pub async fn authenticate_at(
        &self,
        email: &str,
        password: &str,
        now: DateTime<Utc>,
    ) -> Result<String, AuthError> {
        let user = self
            .storage
            .user_by_email(email)
            .await?
            .ok_or(AuthError::NotFound)?;

        if let Some(locked_until) = user.locked_until.filter(|until| *until > now) {
            warn!(user_id = %user.user_id, %locked_until, "login attempt on locked account");
            return Err(AuthError::Locked(locked_until));
        }

        if !verify_password(password, &user.password_hash)? {
            let updated = self
                .storage
                .record_failed_login(
                    user.user_id,
                    self.config.max_failed_attempts,
                    now + self.config.lockout,
                )
                .await?
                .ok_or(AuthError::NotFound)?;
            warn!(
                user_id = %user.user_id,
                failed_attempts = updated.failed_attempts,
                "password verification failed"
            );
            return match updated.locked_until.filter(|until| *until > now) {
                Some(locked_until) => Err(AuthError::Locked(locked_until)),
                None => Err(AuthError::InvalidCredentials),
            };
        }

        self.storage.reset_failed_logins(user.user_id).await?;
        let token = mint_token(
            &self.keys,
            user.user_id,
            &user.username,
            now,
            self.config.token_ttl,
        )
        .map_err(|e| AuthError::Internal(anyhow::anyhow!("token mint failed: {e}")))?;
        info!(user_id = %user.user_id, "user logged in");
        Ok(token)
    }

    pub fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = verify_token(&self.keys, token).map_err(|_| AuthError::Invalid)?;
        if claims.username.is_empty() {
            return Err(AuthError::Invalid);
        }
        Ok(Identity {
            user_id: claims.user_id,
            username: claims.username,
        })
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
