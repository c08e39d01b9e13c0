use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;

/// Claims carried by every session token. Validated once in [`verify_token`];
/// callers only ever see the typed result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct TokenKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }
}

pub fn mint_token(
    keys: &TokenKeys,
    user_id: UserId,
    username: &str,
    issued_at: DateTime<Utc>,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = Claims {
        user_id,
        username: username.to_string(),
        iat: issued_at.timestamp(),
        exp: (issued_at + ttl).timestamp(),
    };

    encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
}

pub fn verify_token(keys: &TokenKeys, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["exp"]);
    validation.leeway = 0;
    decode::<Claims>(token, &keys.decoding, &validation).map(|data| data.claims)
}
