//! Session tokens.
//!
//! Access and refresh tokens are HS256-signed JWTs. The subject is the
//! username (the ACL compares it against the `<username>` path parameter)
//! and `jti` carries the session id so sign-out can target the exact
//! session row.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Claims carried by every wharf session token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Username of the token owner.
    pub sub: String,
    /// Expiry, seconds since the epoch.
    pub exp: i64,
    /// Issued-at, seconds since the epoch.
    pub iat: i64,
    /// Session id this token belongs to.
    pub jti: Uuid,
}

/// Signs and verifies session tokens with the process-wide secret.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenSigner {
    /// Create a signer from the configured signing secret.
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a token for `username` bound to `session_id`, valid for
    /// `ttl_secs` from now.
    pub fn issue(&self, username: &str, session_id: Uuid, ttl_secs: i64) -> crate::Result<String> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: username.to_string(),
            exp: now + ttl_secs,
            iat: now,
            jti: session_id,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| crate::Error::Token(e.to_string()))
    }

    /// Verify a token's signature and expiry, returning its claims.
    pub fn verify(&self, token: &str) -> crate::Result<Claims> {
        let validation = Validation::new(Algorithm::HS256);
        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| crate::Error::Token(e.to_string()))
    }
}
