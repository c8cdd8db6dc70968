//! Session token issuance.
//!
//! Tokens are HMAC-SHA256 of `identity|nanos` under the server secret and are
//! cached in the coordination store at `/tokens/{identity}` so a reconnecting
//! agent gets the same token back until it expires.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::store::{CoordinationStore, StoreError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid signing key: {0}")]
    Key(#[from] hmac::digest::InvalidLength),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenIssuer {
    secret: Vec<u8>,
    ttl: Duration,
    store: Arc<dyn CoordinationStore>,
}

pub fn token_key(identity: &str) -> String {
    format!("/tokens/{identity}")
}

fn render_cached(token: &IssuedToken) -> String {
    format!("token:{},expires_at:{}", token.token, token.expires_at.to_rfc3339())
}

fn parse_cached(raw: &str) -> Option<IssuedToken> {
    let (token_part, expiry_part) = raw.split_once(",expires_at:")?;
    let token = token_part.strip_prefix("token:")?.to_string();
    let expires_at = DateTime::parse_from_rfc3339(expiry_part).ok()?.with_timezone(&Utc);
    Some(IssuedToken { token, expires_at })
}

impl TokenIssuer {
    pub fn new(secret: impl Into<Vec<u8>>, ttl: Duration, store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            secret: secret.into(),
            ttl,
            store,
        }
    }

    /// Returns the cached token for `identity` while it is still valid,
    /// minting and caching a new one otherwise.
    pub async fn issue(&self, identity: &str) -> Result<IssuedToken, TokenError> {
        let key = token_key(identity);
        let now = Utc::now();
        if let Some(cached) = self.store.get(&key).await?.as_deref().and_then(parse_cached) {
            if cached.expires_at > now {
                debug!("Reusing cached token for {}", identity);
                return Ok(cached);
            }
        }

        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
        let mut mac = HmacSha256::new_from_slice(&self.secret)?;
        mac.update(format!("{identity}|{nanos}").as_bytes());
        let issued = IssuedToken {
            token: hex::encode(mac.finalize().into_bytes()),
            expires_at: now + self.ttl,
        };
        self.store.put(&key, &render_cached(&issued)).await?;
        debug!("Issued new token for {}", identity);
        Ok(issued)
    }
}
