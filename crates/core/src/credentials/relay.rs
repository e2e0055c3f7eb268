//! Time-boxed relay (TURN) credentials
//!
//! Uses the TURN REST convention: `username = "<expiryUnixTs>:<deviceId>"`
//! and `credential = base64(HMAC-SHA1(sharedSecret, username))`. The relay
//! server holds the same secret and checks both the MAC and the expiry.

use crate::clock::Clock;
use crate::{Error, Result};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

type HmacSha1 = Hmac<Sha1>;

/// Credential handed to the ICE agent for relay allocation
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayCredential {
    pub username: String,
    pub credential: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for RelayCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayCredential")
            .field("username", &self.username)
            .field("credential", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of fresh relay credentials, one per connection attempt
#[async_trait]
pub trait RelayCredentialProvider: Send + Sync {
    /// Mint a credential for `device_id`
    async fn relay_credential(&self, device_id: &str) -> Result<RelayCredential>;
}

/// HMAC-SHA1 relay credential minter
#[derive(Debug)]
pub struct RelayCredentialMinter {
    shared_secret: Vec<u8>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    /// Last expiry handed out per device
    last_expiry: Mutex<HashMap<String, i64>>,
}

impl RelayCredentialMinter {
    /// Create a minter
    pub fn new(shared_secret: impl Into<Vec<u8>>, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            shared_secret: shared_secret.into(),
            ttl,
            clock,
            last_expiry: Mutex::new(HashMap::new()),
        }
    }

    /// Mint a credential for `device_id`
    ///
    /// Expiry timestamps strictly increase per device, so two attempts within
    /// the same second still receive different credentials.
    pub fn mint(&self, device_id: &str) -> Result<RelayCredential> {
        let mut expiry = (self.clock.now() + self.ttl).timestamp();
        {
            let mut last = self.last_expiry.lock();
            if let Some(prev) = last.get(device_id) {
                if expiry <= *prev {
                    expiry = prev + 1;
                }
            }
            last.insert(device_id.to_string(), expiry);
        }

        let username = format!("{}:{}", expiry, device_id);
        let credential = self.sign(&username)?;
        let expires_at = DateTime::<Utc>::from_timestamp(expiry, 0)
            .ok_or_else(|| Error::InvalidState(format!("expiry {} out of range", expiry)))?;

        debug!("Minted relay credential for {} (expires {})", device_id, expires_at);
        Ok(RelayCredential {
            username,
            credential,
            expires_at,
        })
    }

    /// Verify a credential and return the device id it was minted for
    pub fn verify(&self, username: &str, credential: &str) -> Result<String> {
        let (expiry, device_id) = username.split_once(':').ok_or_else(|| {
            Error::AuthenticationFailed("malformed relay username".to_string())
        })?;
        let expiry: i64 = expiry.parse().map_err(|_| {
            Error::AuthenticationFailed("malformed relay username expiry".to_string())
        })?;

        let tag = base64::engine::general_purpose::STANDARD
            .decode(credential)
            .map_err(|_| Error::AuthenticationFailed("malformed relay credential".to_string()))?;

        let mut mac = self.mac()?;
        mac.update(username.as_bytes());
        mac.verify_slice(&tag)
            .map_err(|_| Error::AuthenticationFailed("relay credential mismatch".to_string()))?;

        if self.clock.now().timestamp() >= expiry {
            return Err(Error::AuthenticationFailed(
                "relay credential expired".to_string(),
            ));
        }

        Ok(device_id.to_string())
    }

    fn sign(&self, username: &str) -> Result<String> {
        let mut mac = self.mac()?;
        mac.update(username.as_bytes());
        Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn mac(&self) -> Result<HmacSha1> {
        HmacSha1::new_from_slice(&self.shared_secret)
            .map_err(|e| Error::InvalidConfig(format!("relay shared secret: {}", e)))
    }
}

#[async_trait]
impl RelayCredentialProvider for RelayCredentialMinter {
    async fn relay_credential(&self, device_id: &str) -> Result<RelayCredential> {
        self.mint(device_id)
    }
}
