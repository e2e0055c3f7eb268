//! Device identity, connection passwords and access codes
//!
//! The issuer owns the device registry (id and code uniqueness) and the
//! access code index. Authorization of an inbound connect request goes
//! through [`CredentialIssuer::authorize`], which checks
//! `allow_remote_control` before looking at any secret.

pub mod access_code;
pub mod relay;

pub use access_code::{AccessCode, AccessCodeStatus, AccessCodeStore};
pub use relay::{RelayCredential, RelayCredentialMinter, RelayCredentialProvider};

use crate::clock::Clock;
use crate::config::CredentialsConfig;
use crate::error::AccessCodeError;
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Characters used for passwords and access codes (no `0 O o 1 l I`)
pub const UNAMBIGUOUS_ALPHABET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnpqrstuvwxyz23456789";

/// Device code length in digits
pub const DEVICE_CODE_LEN: usize = 9;

/// Connection password length
pub const PASSWORD_LEN: usize = 9;

/// Access code length
pub const ACCESS_CODE_LEN: usize = 8;

/// Platform the device runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformTag {
    Windows,
    MacOs,
    Linux,
    Android,
    Ios,
    Web,
}

impl PlatformTag {
    /// Platform of the running binary
    pub fn current() -> Self {
        match std::env::consts::OS {
            "windows" => PlatformTag::Windows,
            "macos" => PlatformTag::MacOs,
            "android" => PlatformTag::Android,
            "ios" => PlatformTag::Ios,
            _ => PlatformTag::Linux,
        }
    }
}

/// Immutable identity of one installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: String,
    pub device_code: String,
    pub platform_tag: PlatformTag,
}

/// Mutable connection settings of a controlled device
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCredential {
    pub connection_password: String,
    pub allow_remote_control: bool,
    /// Forwarded to the controller; the OS lock check itself is platform work
    pub require_lock_password_check: bool,
}

impl std::fmt::Debug for ConnectionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionCredential")
            .field("connection_password", &"<redacted>")
            .field("allow_remote_control", &self.allow_remote_control)
            .field("require_lock_password_check", &self.require_lock_password_check)
            .finish()
    }
}

/// Credentials presented by a controller in a connect request
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectAuth {
    /// One-time access code
    AccessCode {
        code: String,
    },
    /// Device code plus the current connection password
    #[serde(rename_all = "camelCase")]
    DevicePassword {
        device_code: String,
        password: String,
    },
}

impl std::fmt::Debug for ConnectAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectAuth::AccessCode { .. } => f.write_str("ConnectAuth::AccessCode(<redacted>)"),
            ConnectAuth::DevicePassword { device_code, .. } => f
                .debug_struct("ConnectAuth::DevicePassword")
                .field("device_code", device_code)
                .finish_non_exhaustive(),
        }
    }
}

/// Whether a connection presenting `password` may proceed
///
/// Always false while remote control is disabled; the password is only
/// compared afterwards, in constant time.
pub fn should_allow_connection(credential: &ConnectionCredential, password: &str) -> bool {
    if !credential.allow_remote_control {
        return false;
    }
    constant_time_eq(
        credential.connection_password.as_bytes(),
        password.as_bytes(),
    )
}

/// Constant-time byte comparison; unequal lengths compare unequal
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Random 9-digit device code without a leading zero
pub fn issue_device_code() -> String {
    let mut rng = OsRng;
    let mut code = String::with_capacity(DEVICE_CODE_LEN);
    code.push(char::from(b'0' + rng.gen_range(1..=9u8)));
    for _ in 1..DEVICE_CODE_LEN {
        code.push(char::from(b'0' + rng.gen_range(0..=9u8)));
    }
    code
}

/// Random 9-character connection password
pub fn issue_connection_password() -> String {
    random_unambiguous(PASSWORD_LEN)
}

fn random_unambiguous(len: usize) -> String {
    let mut rng = OsRng;
    (0..len)
        .map(|_| char::from(UNAMBIGUOUS_ALPHABET[rng.gen_range(0..UNAMBIGUOUS_ALPHABET.len())]))
        .collect()
}

#[derive(Debug, Default)]
struct DeviceRegistry {
    device_ids: HashSet<String>,
    device_codes: HashSet<String>,
}

/// Issues and validates device credentials
#[derive(Debug)]
pub struct CredentialIssuer {
    config: CredentialsConfig,
    clock: Arc<dyn Clock>,
    registry: Mutex<DeviceRegistry>,
    access_codes: AccessCodeStore,
}

impl CredentialIssuer {
    /// Create an issuer with an empty registry
    pub fn new(config: CredentialsConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            registry: Mutex::new(DeviceRegistry::default()),
            access_codes: AccessCodeStore::new(),
        }
    }

    /// Register a new installation
    ///
    /// Both the device id and the device code are checked against the
    /// registry; running out of attempts is an error.
    pub fn register_device(&self, platform_tag: PlatformTag) -> Result<DeviceIdentity> {
        let mut registry = self.registry.lock();

        let device_id = self.issue_unique(|| Uuid::new_v4().to_string(), |id| {
            registry.device_ids.contains(id)
        })?;
        let device_code =
            self.issue_unique(issue_device_code, |code| registry.device_codes.contains(code))?;

        registry.device_ids.insert(device_id.clone());
        registry.device_codes.insert(device_code.clone());

        info!("Registered device {} ({:?})", device_id, platform_tag);
        Ok(DeviceIdentity {
            device_id,
            device_code,
            platform_tag,
        })
    }

    /// Record an identity issued elsewhere so future issuance avoids it
    pub fn adopt_device(&self, identity: &DeviceIdentity) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.device_ids.contains(&identity.device_id)
            || registry.device_codes.contains(&identity.device_code)
        {
            return Err(Error::InvalidState(format!(
                "device {} collides with a registered identity",
                identity.device_id
            )));
        }
        registry.device_ids.insert(identity.device_id.clone());
        registry.device_codes.insert(identity.device_code.clone());
        Ok(())
    }

    /// Fresh credential with remote control enabled
    pub fn new_credential(&self) -> ConnectionCredential {
        ConnectionCredential {
            connection_password: issue_connection_password(),
            allow_remote_control: true,
            require_lock_password_check: false,
        }
    }

    /// Replace the connection password with one that differs from the current
    pub fn refresh(&self, credential: &mut ConnectionCredential) -> Result<()> {
        let previous = credential.connection_password.clone();
        let next = self.issue_unique(issue_connection_password, |p| *p == previous)?;
        credential.connection_password = next;
        debug!("Connection password refreshed");
        Ok(())
    }

    /// Issue a single-use access code with the configured lifetime
    pub fn issue_access_code(&self, device_id: &str) -> Result<AccessCode> {
        self.issue_access_code_with_ttl(device_id, self.config.access_code_ttl())
    }

    /// Issue a single-use access code with an explicit lifetime
    pub fn issue_access_code_with_ttl(
        &self,
        device_id: &str,
        ttl: chrono::Duration,
    ) -> Result<AccessCode> {
        for _ in 0..self.config.max_issue_attempts {
            let issued_at = self.clock.now();
            let code = AccessCode {
                code: random_unambiguous(ACCESS_CODE_LEN),
                device_id: device_id.to_string(),
                issued_at,
                expires_at: issued_at + ttl,
                used: false,
            };
            if self.access_codes.insert(code.clone()) {
                debug!("Issued access code for {} (expires {})", device_id, code.expires_at);
                return Ok(code);
            }
        }
        Err(Error::InvalidState(format!(
            "no unique access code after {} attempts",
            self.config.max_issue_attempts
        )))
    }

    /// Validate and consume an access code
    pub fn validate_access_code(&self, code: &str) -> std::result::Result<AccessCode, AccessCodeError> {
        self.access_codes.validate(code, None, self.clock.now())
    }

    /// Remove access codes that can no longer validate
    pub fn purge_expired_access_codes(&self) -> usize {
        let purged = self.access_codes.purge(self.clock.now());
        if purged > 0 {
            debug!("Purged {} access codes", purged);
        }
        purged
    }

    /// Decide on an inbound connect request for the device `identity`
    ///
    /// `allow_remote_control` is checked first; access codes must belong to
    /// `identity`.
    pub fn authorize(
        &self,
        auth: &ConnectAuth,
        identity: &DeviceIdentity,
        credential: &ConnectionCredential,
    ) -> Result<()> {
        if !credential.allow_remote_control {
            warn!("Rejecting connect request: remote control disabled");
            return Err(Error::DeviceUnauthorized(
                "remote control is disabled on this device".to_string(),
            ));
        }

        match auth {
            ConnectAuth::AccessCode { code } => {
                self.access_codes
                    .validate(code, Some(&identity.device_id), self.clock.now())?;
                Ok(())
            }
            ConnectAuth::DevicePassword {
                device_code,
                password,
            } => {
                if device_code != &identity.device_code {
                    return Err(Error::DeviceUnauthorized(format!(
                        "device code {} does not match this device",
                        device_code
                    )));
                }
                if should_allow_connection(credential, password) {
                    Ok(())
                } else {
                    Err(Error::AuthenticationFailed(
                        "connection password mismatch".to_string(),
                    ))
                }
            }
        }
    }

    fn issue_unique(
        &self,
        mut generate: impl FnMut() -> String,
        mut taken: impl FnMut(&String) -> bool,
    ) -> Result<String> {
        for attempt in 0..self.config.max_issue_attempts {
            let candidate = generate();
            if !taken(&candidate) {
                return Ok(candidate);
            }
            debug!("Issuance collision on attempt {}", attempt + 1);
        }
        Err(Error::InvalidState(format!(
            "no unique value after {} attempts",
            self.config.max_issue_attempts
        )))
    }
}
