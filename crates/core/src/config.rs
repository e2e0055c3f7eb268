//! Engine configuration
//!
//! Every section has serde defaults so a partial TOML file (or none at all)
//! yields a working configuration.

use crate::lifecycle::BackoffPolicy;
use crate::{Error, Result};
use remotedesk_network_quality::QualityConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Top-level configuration for one engine instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Signaling relay settings
    #[serde(default)]
    pub signaling: SignalingConfig,

    /// Candidate negotiation and connection establishment
    #[serde(default)]
    pub ice: IceConfig,

    /// Session lifecycle and history
    #[serde(default)]
    pub session: SessionConfig,

    /// File transfer
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Codes and passwords
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Network quality monitor and adaptive bitrate
    #[serde(default)]
    pub quality: QualityConfig,
}

/// Signaling relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingConfig {
    /// Relay URLs, tried in order on failover
    #[serde(default = "default_relay_urls")]
    pub relay_urls: Vec<String>,

    /// Registration handshake timeout in milliseconds (default: 5000)
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// Heartbeat interval in milliseconds (default: 15000)
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Backoff between relay failover rounds
    #[serde(default)]
    pub failover: BackoffPolicy,
}

fn default_relay_urls() -> Vec<String> {
    vec!["ws://localhost:8765".to_string()]
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_heartbeat_interval_ms() -> u64 {
    15000
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            relay_urls: default_relay_urls(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            failover: BackoffPolicy::default(),
        }
    }
}

impl SignalingConfig {
    /// Handshake timeout as a Duration
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Candidate negotiation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceConfig {
    /// STUN server URLs
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,

    /// TURN server URLs
    #[serde(default)]
    pub turn_urls: Vec<String>,

    /// Shared secret used to mint relay credentials
    #[serde(default)]
    pub turn_shared_secret: Option<String>,

    /// Relay credential lifetime in seconds (default: 600)
    #[serde(default = "default_relay_credential_ttl_secs")]
    pub relay_credential_ttl_secs: u64,

    /// Per-pair connectivity check timeout in milliseconds (default: 2000)
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,

    /// Budget for the direct (non-relay) stage in milliseconds (default: 5000)
    #[serde(default = "default_gathering_timeout_ms")]
    pub gathering_timeout_ms: u64,

    /// Whole connection attempt timeout in milliseconds (default: 30000)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Data channel re-establishment window
    #[serde(default = "BackoffPolicy::aggressive")]
    pub reconnect: BackoffPolicy,
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_relay_credential_ttl_secs() -> u64 {
    600
}

fn default_check_timeout_ms() -> u64 {
    2000
}

fn default_gathering_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_ms() -> u64 {
    30000
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            turn_urls: Vec::new(),
            turn_shared_secret: None,
            relay_credential_ttl_secs: default_relay_credential_ttl_secs(),
            check_timeout_ms: default_check_timeout_ms(),
            gathering_timeout_ms: default_gathering_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            reconnect: BackoffPolicy::aggressive(),
        }
    }
}

impl IceConfig {
    /// Per-pair check timeout
    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    /// Direct stage budget
    pub fn gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.gathering_timeout_ms)
    }

    /// Whole attempt budget
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Session lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Maximum concurrent sessions (0 = unlimited)
    #[serde(default)]
    pub max_sessions: usize,

    /// Days to keep ended session records (default: 30)
    #[serde(default = "default_history_retention_days")]
    pub history_retention_days: u32,

    /// JSON history file; in-memory history when unset
    #[serde(default)]
    pub history_path: Option<PathBuf>,

    /// Weight of the previous smoothed latency (default: 0.9)
    #[serde(default = "default_smoothing_old_weight")]
    pub smoothing_old_weight: f64,

    /// Stats sampling interval while Active in milliseconds (default: 1000)
    #[serde(default = "default_active_sample_interval_ms")]
    pub active_sample_interval_ms: u64,

    /// Stats sampling interval while Paused in milliseconds (default: 5000)
    #[serde(default = "default_paused_sample_interval_ms")]
    pub paused_sample_interval_ms: u64,

    /// Input injection latency budget in milliseconds (default: 100)
    #[serde(default = "default_input_latency_budget_ms")]
    pub input_latency_budget_ms: u64,
}

fn default_history_retention_days() -> u32 {
    30
}

fn default_smoothing_old_weight() -> f64 {
    0.9
}

fn default_active_sample_interval_ms() -> u64 {
    1000
}

fn default_paused_sample_interval_ms() -> u64 {
    5000
}

fn default_input_latency_budget_ms() -> u64 {
    100
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            history_retention_days: default_history_retention_days(),
            history_path: None,
            smoothing_old_weight: default_smoothing_old_weight(),
            active_sample_interval_ms: default_active_sample_interval_ms(),
            paused_sample_interval_ms: default_paused_sample_interval_ms(),
            input_latency_budget_ms: default_input_latency_budget_ms(),
        }
    }
}

impl SessionConfig {
    /// Retention window for ended sessions
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.history_retention_days))
    }

    /// Input latency budget
    pub fn input_latency_budget(&self) -> Duration {
        Duration::from_millis(self.input_latency_budget_ms)
    }
}

/// File transfer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk size in bytes (default: 1 MiB)
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Concurrent outgoing tasks per connection (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Per-chunk retry backoff; `max_retries` bounds the attempts
    #[serde(default = "BackoffPolicy::chunk_retry")]
    pub chunk_retry: BackoffPolicy,
}

fn default_chunk_size() -> u64 {
    1024 * 1024
}

fn default_max_concurrent() -> usize {
    3
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
            chunk_retry: BackoffPolicy::chunk_retry(),
        }
    }
}

/// Credential issuance configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Access code lifetime in seconds (default: 600)
    #[serde(default = "default_access_code_ttl_secs")]
    pub access_code_ttl_secs: u64,

    /// Attempts before giving up on a collision-free identifier (default: 16)
    #[serde(default = "default_max_issue_attempts")]
    pub max_issue_attempts: u32,
}

fn default_access_code_ttl_secs() -> u64 {
    600
}

fn default_max_issue_attempts() -> u32 {
    16
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            access_code_ttl_secs: default_access_code_ttl_secs(),
            max_issue_attempts: default_max_issue_attempts(),
        }
    }
}

impl CredentialsConfig {
    /// Access code lifetime
    pub fn access_code_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.access_code_ttl_secs as i64)
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            Error::InvalidConfig(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Build configuration from `REMOTEDESK_*` environment variables
    ///
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(urls) = env_list("REMOTEDESK_RELAY_URLS") {
            config.signaling.relay_urls = urls;
        }
        if let Some(v) = env_parse("REMOTEDESK_HANDSHAKE_TIMEOUT_MS")? {
            config.signaling.handshake_timeout_ms = v;
        }
        if let Some(servers) = env_list("REMOTEDESK_STUN_SERVERS") {
            config.ice.stun_servers = servers;
        }
        if let Some(urls) = env_list("REMOTEDESK_TURN_URLS") {
            config.ice.turn_urls = urls;
        }
        if let Ok(secret) = std::env::var("REMOTEDESK_TURN_SECRET") {
            config.ice.turn_shared_secret = Some(secret);
        }
        if let Some(v) = env_parse("REMOTEDESK_CONNECT_TIMEOUT_MS")? {
            config.ice.connect_timeout_ms = v;
        }
        if let Some(v) = env_parse("REMOTEDESK_MAX_SESSIONS")? {
            config.session.max_sessions = v;
        }
        if let Some(v) = env_parse("REMOTEDESK_HISTORY_RETENTION_DAYS")? {
            config.session.history_retention_days = v;
        }
        if let Ok(path) = std::env::var("REMOTEDESK_HISTORY_PATH") {
            config.session.history_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse("REMOTEDESK_CHUNK_SIZE")? {
            config.transfer.chunk_size = v;
        }
        if let Some(v) = env_parse("REMOTEDESK_MAX_TRANSFERS")? {
            config.transfer.max_concurrent = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, otherwise from the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(p) => {
                debug!("Config file {} not found, using environment", p.display());
                Self::from_env()
            }
            None => Self::from_env(),
        }
    }

    /// Validate configuration ranges
    pub fn validate(&self) -> Result<()> {
        if self.signaling.relay_urls.is_empty() {
            return Err(Error::InvalidConfig(
                "signaling.relay_urls must not be empty".to_string(),
            ));
        }
        if self.signaling.handshake_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "signaling.handshake_timeout_ms must be > 0".to_string(),
            ));
        }
        self.signaling.failover.validate("signaling.failover")?;

        if self.ice.check_timeout_ms == 0 || self.ice.connect_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "ice timeouts must be > 0".to_string(),
            ));
        }
        if self.ice.connect_timeout_ms < self.ice.gathering_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "ice.connect_timeout_ms ({}) must be >= gathering_timeout_ms ({})",
                self.ice.connect_timeout_ms, self.ice.gathering_timeout_ms
            )));
        }
        self.ice.reconnect.validate("ice.reconnect")?;

        if !(0.0..1.0).contains(&self.session.smoothing_old_weight) {
            return Err(Error::InvalidConfig(format!(
                "session.smoothing_old_weight must be in [0, 1), got {}",
                self.session.smoothing_old_weight
            )));
        }
        if self.session.active_sample_interval_ms == 0
            || self.session.paused_sample_interval_ms == 0
        {
            return Err(Error::InvalidConfig(
                "session sample intervals must be > 0".to_string(),
            ));
        }

        if self.transfer.chunk_size == 0 {
            return Err(Error::InvalidConfig(
                "transfer.chunk_size must be > 0".to_string(),
            ));
        }
        if self.transfer.max_concurrent == 0 {
            return Err(Error::InvalidConfig(
                "transfer.max_concurrent must be > 0".to_string(),
            ));
        }
        self.transfer.chunk_retry.validate("transfer.chunk_retry")?;

        if self.credentials.access_code_ttl_secs == 0 {
            return Err(Error::InvalidConfig(
                "credentials.access_code_ttl_secs must be > 0".to_string(),
            ));
        }
        if self.credentials.max_issue_attempts == 0 {
            return Err(Error::InvalidConfig(
                "credentials.max_issue_attempts must be > 0".to_string(),
            ));
        }

        self.quality
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))
    }
}

fn env_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::InvalidConfig(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.signaling.handshake_timeout(), Duration::from_secs(5));
        assert_eq!(config.transfer.chunk_size, 1024 * 1024);
        assert_eq!(config.transfer.max_concurrent, 3);
        assert_eq!(config.session.history_retention_days, 30);
        assert_eq!(config.credentials.access_code_ttl(), chrono::Duration::minutes(10));
    }

    #[test]
    fn test_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
[transfer]
chunk_size = 65536

[session]
max_sessions = 2
"#,
        )
        .unwrap();

        assert_eq!(config.transfer.chunk_size, 65536);
        assert_eq!(config.transfer.max_concurrent, 3);
        assert_eq!(config.session.max_sessions, 2);
        assert_eq!(config.ice.check_timeout_ms, 2000);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remotedesk.toml");
        std::fs::write(
            &path,
            "[signaling]\nrelay_urls = [\"ws://a:1\", \"ws://b:2\"]\n",
        )
        .unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.signaling.relay_urls.len(), 2);
    }

    #[test]
    fn test_invalid_smoothing() {
        let mut config = EngineConfig::default();
        config.session.smoothing_old_weight = 1.5;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut config = EngineConfig::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }
}
