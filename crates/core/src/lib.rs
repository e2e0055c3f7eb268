//! RemoteDesk core engine
//!
//! Establishes authorized peer-to-peer remote-control sessions between two
//! devices and moves files over them.
//!
//! # Features
//!
//! - **Device credentials**: numeric device codes, rotating connection
//!   passwords and single-use access codes
//! - **Signaling**: JSON envelopes over WebSocket, relay failover and an
//!   in-process relay hub
//! - **Connectivity**: candidate gathering, IPv6-first pair checks with relay
//!   fallback and an explicit connection state machine
//! - **Sessions**: lifecycle, quality statistics, adaptive bitrate and a
//!   retained history
//! - **File transfer**: checksummed chunks, bounded concurrency, pause/resume
//!   without resending acknowledged chunks
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  Endpoint (one per device)                               │
//! │  ├─ CredentialIssuer (device codes, passwords, codes)    │
//! │  ├─ SignalingChannel ── WebSocket ──> relay (SignalingHub)│
//! │  ├─ ConnectionStateMachine (per session)                 │
//! │  │   └─ CandidateNegotiator ── ConnectivityProbe         │
//! │  ├─ SessionManager (lifecycle, stats, history)           │
//! │  │   └─ NetworkQualityMonitor (per session)              │
//! │  └─ TransferEngine (per session data channel)            │
//! │     ↓                                                    │
//! │  EventBus ──> embedder (UI, logs)                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use remotedesk_core::{ConnectAuth, Endpoint, SessionPermissions, WebSocketConnector};
//!
//! let endpoint = Endpoint::connect(parts, &WebSocketConnector::default()).await?;
//! let session = endpoint
//!     .start_session(
//!         "peer-device-id",
//!         ConnectAuth::DevicePassword { device_code, password },
//!         SessionPermissions::default(),
//!     )
//!     .await?;
//! ```

#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod peer;
pub mod platform;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CredentialsConfig, EngineConfig, IceConfig, SessionConfig, SignalingConfig, TransferConfig,
};
pub use credentials::{
    AccessCode, ConnectAuth, ConnectionCredential, CredentialIssuer, DeviceIdentity, PlatformTag,
};
pub use endpoint::{Endpoint, EndpointParts, IncomingRequest};
pub use error::{AccessCodeError, Error, ErrorCategory, ErrorCode, ResourceError, Result};
pub use events::{EngineEvent, EventBus};
pub use lifecycle::BackoffPolicy;
pub use peer::{
    ConnectionState, ConnectionStateMachine, ConnectivityProbe, FailureReason, PeerConnection,
};
pub use session::{
    EndReason, HistoryStore, JsonFileHistory, MemoryHistory, Session, SessionManager,
    SessionPermissions, SessionStatus,
};
pub use signaling::{SignalingChannel, SignalingHub, WebSocketConnector};
pub use transfer::{TransferEngine, TransferStatus, TransferTask};

pub use remotedesk_network_quality::{ConnectionQuality, QualityConfig};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
