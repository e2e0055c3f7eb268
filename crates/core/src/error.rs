//! Error types for the RemoteDesk engine
//!
//! Errors that collaborators may act on carry a numeric [`ErrorCode`] from the
//! shared taxonomy: connection (1xxx), authorization (2xxx), transfer (3xxx)
//! and resource (4xxx).

use serde::{Deserialize, Serialize};

/// Result type alias using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes surfaced to UI and logging collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    NetworkUnreachable = 1001,
    SignalingUnavailable = 1002,
    NatTraversalFailed = 1003,
    ConnectionTimeout = 1004,

    InvalidAccessCode = 2001,
    DeviceUnauthorized = 2002,
    CertificateInvalid = 2003,
    AuthenticationFailed = 2004,

    /// Reported by the external media pipeline
    VideoEncodingFailed = 3001,
    DataChannelClosed = 3002,
    FileTransferFailed = 3003,
    ChecksumMismatch = 3004,

    ScreenCaptureFailed = 4001,
    PermissionDenied = 4002,
    OutOfMemory = 4003,
    CpuOverloaded = 4004,
}

impl ErrorCode {
    /// Numeric value of the code
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Category the code belongs to
    pub fn category(self) -> ErrorCategory {
        match self.as_u16() / 1000 {
            1 => ErrorCategory::Connection,
            2 => ErrorCategory::Authorization,
            3 => ErrorCategory::Transfer,
            _ => ErrorCategory::Resource,
        }
    }
}

/// Error taxonomy categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Recovered locally where possible (STUN→TURN fallback, relay failover)
    Connection,
    /// Never retried automatically
    Authorization,
    /// Chunk-level retry is automatic and bounded
    Transfer,
    /// Reported by platform collaborators; ends sessions gracefully
    Resource,
}

/// Resource failures reported by platform collaborators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
pub enum ResourceError {
    #[error("screen capture failed")]
    ScreenCaptureFailed,
    #[error("permission denied")]
    PermissionDenied,
    #[error("out of memory")]
    OutOfMemory,
    #[error("cpu overloaded")]
    CpuOverloaded,
}

impl ResourceError {
    /// Taxonomy code for this resource failure
    pub fn code(self) -> ErrorCode {
        match self {
            ResourceError::ScreenCaptureFailed => ErrorCode::ScreenCaptureFailed,
            ResourceError::PermissionDenied => ErrorCode::PermissionDenied,
            ResourceError::OutOfMemory => ErrorCode::OutOfMemory,
            ResourceError::CpuOverloaded => ErrorCode::CpuOverloaded,
        }
    }
}

/// Access code validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum AccessCodeError {
    #[error("access code expired")]
    Expired,
    #[error("access code already used")]
    AlreadyUsed,
    #[error("access code not found")]
    NotFound,
}

/// Errors that can occur in engine operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Network unreachable
    #[error("Network unreachable: {0}")]
    NetworkUnreachable(String),

    /// Signaling relay unavailable or signaling channel lost
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// NAT traversal failed (every direct and relay candidate pair failed)
    #[error("NAT traversal failed: {0}")]
    NatTraversalFailed(String),

    /// Operation timeout
    #[error("Connection timeout: {0}")]
    ConnectionTimeout(String),

    /// Access code rejected
    #[error("Invalid access code: {0}")]
    InvalidAccessCode(#[from] AccessCodeError),

    /// Device not allowed to connect
    #[error("Device unauthorized: {0}")]
    DeviceUnauthorized(String),

    /// Peer certificate rejected
    #[error("Certificate invalid: {0}")]
    CertificateInvalid(String),

    /// Credentials rejected
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Data channel closed underneath a transfer
    #[error("Data channel closed: {0}")]
    DataChannelClosed(String),

    /// File transfer failed after exhausting retries
    #[error("File transfer failed: {0}")]
    FileTransferFailed(String),

    /// Chunk checksum did not match its payload
    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    /// Resource failure reported by a platform collaborator
    #[error("Resource error: {0}")]
    Resource(#[from] ResourceError),

    /// Operation not valid in the aggregate's current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Transfer task not found
    #[error("Transfer not found: {0}")]
    TransferNotFound(String),

    /// Session management error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Taxonomy code, if this error belongs to the shared taxonomy
    pub fn code(&self) -> Option<ErrorCode> {
        let code = match self {
            Error::NetworkUnreachable(_) => ErrorCode::NetworkUnreachable,
            Error::SignalingUnavailable(_) => ErrorCode::SignalingUnavailable,
            Error::NatTraversalFailed(_) => ErrorCode::NatTraversalFailed,
            Error::ConnectionTimeout(_) => ErrorCode::ConnectionTimeout,
            Error::InvalidAccessCode(_) => ErrorCode::InvalidAccessCode,
            Error::DeviceUnauthorized(_) => ErrorCode::DeviceUnauthorized,
            Error::CertificateInvalid(_) => ErrorCode::CertificateInvalid,
            Error::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Error::DataChannelClosed(_) => ErrorCode::DataChannelClosed,
            Error::FileTransferFailed(_) => ErrorCode::FileTransferFailed,
            Error::ChecksumMismatch(_) => ErrorCode::ChecksumMismatch,
            Error::Resource(r) => r.code(),
            _ => return None,
        };
        Some(code)
    }

    /// Rebuild an error reported by a peer as `code` plus a message
    pub fn from_code(code: u16, message: String) -> Self {
        match code {
            1001 => Error::NetworkUnreachable(message),
            1002 => Error::SignalingUnavailable(message),
            1003 => Error::NatTraversalFailed(message),
            1004 => Error::ConnectionTimeout(message),
            2001 => Error::InvalidAccessCode(AccessCodeError::NotFound),
            2002 => Error::DeviceUnauthorized(message),
            2003 => Error::CertificateInvalid(message),
            2004 => Error::AuthenticationFailed(message),
            3002 => Error::DataChannelClosed(message),
            3003 => Error::FileTransferFailed(message),
            3004 => Error::ChecksumMismatch(message),
            4001 => Error::Resource(ResourceError::ScreenCaptureFailed),
            4002 => Error::Resource(ResourceError::PermissionDenied),
            4003 => Error::Resource(ResourceError::OutOfMemory),
            4004 => Error::Resource(ResourceError::CpuOverloaded),
            _ => Error::SessionError(format!("remote error {}: {}", code, message)),
        }
    }

    /// Taxonomy category, if any
    pub fn category(&self) -> Option<ErrorCategory> {
        self.code().map(ErrorCode::category)
    }

    /// Check if this error is retryable
    ///
    /// Authorization errors are never retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NetworkUnreachable(_)
                | Error::SignalingUnavailable(_)
                | Error::NatTraversalFailed(_)
                | Error::ConnectionTimeout(_)
                | Error::DataChannelClosed(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is an authorization error
    pub fn is_authorization_error(&self) -> bool {
        self.category() == Some(ErrorCategory::Authorization)
    }
}
