//! Signaling wire protocol
//!
//! One JSON envelope per WebSocket text frame. The envelope is routing
//! metadata only; the typed body travels base64-encoded in `payload`.

use crate::clock::unix_millis;
use crate::credentials::{ConnectAuth, PlatformTag};
use crate::error::AccessCodeError;
use crate::peer::Candidate;
use crate::session::SessionPermissions;
use crate::{Error, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Device id the relay uses when it speaks for itself
pub const RELAY_DEVICE_ID: &str = "relay";

/// Envelope type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Register,
    Offer,
    Answer,
    IceCandidate,
    ConnectRequest,
    ConnectResponse,
    Heartbeat,
    Disconnect,
}

/// Signaling envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub from_device_id: String,
    #[serde(default)]
    pub to_device_id: String,
    #[serde(default)]
    pub session_id: String,
    pub timestamp_ms: u64,
    #[serde(default, with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl SignalingMessage {
    /// Envelope with an empty payload stamped with the current time
    pub fn new(
        message_type: MessageType,
        from_device_id: impl Into<String>,
        to_device_id: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            from_device_id: from_device_id.into(),
            to_device_id: to_device_id.into(),
            session_id: session_id.into(),
            timestamp_ms: unix_millis(Utc::now()),
            payload: Vec::new(),
        }
    }

    /// Attach a JSON-encoded body
    pub fn with_payload<T: Serialize>(mut self, body: &T) -> Result<Self> {
        self.payload = serde_json::to_vec(body)
            .map_err(|e| Error::SerializationError(format!("payload encode: {}", e)))?;
        Ok(self)
    }

    /// Decode the body as `T`
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            Error::SerializationError(format!(
                "{:?} payload decode: {}",
                self.message_type, e
            ))
        })
    }

    /// Whether the relay itself sent this envelope
    pub fn is_from_relay(&self) -> bool {
        self.from_device_id == RELAY_DEVICE_ID
    }

    /// Encode as one JSON line
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::SerializationError(format!("envelope encode: {}", e)))
    }

    /// Decode from JSON
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::SerializationError(format!("envelope decode: {}", e)))
    }
}

/// Register body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub device_id: String,
    pub device_name: String,
    pub platform: PlatformTag,
    pub version: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// ConnectRequest body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequestPayload {
    pub auth: ConnectAuth,
    #[serde(default)]
    pub permissions: SessionPermissions,
}

/// ConnectResponse body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponsePayload {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_code_error: Option<AccessCodeError>,
    #[serde(default)]
    pub require_lock_password_check: bool,
}

impl ConnectResponsePayload {
    /// Accepting response
    pub fn accept(require_lock_password_check: bool) -> Self {
        Self {
            accepted: true,
            error_code: None,
            reason: None,
            access_code_error: None,
            require_lock_password_check,
        }
    }

    /// Rejecting response built from the error that caused it
    pub fn reject(error: &Error) -> Self {
        Self {
            accepted: false,
            error_code: error.code().map(|c| c.as_u16()),
            reason: Some(error.to_string()),
            access_code_error: match error {
                Error::InvalidAccessCode(kind) => Some(*kind),
                _ => None,
            },
            require_lock_password_check: false,
        }
    }

    /// Error a rejecting response stands for
    pub fn rejection_error(&self) -> Error {
        if let Some(kind) = self.access_code_error {
            return Error::InvalidAccessCode(kind);
        }
        let reason = self
            .reason
            .clone()
            .unwrap_or_else(|| "connection rejected".to_string());
        match self.error_code {
            Some(code) => Error::from_code(code, reason),
            None => Error::SessionError(reason),
        }
    }
}

/// Offer / Answer body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptionPayload {
    pub connection_id: String,
    pub sdp: String,
}

/// IceCandidate body; `None` marks the end of the sender's candidates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidatePayload {
    pub candidate: Option<Candidate>,
}

/// Disconnect body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectPayload {
    pub reason: String,
}

mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
