//! Short-lived, single-use access codes

use crate::error::AccessCodeError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Observable state of an access code at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCodeStatus {
    /// Usable
    Active,
    /// Past `expires_at`
    Expired,
    /// Already used once
    Consumed,
}

/// One-time code that lets a controller connect without the device password
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCode {
    pub code: String,
    pub device_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
}

impl AccessCode {
    /// Status at `now`; consumption wins over expiry
    pub fn status_at(&self, now: DateTime<Utc>) -> AccessCodeStatus {
        if self.used {
            AccessCodeStatus::Consumed
        } else if now >= self.expires_at {
            AccessCodeStatus::Expired
        } else {
            AccessCodeStatus::Active
        }
    }

    /// Valid iff unused and `now < expires_at`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == AccessCodeStatus::Active
    }
}

/// Access code index
///
/// Validation and consumption happen under one lock so a code can never be
/// accepted twice.
#[derive(Debug, Default)]
pub struct AccessCodeStore {
    codes: Mutex<HashMap<String, AccessCode>>,
}

impl AccessCodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `code` is already indexed
    pub fn contains(&self, code: &str) -> bool {
        self.codes.lock().contains_key(code)
    }

    /// Insert a freshly issued code; returns false on collision
    pub fn insert(&self, code: AccessCode) -> bool {
        let mut codes = self.codes.lock();
        if codes.contains_key(&code.code) {
            return false;
        }
        codes.insert(code.code.clone(), code);
        true
    }

    /// Validate and consume `code`
    ///
    /// When `device_id` is given, a code issued for another device is reported
    /// as `NotFound` and left untouched.
    pub fn validate(
        &self,
        code: &str,
        device_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<AccessCode, AccessCodeError> {
        let mut codes = self.codes.lock();
        let entry = codes.get_mut(code).ok_or(AccessCodeError::NotFound)?;

        if let Some(expected) = device_id {
            if entry.device_id != expected {
                return Err(AccessCodeError::NotFound);
            }
        }

        match entry.status_at(now) {
            AccessCodeStatus::Consumed => Err(AccessCodeError::AlreadyUsed),
            AccessCodeStatus::Expired => Err(AccessCodeError::Expired),
            AccessCodeStatus::Active => {
                entry.used = true;
                debug!("Access code consumed for device {}", entry.device_id);
                Ok(entry.clone())
            }
        }
    }

    /// Drop codes that can never validate again
    pub fn purge(&self, now: DateTime<Utc>) -> usize {
        let mut codes = self.codes.lock();
        let before = codes.len();
        codes.retain(|_, c| c.is_valid_at(now));
        before - codes.len()
    }

    /// Number of indexed codes
    pub fn len(&self) -> usize {
        self.codes.lock().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
