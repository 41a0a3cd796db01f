//! Store accounts as seen by the sync core.
//!
//! The account registry owns these records; the core only reads identifiers
//! and expiry, and writes back status changes and refreshed credentials.

use chrono::{DateTime, Duration, Utc};
use core::str::FromStr;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::StoreCode;

/// Connectivity of a store account towards the upstream platform.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    /// The upstream rejected the credential; an operator has to re-authorize.
    NeedReconnect,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::NeedReconnect => "NEED_RECONNECT",
            ConnectionStatus::Disconnected => "DISCONNECTED",
        }
    }
}

impl core::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECTED" => Ok(ConnectionStatus::Connected),
            "NEED_RECONNECT" => Ok(ConnectionStatus::NeedReconnect),
            "DISCONNECTED" => Ok(ConnectionStatus::Disconnected),
            other => Err(DomainError::unknown("connection status", other)),
        }
    }
}

/// A store account row, reduced to the fields the sync core needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAccount {
    pub store_code: StoreCode,
    /// When the current access credential stops being accepted upstream.
    pub credential_expires_at: Option<DateTime<Utc>>,
    pub status: ConnectionStatus,
}

impl StoreAccount {
    pub fn connected(store_code: StoreCode, credential_expires_at: DateTime<Utc>) -> Self {
        Self {
            store_code,
            credential_expires_at: Some(credential_expires_at),
            status: ConnectionStatus::Connected,
        }
    }

    /// Whether the credential expires at or before `now + horizon`.
    ///
    /// Accounts without a recorded expiry are treated as due, as is every
    /// account when `now + horizon` is past the representable range.
    pub fn expires_within(&self, now: DateTime<Utc>, horizon: Duration) -> bool {
        match (self.credential_expires_at, now.checked_add_signed(horizon)) {
            (Some(at), Some(cutoff)) => at <= cutoff,
            _ => true,
        }
    }
}

/// A freshly issued access credential.
///
/// The token is already encrypted by the issuing collaborator and is opaque
/// here. `Debug` output is redacted so the value cannot leak into logs.
#[derive(Debug)]
pub struct Credential {
    token: Secret<String>,
    pub expires_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(encrypted_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            token: Secret::new(encrypted_token.into()),
            expires_at,
        }
    }

    /// Expose the encrypted token for persistence. Never log the result.
    pub fn expose_token(&self) -> &str {
        self.token.expose_secret()
    }
}
