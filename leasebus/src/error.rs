//! Error types for the lease engine.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

use crate::types::LockToken;

/// Error type for lease, settlement and session operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The lease is no longer held. The unit of work is lost and the broker
    /// will redeliver it.
    #[error("lock expired for token {0}")]
    LockExpired(LockToken),

    /// The token was already settled (or released) by this client.
    #[error("lock {0} is already settled")]
    AlreadySettled(LockToken),

    /// The broker refused or failed to extend one lock.
    #[error("renewal failed for token {token}: {reason}")]
    RenewalFailed { token: LockToken, reason: String },

    /// Aggregated per-token failures from a batch renewal.
    #[error(transparent)]
    Renewal(RenewalErrors),

    /// Another receiver holds the session.
    #[error("session '{session_id}' is locked by another receiver")]
    SessionAcquisitionDenied { session_id: String },

    /// The governing cancellation token fired.
    #[error("receive canceled")]
    Canceled,

    /// The lock registry has no entry for the token.
    #[error("lock token {0} is not registered")]
    LockNotFound(LockToken),

    /// A renewal returned an expiry too far in the future to be trusted.
    #[error("broker returned implausible expiry {expiry} for token {token}")]
    ImplausibleExpiry {
        token: LockToken,
        expiry: DateTime<Utc>,
    },

    /// The receiver that issued a handle has been dropped.
    #[error("receiver is closed")]
    ReceiverClosed,

    /// Transport or broker-side failure.
    #[error("broker error: {0}")]
    Broker(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl Error {
    /// Races between settlement and expiry that callers may ignore.
    pub fn is_benign(&self) -> bool {
        matches!(self, Self::AlreadySettled(_) | Self::LockExpired(_))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    pub fn is_already_settled(&self) -> bool {
        matches!(self, Self::AlreadySettled(_))
    }
}

/// Per-token failures collected from one batch renewal.
#[derive(Debug, Default)]
pub struct RenewalErrors {
    failures: BTreeMap<LockToken, Error>,
}

impl RenewalErrors {
    pub fn new(failures: BTreeMap<LockToken, Error>) -> Self {
        Self { failures }
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn get(&self, token: &LockToken) -> Option<&Error> {
        self.failures.get(token)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LockToken, &Error)> {
        self.failures.iter()
    }

    pub fn into_inner(self) -> BTreeMap<LockToken, Error> {
        self.failures
    }
}

impl fmt::Display for RenewalErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lock renewal(s) failed", self.failures.len())?;
        for (i, error) in self.failures.values().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RenewalErrors {}

/// Result type alias for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
