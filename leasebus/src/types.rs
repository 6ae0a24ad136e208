//! Value types shared by the lease engine and its broker collaborator.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sequence number assigned by the broker when a message is enqueued.
pub type SequenceNumber = u64;

/// Opaque lock token issued by the broker for one delivery or one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(Uuid);

impl LockToken {
    /// Issue a fresh, random token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap a token received from the broker.
    #[must_use]
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// A single peek-locked delivery.
    Message,
    /// An exclusive session lock covering a group of messages.
    Session,
}

impl LockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Session => "session",
        }
    }
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome applied to a held message lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outcome {
    /// Remove the message from the entity.
    Complete,
    /// Release the lock so the message is redelivered immediately.
    Abandon,
    /// Set the message aside; it can only be fetched again by sequence number.
    Defer,
    /// Move the message to the dead-letter sub-queue.
    DeadLetter {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
}

impl Outcome {
    /// Dead-letter with a reason and no description.
    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::DeadLetter {
            reason: Some(reason.into()),
            description: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Abandon => "abandon",
            Self::Defer => "defer",
            Self::DeadLetter { .. } => "dead_letter",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A message as sent by a producer.
///
/// `group_id` is the session affinity key. It is fixed once the message has
/// been handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Producer-assigned message id.
    pub id: String,
    /// Opaque payload.
    pub data: Vec<u8>,
    /// Session the message belongs to, if any.
    #[serde(default)]
    pub group_id: Option<String>,
    /// Time the message may sit on the entity before the broker drops it.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
    /// Application properties.
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Message {
    /// Create a message with a random id.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            data: data.into(),
            group_id: None,
            ttl: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn from_string(text: impl Into<String>) -> Self {
        Self::new(text.into().into_bytes())
    }

    #[must_use]
    pub fn with_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// One peek-locked delivery handed out by the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub message: Message,
    pub lock_token: LockToken,
    pub locked_until: DateTime<Utc>,
    pub sequence_number: SequenceNumber,
    /// How many times the broker has handed this message out, this one included.
    pub delivery_count: u32,
    /// Transport-level tag, unique per delivery on a receiver.
    pub delivery_tag: u64,
    pub enqueued_at: DateTime<Utc>,
}

/// An accepted session lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLease {
    pub entity: String,
    pub session_id: String,
    pub lock_token: LockToken,
    pub locked_until: DateTime<Utc>,
}

/// Where a delivery is in its lifecycle.
///
/// `Delivered -> Dispatched -> Settled | LockLost`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeliveryState {
    Delivered = 0,
    Dispatched = 1,
    Settled = 2,
    LockLost = 3,
}

impl DeliveryState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Delivered,
            1 => Self::Dispatched,
            2 => Self::Settled,
            _ => Self::LockLost,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::LockLost)
    }
}

/// `now + duration`, saturating instead of overflowing.
pub(crate) fn expiry_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
