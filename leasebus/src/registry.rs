//! Lock registry: the single owner of outstanding lease entries.
//!
//! Every held lock (message or session) has one [`LeaseEntry`] keyed by its
//! [`LockToken`]. Removal is a fence: a removed token is remembered and can
//! never be registered or updated again, so a renewal response that arrives
//! after settlement cannot resurrect the lock.
//!
//! A fence is kept until the lock's last known expiry plus a grace period has
//! passed. After that the broker has discarded the token as well, and the
//! fence is pruned.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::{Error, Result};
use crate::types::{LockKind, LockToken, expiry_after};

/// How long a removed token stays fenced past its last known expiry.
pub const DEFAULT_FENCE_GRACE: Duration = Duration::from_secs(5 * 60);

/// Fence count below which no pruning pass runs.
const PRUNE_FLOOR: usize = 1024;

/// One outstanding lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEntry {
    pub token: LockToken,
    pub kind: LockKind,
    pub expiry: DateTime<Utc>,
    /// Entity path or session id the lock was issued for.
    pub owner: String,
    /// Set while a settlement call for this token is awaiting the broker.
    pub settling: bool,
}

impl LeaseEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

struct RegistryState {
    entries: HashMap<LockToken, LeaseEntry>,
    /// Removed tokens and the time after which each may be forgotten.
    fenced: HashMap<LockToken, DateTime<Utc>>,
    fence_grace: Duration,
    /// Fence count that triggers the next pruning pass.
    prune_at: usize,
}

impl RegistryState {
    fn fence(&mut self, token: &LockToken, now: DateTime<Utc>) -> Option<LeaseEntry> {
        let entry = self.entries.remove(token)?;
        let retain_until = expiry_after(entry.expiry.max(now), self.fence_grace);
        self.fenced.insert(*token, retain_until);

        if self.fenced.len() >= self.prune_at {
            self.prune(now);
            self.prune_at = PRUNE_FLOOR.max(self.fenced.len() * 2);
        }
        Some(entry)
    }

    fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.fenced.len();
        self.fenced.retain(|_, retain_until| *retain_until > now);
        before - self.fenced.len()
    }
}

/// Concurrent map of held locks.
pub struct LockRegistry {
    state: RwLock<RegistryState>,
}

impl Default for LockRegistry {
    fn default() -> Self {
        Self::with_fence_grace(DEFAULT_FENCE_GRACE)
    }
}

impl LockRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose fences outlive the last known expiry by `grace`.
    #[must_use]
    pub fn with_fence_grace(grace: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState {
                entries: HashMap::new(),
                fenced: HashMap::new(),
                fence_grace: grace,
                prune_at: PRUNE_FLOOR,
            }),
        }
    }

    /// Track a newly issued lock.
    ///
    /// Registering a live token again keeps the later expiry. Registering a
    /// fenced token fails with [`Error::AlreadySettled`].
    pub async fn register(
        &self,
        token: LockToken,
        kind: LockKind,
        initial_expiry: DateTime<Utc>,
        owner: impl Into<String>,
    ) -> Result<LeaseEntry> {
        let mut state = self.state.write().await;
        if state.fenced.contains_key(&token) {
            return Err(Error::AlreadySettled(token));
        }

        let entry = state.entries.entry(token).or_insert_with(|| LeaseEntry {
            token,
            kind,
            expiry: initial_expiry,
            owner: owner.into(),
            settling: false,
        });
        entry.expiry = entry.expiry.max(initial_expiry);
        trace!(token = %token, kind = %kind, expiry = %entry.expiry, "Registered lock");
        Ok(entry.clone())
    }

    pub async fn lookup(&self, token: &LockToken) -> Option<LeaseEntry> {
        self.state.read().await.entries.get(token).cloned()
    }

    /// Move a lock's expiry forward and return the effective expiry.
    ///
    /// Expiries never move backwards: an older renewal response arriving
    /// after a newer one leaves the newer value in place.
    pub async fn update_expiry(
        &self,
        token: &LockToken,
        new_expiry: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(token)
            .ok_or(Error::LockNotFound(*token))?;
        entry.expiry = entry.expiry.max(new_expiry);
        Ok(entry.expiry)
    }

    /// Drop a lock for good.
    pub async fn remove(&self, token: &LockToken) -> Result<LeaseEntry> {
        self.state
            .write()
            .await
            .fence(token, Utc::now())
            .ok_or(Error::LockNotFound(*token))
    }

    /// Claim the right to settle a lock.
    ///
    /// Fails with [`Error::AlreadySettled`] when the token is gone or another
    /// settlement is in flight, and with [`Error::LockExpired`] (fencing the
    /// token) when the lease has already lapsed.
    pub async fn begin_settle(&self, token: &LockToken, now: DateTime<Utc>) -> Result<LeaseEntry> {
        let mut state = self.state.write().await;
        let entry = match state.entries.get_mut(token) {
            Some(entry) if !entry.settling => entry,
            _ => return Err(Error::AlreadySettled(*token)),
        };

        if entry.is_expired(now) {
            state.fence(token, now);
            return Err(Error::LockExpired(*token));
        }

        entry.settling = true;
        Ok(entry.clone())
    }

    /// Finish a settlement started with [`begin_settle`](Self::begin_settle).
    ///
    /// On success the token is fenced; on failure it becomes live again and
    /// may be renewed or settled once more.
    pub async fn finish_settle(&self, token: &LockToken, succeeded: bool) {
        let mut state = self.state.write().await;
        if succeeded {
            state.fence(token, Utc::now());
        } else if let Some(entry) = state.entries.get_mut(token) {
            entry.settling = false;
        }
    }

    /// Evict every lease whose expiry has passed and is not mid-settlement.
    ///
    /// Also forgets fences whose retention has run out.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Vec<LeaseEntry> {
        let mut state = self.state.write().await;
        let expired: Vec<LockToken> = state
            .entries
            .values()
            .filter(|entry| !entry.settling && entry.is_expired(now))
            .map(|entry| entry.token)
            .collect();

        let swept: Vec<LeaseEntry> = expired
            .iter()
            .filter_map(|token| state.fence(token, now))
            .collect();
        state.prune(now);
        swept
    }

    /// Forget fences whose retention ended before `now` and return how many
    /// were dropped.
    pub async fn prune_fences(&self, now: DateTime<Utc>) -> usize {
        self.state.write().await.prune(now)
    }

    /// Tokens currently held, optionally filtered by kind.
    pub async fn tokens(&self, kind: Option<LockKind>) -> Vec<LockToken> {
        self.state
            .read()
            .await
            .entries
            .values()
            .filter(|entry| kind.is_none_or(|k| entry.kind == k))
            .map(|entry| entry.token)
            .collect()
    }

    pub async fn is_fenced(&self, token: &LockToken) -> bool {
        self.state.read().await.fenced.contains_key(token)
    }

    /// Number of removed tokens still fenced.
    pub async fn fenced_len(&self) -> usize {
        self.state.read().await.fenced.len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }
}
