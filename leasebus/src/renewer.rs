//! Lease renewal, one-shot and periodic.
//!
//! A batch renewal issues one broker call per token still present in the
//! registry. Failures are collected per token; one bad token never stops
//! the others from being renewed.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, RenewalErrors, Result};
use crate::registry::LockRegistry;
use crate::traits::Broker;
use crate::types::{LockKind, LockToken, expiry_after};

/// Outcome of one batch renewal.
#[derive(Debug, Default)]
pub struct RenewalReport {
    /// New expiry per successfully renewed token.
    pub renewed: BTreeMap<LockToken, DateTime<Utc>>,
    /// Error per token that could not be renewed.
    pub failures: BTreeMap<LockToken, Error>,
}

impl RenewalReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Tokens that should no longer be renewed: settled, lost or unknown to
    /// this renewer's registry.
    pub fn dead_tokens(&self) -> impl Iterator<Item = &LockToken> {
        self.failures
            .iter()
            .filter(|(_, e)| e.is_benign() || matches!(e, Error::LockNotFound(_)))
            .map(|(token, _)| token)
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: RenewalReport) {
        self.renewed.extend(other.renewed);
        self.failures.extend(other.failures);
    }

    /// Collapse into a single result.
    ///
    /// Tokens that were already settled are dropped; they are the expected
    /// race between renewal and completion. Anything else is returned as
    /// [`Error::Renewal`].
    pub fn into_result(self) -> Result<()> {
        let failures: BTreeMap<LockToken, Error> = self
            .failures
            .into_iter()
            .filter(|(_, e)| !e.is_already_settled())
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Renewal(RenewalErrors::new(failures)))
        }
    }
}

/// Extends held locks through the broker and records the new expiries.
#[derive(Clone)]
pub struct LeaseRenewer {
    registry: Arc<LockRegistry>,
    broker: Arc<dyn Broker>,
    max_lock_horizon: Duration,
}

impl LeaseRenewer {
    pub fn new(
        registry: Arc<LockRegistry>,
        broker: Arc<dyn Broker>,
        max_lock_horizon: Duration,
    ) -> Self {
        Self {
            registry,
            broker,
            max_lock_horizon,
        }
    }

    /// Renew every token in `tokens`.
    pub async fn renew(&self, tokens: &[LockToken]) -> RenewalReport {
        let unique: BTreeSet<LockToken> = tokens.iter().copied().collect();
        let results = join_all(
            unique
                .into_iter()
                .map(|token| async move { (token, self.renew_one(token).await) }),
        )
        .await;

        let mut report = RenewalReport::default();
        for (token, result) in results {
            match result {
                Ok(expiry) => {
                    report.renewed.insert(token, expiry);
                }
                Err(e) => {
                    report.failures.insert(token, e);
                }
            }
        }
        report
    }

    /// Renew a single token and return its new expiry.
    ///
    /// A token this registry removed earlier is [`Error::AlreadySettled`]; one
    /// it never held is [`Error::LockNotFound`].
    pub async fn renew_one(&self, token: LockToken) -> Result<DateTime<Utc>> {
        let Some(entry) = self.registry.lookup(&token).await else {
            return if self.registry.is_fenced(&token).await {
                Err(Error::AlreadySettled(token))
            } else {
                Err(Error::LockNotFound(token))
            };
        };

        let renewed = match entry.kind {
            LockKind::Message => self.broker.renew_message_lock(token).await,
            LockKind::Session => self.broker.renew_session_lock(token).await,
        };

        match renewed {
            Ok(expiry) => {
                let limit = expiry_after(Utc::now(), self.max_lock_horizon);
                if expiry > limit {
                    warn!(token = %token, expiry = %expiry, "Ignoring implausible lock expiry");
                    return Err(Error::ImplausibleExpiry { token, expiry });
                }
                // A settle that finished while the call was in flight fences the token
                let effective = self
                    .registry
                    .update_expiry(&token, expiry)
                    .await
                    .map_err(|_| Error::AlreadySettled(token))?;
                trace!(token = %token, expiry = %effective, "Renewed lock");
                Ok(effective)
            }
            Err(Error::LockExpired(_)) => match self.registry.remove(&token).await {
                Ok(_) => {
                    warn!(token = %token, kind = %entry.kind, "Broker no longer recognizes lock");
                    Err(Error::LockExpired(token))
                }
                Err(_) => Err(Error::AlreadySettled(token)),
            },
            Err(e) => Err(Error::RenewalFailed {
                token,
                reason: e.to_string(),
            }),
        }
    }

    /// Renew `batch` every `interval` until `shutdown` fires.
    ///
    /// Tokens reported as settled or lost are dropped from the batch. Each
    /// tick's report is forwarded to `reports` when given. A renewal already
    /// in flight is allowed to finish before the task exits.
    pub fn spawn_periodic(
        &self,
        interval: Duration,
        batch: LeaseBatch,
        shutdown: CancellationToken,
        reports: Option<mpsc::UnboundedSender<RenewalReport>>,
    ) -> JoinHandle<()> {
        let renewer = self.clone();

        tokio::spawn(async move {
            info!(interval = ?interval, "Lease renewal started");
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Lease renewal received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let tokens = batch.snapshot().await;
                        if tokens.is_empty() {
                            trace!("No leases to renew");
                            continue;
                        }

                        let report = renewer.renew(&tokens).await;
                        debug!(
                            renewed = report.renewed.len(),
                            failed = report.failures.len(),
                            "Renewal tick complete"
                        );
                        for (token, error) in &report.failures {
                            if !error.is_already_settled() {
                                warn!(token = %token, error = %error, "Lock renewal failed");
                            }
                        }

                        let dead: Vec<LockToken> = report.dead_tokens().copied().collect();
                        batch.untrack_all(&dead).await;

                        if let Some(tx) = &reports {
                            // Receiver may have gone away; renewal continues regardless
                            let _ = tx.send(report);
                        }
                    }
                }
            }

            info!("Lease renewal stopped");
        })
    }
}

/// Shared, mutable set of tokens a periodic renewal keeps alive.
#[derive(Clone, Default)]
pub struct LeaseBatch {
    tokens: Arc<RwLock<BTreeSet<LockToken>>>,
}

impl LeaseBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn track(&self, token: LockToken) {
        self.tokens.write().await.insert(token);
    }

    pub async fn untrack(&self, token: &LockToken) {
        self.tokens.write().await.remove(token);
    }

    pub async fn untrack_all(&self, tokens: &[LockToken]) {
        if tokens.is_empty() {
            return;
        }
        let mut set = self.tokens.write().await;
        for token in tokens {
            set.remove(token);
        }
    }

    pub async fn snapshot(&self) -> Vec<LockToken> {
        self.tokens.read().await.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.tokens.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tokens.read().await.is_empty()
    }
}
