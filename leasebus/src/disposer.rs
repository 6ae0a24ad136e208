//! Exactly-once settlement of message locks.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::registry::LockRegistry;
use crate::traits::Broker;
use crate::types::{LockToken, Outcome};

/// Applies terminal outcomes to held message locks.
///
/// The registry entry is claimed before the broker call and only removed
/// once the broker acknowledges, so a failed settle leaves the lock live and
/// retryable.
#[derive(Clone)]
pub struct Disposer {
    registry: Arc<LockRegistry>,
    broker: Arc<dyn Broker>,
}

impl Disposer {
    pub fn new(registry: Arc<LockRegistry>, broker: Arc<dyn Broker>) -> Self {
        Self { registry, broker }
    }

    /// Settle `token` with `outcome`.
    ///
    /// Returns [`Error::AlreadySettled`] when the token is no longer held
    /// (including a concurrent settle still in flight) and
    /// [`Error::LockExpired`] when the lease lapsed first. Both are benign.
    pub async fn settle(&self, token: LockToken, outcome: &Outcome) -> Result<()> {
        self.registry.begin_settle(&token, Utc::now()).await?;

        match self.broker.settle(token, outcome.clone()).await {
            Ok(()) => {
                self.registry.finish_settle(&token, true).await;
                debug!(token = %token, outcome = %outcome, "Settled lock");
                Ok(())
            }
            Err(Error::LockExpired(_)) => {
                // The broker already gave the message to someone else.
                self.registry.finish_settle(&token, true).await;
                warn!(token = %token, outcome = %outcome, "Lock lost before settlement");
                Err(Error::LockExpired(token))
            }
            Err(e) => {
                self.registry.finish_settle(&token, false).await;
                warn!(token = %token, outcome = %outcome, error = %e, "Settlement failed, lock kept");
                Err(e)
            }
        }
    }
}
