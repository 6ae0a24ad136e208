//! Session controller: deliveries serialized under one exclusive session lock.
//!
//! A session is accepted, its lock registered like any other lease, and then
//! its deliveries are dispatched one at a time. Before each dispatch the
//! session lock must still be held. The session ends on [`MessageSession::close`],
//! cancellation, idle timeout or lock loss; the lock is released only after
//! the last delivery has been settled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::receiver::{
    LeaseContext, ReceivedMessage, Receiver, dispatch, release_undispatched, renew_messages,
    sweep_expired,
};
use crate::renewer::LeaseBatch;
use crate::registry::LeaseEntry;
use crate::traits::{Broker, ReceiveOptions, SessionHandler};
use crate::types::{LockKind, LockToken, SessionLease};

struct SessionInner {
    lease: SessionLease,
    broker: Arc<dyn Broker>,
    ctx: Arc<LeaseContext>,
    closed: CancellationToken,
    lost: AtomicBool,
}

/// Handle to an accepted session.
///
/// Clones share the same lock. State and renewal calls fail with
/// [`Error::LockExpired`] once the session lock is no longer held.
#[derive(Clone)]
pub struct MessageSession {
    inner: Arc<SessionInner>,
}

impl MessageSession {
    fn new(lease: SessionLease, broker: Arc<dyn Broker>, ctx: Arc<LeaseContext>) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                lease,
                broker,
                ctx,
                closed: CancellationToken::new(),
                lost: AtomicBool::new(false),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.lease.session_id
    }

    pub fn entity(&self) -> &str {
        &self.inner.lease.entity
    }

    pub fn lock_token(&self) -> LockToken {
        self.inner.lease.lock_token
    }

    /// Expiry of the session lock as last confirmed by the broker.
    pub async fn locked_until(&self) -> Result<DateTime<Utc>> {
        Ok(self.ensure_held().await?.expiry)
    }

    /// Opaque state stored for this session. `None` if none was ever set.
    pub async fn state(&self) -> Result<Option<Vec<u8>>> {
        self.ensure_held().await?;
        let result = self.inner.broker.get_session_state(&self.inner.lease).await;
        self.observe(result).await
    }

    /// Replace the session state.
    pub async fn set_state(&self, state: impl Into<Vec<u8>>) -> Result<()> {
        self.write_state(Some(state.into())).await
    }

    pub async fn clear_state(&self) -> Result<()> {
        self.write_state(None).await
    }

    /// Extend the session lock and return the new expiry.
    pub async fn renew_lock(&self) -> Result<DateTime<Utc>> {
        self.ensure_held().await?;
        let result = self.inner.ctx.renewer.renew_one(self.lock_token()).await;
        if matches!(result, Err(Error::LockExpired(_))) {
            self.mark_lost();
        }
        result
    }

    /// Renew the locks of messages delivered in this session.
    ///
    /// Fails with [`Error::LockExpired`] if the session lock itself is gone.
    pub async fn renew_locks(&self, messages: &[ReceivedMessage]) -> Result<()> {
        self.ensure_held().await?;
        renew_messages(messages).await.into_result()
    }

    /// Keep this session's lock and the message locks in `batch` alive every
    /// `renew_interval` until `shutdown` fires.
    ///
    /// The session lock is added to `batch`. Message tokens tracked in the
    /// batch must come from deliveries of this session.
    pub async fn spawn_renewal(
        &self,
        batch: LeaseBatch,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        batch.track(self.lock_token()).await;
        let ctx = &self.inner.ctx;
        ctx.renewer
            .spawn_periodic(ctx.config.renew_interval, batch, shutdown, None)
    }

    /// Stop dispatching. The delivery in progress is settled first, then the
    /// session lock is released.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            debug!(session_id = %self.session_id(), "Session close requested");
            self.inner.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// True once the session lock lapsed or the broker stopped recognizing it.
    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    /// Resolves when [`close`](Self::close) is called.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    async fn write_state(&self, state: Option<Vec<u8>>) -> Result<()> {
        self.ensure_held().await?;
        let result = self
            .inner
            .broker
            .set_session_state(&self.inner.lease, state)
            .await;
        self.observe(result).await
    }

    /// The registry entry of the session lock, if it is still held.
    async fn ensure_held(&self) -> Result<LeaseEntry> {
        let token = self.lock_token();
        if self.is_lost() {
            return Err(Error::LockExpired(token));
        }

        match self.inner.ctx.registry.lookup(&token).await {
            Some(entry) if !entry.is_expired(Utc::now()) => Ok(entry),
            Some(_) => {
                let _ = self.inner.ctx.registry.remove(&token).await;
                self.mark_lost();
                Err(Error::LockExpired(token))
            }
            None => {
                self.mark_lost();
                Err(Error::LockExpired(token))
            }
        }
    }

    async fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(Error::LockExpired(_))) {
            let _ = self.inner.ctx.registry.remove(&self.lock_token()).await;
            self.mark_lost();
        }
        result
    }

    fn mark_lost(&self) {
        if !self.inner.lost.swap(true, Ordering::AcqRel) && !self.is_closed() {
            warn!(
                entity = %self.entity(),
                session_id = %self.session_id(),
                token = %self.lock_token(),
                "Session lock lost"
            );
        }
    }

    /// Give the session lock back to the broker unless it is already gone.
    async fn release(&self) {
        if !self.is_lost()
            && let Err(e) = self.inner.broker.release_session(&self.inner.lease).await
        {
            warn!(session_id = %self.session_id(), error = %e, "Failed to release session lock");
        }
        let _ = self.inner.ctx.registry.remove(&self.lock_token()).await;
        info!(entity = %self.entity(), session_id = %self.session_id(), "Session closed");
    }
}

impl std::fmt::Debug for MessageSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSession")
            .field("session_id", &self.session_id())
            .field("lock_token", &self.lock_token())
            .field("closed", &self.is_closed())
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl Receiver {
    /// Accept one session and dispatch its deliveries until it is closed.
    ///
    /// With `session_id` set, a session held by another receiver fails with
    /// [`Error::SessionAcquisitionDenied`]. With `None`, waits for the next
    /// session that has messages and is not held.
    ///
    /// Returns `Ok(())` after a close or idle timeout, [`Error::Canceled`]
    /// after cancellation and [`Error::LockExpired`] if the session lock was
    /// lost.
    pub async fn receive_one_session<H>(
        &self,
        shutdown: &CancellationToken,
        session_id: Option<&str>,
        handler: &H,
    ) -> Result<()>
    where
        H: SessionHandler + ?Sized,
    {
        let entity = self.entity();
        let lease = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Err(Error::Canceled),
            lease = self.broker.accept_session(entity, session_id) => lease?,
        };
        info!(entity = %entity, session_id = %lease.session_id, "Session accepted");

        // Each session gets its own registry, dropped with the session
        let ctx = Arc::new(LeaseContext::new(
            Arc::clone(&self.broker),
            entity,
            self.ctx.config.clone(),
        ));
        ctx.registry
            .register(
                lease.lock_token,
                LockKind::Session,
                lease.locked_until,
                lease.session_id.as_str(),
            )
            .await?;
        let session = MessageSession::new(lease, Arc::clone(&self.broker), ctx);

        if let Err(e) = handler.start(&session).await {
            warn!(session_id = %session.session_id(), error = %e, "Session start failed");
            session.release().await;
            return Err(e);
        }

        let result = self.run_session(&session, shutdown, handler).await;
        session.release().await;
        handler.end().await;
        result
    }

    async fn run_session<H>(
        &self,
        session: &MessageSession,
        shutdown: &CancellationToken,
        handler: &H,
    ) -> Result<()>
    where
        H: SessionHandler + ?Sized,
    {
        let ctx = &session.inner.ctx;
        let session_id = session.session_id();
        let mut stream = self
            .broker
            .open_receiver(
                self.entity(),
                ReceiveOptions::for_session(session.inner.lease.clone()),
            )
            .await?;
        let idle_timeout = ctx.config.session_idle_timeout;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(session_id = %session_id, "Session received shutdown signal");
                    return Err(Error::Canceled);
                }
                _ = session.closed() => return Ok(()),
                next = tokio::time::timeout(idle_timeout, stream.next_delivery()) => next,
            };

            let delivery = match next {
                Err(_) => {
                    info!(session_id = %session_id, timeout = ?idle_timeout, "Session idle");
                    return Ok(());
                }
                Ok(Ok(Some(delivery))) => delivery,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(Error::LockExpired(token))) => {
                    session.mark_lost();
                    return Err(Error::LockExpired(token));
                }
                Ok(Err(e)) => {
                    error!(session_id = %session_id, error = %e, "Session receive failed");
                    return Err(e);
                }
            };

            if shutdown.is_cancelled() {
                release_undispatched(ctx, delivery).await;
                return Err(Error::Canceled);
            }
            if session.is_closed() {
                release_undispatched(ctx, delivery).await;
                return Ok(());
            }

            sweep_expired(ctx).await;
            if let Err(e) = session.ensure_held().await {
                release_undispatched(ctx, delivery).await;
                return Err(e);
            }

            if let Err(e) = dispatch(ctx, delivery, handler).await {
                error!(session_id = %session_id, error = %e, "Failed to settle delivery");
            }
        }
    }
}
