//! Seams between the lease engine, the broker and the application.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::receiver::{DispositionAction, ReceivedMessage};
use crate::session::MessageSession;
use crate::types::{Delivery, LockToken, Message, Outcome, SequenceNumber, SessionLease};

/// Options for opening a receiver link.
#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    /// Restrict deliveries to an accepted session.
    pub session: Option<SessionLease>,
}

impl ReceiveOptions {
    pub fn for_session(lease: SessionLease) -> Self {
        Self {
            session: Some(lease),
        }
    }
}

/// Broker operations over an already authenticated connection.
///
/// Implementations report a lock the broker no longer recognizes as
/// [`Error::LockExpired`](crate::Error::LockExpired) and a session held
/// elsewhere as
/// [`Error::SessionAcquisitionDenied`](crate::Error::SessionAcquisitionDenied).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue a message on an entity.
    async fn send(&self, entity: &str, message: Message) -> crate::Result<()>;

    /// Open a peek-lock receiver on an entity.
    async fn open_receiver(
        &self,
        entity: &str,
        options: ReceiveOptions,
    ) -> crate::Result<Box<dyn DeliveryStream>>;

    /// Extend a message lock, returning the new expiry.
    async fn renew_message_lock(&self, token: LockToken) -> crate::Result<DateTime<Utc>>;

    /// Extend a session lock, returning the new expiry.
    async fn renew_session_lock(&self, token: LockToken) -> crate::Result<DateTime<Utc>>;

    /// Apply a terminal outcome to a message lock.
    async fn settle(&self, token: LockToken, outcome: Outcome) -> crate::Result<()>;

    /// Accept a named session, or the next available one when `session_id`
    /// is `None`.
    async fn accept_session(
        &self,
        entity: &str,
        session_id: Option<&str>,
    ) -> crate::Result<SessionLease>;

    /// Release a session lock so other receivers can accept it.
    async fn release_session(&self, session: &SessionLease) -> crate::Result<()>;

    /// Read the opaque state stored for a session.
    async fn get_session_state(&self, session: &SessionLease) -> crate::Result<Option<Vec<u8>>>;

    /// Replace the opaque state stored for a session.
    async fn set_session_state(
        &self,
        session: &SessionLease,
        state: Option<Vec<u8>>,
    ) -> crate::Result<()>;

    /// Lock a deferred message again by its sequence number.
    async fn receive_deferred(
        &self,
        entity: &str,
        sequence_number: SequenceNumber,
    ) -> crate::Result<Delivery>;
}

/// A receiver link yielding peek-locked deliveries.
///
/// `next_delivery` must be cancel safe: dropping the future before it
/// resolves must not lock a message.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Wait for the next delivery. `Ok(None)` means the link was closed.
    async fn next_delivery(&mut self) -> crate::Result<Option<Delivery>>;
}

/// Application callback invoked once per delivery.
///
/// The returned action is applied by the receive loop. Returning
/// [`DispositionAction::Retain`] leaves settlement to the application,
/// which keeps the [`ReceivedMessage`] and settles it later.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: ReceivedMessage) -> DispositionAction;
}

/// Handler for the deliveries of one accepted session.
#[async_trait]
pub trait SessionHandler: Handler {
    /// Called once the session lock is held, before the first delivery.
    /// An error aborts the session.
    async fn start(&self, session: &MessageSession) -> crate::Result<()>;

    /// Called after the session lock has been released.
    async fn end(&self) {}
}

/// Adapts an async closure into a [`Handler`].
pub struct HandlerFn<F>(F);

impl<F, Fut> HandlerFn<F>
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = DispositionAction> + Send,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(ReceivedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = DispositionAction> + Send,
{
    async fn handle(&self, message: ReceivedMessage) -> DispositionAction {
        (self.0)(message).await
    }
}

/// Builds a [`SessionHandler`] from a message handler plus start and end
/// callbacks.
pub struct FnSessionHandler<H, S, E> {
    handler: H,
    start: S,
    end: E,
}

impl<H, S, E> FnSessionHandler<H, S, E>
where
    H: Handler,
    S: Fn(&MessageSession) -> crate::Result<()> + Send + Sync,
    E: Fn() + Send + Sync,
{
    pub fn new(handler: H, start: S, end: E) -> Self {
        Self {
            handler,
            start,
            end,
        }
    }
}

#[async_trait]
impl<H, S, E> Handler for FnSessionHandler<H, S, E>
where
    H: Handler,
    S: Fn(&MessageSession) -> crate::Result<()> + Send + Sync,
    E: Fn() + Send + Sync,
{
    async fn handle(&self, message: ReceivedMessage) -> DispositionAction {
        self.handler.handle(message).await
    }
}

#[async_trait]
impl<H, S, E> SessionHandler for FnSessionHandler<H, S, E>
where
    H: Handler,
    S: Fn(&MessageSession) -> crate::Result<()> + Send + Sync,
    E: Fn() + Send + Sync,
{
    async fn start(&self, session: &MessageSession) -> crate::Result<()> {
        (self.start)(session)
    }

    async fn end(&self) {
        (self.end)();
    }
}
