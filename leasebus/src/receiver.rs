//! Receive loop and the application-facing message handle.
//!
//! Each delivery moves through `Delivered -> Dispatched -> Settled | LockLost`.
//! The loop registers the lock, hands a [`ReceivedMessage`] to the handler and
//! applies the [`DispositionAction`] it returns through the [`Disposer`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LeaseConfig;
use crate::disposer::Disposer;
use crate::error::{Error, Result};
use crate::registry::LockRegistry;
use crate::renewer::{LeaseBatch, LeaseRenewer, RenewalReport};
use crate::traits::{Broker, DeliveryStream, Handler, ReceiveOptions};
use crate::types::{Delivery, DeliveryState, LockKind, LockToken, Message, Outcome, SequenceNumber};

/// Lease machinery scoped to one receiver or one accepted session.
pub(crate) struct LeaseContext {
    pub(crate) registry: Arc<LockRegistry>,
    pub(crate) disposer: Disposer,
    pub(crate) renewer: LeaseRenewer,
    pub(crate) config: LeaseConfig,
    pub(crate) entity: String,
}

impl LeaseContext {
    pub(crate) fn new(broker: Arc<dyn Broker>, entity: impl Into<String>, config: LeaseConfig) -> Self {
        let registry = Arc::new(LockRegistry::new());
        Self {
            disposer: Disposer::new(Arc::clone(&registry), Arc::clone(&broker)),
            renewer: LeaseRenewer::new(Arc::clone(&registry), broker, config.max_lock_horizon),
            registry,
            config,
            entity: entity.into(),
        }
    }
}

struct ReceivedInner {
    delivery: Delivery,
    state: AtomicU8,
    ctx: Weak<LeaseContext>,
}

/// A delivered message whose lock is held by this receiver.
///
/// Cheap to clone; all clones share one lifecycle state. Settlement through
/// any clone settles the message for all of them.
#[derive(Clone)]
pub struct ReceivedMessage {
    inner: Arc<ReceivedInner>,
}

impl ReceivedMessage {
    fn new(delivery: Delivery, ctx: &Arc<LeaseContext>) -> Self {
        Self {
            inner: Arc::new(ReceivedInner {
                delivery,
                state: AtomicU8::new(DeliveryState::Delivered as u8),
                ctx: Arc::downgrade(ctx),
            }),
        }
    }

    pub fn message(&self) -> &Message {
        &self.inner.delivery.message
    }

    pub fn delivery(&self) -> &Delivery {
        &self.inner.delivery
    }

    pub fn data(&self) -> &[u8] {
        &self.inner.delivery.message.data
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        self.inner.delivery.message.text()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.inner.delivery.message.group_id.as_deref()
    }

    pub fn lock_token(&self) -> LockToken {
        self.inner.delivery.lock_token
    }

    pub fn sequence_number(&self) -> SequenceNumber {
        self.inner.delivery.sequence_number
    }

    pub fn delivery_count(&self) -> u32 {
        self.inner.delivery.delivery_count
    }

    pub fn state(&self) -> DeliveryState {
        DeliveryState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub async fn complete(&self) -> Result<()> {
        self.apply(Outcome::Complete).await
    }

    pub async fn abandon(&self) -> Result<()> {
        self.apply(Outcome::Abandon).await
    }

    pub async fn defer(&self) -> Result<()> {
        self.apply(Outcome::Defer).await
    }

    pub async fn dead_letter(&self, reason: impl Into<String>) -> Result<()> {
        self.apply(Outcome::dead_letter(reason)).await
    }

    /// Settle with `outcome`.
    ///
    /// Only the first successful settlement takes effect. Later calls return
    /// [`Error::AlreadySettled`]; a lapsed lock returns [`Error::LockExpired`]
    /// and moves the message to [`DeliveryState::LockLost`].
    pub async fn apply(&self, outcome: Outcome) -> Result<()> {
        let ctx = self.context()?;
        match ctx.disposer.settle(self.lock_token(), &outcome).await {
            Ok(()) => {
                self.inner
                    .state
                    .store(DeliveryState::Settled as u8, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                if e.is_benign() {
                    self.mark_lost();
                }
                Err(e)
            }
        }
    }

    /// Extend this message's lock and return the new expiry.
    pub async fn renew_lock(&self) -> Result<DateTime<Utc>> {
        let ctx = self.context()?;
        let result = ctx.renewer.renew_one(self.lock_token()).await;
        if matches!(result, Err(Error::LockExpired(_))) {
            self.mark_lost();
        }
        result
    }

    /// Expiry of the held lock as last confirmed by the broker.
    pub async fn locked_until(&self) -> Result<DateTime<Utc>> {
        let ctx = self.context()?;
        match ctx.registry.lookup(&self.lock_token()).await {
            Some(entry) => Ok(entry.expiry),
            None if self.state() == DeliveryState::Settled => {
                Err(Error::AlreadySettled(self.lock_token()))
            }
            None => Err(Error::LockExpired(self.lock_token())),
        }
    }

    fn context(&self) -> Result<Arc<LeaseContext>> {
        self.inner.ctx.upgrade().ok_or(Error::ReceiverClosed)
    }

    fn mark_dispatched(&self) {
        let _ = self.inner.state.compare_exchange(
            DeliveryState::Delivered as u8,
            DeliveryState::Dispatched as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Move a not yet settled message to `LockLost`. Settled stays settled.
    fn mark_lost(&self) {
        let _ = self
            .inner
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!DeliveryState::from_u8(current).is_terminal())
                    .then_some(DeliveryState::LockLost as u8)
            });
    }
}

impl std::fmt::Debug for ReceivedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceivedMessage")
            .field("lock_token", &self.lock_token())
            .field("sequence_number", &self.sequence_number())
            .field("state", &self.state())
            .finish()
    }
}

/// What the receive loop does with a message once the handler returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispositionAction {
    /// Settle with the outcome right away.
    Settle(Outcome),
    /// Leave the lock held; the application settles the message itself.
    Retain,
}

impl DispositionAction {
    pub fn complete() -> Self {
        Self::Settle(Outcome::Complete)
    }

    pub fn abandon() -> Self {
        Self::Settle(Outcome::Abandon)
    }

    pub fn defer() -> Self {
        Self::Settle(Outcome::Defer)
    }

    pub fn dead_letter(reason: impl Into<String>) -> Self {
        Self::Settle(Outcome::dead_letter(reason))
    }

    pub fn retain() -> Self {
        Self::Retain
    }

    /// Carry out the action against `message`.
    pub async fn execute(self, message: &ReceivedMessage) -> Result<()> {
        match self {
            Self::Settle(outcome) => message.apply(outcome).await,
            Self::Retain => Ok(()),
        }
    }
}

/// Register a delivery, run the handler on it and apply the returned action.
///
/// Benign settlement races are logged and swallowed. A handler that panics
/// leaves the lock to expire.
pub(crate) async fn dispatch<H>(ctx: &Arc<LeaseContext>, delivery: Delivery, handler: &H) -> Result<()>
where
    H: Handler + ?Sized,
{
    let token = delivery.lock_token;
    ctx.registry
        .register(token, LockKind::Message, delivery.locked_until, ctx.entity.as_str())
        .await?;

    let message = ReceivedMessage::new(delivery, ctx);
    message.mark_dispatched();
    debug!(
        entity = %ctx.entity,
        token = %token,
        sequence_number = message.sequence_number(),
        delivery_count = message.delivery_count(),
        "Dispatching delivery"
    );

    let action = match AssertUnwindSafe(handler.handle(message.clone()))
        .catch_unwind()
        .await
    {
        Ok(action) => action,
        Err(_) => {
            error!(entity = %ctx.entity, token = %token, "Handler panicked, lock left to expire");
            return Ok(());
        }
    };

    if action == DispositionAction::Retain {
        debug!(entity = %ctx.entity, token = %token, "Handler retained lock");
        return Ok(());
    }

    match action.execute(&message).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_benign() => {
            debug!(entity = %ctx.entity, token = %token, error = %e, "Settlement raced lock loss");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Give back a delivery that was pulled but never dispatched.
pub(crate) async fn release_undispatched(ctx: &LeaseContext, delivery: Delivery) {
    if !ctx.config.abandon_on_cancel {
        return;
    }
    let token = delivery.lock_token;
    let registered = ctx
        .registry
        .register(token, LockKind::Message, delivery.locked_until, ctx.entity.as_str())
        .await;
    if registered.is_ok()
        && let Err(e) = ctx.disposer.settle(token, &Outcome::Abandon).await
    {
        debug!(entity = %ctx.entity, token = %token, error = %e, "Could not abandon undispatched delivery");
    }
}

/// Renew `messages` in one batch per issuing context.
///
/// Messages from a receiver or session that no longer exists fail with
/// [`Error::ReceiverClosed`]. Messages whose lock the broker no longer
/// recognizes move to [`DeliveryState::LockLost`].
pub(crate) async fn renew_messages(messages: &[ReceivedMessage]) -> RenewalReport {
    let mut report = RenewalReport::default();
    let mut groups: Vec<(Arc<LeaseContext>, Vec<LockToken>)> = Vec::new();
    for message in messages {
        let token = message.lock_token();
        let Ok(ctx) = message.context() else {
            report.failures.insert(token, Error::ReceiverClosed);
            continue;
        };
        match groups.iter_mut().find(|(held, _)| Arc::ptr_eq(held, &ctx)) {
            Some((_, tokens)) => tokens.push(token),
            None => groups.push((ctx, vec![token])),
        }
    }

    let reports = join_all(groups.iter().map(|(ctx, tokens)| ctx.renewer.renew(tokens))).await;
    for partial in reports {
        report.merge(partial);
    }

    for message in messages {
        if matches!(
            report.failures.get(&message.lock_token()),
            Some(Error::LockExpired(_))
        ) {
            message.mark_lost();
        }
    }
    report
}

/// Evict locks that lapsed without settlement.
pub(crate) async fn sweep_expired(ctx: &LeaseContext) {
    for entry in ctx.registry.sweep_expired(Utc::now()).await {
        warn!(
            entity = %ctx.entity,
            token = %entry.token,
            kind = %entry.kind,
            expiry = %entry.expiry,
            "Lock expired before settlement"
        );
    }
}

/// Peek-lock receiver for one entity.
pub struct Receiver {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) ctx: Arc<LeaseContext>,
}

impl Receiver {
    pub fn new(broker: Arc<dyn Broker>, entity: impl Into<String>, config: LeaseConfig) -> Self {
        let ctx = Arc::new(LeaseContext::new(Arc::clone(&broker), entity, config));
        Self { broker, ctx }
    }

    pub fn entity(&self) -> &str {
        &self.ctx.entity
    }

    pub fn config(&self) -> &LeaseConfig {
        &self.ctx.config
    }

    /// Registry of the message locks this receiver holds.
    pub fn registry(&self) -> &Arc<LockRegistry> {
        &self.ctx.registry
    }

    pub fn renewer(&self) -> &LeaseRenewer {
        &self.ctx.renewer
    }

    /// Pull and dispatch deliveries until `shutdown` fires or the link closes.
    ///
    /// Returns [`Error::Canceled`] after cancellation. A handler already
    /// running when cancellation is observed is allowed to finish.
    pub async fn receive<H>(&self, shutdown: &CancellationToken, handler: &H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let entity = self.entity();
        let mut stream = self
            .broker
            .open_receiver(entity, ReceiveOptions::default())
            .await?;
        info!(entity = %entity, "Receiver started");

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(entity = %entity, "Receiver received shutdown signal");
                    break Err(Error::Canceled);
                }
                next = stream.next_delivery() => next,
            };

            match next {
                Ok(Some(delivery)) => {
                    if shutdown.is_cancelled() {
                        info!(entity = %entity, "Receiver received shutdown signal");
                        release_undispatched(&self.ctx, delivery).await;
                        break Err(Error::Canceled);
                    }
                    sweep_expired(&self.ctx).await;
                    if let Err(e) = dispatch(&self.ctx, delivery, handler).await {
                        error!(entity = %entity, error = %e, "Failed to settle delivery");
                    }
                }
                Ok(None) => {
                    info!(entity = %entity, "Receiver link closed");
                    break Ok(());
                }
                Err(e) => {
                    error!(entity = %entity, error = %e, "Receive failed");
                    // Back off on error
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => break Err(Error::Canceled),
                        _ = tokio::time::sleep(self.ctx.config.error_backoff) => {}
                    }
                }
            }
        };

        info!(entity = %entity, "Receiver stopped");
        result
    }

    /// Pull one delivery and dispatch it.
    pub async fn receive_one<H>(&self, shutdown: &CancellationToken, handler: &H) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        let mut stream = self
            .broker
            .open_receiver(self.entity(), ReceiveOptions::default())
            .await?;
        let delivery = next_or_cancel(stream.as_mut(), shutdown).await?;
        if shutdown.is_cancelled() {
            release_undispatched(&self.ctx, delivery).await;
            return Err(Error::Canceled);
        }
        dispatch(&self.ctx, delivery, handler).await
    }

    /// Lock deferred messages again by sequence number and dispatch them in
    /// the order given.
    pub async fn receive_deferred<H>(
        &self,
        shutdown: &CancellationToken,
        sequence_numbers: &[SequenceNumber],
        handler: &H,
    ) -> Result<()>
    where
        H: Handler + ?Sized,
    {
        for &sequence_number in sequence_numbers {
            if shutdown.is_cancelled() {
                return Err(Error::Canceled);
            }
            let delivery = self
                .broker
                .receive_deferred(self.entity(), sequence_number)
                .await?;
            debug!(entity = %self.entity(), sequence_number, "Received deferred message");
            dispatch(&self.ctx, delivery, handler).await?;
        }
        Ok(())
    }

    /// Renew the locks of `messages` in one batch.
    ///
    /// Each message is renewed through the receiver or session that delivered
    /// it. Messages settled in the meantime are skipped silently. Any other
    /// failure is returned as [`Error::Renewal`] with one entry per token;
    /// the remaining locks are still renewed.
    pub async fn renew_locks(&self, messages: &[ReceivedMessage]) -> Result<()> {
        renew_messages(messages).await.into_result()
    }

    /// Keep the locks in `batch` alive every `renew_interval` until
    /// `shutdown` fires.
    ///
    /// Only locks delivered by this receiver outside of sessions can be kept
    /// alive here; use [`MessageSession::spawn_renewal`] for session
    /// deliveries and the session lock.
    ///
    /// [`MessageSession::spawn_renewal`]: crate::MessageSession::spawn_renewal
    pub fn spawn_renewal(&self, batch: LeaseBatch, shutdown: CancellationToken) -> JoinHandle<()> {
        self.ctx
            .renewer
            .spawn_periodic(self.ctx.config.renew_interval, batch, shutdown, None)
    }
}

async fn next_or_cancel(
    stream: &mut dyn DeliveryStream,
    shutdown: &CancellationToken,
) -> Result<Delivery> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(Error::Canceled),
        next = stream.next_delivery() => next?.ok_or(Error::ReceiverClosed),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::QueueOptions;
    use crate::memory::InMemoryBroker;
    use crate::traits::HandlerFn;
    use crate::types::SessionLease;

    async fn setup(options: QueueOptions) -> (Arc<InMemoryBroker>, Receiver) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_queue("orders", options).await;
        let receiver = Receiver::new(broker.clone(), "orders", LeaseConfig::default());
        (broker, receiver)
    }

    async fn send(broker: &InMemoryBroker, texts: &[&str]) {
        for text in texts {
            broker
                .send("orders", Message::from_string(*text))
                .await
                .unwrap();
        }
    }

    fn cancel_after(ms: u64) -> CancellationToken {
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            canceller.cancel();
        });
        shutdown
    }

    #[tokio::test]
    async fn receive_completes_every_message_once() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["a", "b", "c"]).await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = HandlerFn::new({
            let seen = Arc::clone(&seen);
            move |msg: ReceivedMessage| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(msg.text().unwrap_or_default().to_string());
                    DispositionAction::complete()
                }
            }
        });

        let result = receiver.receive(&cancel_after(200), &handler).await;

        assert!(matches!(result, Err(Error::Canceled)));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(broker.active_count("orders").await, 0);
        assert!(receiver.registry().is_empty().await);
    }

    #[tokio::test]
    async fn retained_message_is_settled_later() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["keep"]).await;

        let kept = Arc::new(Mutex::new(None));
        let handler = HandlerFn::new({
            let kept = Arc::clone(&kept);
            move |msg: ReceivedMessage| {
                let kept = Arc::clone(&kept);
                async move {
                    *kept.lock().unwrap() = Some(msg);
                    DispositionAction::retain()
                }
            }
        });

        receiver
            .receive_one(&CancellationToken::new(), &handler)
            .await
            .unwrap();

        let msg = kept.lock().unwrap().take().unwrap();
        assert_eq!(msg.state(), DeliveryState::Dispatched);
        assert_eq!(broker.active_count("orders").await, 1);
        assert!(msg.locked_until().await.unwrap() > Utc::now());

        msg.complete().await.unwrap();
        assert_eq!(msg.state(), DeliveryState::Settled);
        assert_eq!(broker.active_count("orders").await, 0);

        // Re-settling is a benign error, not a second settlement
        let err = msg.abandon().await.unwrap_err();
        assert!(err.is_already_settled());
        assert_eq!(msg.state(), DeliveryState::Settled);
        assert!(msg.locked_until().await.unwrap_err().is_already_settled());
    }

    #[tokio::test]
    async fn lapsed_lock_moves_message_to_lock_lost() {
        let (broker, receiver) =
            setup(QueueOptions::default().with_lock_duration(Duration::from_millis(50))).await;
        send(&broker, &["slow"]).await;

        let kept = Arc::new(Mutex::new(None));
        let handler = HandlerFn::new({
            let kept = Arc::clone(&kept);
            move |msg: ReceivedMessage| {
                let kept = Arc::clone(&kept);
                async move {
                    *kept.lock().unwrap() = Some(msg);
                    DispositionAction::retain()
                }
            }
        });
        receiver
            .receive_one(&CancellationToken::new(), &handler)
            .await
            .unwrap();
        let msg = kept.lock().unwrap().take().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let err = msg.complete().await.unwrap_err();
        assert!(err.is_benign());
        assert_eq!(msg.state(), DeliveryState::LockLost);
        // The broker hands the message out again
        assert_eq!(broker.active_count("orders").await, 1);
    }

    #[tokio::test]
    async fn abandoned_message_is_redelivered() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["retry"]).await;

        let counts = Arc::new(Mutex::new(Vec::new()));
        let handler = HandlerFn::new({
            let counts = Arc::clone(&counts);
            move |msg: ReceivedMessage| {
                let counts = Arc::clone(&counts);
                async move {
                    counts.lock().unwrap().push(msg.delivery_count());
                    if msg.delivery_count() == 1 {
                        DispositionAction::abandon()
                    } else {
                        DispositionAction::complete()
                    }
                }
            }
        });

        let _ = receiver.receive(&cancel_after(200), &handler).await;

        assert_eq!(*counts.lock().unwrap(), vec![1, 2]);
        assert_eq!(broker.active_count("orders").await, 0);
    }

    #[derive(Default)]
    struct Counting(AtomicUsize);

    #[async_trait]
    impl Handler for Counting {
        async fn handle(&self, _message: ReceivedMessage) -> DispositionAction {
            self.0.fetch_add(1, Ordering::SeqCst);
            DispositionAction::complete()
        }
    }

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn handle(&self, _message: ReceivedMessage) -> DispositionAction {
            panic!("handler failure")
        }
    }

    #[tokio::test]
    async fn cancellation_stops_dispatch() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["never"]).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let handler = Counting::default();
        let err = receiver.receive(&shutdown, &handler).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(handler.0.load(Ordering::SeqCst), 0);
        assert_eq!(broker.active_count("orders").await, 1);
    }

    /// Fires `shutdown` from inside the handler, then finishes its work.
    struct CancelsMidway {
        shutdown: CancellationToken,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CancelsMidway {
        async fn handle(&self, _message: ReceivedMessage) -> DispositionAction {
            self.handled.fetch_add(1, Ordering::SeqCst);
            self.shutdown.cancel();
            tokio::time::sleep(Duration::from_millis(20)).await;
            DispositionAction::complete()
        }
    }

    #[tokio::test]
    async fn in_flight_handler_settles_before_cancel_returns() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["first", "second"]).await;
        let shutdown = CancellationToken::new();
        let handler = CancelsMidway {
            shutdown: shutdown.clone(),
            handled: AtomicUsize::new(0),
        };

        let err = receiver.receive(&shutdown, &handler).await.unwrap_err();

        assert!(err.is_canceled());
        assert_eq!(handler.handled.load(Ordering::SeqCst), 1);
        // The first message was completed, the second never pulled
        assert_eq!(broker.active_count("orders").await, 1);
        assert!(receiver.registry().is_empty().await);
    }

    /// Broker whose receiver link fires `shutdown` right before yielding.
    struct CancelOnDelivery {
        inner: Arc<InMemoryBroker>,
        shutdown: CancellationToken,
        pulled: Arc<Mutex<Vec<LockToken>>>,
    }

    struct CancelingStream {
        inner: Box<dyn DeliveryStream>,
        shutdown: CancellationToken,
        pulled: Arc<Mutex<Vec<LockToken>>>,
    }

    #[async_trait]
    impl DeliveryStream for CancelingStream {
        async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
            let next = self.inner.next_delivery().await?;
            if let Some(delivery) = &next {
                self.pulled.lock().unwrap().push(delivery.lock_token);
            }
            self.shutdown.cancel();
            Ok(next)
        }
    }

    #[async_trait]
    impl Broker for CancelOnDelivery {
        async fn send(&self, entity: &str, message: Message) -> Result<()> {
            self.inner.send(entity, message).await
        }
        async fn open_receiver(
            &self,
            entity: &str,
            options: ReceiveOptions,
        ) -> Result<Box<dyn DeliveryStream>> {
            Ok(Box::new(CancelingStream {
                inner: self.inner.open_receiver(entity, options).await?,
                shutdown: self.shutdown.clone(),
                pulled: Arc::clone(&self.pulled),
            }))
        }
        async fn renew_message_lock(&self, token: LockToken) -> Result<DateTime<Utc>> {
            self.inner.renew_message_lock(token).await
        }
        async fn renew_session_lock(&self, token: LockToken) -> Result<DateTime<Utc>> {
            self.inner.renew_session_lock(token).await
        }
        async fn settle(&self, token: LockToken, outcome: Outcome) -> Result<()> {
            self.inner.settle(token, outcome).await
        }
        async fn accept_session(
            &self,
            entity: &str,
            session_id: Option<&str>,
        ) -> Result<SessionLease> {
            self.inner.accept_session(entity, session_id).await
        }
        async fn release_session(&self, session: &SessionLease) -> Result<()> {
            self.inner.release_session(session).await
        }
        async fn get_session_state(&self, session: &SessionLease) -> Result<Option<Vec<u8>>> {
            self.inner.get_session_state(session).await
        }
        async fn set_session_state(
            &self,
            session: &SessionLease,
            state: Option<Vec<u8>>,
        ) -> Result<()> {
            self.inner.set_session_state(session, state).await
        }
        async fn receive_deferred(
            &self,
            entity: &str,
            sequence_number: SequenceNumber,
        ) -> Result<Delivery> {
            self.inner.receive_deferred(entity, sequence_number).await
        }
    }

    /// Run the receive loop over a link that cancels as it delivers.
    async fn pull_after_cancel(
        abandon_on_cancel: bool,
    ) -> (Arc<InMemoryBroker>, Arc<LockRegistry>, LockToken, usize) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_queue("orders", QueueOptions::default()).await;
        send(&broker, &["late"]).await;

        let shutdown = CancellationToken::new();
        let pulled = Arc::new(Mutex::new(Vec::new()));
        let link = CancelOnDelivery {
            inner: broker.clone(),
            shutdown: shutdown.clone(),
            pulled: Arc::clone(&pulled),
        };
        let receiver = Receiver::new(
            Arc::new(link),
            "orders",
            LeaseConfig::default().with_abandon_on_cancel(abandon_on_cancel),
        );

        let handler = Counting::default();
        let err = receiver.receive(&shutdown, &handler).await.unwrap_err();
        assert!(err.is_canceled());

        let token = pulled.lock().unwrap()[0];
        let registry = Arc::clone(receiver.registry());
        (broker, registry, token, handler.0.load(Ordering::SeqCst))
    }

    #[tokio::test]
    async fn delivery_pulled_after_cancel_is_abandoned() {
        let (broker, registry, token, handled) = pull_after_cancel(true).await;

        assert_eq!(handled, 0);
        assert!(registry.is_empty().await);
        // Given back to the broker, so the lock is gone
        assert!(matches!(
            broker.renew_message_lock(token).await,
            Err(Error::LockExpired(_))
        ));
        assert_eq!(broker.active_count("orders").await, 1);
    }

    #[tokio::test]
    async fn delivery_pulled_after_cancel_keeps_lock_without_abandon() {
        let (broker, registry, token, handled) = pull_after_cancel(false).await;

        assert_eq!(handled, 0);
        assert!(registry.is_empty().await);
        // Left locked until it lapses on its own
        broker.renew_message_lock(token).await.unwrap();
        assert_eq!(broker.active_count("orders").await, 1);
    }

    #[tokio::test]
    async fn panicking_handler_leaves_lock_to_expire() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["boom"]).await;

        receiver
            .receive_one(&CancellationToken::new(), &Panics)
            .await
            .unwrap();

        assert_eq!(receiver.registry().len().await, 1);
        assert_eq!(broker.active_count("orders").await, 1);
    }

    #[tokio::test]
    async fn deferred_messages_are_dispatched_by_sequence_number() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["first", "second"]).await;

        let deferred = Arc::new(Mutex::new(Vec::new()));
        let defer_all = HandlerFn::new({
            let deferred = Arc::clone(&deferred);
            move |msg: ReceivedMessage| {
                let deferred = Arc::clone(&deferred);
                async move {
                    deferred.lock().unwrap().push(msg.sequence_number());
                    DispositionAction::defer()
                }
            }
        });
        let _ = receiver.receive(&cancel_after(150), &defer_all).await;
        assert_eq!(broker.deferred_count("orders").await, 2);

        // Retrieve in reverse order
        let mut sequence_numbers = deferred.lock().unwrap().clone();
        sequence_numbers.reverse();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let complete_all = HandlerFn::new({
            let seen = Arc::clone(&seen);
            move |msg: ReceivedMessage| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(msg.text().unwrap_or_default().to_string());
                    DispositionAction::complete()
                }
            }
        });
        receiver
            .receive_deferred(&CancellationToken::new(), &sequence_numbers, &complete_all)
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["second", "first"]);
        assert_eq!(broker.deferred_count("orders").await, 0);
    }

    #[tokio::test]
    async fn renew_locks_ignores_settled_messages() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["a", "b"]).await;

        let kept = Arc::new(Mutex::new(Vec::new()));
        let handler = HandlerFn::new({
            let kept = Arc::clone(&kept);
            move |msg: ReceivedMessage| {
                let kept = Arc::clone(&kept);
                async move {
                    kept.lock().unwrap().push(msg);
                    DispositionAction::retain()
                }
            }
        });
        for _ in 0..2 {
            receiver
                .receive_one(&CancellationToken::new(), &handler)
                .await
                .unwrap();
        }
        let messages = kept.lock().unwrap().clone();

        messages[0].complete().await.unwrap();
        receiver.renew_locks(&messages).await.unwrap();

        let renewed = messages[1].renew_lock().await.unwrap();
        assert_eq!(messages[1].locked_until().await.unwrap(), renewed);
    }

    #[tokio::test]
    async fn renew_locks_reports_broker_failures() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["a", "b"]).await;

        let kept = Arc::new(Mutex::new(Vec::new()));
        let handler = HandlerFn::new({
            let kept = Arc::clone(&kept);
            move |msg: ReceivedMessage| {
                let kept = Arc::clone(&kept);
                async move {
                    kept.lock().unwrap().push(msg);
                    DispositionAction::retain()
                }
            }
        });
        for _ in 0..2 {
            receiver
                .receive_one(&CancellationToken::new(), &handler)
                .await
                .unwrap();
        }
        let messages = kept.lock().unwrap().clone();
        broker.fail_renewals_for(messages[0].lock_token()).await;

        match receiver.renew_locks(&messages).await {
            Err(Error::Renewal(errors)) => {
                assert_eq!(errors.len(), 1);
                assert!(errors.get(&messages[0].lock_token()).is_some());
            }
            other => panic!("expected renewal errors, got {other:?}"),
        }
        // The healthy lock is still held
        messages[1].complete().await.unwrap();
    }

    #[tokio::test]
    async fn settlement_after_receiver_drop_is_closed() {
        let (broker, receiver) = setup(QueueOptions::default()).await;
        send(&broker, &["orphan"]).await;

        let kept = Arc::new(Mutex::new(None));
        let handler = HandlerFn::new({
            let kept = Arc::clone(&kept);
            move |msg: ReceivedMessage| {
                let kept = Arc::clone(&kept);
                async move {
                    *kept.lock().unwrap() = Some(msg);
                    DispositionAction::retain()
                }
            }
        });
        receiver
            .receive_one(&CancellationToken::new(), &handler)
            .await
            .unwrap();
        drop(receiver);

        let msg = kept.lock().unwrap().take().unwrap();
        assert!(matches!(msg.complete().await, Err(Error::ReceiverClosed)));
    }
}
