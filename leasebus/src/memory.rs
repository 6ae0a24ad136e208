//! In-memory broker implementation for testing.
//!
//! Behaves like a peek-lock queue broker without any network:
//! - deliveries are locked for the entity's lock duration and return to the
//!   queue when the lock lapses
//! - messages past their TTL are dropped
//! - messages delivered `max_delivery_count` times are dead-lettered
//! - deferred messages are only reachable by sequence number
//! - session locks are exclusive and carry opaque persisted state
//!
//! Lapsed locks are reclaimed lazily on every operation touching an entity.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::traits::{Broker, DeliveryStream, ReceiveOptions};
use crate::types::{
    Delivery, LockToken, Message, Outcome, SequenceNumber, SessionLease, expiry_after,
};

/// How often a waiting receiver rechecks for lapsed locks.
const RECLAIM_POLL: Duration = Duration::from_millis(25);

/// Property set on messages dead-lettered with a reason.
pub const DEAD_LETTER_REASON: &str = "DeadLetterReason";
/// Property set on messages dead-lettered with a description.
pub const DEAD_LETTER_DESCRIPTION: &str = "DeadLetterErrorDescription";

#[derive(Clone)]
struct StoredMessage {
    message: Message,
    sequence_number: SequenceNumber,
    enqueued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    delivery_count: u32,
}

impl StoredMessage {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

struct LockedMessage {
    stored: StoredMessage,
    locked_until: DateTime<Utc>,
}

struct SessionHolder {
    token: LockToken,
    locked_until: DateTime<Utc>,
}

#[derive(Default)]
struct SessionSlot {
    state: Option<Vec<u8>>,
    holder: Option<SessionHolder>,
}

struct QueueState {
    options: QueueOptions,
    available: BTreeMap<SequenceNumber, StoredMessage>,
    locked: HashMap<LockToken, LockedMessage>,
    deferred: BTreeMap<SequenceNumber, StoredMessage>,
    dead_letter: Vec<StoredMessage>,
    sessions: HashMap<String, SessionSlot>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            available: BTreeMap::new(),
            locked: HashMap::new(),
            deferred: BTreeMap::new(),
            dead_letter: Vec::new(),
            sessions: HashMap::new(),
        }
    }

    /// Return lapsed message locks to the queue, drop lapsed session holders
    /// and expired messages. Returns the tokens of every lapsed lock.
    fn reclaim(&mut self, now: DateTime<Utc>) -> Vec<LockToken> {
        let mut lapsed: Vec<LockToken> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.locked_until <= now)
            .map(|(token, _)| *token)
            .collect();
        for token in &lapsed {
            if let Some(locked) = self.locked.remove(token) {
                trace!(token = %token, "Message lock lapsed");
                self.requeue(locked.stored);
            }
        }

        for slot in self.sessions.values_mut() {
            if let Some(holder) = slot.holder.take_if(|h| h.locked_until <= now) {
                trace!(token = %holder.token, "Session lock lapsed");
                lapsed.push(holder.token);
            }
        }

        self.available.retain(|_, stored| !stored.is_expired(now));
        lapsed
    }

    /// Put a message back, or dead-letter it once its deliveries are used up.
    fn requeue(&mut self, mut stored: StoredMessage) {
        if stored.delivery_count >= self.options.max_delivery_count {
            stored.message.properties.insert(
                DEAD_LETTER_REASON.to_string(),
                "MaxDeliveryCountExceeded".into(),
            );
            self.dead_letter.push(stored);
        } else {
            self.available.insert(stored.sequence_number, stored);
        }
    }

    fn session_held_by(&self, session_id: &str, token: &LockToken, now: DateTime<Utc>) -> bool {
        self.sessions
            .get(session_id)
            .and_then(|slot| slot.holder.as_ref())
            .is_some_and(|h| h.token == *token && h.locked_until > now)
    }

    fn session_is_free(&self, session_id: &str) -> bool {
        self.sessions
            .get(session_id)
            .is_none_or(|slot| slot.holder.is_none())
    }

    fn next_available(&self, session_id: Option<&str>) -> Option<SequenceNumber> {
        self.available
            .values()
            .find(|stored| match session_id {
                Some(id) => stored.message.group_id.as_deref() == Some(id),
                None => true,
            })
            .map(|stored| stored.sequence_number)
    }

    fn lock(&mut self, mut stored: StoredMessage, now: DateTime<Utc>, tag: u64) -> Delivery {
        stored.delivery_count += 1;
        let token = LockToken::new();
        let locked_until = expiry_after(now, self.options.lock_duration);
        let delivery = Delivery {
            message: stored.message.clone(),
            lock_token: token,
            locked_until,
            sequence_number: stored.sequence_number,
            delivery_count: stored.delivery_count,
            delivery_tag: tag,
            enqueued_at: stored.enqueued_at,
        };
        self.locked.insert(
            token,
            LockedMessage {
                stored,
                locked_until,
            },
        );
        delivery
    }

    fn acquire_session(&mut self, session_id: &str, now: DateTime<Utc>) -> (LockToken, DateTime<Utc>) {
        let token = LockToken::new();
        let locked_until = expiry_after(now, self.options.lock_duration);
        self.sessions.entry(session_id.to_string()).or_default().holder = Some(SessionHolder {
            token,
            locked_until,
        });
        (token, locked_until)
    }

    fn active_count(&self) -> usize {
        self.available.len() + self.locked.len()
    }
}

enum LockOwner {
    Message { entity: String },
    Session { entity: String, session_id: String },
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    /// Owner of every lock currently held.
    locks: HashMap<LockToken, LockOwner>,
    next_sequence: SequenceNumber,
    next_tag: u64,
    settle_failures: u32,
    failing_renewals: HashSet<LockToken>,
}

impl BrokerState {
    fn queue_mut(&mut self, entity: &str, now: DateTime<Utc>) -> Result<&mut QueueState> {
        let queue = self
            .queues
            .get_mut(entity)
            .ok_or_else(|| Error::Broker(format!("entity '{entity}' not found")))?;
        for token in queue.reclaim(now) {
            self.locks.remove(&token);
        }
        Ok(queue)
    }

    fn message_entity(&self, token: &LockToken) -> Result<String> {
        match self.locks.get(token) {
            Some(LockOwner::Message { entity }) => Ok(entity.clone()),
            _ => Err(Error::LockExpired(*token)),
        }
    }

    fn session_owner(&self, token: &LockToken) -> Result<(String, String)> {
        match self.locks.get(token) {
            Some(LockOwner::Session { entity, session_id }) => {
                Ok((entity.clone(), session_id.clone()))
            }
            _ => Err(Error::LockExpired(*token)),
        }
    }

    fn next_tag(&mut self) -> u64 {
        self.next_tag += 1;
        self.next_tag
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    async fn try_deliver(
        &self,
        entity: &str,
        session: Option<&SessionLease>,
    ) -> Result<Option<Delivery>> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();
        let tag = state.next_tag();
        let queue = state.queue_mut(entity, now)?;

        if let Some(lease) = session
            && !queue.session_held_by(&lease.session_id, &lease.lock_token, now)
        {
            return Err(Error::LockExpired(lease.lock_token));
        }

        let session_id = session.map(|lease| lease.session_id.as_str());
        let Some(stored) = queue
            .next_available(session_id)
            .and_then(|seq| queue.available.remove(&seq))
        else {
            return Ok(None);
        };

        let delivery = queue.lock(stored, now, tag);
        state.locks.insert(
            delivery.lock_token,
            LockOwner::Message {
                entity: entity.to_string(),
            },
        );
        trace!(
            entity = %entity,
            sequence_number = delivery.sequence_number,
            token = %delivery.lock_token,
            "Locked message for delivery"
        );
        Ok(Some(delivery))
    }
}

/// In-memory implementation of [`Broker`] for testing.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    /// Create a broker with no entities.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Create an entity. An existing entity of the same name is kept as is.
    pub async fn create_queue(&self, entity: impl Into<String>, options: QueueOptions) {
        let entity = entity.into();
        let mut state = self.shared.state.lock().await;
        if !state.queues.contains_key(&entity) {
            debug!(entity = %entity, sessions = options.requires_session, "Created queue");
            state.queues.insert(entity, QueueState::new(options));
        }
    }

    /// Messages still on the entity: available plus locked.
    pub async fn active_count(&self, entity: &str) -> usize {
        self.with_queue(entity, |q| q.active_count()).await
    }

    pub async fn dead_letter_count(&self, entity: &str) -> usize {
        self.with_queue(entity, |q| q.dead_letter.len()).await
    }

    pub async fn deferred_count(&self, entity: &str) -> usize {
        self.with_queue(entity, |q| q.deferred.len()).await
    }

    /// Messages in the dead-letter sub-queue, oldest first.
    pub async fn dead_letters(&self, entity: &str) -> Vec<Message> {
        self.with_queue(entity, |q| {
            q.dead_letter.iter().map(|s| s.message.clone()).collect()
        })
        .await
    }

    /// Message and session locks currently held across all entities.
    pub async fn held_lock_count(&self) -> usize {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();
        let entities: Vec<String> = state.queues.keys().cloned().collect();
        for entity in &entities {
            let _ = state.queue_mut(entity, now);
        }
        state.locks.len()
    }

    /// Make the next `count` settle calls fail with a broker error.
    pub async fn fail_next_settles(&self, count: u32) {
        self.shared.state.lock().await.settle_failures = count;
    }

    /// Make every renewal of `token` fail with a broker error.
    pub async fn fail_renewals_for(&self, token: LockToken) {
        self.shared.state.lock().await.failing_renewals.insert(token);
    }

    async fn with_queue<T: Default>(&self, entity: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        let mut state = self.shared.state.lock().await;
        match state.queue_mut(entity, Utc::now()) {
            Ok(queue) => f(queue),
            Err(_) => T::default(),
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn send(&self, entity: &str, message: Message) -> Result<()> {
        {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            let now = Utc::now();
            state.next_sequence += 1;
            let sequence_number = state.next_sequence;
            let queue = state.queue_mut(entity, now)?;

            if queue.options.requires_session && message.group_id.is_none() {
                return Err(Error::Broker(format!(
                    "entity '{entity}' requires a session id on every message"
                )));
            }

            let expires_at = message
                .ttl
                .or(queue.options.default_ttl)
                .map(|ttl| expiry_after(now, ttl));
            queue.available.insert(
                sequence_number,
                StoredMessage {
                    message,
                    sequence_number,
                    enqueued_at: now,
                    expires_at,
                    delivery_count: 0,
                },
            );
            trace!(entity = %entity, sequence_number, "Enqueued message");
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn open_receiver(
        &self,
        entity: &str,
        options: ReceiveOptions,
    ) -> Result<Box<dyn DeliveryStream>> {
        {
            let mut state = self.shared.state.lock().await;
            let queue = state.queue_mut(entity, Utc::now())?;
            match (&options.session, queue.options.requires_session) {
                (None, true) => {
                    return Err(Error::Broker(format!(
                        "entity '{entity}' requires sessions; accept a session first"
                    )));
                }
                (Some(_), false) => {
                    return Err(Error::Broker(format!(
                        "entity '{entity}' does not support sessions"
                    )));
                }
                _ => {}
            }
        }

        Ok(Box::new(MemoryDeliveryStream {
            shared: Arc::clone(&self.shared),
            entity: entity.to_string(),
            session: options.session,
        }))
    }

    async fn renew_message_lock(&self, token: LockToken) -> Result<DateTime<Utc>> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        if state.failing_renewals.contains(&token) {
            return Err(Error::Broker("injected renewal failure".to_string()));
        }

        let now = Utc::now();
        let entity = state.message_entity(&token)?;
        let queue = state.queue_mut(&entity, now)?;
        let lock_duration = queue.options.lock_duration;
        let locked = queue
            .locked
            .get_mut(&token)
            .ok_or(Error::LockExpired(token))?;
        locked.locked_until = expiry_after(now, lock_duration);
        Ok(locked.locked_until)
    }

    async fn renew_session_lock(&self, token: LockToken) -> Result<DateTime<Utc>> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        if state.failing_renewals.contains(&token) {
            return Err(Error::Broker("injected renewal failure".to_string()));
        }

        let now = Utc::now();
        let (entity, session_id) = state.session_owner(&token)?;
        let queue = state.queue_mut(&entity, now)?;
        let lock_duration = queue.options.lock_duration;
        let holder = queue
            .sessions
            .get_mut(&session_id)
            .and_then(|slot| slot.holder.as_mut())
            .filter(|h| h.token == token)
            .ok_or(Error::LockExpired(token))?;
        holder.locked_until = expiry_after(now, lock_duration);
        Ok(holder.locked_until)
    }

    async fn settle(&self, token: LockToken, outcome: Outcome) -> Result<()> {
        let requeued = {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            if state.settle_failures > 0 {
                state.settle_failures -= 1;
                return Err(Error::Broker("injected settle failure".to_string()));
            }

            let entity = state.message_entity(&token)?;
            let queue = state.queue_mut(&entity, Utc::now())?;
            let Some(locked) = queue.locked.remove(&token) else {
                state.locks.remove(&token);
                return Err(Error::LockExpired(token));
            };

            let mut stored = locked.stored;
            let requeued = matches!(outcome, Outcome::Abandon);
            match outcome {
                Outcome::Complete => {}
                Outcome::Abandon => queue.requeue(stored),
                Outcome::Defer => {
                    queue.deferred.insert(stored.sequence_number, stored);
                }
                Outcome::DeadLetter {
                    reason,
                    description,
                } => {
                    if let Some(reason) = reason {
                        stored
                            .message
                            .properties
                            .insert(DEAD_LETTER_REASON.to_string(), reason.into());
                    }
                    if let Some(description) = description {
                        stored
                            .message
                            .properties
                            .insert(DEAD_LETTER_DESCRIPTION.to_string(), description.into());
                    }
                    queue.dead_letter.push(stored);
                }
            }
            state.locks.remove(&token);
            requeued
        };

        if requeued {
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    async fn accept_session(&self, entity: &str, session_id: Option<&str>) -> Result<SessionLease> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut guard = self.shared.state.lock().await;
                let state = &mut *guard;
                let now = Utc::now();
                let queue = state.queue_mut(entity, now)?;
                if !queue.options.requires_session {
                    return Err(Error::Broker(format!(
                        "entity '{entity}' does not support sessions"
                    )));
                }

                let candidate = match session_id {
                    Some(id) if queue.session_is_free(id) => Some(id.to_string()),
                    Some(id) => {
                        return Err(Error::SessionAcquisitionDenied {
                            session_id: id.to_string(),
                        });
                    }
                    None => queue
                        .available
                        .values()
                        .filter_map(|stored| stored.message.group_id.as_deref())
                        .find(|id| queue.session_is_free(id))
                        .map(str::to_string),
                };

                if let Some(id) = candidate {
                    let (token, locked_until) = queue.acquire_session(&id, now);
                    state.locks.insert(
                        token,
                        LockOwner::Session {
                            entity: entity.to_string(),
                            session_id: id.clone(),
                        },
                    );
                    debug!(entity = %entity, session_id = %id, "Session lock granted");
                    return Ok(SessionLease {
                        entity: entity.to_string(),
                        session_id: id,
                        lock_token: token,
                        locked_until,
                    });
                }
            }

            // Session holders lapse without notification, so poll as well
            let _ = tokio::time::timeout(RECLAIM_POLL, notified).await;
        }
    }

    async fn release_session(&self, session: &SessionLease) -> Result<()> {
        {
            let mut guard = self.shared.state.lock().await;
            let state = &mut *guard;
            let now = Utc::now();
            let queue = state.queue_mut(&session.entity, now)?;
            if !queue.session_held_by(&session.session_id, &session.lock_token, now) {
                return Err(Error::LockExpired(session.lock_token));
            }
            if let Some(slot) = queue.sessions.get_mut(&session.session_id) {
                slot.holder = None;
            }
            state.locks.remove(&session.lock_token);
            debug!(entity = %session.entity, session_id = %session.session_id, "Session lock released");
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn get_session_state(&self, session: &SessionLease) -> Result<Option<Vec<u8>>> {
        let mut state = self.shared.state.lock().await;
        let now = Utc::now();
        let queue = state.queue_mut(&session.entity, now)?;
        if !queue.session_held_by(&session.session_id, &session.lock_token, now) {
            return Err(Error::LockExpired(session.lock_token));
        }
        Ok(queue
            .sessions
            .get(&session.session_id)
            .and_then(|slot| slot.state.clone()))
    }

    async fn set_session_state(
        &self,
        session: &SessionLease,
        new_state: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        let now = Utc::now();
        let queue = state.queue_mut(&session.entity, now)?;
        if !queue.session_held_by(&session.session_id, &session.lock_token, now) {
            return Err(Error::LockExpired(session.lock_token));
        }
        queue
            .sessions
            .entry(session.session_id.clone())
            .or_default()
            .state = new_state;
        Ok(())
    }

    async fn receive_deferred(
        &self,
        entity: &str,
        sequence_number: SequenceNumber,
    ) -> Result<Delivery> {
        let mut guard = self.shared.state.lock().await;
        let state = &mut *guard;
        let now = Utc::now();
        let tag = state.next_tag();
        let queue = state.queue_mut(entity, now)?;
        let stored = queue.deferred.remove(&sequence_number).ok_or_else(|| {
            Error::Broker(format!(
                "no deferred message with sequence number {sequence_number}"
            ))
        })?;

        let delivery = queue.lock(stored, now, tag);
        state.locks.insert(
            delivery.lock_token,
            LockOwner::Message {
                entity: entity.to_string(),
            },
        );
        Ok(delivery)
    }
}

/// Receiver link over the in-memory broker.
struct MemoryDeliveryStream {
    shared: Arc<Shared>,
    entity: String,
    session: Option<SessionLease>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next_delivery(&mut self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self
                .shared
                .try_deliver(&self.entity, self.session.as_ref())
                .await?
            {
                return Ok(Some(delivery));
            }

            // Lapsed locks return messages without notification, so poll as well
            let _ = tokio::time::timeout(RECLAIM_POLL, notified).await;
        }
    }
}
