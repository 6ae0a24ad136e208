//! Lock lifecycle and session exclusivity for peek-lock message queues.
//!
//! This crate keeps message and session leases alive while the application
//! processes deliveries, and makes sure every delivery is settled exactly
//! once, whether the handler, a background renewal or the application itself
//! gets there first.
//!
//! # Key Types
//!
//! - [`LockRegistry`] - Token to expiry map with fencing removal
//! - [`Disposer`] - Applies settlement outcomes exactly once
//! - [`LeaseRenewer`] - Batch and periodic lock renewal
//! - [`Receiver`] - Receive loop dispatching to a [`Handler`]
//! - [`MessageSession`] - Handle to an exclusively held session
//! - [`Broker`] - Trait the broker connection implements
//! - [`InMemoryBroker`] - Broker for tests and development

pub mod config;
pub mod disposer;
pub mod error;
pub mod memory;
pub mod receiver;
pub mod registry;
pub mod renewer;
pub mod session;
pub mod traits;
pub mod types;

// Re-exports
pub use config::{LeaseConfig, QueueOptions};
pub use disposer::Disposer;
pub use error::{Error, RenewalErrors, Result};
pub use memory::InMemoryBroker;
pub use receiver::{DispositionAction, ReceivedMessage, Receiver};
pub use registry::{LeaseEntry, LockRegistry};
pub use renewer::{LeaseBatch, LeaseRenewer, RenewalReport};
pub use session::MessageSession;
pub use traits::{
    Broker, DeliveryStream, FnSessionHandler, Handler, HandlerFn, ReceiveOptions, SessionHandler,
};
pub use types::{
    Delivery, DeliveryState, LockKind, LockToken, Message, Outcome, SequenceNumber, SessionLease,
};
