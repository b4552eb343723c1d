//! Trustgraph shared types and traits.
//!
//! This crate is the base foundation of the trustgraph event engine: the
//! domain entities observed by subscribers, the persistent model of clients,
//! subscriptions and notification queues, and the interfaces through which
//! the engine talks to its collaborators (the producer's store, the durable
//! event store and the outbound wire transport).
//!
//! Nothing here performs I/O by itself; concrete backends live in sibling
//! crates.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod database;
pub mod error;
pub mod events;
pub mod graph;
pub mod source;
pub mod transport;

pub use self::error::Error;
pub use self::events::{
    Client, ClientState, Notification, NotificationBody, StreamKind, Subscription, SubscriptionId,
    TransportId,
};
pub use self::graph::{GraphEntity, Identity, Score, Trust};
