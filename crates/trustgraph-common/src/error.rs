//! Errors

use thiserror::Error;

use crate::events::{StreamKind, SubscriptionId, TransportId};
use crate::{database, graph, source, transport};

/// Engine error
#[derive(Debug, Error)]
pub enum Error {
    /// The client already observes this stream
    #[error("a {0} subscription already exists for this client")]
    SubscriptionExistsAlready(StreamKind),
    /// No subscription with this id
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
    /// No client with this transport id
    #[error("unknown client {0}")]
    UnknownClient(TransportId),
    /// Cooperative cancellation fired
    #[error("cancelled")]
    Cancelled,
    /// Event store failure
    #[error(transparent)]
    Database(#[from] database::Error),
    /// Entity codec failure
    #[error(transparent)]
    Payload(#[from] graph::Error),
    /// Producer read failure
    #[error(transparent)]
    Source(#[from] source::Error),
    /// Wire failure
    #[error(transparent)]
    Transport(#[from] transport::Error),
    /// Broken internal invariant
    #[error("internal error: {0}")]
    Internal(String),
}
