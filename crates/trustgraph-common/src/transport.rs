//! Outbound wire interface.
//!
//! The engine hands fully decoded entity clones to the transport and waits
//! for the remote client's acknowledgement; one send corresponds to one
//! request/response round trip. Implementations own their I/O timeouts; for
//! shutdown latency the engine relies on dropping the send future through
//! task cancellation.

use async_trait::async_trait;
use uuid::Uuid;

use crate::events::{StreamKind, SubscriptionId, TransportId};
use crate::graph::{Identity, Score, Trust};

/// Transport error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel to the client is gone
    #[error("client disconnected")]
    Disconnected,
    /// The client processed the message and reported failure
    #[error("client-side processing failed: {0}")]
    Client(String),
    /// The request never completed
    #[error("transport i/o failed: {0}")]
    Io(String),
    /// Shutdown was requested mid-call
    #[error("send cancelled")]
    Cancelled,
}

impl Error {
    /// Whether this failure means the channel is unusable and the client
    /// should be dropped without exhausting the retry budget
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::Disconnected | Error::Io(_))
    }
}

/// Which side of a snapshot block a marker delimits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMarker {
    /// Snapshot block opens
    Begin,
    /// Snapshot block closes
    End,
}

/// Request/response channel to remote subscribers.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Deliver an identity change
    async fn send_identity_changed(
        &self,
        to: &TransportId,
        old: Option<&Identity>,
        new: Option<&Identity>,
    ) -> Result<(), Error>;

    /// Deliver a trust change
    async fn send_trust_changed(
        &self,
        to: &TransportId,
        old: Option<&Trust>,
        new: Option<&Trust>,
    ) -> Result<(), Error>;

    /// Deliver a score change
    async fn send_score_changed(
        &self,
        to: &TransportId,
        old: Option<&Score>,
        new: Option<&Score>,
    ) -> Result<(), Error>;

    /// Deliver a snapshot begin/end marker
    async fn send_sync_marker(
        &self,
        to: &TransportId,
        subscription: &SubscriptionId,
        version: Uuid,
        marker: SyncMarker,
        stream: StreamKind,
    ) -> Result<(), Error>;

    /// Tell a client its subscription was discarded server-side. Best
    /// effort; the engine swallows failures.
    async fn send_unsubscribed(
        &self,
        to: &TransportId,
        stream: StreamKind,
        subscription: &SubscriptionId,
    ) -> Result<(), Error>;
}
