//! Persistent model of the subscription pipeline.
//!
//! `Client` owns its `Subscription`s, a `Subscription` owns its queued
//! `Notification`s, and ownership is expressed through persistent ids rather
//! than live references; deletion cascades are performed explicitly by the
//! engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The class of entity a subscription observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// Identity creations, edits and deletions
    Identities,
    /// Trust edge changes
    Trusts,
    /// Computed score changes
    Scores,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Identities => write!(f, "identities"),
            StreamKind::Trusts => write!(f, "trusts"),
            StreamKind::Scores => write!(f, "scores"),
        }
    }
}

/// Opaque unique handle of a client's outbound channel.
///
/// Transport ids are minted by the wire layer and do not survive a restart of
/// either peer, which is why the engine discards all clients on startup.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransportId(String);

impl TransportId {
    /// The raw handle
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TransportId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TransportId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Globally unique subscription identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Mint a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected peer with at least one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    /// Outbound channel handle, unique across clients
    pub transport_id: TransportId,
    /// Index the next stored notification will be assigned
    pub next_notification_index: u64,
    /// Consecutive failed deliveries since the last success
    pub failure_count: u8,
}

impl Client {
    /// A fresh client with an empty queue
    pub fn new(transport_id: TransportId) -> Self {
        Self {
            transport_id,
            next_notification_index: 0,
            failure_count: 0,
        }
    }

    /// Allocate the queue position for the next stored notification.
    ///
    /// The counter only ever moves forward; indices of deleted notifications
    /// are never reused.
    pub fn allocate_index(&mut self) -> u64 {
        let index = self.next_notification_index;
        self.next_notification_index += 1;
        index
    }

    /// Delivery health derived from the failure counter
    pub fn state(&self) -> ClientState {
        if self.failure_count == 0 {
            ClientState::Healthy
        } else {
            ClientState::Degraded
        }
    }
}

/// Per-client delivery health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No outstanding delivery failures
    Healthy,
    /// At least one failed delivery since the last success
    Degraded,
}

/// One stream subscription of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// Globally unique id
    pub id: SubscriptionId,
    /// Owning client
    pub transport_id: TransportId,
    /// Stream this subscription observes
    pub stream: StreamKind,
}

/// One queued delivery for a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Owning client; always equal to the subscription's client
    pub transport_id: TransportId,
    /// Subscription this notification belongs to
    pub subscription: SubscriptionId,
    /// Per-client FIFO position
    pub index: u64,
    /// What goes over the wire
    pub body: NotificationBody,
}

/// Payload of a queued notification.
///
/// `Changed` carries serialized entity clones; a `None` old state means the
/// entity was created, a `None` new state means it was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationBody {
    /// Opens a snapshot block; the client records the version
    Begin {
        /// Snapshot version stamped on every clone of the block
        version: Uuid,
        /// Stream being synchronized
        stream: StreamKind,
    },
    /// Closes the snapshot block opened by the matching `Begin`; the client
    /// sweeps local objects whose stored version differs
    End {
        /// Version of the block being closed
        version: Uuid,
        /// Stream being synchronized
        stream: StreamKind,
    },
    /// An entity changed
    Changed {
        /// Stream the entity belongs to
        stream: StreamKind,
        /// Serialized clone of the previous state
        old: Option<Vec<u8>>,
        /// Serialized clone of the new state
        new: Option<Vec<u8>>,
    },
}

impl NotificationBody {
    /// Stream the notification belongs to
    pub fn stream(&self) -> StreamKind {
        match self {
            NotificationBody::Begin { stream, .. }
            | NotificationBody::End { stream, .. }
            | NotificationBody::Changed { stream, .. } => *stream,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn index_allocation_is_monotonic() {
        let mut client = Client::new("t-1".into());
        assert_eq!(client.allocate_index(), 0);
        assert_eq!(client.allocate_index(), 1);
        assert_eq!(client.next_notification_index, 2);
    }

    #[test]
    fn client_state_follows_failure_count() {
        let mut client = Client::new("t-1".into());
        assert_eq!(client.state(), ClientState::Healthy);
        client.failure_count = 1;
        assert_eq!(client.state(), ClientState::Degraded);
        client.failure_count = 0;
        assert_eq!(client.state(), ClientState::Healthy);
    }

    #[test]
    fn body_reports_its_stream() {
        let body = NotificationBody::Changed {
            stream: StreamKind::Trusts,
            old: None,
            new: Some(vec![1]),
        };
        assert_eq!(body.stream(), StreamKind::Trusts);
    }

    #[test]
    fn stream_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&StreamKind::Identities).expect("serialize"),
            r#""identities""#
        );
    }
}
