//! Durable store interface for clients, subscriptions and notifications.
//!
//! The engine keeps all queue state in an external store and drives it
//! through these traits. Reads that participate in a read-modify-write go
//! through the transaction so they observe the transaction's own staged
//! writes; plain reads go through [`EventStoreDatabase`] directly. Writers
//! are serialized by the engine's core lock, so backends only need
//! single-writer transactions.

use async_trait::async_trait;

use crate::events::{Client, Notification, StreamKind, Subscription, SubscriptionId, TransportId};


/// Event store error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend failure
    #[error(transparent)]
    Database(Box<dyn std::error::Error + Send + Sync>),
    /// Unique constraint violated; a bug in the caller
    #[error("duplicate entry")]
    Duplicate,
    /// Client row not present
    #[error("unknown client")]
    UnknownClient,
    /// Subscription row not present
    #[error("unknown subscription")]
    UnknownSubscription,
    /// Notification row not present
    #[error("unknown notification")]
    UnknownNotification,
}

/// Commit and rollback
#[async_trait]
pub trait DbTransactionFinalizer {
    /// Event store error
    type Err: Into<Error> + From<Error>;

    /// Commits all staged changes into the store
    async fn commit(self: Box<Self>) -> Result<(), Self::Err>;

    /// Discards all staged changes
    async fn rollback(self: Box<Self>) -> Result<(), Self::Err>;
}

/// Write handle over the event store.
#[async_trait]
pub trait EventStoreTransaction<'a, Error>: DbTransactionFinalizer<Err = Error> {
    /// Get a client by its transport id
    async fn get_client(&mut self, transport_id: &TransportId) -> Result<Option<Client>, Error>;

    /// Insert a new client; `Duplicate` if the transport id is taken
    async fn add_client(&mut self, client: Client) -> Result<(), Error>;

    /// Overwrite an existing client's counters
    async fn update_client(&mut self, client: &Client) -> Result<(), Error>;

    /// Remove a client row; its subscriptions and notifications are removed
    /// explicitly by the caller
    async fn remove_client(&mut self, transport_id: &TransportId) -> Result<(), Error>;

    /// Get a subscription by id
    async fn get_subscription(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, Error>;

    /// All subscriptions of one client
    async fn client_subscriptions(
        &mut self,
        transport_id: &TransportId,
    ) -> Result<Vec<Subscription>, Error>;

    /// A client's subscription of the given stream kind, if any
    async fn client_subscription_of(
        &mut self,
        transport_id: &TransportId,
        stream: StreamKind,
    ) -> Result<Option<Subscription>, Error>;

    /// Every subscription of the given stream kind, across clients
    async fn subscriptions_of(&mut self, stream: StreamKind) -> Result<Vec<Subscription>, Error>;

    /// Insert a new subscription; `Duplicate` if the id is taken
    async fn add_subscription(&mut self, subscription: Subscription) -> Result<(), Error>;

    /// Remove a subscription row
    async fn remove_subscription(&mut self, id: &SubscriptionId) -> Result<(), Error>;

    /// Append a notification; the `(client, index)` pair must be unused
    async fn add_notification(&mut self, notification: Notification) -> Result<(), Error>;

    /// Remove one notification by its queue position
    async fn remove_notification(
        &mut self,
        transport_id: &TransportId,
        index: u64,
    ) -> Result<(), Error>;

    /// Remove every notification belonging to one subscription
    async fn remove_subscription_notifications(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<(), Error>;

    /// Remove every notification queued for one client
    async fn remove_client_notifications(
        &mut self,
        transport_id: &TransportId,
    ) -> Result<(), Error>;

    /// Delete every client, subscription and notification
    async fn clear_all(&mut self) -> Result<(), Error>;
}

/// Read side of the event store plus the transaction entry point.
#[async_trait]
pub trait EventStoreDatabase {
    /// Event store error
    type Err: Into<Error> + From<Error>;

    /// Begins a transaction
    async fn begin_transaction<'a>(
        &'a self,
    ) -> Result<Box<dyn EventStoreTransaction<'a, Self::Err> + Send + Sync + 'a>, Error>;

    /// Get a client by its transport id
    async fn get_client(&self, transport_id: &TransportId) -> Result<Option<Client>, Self::Err>;

    /// Every known client
    async fn list_clients(&self) -> Result<Vec<Client>, Self::Err>;

    /// Get a subscription by id
    async fn get_subscription(
        &self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, Self::Err>;

    /// All subscriptions of one client
    async fn client_subscriptions(
        &self,
        transport_id: &TransportId,
    ) -> Result<Vec<Subscription>, Self::Err>;

    /// A client's queue in ascending index order
    async fn client_notifications(
        &self,
        transport_id: &TransportId,
    ) -> Result<Vec<Notification>, Self::Err>;

    /// Pending notifications of one subscription, ascending by index
    async fn subscription_notifications(
        &self,
        id: &SubscriptionId,
    ) -> Result<Vec<Notification>, Self::Err>;
}
