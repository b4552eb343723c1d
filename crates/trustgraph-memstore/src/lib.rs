//! In-memory event store backend.
//!
//! Keeps the whole store in `BTreeMap`s behind a single `RwLock`. A
//! transaction clones the state on begin, mutates the clone, and swaps it
//! back on commit; rollback just drops the clone. The engine serializes
//! writers through its core lock, so this simple scheme already gives
//! snapshot isolation between a transaction and concurrent readers.
//!
//! Useful for tests and for embedded deployments that accept losing queue
//! state with the process.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use trustgraph_common::database::{
    DbTransactionFinalizer, Error, EventStoreDatabase, EventStoreTransaction,
};
use trustgraph_common::events::{
    Client, Notification, StreamKind, Subscription, SubscriptionId, TransportId,
};

#[derive(Debug, Default, Clone)]
struct State {
    clients: BTreeMap<TransportId, Client>,
    subscriptions: BTreeMap<SubscriptionId, Subscription>,
    // keyed by (client, index) so a range scan yields FIFO order
    notifications: BTreeMap<(TransportId, u64), Notification>,
}

impl State {
    fn client_notifications(&self, transport_id: &TransportId) -> Vec<Notification> {
        self.notifications
            .range((transport_id.clone(), 0)..=(transport_id.clone(), u64::MAX))
            .map(|(_, notification)| notification.clone())
            .collect()
    }
}

/// In-memory [`EventStoreDatabase`] implementation.
#[derive(Debug, Clone, Default)]
pub struct MemoryEventStore {
    inner: Arc<RwLock<State>>,
}

impl MemoryEventStore {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

/// Transaction over a [`MemoryEventStore`].
#[derive(Debug)]
pub struct MemoryTransaction {
    inner: Arc<RwLock<State>>,
    staged: State,
}

#[async_trait]
impl DbTransactionFinalizer for MemoryTransaction {
    type Err = Error;

    async fn commit(self: Box<Self>) -> Result<(), Error> {
        let this = *self;
        *this.inner.write() = this.staged;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl<'a> EventStoreTransaction<'a, Error> for MemoryTransaction {
    async fn get_client(&mut self, transport_id: &TransportId) -> Result<Option<Client>, Error> {
        Ok(self.staged.clients.get(transport_id).cloned())
    }

    async fn add_client(&mut self, client: Client) -> Result<(), Error> {
        if self.staged.clients.contains_key(&client.transport_id) {
            return Err(Error::Duplicate);
        }
        self.staged.clients.insert(client.transport_id.clone(), client);
        Ok(())
    }

    async fn update_client(&mut self, client: &Client) -> Result<(), Error> {
        if !self.staged.clients.contains_key(&client.transport_id) {
            return Err(Error::UnknownClient);
        }
        self.staged
            .clients
            .insert(client.transport_id.clone(), client.clone());
        Ok(())
    }

    async fn remove_client(&mut self, transport_id: &TransportId) -> Result<(), Error> {
        self.staged
            .clients
            .remove(transport_id)
            .map(|_| ())
            .ok_or(Error::UnknownClient)
    }

    async fn get_subscription(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, Error> {
        Ok(self.staged.subscriptions.get(id).cloned())
    }

    async fn client_subscriptions(
        &mut self,
        transport_id: &TransportId,
    ) -> Result<Vec<Subscription>, Error> {
        Ok(self
            .staged
            .subscriptions
            .values()
            .filter(|sub| &sub.transport_id == transport_id)
            .cloned()
            .collect())
    }

    async fn client_subscription_of(
        &mut self,
        transport_id: &TransportId,
        stream: StreamKind,
    ) -> Result<Option<Subscription>, Error> {
        Ok(self
            .staged
            .subscriptions
            .values()
            .find(|sub| &sub.transport_id == transport_id && sub.stream == stream)
            .cloned())
    }

    async fn subscriptions_of(&mut self, stream: StreamKind) -> Result<Vec<Subscription>, Error> {
        Ok(self
            .staged
            .subscriptions
            .values()
            .filter(|sub| sub.stream == stream)
            .cloned()
            .collect())
    }

    async fn add_subscription(&mut self, subscription: Subscription) -> Result<(), Error> {
        if self.staged.subscriptions.contains_key(&subscription.id) {
            return Err(Error::Duplicate);
        }
        self.staged
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    async fn remove_subscription(&mut self, id: &SubscriptionId) -> Result<(), Error> {
        self.staged
            .subscriptions
            .remove(id)
            .map(|_| ())
            .ok_or(Error::UnknownSubscription)
    }

    async fn add_notification(&mut self, notification: Notification) -> Result<(), Error> {
        let key = (notification.transport_id.clone(), notification.index);
        if self.staged.notifications.contains_key(&key) {
            return Err(Error::Duplicate);
        }
        self.staged.notifications.insert(key, notification);
        Ok(())
    }

    async fn remove_notification(
        &mut self,
        transport_id: &TransportId,
        index: u64,
    ) -> Result<(), Error> {
        self.staged
            .notifications
            .remove(&(transport_id.clone(), index))
            .map(|_| ())
            .ok_or(Error::UnknownNotification)
    }

    async fn remove_subscription_notifications(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<(), Error> {
        self.staged
            .notifications
            .retain(|_, notification| &notification.subscription != id);
        Ok(())
    }

    async fn remove_client_notifications(
        &mut self,
        transport_id: &TransportId,
    ) -> Result<(), Error> {
        self.staged
            .notifications
            .retain(|(client, _), _| client != transport_id);
        Ok(())
    }

    async fn clear_all(&mut self) -> Result<(), Error> {
        self.staged = State::default();
        Ok(())
    }
}

#[async_trait]
impl EventStoreDatabase for MemoryEventStore {
    type Err = Error;

    async fn begin_transaction<'a>(
        &'a self,
    ) -> Result<Box<dyn EventStoreTransaction<'a, Error> + Send + Sync + 'a>, Error> {
        Ok(Box::new(MemoryTransaction {
            inner: self.inner.clone(),
            staged: self.inner.read().clone(),
        }))
    }

    async fn get_client(&self, transport_id: &TransportId) -> Result<Option<Client>, Error> {
        Ok(self.inner.read().clients.get(transport_id).cloned())
    }

    async fn list_clients(&self) -> Result<Vec<Client>, Error> {
        Ok(self.inner.read().clients.values().cloned().collect())
    }

    async fn get_subscription(&self, id: &SubscriptionId) -> Result<Option<Subscription>, Error> {
        Ok(self.inner.read().subscriptions.get(id).cloned())
    }

    async fn client_subscriptions(
        &self,
        transport_id: &TransportId,
    ) -> Result<Vec<Subscription>, Error> {
        Ok(self
            .inner
            .read()
            .subscriptions
            .values()
            .filter(|sub| &sub.transport_id == transport_id)
            .cloned()
            .collect())
    }

    async fn client_notifications(
        &self,
        transport_id: &TransportId,
    ) -> Result<Vec<Notification>, Error> {
        Ok(self.inner.read().client_notifications(transport_id))
    }

    async fn subscription_notifications(
        &self,
        id: &SubscriptionId,
    ) -> Result<Vec<Notification>, Error> {
        let inner = self.inner.read();
        let mut notifications: Vec<_> = inner
            .notifications
            .values()
            .filter(|notification| &notification.subscription == id)
            .cloned()
            .collect();
        notifications.sort_by_key(|notification| notification.index);
        Ok(notifications)
    }
}
