//! Subscription engine
//!
//! Entry points invoked by the producer while it holds its write lock, plus
//! the lifecycle of the deployment worker. The lock order is global and must
//! never be inverted: producer lock, then the engine's core lock, then the
//! store transaction. [`EventEngine::schedule_deployment`] takes none of
//! these; the ticker state sits behind its own small lock so it can be poked
//! from any thread.

mod deploy;
mod snapshot;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use trustgraph_common::database::{self, EventStoreDatabase, EventStoreTransaction};
use trustgraph_common::events::{
    Client, Notification, NotificationBody, StreamKind, Subscription, SubscriptionId, TransportId,
};
use trustgraph_common::graph::{GraphEntity, Identity, Score, Trust};
use trustgraph_common::source::GraphSource;
use trustgraph_common::transport::EventTransport;
use trustgraph_common::Error;

/// Boxed store transaction as handed out by [`EventStoreDatabase`]
pub type StoreTransaction<'a> =
    Box<dyn EventStoreTransaction<'a, database::Error> + Send + Sync + 'a>;

/// Shared handle to the durable event store
pub type Store = Arc<dyn EventStoreDatabase<Err = database::Error> + Send + Sync>;

/// Tunables of the delivery pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Delay between scheduling a deployment run and executing it. Doubles
    /// as the retry back-off for degraded clients.
    pub process_delay: Duration,
    /// Consecutive failed deliveries after which a client is forcibly
    /// removed
    pub disconnect_after_failures: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            process_delay: Duration::from_secs(60),
            disconnect_after_failures: 5,
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    queue: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// The subscription/notification engine.
///
/// Owns the per-client notification queues in the durable store and the
/// single deployment worker that flushes them. Producers feed it change
/// events through [`identity_changed`](EventEngine::identity_changed) and
/// friends inside their own transaction, commit, and then call
/// [`schedule_deployment`](EventEngine::schedule_deployment).
pub struct EventEngine {
    store: Store,
    source: Arc<dyn GraphSource>,
    transport: Arc<dyn EventTransport>,
    config: EngineConfig,
    // Guards every read-modify-write of queue state. Second in the global
    // lock order, after the producer lock.
    core_lock: tokio::sync::Mutex<()>,
    // Ticker state; independent of the core lock.
    worker: Mutex<Option<Worker>>,
    // Lets `start` hand the spawned worker an owning handle.
    weak: Weak<Self>,
}

impl std::fmt::Debug for EventEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventEngine {
    /// Create an engine over the given store, producer and wire transport
    pub fn new(
        store: Store,
        source: Arc<dyn GraphSource>,
        transport: Arc<dyn EventTransport>,
        config: EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            store,
            source,
            transport,
            config,
            core_lock: tokio::sync::Mutex::new(()),
            worker: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Start the engine: discard state left over from a previous run and
    /// spawn the deployment worker.
    ///
    /// Transport handles do not survive a restart, so clients of a previous
    /// process cannot be resumed; the store is wiped in a single
    /// transaction. Calling `start` on a running engine is a no-op.
    #[instrument(skip_all)]
    pub async fn start(&self) -> Result<(), Error> {
        if self.worker.lock().is_some() {
            return Ok(());
        }

        {
            let _core = self.core_lock.lock().await;
            let mut tx = self.store.begin_transaction().await?;
            tx.clear_all().await?;
            tx.commit().await?;
        }

        let engine = self
            .weak
            .upgrade()
            .ok_or_else(|| Error::Internal("engine already dropped".to_owned()))?;
        let cancel = CancellationToken::new();
        let (queue, requests) = mpsc::channel(1);
        let handle = tokio::spawn(Self::worker_loop(engine, requests, cancel.clone()));

        *self.worker.lock() = Some(Worker {
            cancel,
            queue,
            handle,
        });
        tracing::info!("subscription engine started");
        Ok(())
    }

    /// Stop the engine, interrupting any in-flight delivery.
    ///
    /// Scheduling is blocked first, then queued and running work is
    /// cancelled and the worker joined. The in-progress notification (if
    /// any) is rolled back, not counted as a delivery failure. Safe to call
    /// when already stopped.
    #[instrument(skip_all)]
    pub async fn stop(&self) {
        let worker = self.worker.lock().take();
        let Some(worker) = worker else { return };

        worker.cancel.cancel();
        drop(worker.queue);
        if let Err(err) = worker.handle.await {
            tracing::error!("deployment worker did not shut down cleanly: {err}");
        }
        tracing::info!("subscription engine stopped");
    }

    /// Request a deployment run after `process_delay`.
    ///
    /// Idempotent: a run that is already queued is not queued again.
    /// Producers call this after committing the transaction that changed
    /// queue state. Holds no engine lock other than the ticker's own.
    pub fn schedule_deployment(&self) {
        let worker = self.worker.lock();
        if let Some(worker) = worker.as_ref() {
            if !worker.cancel.is_cancelled() {
                let _ = worker.queue.try_send(());
            }
        }
    }

    /// Queue an identity change for every identity subscriber.
    ///
    /// Caller contract: the producer write lock is held and `tx` is the
    /// producer's open transaction. No network I/O happens here; delivery
    /// starts once the caller commits and schedules a deployment.
    #[instrument(skip_all)]
    pub async fn identity_changed(
        &self,
        tx: &mut StoreTransaction<'_>,
        old: Option<&Identity>,
        new: Option<&Identity>,
    ) -> Result<(), Error> {
        self.entity_changed(tx, old, new).await
    }

    /// Queue a trust change for every trust subscriber.
    #[instrument(skip_all)]
    pub async fn trust_changed(
        &self,
        tx: &mut StoreTransaction<'_>,
        old: Option<&Trust>,
        new: Option<&Trust>,
    ) -> Result<(), Error> {
        self.entity_changed(tx, old, new).await
    }

    /// Queue a score change for every score subscriber.
    #[instrument(skip_all)]
    pub async fn score_changed(
        &self,
        tx: &mut StoreTransaction<'_>,
        old: Option<&Score>,
        new: Option<&Score>,
    ) -> Result<(), Error> {
        self.entity_changed(tx, old, new).await
    }

    async fn entity_changed<E: GraphEntity>(
        &self,
        tx: &mut StoreTransaction<'_>,
        old: Option<&E>,
        new: Option<&E>,
    ) -> Result<(), Error> {
        let _core = self.core_lock.lock().await;

        match (old, new) {
            (None, None) => {
                return Err(Error::Internal(
                    "change event with neither old nor new state".to_owned(),
                ));
            }
            (Some(old), Some(new)) if old.id() != new.id() => {
                return Err(Error::Internal(format!(
                    "change event pairs entity {} with {}",
                    old.id(),
                    new.id()
                )));
            }
            _ => {}
        }

        let payload_old = old.map(GraphEntity::to_payload).transpose()?;
        let payload_new = new.map(GraphEntity::to_payload).transpose()?;

        for subscription in tx.subscriptions_of(E::STREAM).await? {
            let mut client = tx
                .get_client(&subscription.transport_id)
                .await?
                .ok_or_else(|| Error::UnknownClient(subscription.transport_id.clone()))?;
            let index = client.allocate_index();
            tx.add_notification(Notification {
                transport_id: subscription.transport_id.clone(),
                subscription: subscription.id,
                index,
                body: NotificationBody::Changed {
                    stream: E::STREAM,
                    old: payload_old.clone(),
                    new: payload_new.clone(),
                },
            })
            .await?;
            tx.update_client(&client).await?;
        }
        Ok(())
    }

    /// Create a subscription and queue its initial snapshot.
    ///
    /// The snapshot may be large; `cancel` aborts it between entities and
    /// the call fails with [`Error::Cancelled`], leaving the caller to roll
    /// `tx` back. Fails with [`Error::SubscriptionExistsAlready`] if the
    /// client already observes `stream`.
    #[instrument(skip_all, fields(client = %transport_id, stream = %stream))]
    pub async fn subscribe(
        &self,
        tx: &mut StoreTransaction<'_>,
        transport_id: &TransportId,
        stream: StreamKind,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, Error> {
        let _core = self.core_lock.lock().await;

        let mut client = match tx.get_client(transport_id).await? {
            Some(client) => client,
            None => {
                let client = Client::new(transport_id.clone());
                tx.add_client(client.clone()).await?;
                client
            }
        };

        if tx
            .client_subscription_of(transport_id, stream)
            .await?
            .is_some()
        {
            return Err(Error::SubscriptionExistsAlready(stream));
        }

        let subscription = Subscription {
            id: SubscriptionId::new(),
            transport_id: transport_id.clone(),
            stream,
        };
        // staged before the snapshot so FK-enforcing backends see the row
        tx.add_subscription(subscription.clone()).await?;

        self.build_snapshot(tx, &mut client, &subscription, cancel)
            .await?;
        tx.update_client(&client).await?;

        tracing::debug!(subscription = %subscription.id, "subscription created");
        Ok(subscription.id)
    }

    /// Remove a subscription and everything still queued for it.
    ///
    /// Deletes the client as well when this was its last subscription.
    /// Fails with [`Error::UnknownSubscription`] if the id is not known.
    #[instrument(skip_all, fields(subscription = %subscription_id))]
    pub async fn unsubscribe(
        &self,
        tx: &mut StoreTransaction<'_>,
        subscription_id: &SubscriptionId,
    ) -> Result<(), Error> {
        let _core = self.core_lock.lock().await;

        let subscription = tx
            .get_subscription(subscription_id)
            .await?
            .ok_or(Error::UnknownSubscription(*subscription_id))?;

        tx.remove_subscription_notifications(&subscription.id).await?;
        tx.remove_subscription(&subscription.id).await?;

        if tx
            .client_subscriptions(&subscription.transport_id)
            .await?
            .is_empty()
        {
            tx.remove_client_notifications(&subscription.transport_id)
                .await?;
            tx.remove_client(&subscription.transport_id).await?;
            tracing::debug!(client = %subscription.transport_id, "last subscription gone, client removed");
        }
        Ok(())
    }
}
