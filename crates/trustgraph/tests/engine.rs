//! End-to-end scenarios for the subscription engine, driven through the
//! in-memory store and a scripted fake transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use trustgraph::engine::{EngineConfig, EventEngine, StoreTransaction};
use trustgraph::Error;
use trustgraph_common::database::{
    DbTransactionFinalizer, Error as DbError, EventStoreDatabase, EventStoreTransaction,
};
use trustgraph_common::events::{
    Client, Notification, NotificationBody, StreamKind, Subscription, SubscriptionId, TransportId,
};
use trustgraph_common::graph::{GraphEntity, Identity, Score, Trust};
use trustgraph_common::source::{self, GraphSource};
use trustgraph_common::transport::{self, EventTransport, SyncMarker};
use trustgraph_memstore::MemoryEventStore;
use uuid::Uuid;

#[derive(Default)]
struct FakeSource {
    identities: Mutex<Vec<Identity>>,
    trusts: Mutex<Vec<Trust>>,
    scores: Mutex<Vec<Score>>,
}

#[async_trait]
impl GraphSource for FakeSource {
    async fn list_identities(&self) -> Result<Vec<Identity>, source::Error> {
        Ok(self.identities.lock().clone())
    }

    async fn list_trusts(&self) -> Result<Vec<Trust>, source::Error> {
        Ok(self.trusts.lock().clone())
    }

    async fn list_scores(&self) -> Result<Vec<Score>, source::Error> {
        Ok(self.scores.lock().clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Delivery {
    IdentityChanged {
        to: TransportId,
        old: Option<Identity>,
        new: Option<Identity>,
    },
    TrustChanged {
        to: TransportId,
        old: Option<Trust>,
        new: Option<Trust>,
    },
    ScoreChanged {
        to: TransportId,
        old: Option<Score>,
        new: Option<Score>,
    },
    Marker {
        to: TransportId,
        subscription: SubscriptionId,
        version: Uuid,
        marker: SyncMarker,
        stream: StreamKind,
    },
    Unsubscribed {
        to: TransportId,
        stream: StreamKind,
        subscription: SubscriptionId,
    },
}

/// Records everything the engine sends; failures can be scripted up front
/// and are consumed one per send attempt.
#[derive(Default)]
struct FakeTransport {
    delivered: Mutex<Vec<Delivery>>,
    scripted_failures: Mutex<VecDeque<transport::Error>>,
    attempts: AtomicUsize,
    hang: AtomicBool,
}

impl FakeTransport {
    fn fail_next(&self, errors: impl IntoIterator<Item = transport::Error>) {
        self.scripted_failures.lock().extend(errors);
    }

    fn delivered(&self) -> Vec<Delivery> {
        self.delivered.lock().clone()
    }

    async fn gate(&self) -> Result<(), transport::Error> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.scripted_failures.lock().pop_front() {
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl EventTransport for FakeTransport {
    async fn send_identity_changed(
        &self,
        to: &TransportId,
        old: Option<&Identity>,
        new: Option<&Identity>,
    ) -> Result<(), transport::Error> {
        self.gate().await?;
        self.delivered.lock().push(Delivery::IdentityChanged {
            to: to.clone(),
            old: old.cloned(),
            new: new.cloned(),
        });
        Ok(())
    }

    async fn send_trust_changed(
        &self,
        to: &TransportId,
        old: Option<&Trust>,
        new: Option<&Trust>,
    ) -> Result<(), transport::Error> {
        self.gate().await?;
        self.delivered.lock().push(Delivery::TrustChanged {
            to: to.clone(),
            old: old.cloned(),
            new: new.cloned(),
        });
        Ok(())
    }

    async fn send_score_changed(
        &self,
        to: &TransportId,
        old: Option<&Score>,
        new: Option<&Score>,
    ) -> Result<(), transport::Error> {
        self.gate().await?;
        self.delivered.lock().push(Delivery::ScoreChanged {
            to: to.clone(),
            old: old.cloned(),
            new: new.cloned(),
        });
        Ok(())
    }

    async fn send_sync_marker(
        &self,
        to: &TransportId,
        subscription: &SubscriptionId,
        version: Uuid,
        marker: SyncMarker,
        stream: StreamKind,
    ) -> Result<(), transport::Error> {
        self.gate().await?;
        self.delivered.lock().push(Delivery::Marker {
            to: to.clone(),
            subscription: *subscription,
            version,
            marker,
            stream,
        });
        Ok(())
    }

    async fn send_unsubscribed(
        &self,
        to: &TransportId,
        stream: StreamKind,
        subscription: &SubscriptionId,
    ) -> Result<(), transport::Error> {
        self.gate().await?;
        self.delivered.lock().push(Delivery::Unsubscribed {
            to: to.clone(),
            stream,
            subscription: *subscription,
        });
        Ok(())
    }
}

/// Wraps a store transaction and fires a cancellation token once a given
/// number of notification writes went through, emulating a stop signal that
/// arrives while a large snapshot is still being queued.
struct CancelAfterWrites<'a> {
    inner: StoreTransaction<'a>,
    cancel: CancellationToken,
    cancel_after: usize,
    writes: Arc<AtomicUsize>,
}

#[async_trait]
impl DbTransactionFinalizer for CancelAfterWrites<'_> {
    type Err = DbError;

    async fn commit(self: Box<Self>) -> Result<(), DbError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), DbError> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl<'a> EventStoreTransaction<'a, DbError> for CancelAfterWrites<'a> {
    async fn get_client(&mut self, transport_id: &TransportId) -> Result<Option<Client>, DbError> {
        self.inner.get_client(transport_id).await
    }

    async fn add_client(&mut self, client: Client) -> Result<(), DbError> {
        self.inner.add_client(client).await
    }

    async fn update_client(&mut self, client: &Client) -> Result<(), DbError> {
        self.inner.update_client(client).await
    }

    async fn remove_client(&mut self, transport_id: &TransportId) -> Result<(), DbError> {
        self.inner.remove_client(transport_id).await
    }

    async fn get_subscription(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<Option<Subscription>, DbError> {
        self.inner.get_subscription(id).await
    }

    async fn client_subscriptions(
        &mut self,
        transport_id: &TransportId,
    ) -> Result<Vec<Subscription>, DbError> {
        self.inner.client_subscriptions(transport_id).await
    }

    async fn client_subscription_of(
        &mut self,
        transport_id: &TransportId,
        stream: StreamKind,
    ) -> Result<Option<Subscription>, DbError> {
        self.inner.client_subscription_of(transport_id, stream).await
    }

    async fn subscriptions_of(&mut self, stream: StreamKind) -> Result<Vec<Subscription>, DbError> {
        self.inner.subscriptions_of(stream).await
    }

    async fn add_subscription(&mut self, subscription: Subscription) -> Result<(), DbError> {
        self.inner.add_subscription(subscription).await
    }

    async fn remove_subscription(&mut self, id: &SubscriptionId) -> Result<(), DbError> {
        self.inner.remove_subscription(id).await
    }

    async fn add_notification(&mut self, notification: Notification) -> Result<(), DbError> {
        self.inner.add_notification(notification).await?;
        let total = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
        if total == self.cancel_after {
            self.cancel.cancel();
        }
        Ok(())
    }

    async fn remove_notification(
        &mut self,
        transport_id: &TransportId,
        index: u64,
    ) -> Result<(), DbError> {
        self.inner.remove_notification(transport_id, index).await
    }

    async fn remove_subscription_notifications(
        &mut self,
        id: &SubscriptionId,
    ) -> Result<(), DbError> {
        self.inner.remove_subscription_notifications(id).await
    }

    async fn remove_client_notifications(
        &mut self,
        transport_id: &TransportId,
    ) -> Result<(), DbError> {
        self.inner.remove_client_notifications(transport_id).await
    }

    async fn clear_all(&mut self) -> Result<(), DbError> {
        self.inner.clear_all().await
    }
}

struct Harness {
    engine: Arc<EventEngine>,
    store: MemoryEventStore,
    source: Arc<FakeSource>,
    transport: Arc<FakeTransport>,
}

fn harness() -> Harness {
    let store = MemoryEventStore::new();
    let source = Arc::new(FakeSource::default());
    let transport = Arc::new(FakeTransport::default());
    let engine = EventEngine::new(
        Arc::new(store.clone()),
        source.clone(),
        transport.clone(),
        EngineConfig {
            process_delay: Duration::from_millis(10),
            disconnect_after_failures: 5,
        },
    );
    Harness {
        engine,
        store,
        source,
        transport,
    }
}

impl Harness {
    async fn subscribe(
        &self,
        client: &str,
        stream: StreamKind,
    ) -> Result<SubscriptionId, Error> {
        self.subscribe_with(client, stream, &CancellationToken::new())
            .await
    }

    async fn subscribe_with(
        &self,
        client: &str,
        stream: StreamKind,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId, Error> {
        let mut tx = self.store.begin_transaction().await.expect("begin");
        match self
            .engine
            .subscribe(&mut tx, &client.into(), stream, cancel)
            .await
        {
            Ok(id) => {
                tx.commit().await.expect("commit");
                Ok(id)
            }
            Err(err) => {
                tx.rollback().await.expect("rollback");
                Err(err)
            }
        }
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), Error> {
        let mut tx = self.store.begin_transaction().await.expect("begin");
        match self.engine.unsubscribe(&mut tx, id).await {
            Ok(()) => {
                tx.commit().await.expect("commit");
                Ok(())
            }
            Err(err) => {
                tx.rollback().await.expect("rollback");
                Err(err)
            }
        }
    }

    async fn emit_identity(&self, old: Option<&Identity>, new: Option<&Identity>) {
        let mut tx = self.store.begin_transaction().await.expect("begin");
        self.engine
            .identity_changed(&mut tx, old, new)
            .await
            .expect("identity_changed");
        tx.commit().await.expect("commit");
        self.engine.schedule_deployment();
    }

    async fn queue(&self, client: &str) -> Vec<trustgraph_common::events::Notification> {
        self.store
            .client_notifications(&client.into())
            .await
            .expect("read queue")
    }

    async fn wait_until_drained(&self, client: &str) {
        for _ in 0..400 {
            if self.queue(client).await.is_empty() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("queue of {client} never drained");
    }

    async fn wait_until_removed(&self, client: &str) {
        for _ in 0..400 {
            if self
                .store
                .get_client(&client.into())
                .await
                .expect("read client")
                .is_none()
            {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("client {client} never removed");
    }
}

#[tokio::test]
async fn fresh_snapshot_is_framed_and_delivered() {
    let h = harness();
    *h.source.identities.lock() = vec![
        Identity::new("id-a", Some("a".to_owned()), true),
        Identity::new("id-b", None, false),
    ];

    h.engine.start().await.expect("start");
    let subscription = h
        .subscribe("alice", StreamKind::Identities)
        .await
        .expect("subscribe");

    // queue before delivery: Begin, one Changed per identity, End
    let queue = h.queue("alice").await;
    assert_eq!(queue.len(), 4);
    assert_eq!(
        queue.iter().map(|n| n.index).collect::<Vec<_>>(),
        vec![0, 1, 2, 3]
    );

    let version = match &queue[0].body {
        NotificationBody::Begin { version, stream } => {
            assert_eq!(*stream, StreamKind::Identities);
            *version
        }
        other => panic!("queue does not open with Begin: {other:?}"),
    };
    for changed in &queue[1..3] {
        match &changed.body {
            NotificationBody::Changed { old, new, .. } => {
                assert!(old.is_none());
                let entity =
                    Identity::from_payload(new.as_ref().expect("payload")).expect("decode");
                assert_eq!(entity.version_id(), Some(version));
            }
            other => panic!("expected Changed, got {other:?}"),
        }
    }
    assert!(matches!(
        &queue[3].body,
        NotificationBody::End { version: v, .. } if *v == version
    ));

    h.engine.schedule_deployment();
    h.wait_until_drained("alice").await;

    let delivered = h.transport.delivered();
    assert_eq!(delivered.len(), 4);
    assert!(matches!(
        &delivered[0],
        Delivery::Marker { marker: SyncMarker::Begin, subscription: s, version: v, .. }
            if *s == subscription && *v == version
    ));
    assert!(matches!(
        &delivered[1],
        Delivery::IdentityChanged { new: Some(identity), .. } if identity.id == "id-a"
    ));
    assert!(matches!(
        &delivered[2],
        Delivery::IdentityChanged { new: Some(identity), .. } if identity.id == "id-b"
    ));
    assert!(matches!(
        &delivered[3],
        Delivery::Marker { marker: SyncMarker::End, version: v, .. } if *v == version
    ));

    h.engine.stop().await;
}

#[tokio::test]
async fn causal_order_is_preserved_across_stream_types() {
    let h = harness();
    h.engine.start().await.expect("start");

    h.subscribe("alice", StreamKind::Identities)
        .await
        .expect("subscribe identities");
    h.subscribe("alice", StreamKind::Trusts)
        .await
        .expect("subscribe trusts");

    // the producer creates identity X and the trust edge X -> Y in one
    // transaction; the identity event is emitted first
    let x = Identity::new("id-x", None, true);
    let t = Trust::new("id-x", "id-y", 75, "introduced").expect("trust");
    {
        let mut tx = h.store.begin_transaction().await.expect("begin");
        h.engine
            .identity_changed(&mut tx, None, Some(&x))
            .await
            .expect("identity_changed");
        h.engine
            .trust_changed(&mut tx, None, Some(&t))
            .await
            .expect("trust_changed");
        tx.commit().await.expect("commit");
    }
    h.engine.schedule_deployment();
    h.wait_until_drained("alice").await;

    let delivered = h.transport.delivered();
    let identity_pos = delivered
        .iter()
        .position(|d| {
            matches!(d, Delivery::IdentityChanged { new: Some(i), .. } if i.id == "id-x")
        })
        .expect("identity delivered");
    let trust_pos = delivered
        .iter()
        .position(|d| {
            matches!(d, Delivery::TrustChanged { new: Some(t), .. } if t.trustee == "id-y")
        })
        .expect("trust delivered");
    assert!(
        identity_pos < trust_pos,
        "identity creation must arrive before the trust that depends on it"
    );

    h.engine.stop().await;
}

#[tokio::test]
async fn queue_indices_stay_contiguous_and_bounded() {
    let h = harness();

    h.subscribe("alice", StreamKind::Identities)
        .await
        .expect("subscribe");
    for n in 0..3 {
        let identity = Identity::new(format!("id-{n}"), None, false);
        let mut tx = h.store.begin_transaction().await.expect("begin");
        h.engine
            .identity_changed(&mut tx, None, Some(&identity))
            .await
            .expect("identity_changed");
        tx.commit().await.expect("commit");
    }

    let client = h
        .store
        .get_client(&"alice".into())
        .await
        .expect("read")
        .expect("client exists");
    let indices: Vec<u64> = h.queue("alice").await.iter().map(|n| n.index).collect();

    assert!(indices.windows(2).all(|w| w[0] < w[1]));
    assert!(indices
        .iter()
        .all(|index| *index < client.next_notification_index));
    // nothing delivered yet, so the prefix starts at zero
    assert_eq!(indices.first(), Some(&0));
}

#[tokio::test]
async fn duplicate_subscription_is_rejected_without_queue_changes() {
    let h = harness();

    h.subscribe("alice", StreamKind::Identities)
        .await
        .expect("first subscribe");
    let queue_before = h.queue("alice").await;

    let result = h.subscribe("alice", StreamKind::Identities).await;
    assert!(matches!(
        result,
        Err(Error::SubscriptionExistsAlready(StreamKind::Identities))
    ));
    assert_eq!(h.queue("alice").await, queue_before);

    // a different stream on the same client is fine
    h.subscribe("alice", StreamKind::Trusts)
        .await
        .expect("different stream");
}

#[tokio::test]
async fn retry_budget_exhaustion_removes_the_client() {
    let h = harness();
    h.engine.start().await.expect("start");

    let subscription = h
        .subscribe("bob", StreamKind::Identities)
        .await
        .expect("subscribe");
    h.transport.fail_next(
        (0..5).map(|n| transport::Error::Client(format!("handler crashed ({n})"))),
    );

    h.engine.schedule_deployment();
    h.wait_until_removed("bob").await;

    assert!(h.queue("bob").await.is_empty());
    assert!(h
        .store
        .get_subscription(&subscription)
        .await
        .expect("read")
        .is_none());
    assert!(h.transport.delivered().iter().any(|d| matches!(
        d,
        Delivery::Unsubscribed { subscription: s, stream: StreamKind::Identities, .. }
            if *s == subscription
    )));

    h.engine.stop().await;
}

#[tokio::test]
async fn one_success_resets_the_failure_counter() {
    let h = harness();
    h.engine.start().await.expect("start");

    h.subscribe("bob", StreamKind::Scores)
        .await
        .expect("subscribe");
    h.transport.fail_next([
        transport::Error::Client("slow consumer".to_owned()),
        transport::Error::Client("slow consumer".to_owned()),
    ]);

    h.engine.schedule_deployment();
    h.wait_until_drained("bob").await;

    let client = h
        .store
        .get_client(&"bob".into())
        .await
        .expect("read")
        .expect("client still present");
    assert_eq!(client.failure_count, 0);

    h.engine.stop().await;
}

#[tokio::test]
async fn disconnect_removes_the_client_immediately() {
    let h = harness();
    h.engine.start().await.expect("start");

    h.subscribe("bob", StreamKind::Identities)
        .await
        .expect("subscribe");
    h.transport.fail_next([transport::Error::Disconnected]);

    h.engine.schedule_deployment();
    h.wait_until_removed("bob").await;

    h.engine.stop().await;
}

#[tokio::test]
async fn unsubscribe_cascades_and_removes_the_last_client() {
    let h = harness();

    let identities = h
        .subscribe("carol", StreamKind::Identities)
        .await
        .expect("subscribe identities");
    let trusts = h
        .subscribe("carol", StreamKind::Trusts)
        .await
        .expect("subscribe trusts");

    h.unsubscribe(&identities).await.expect("unsubscribe");
    // the trust snapshot is still queued, the client stays
    assert!(h
        .store
        .get_client(&"carol".into())
        .await
        .expect("read")
        .is_some());
    assert!(h
        .queue("carol")
        .await
        .iter()
        .all(|n| n.subscription == trusts));

    h.unsubscribe(&trusts).await.expect("unsubscribe last");
    assert!(h
        .store
        .get_client(&"carol".into())
        .await
        .expect("read")
        .is_none());
    assert!(h.queue("carol").await.is_empty());

    assert!(matches!(
        h.unsubscribe(&identities).await,
        Err(Error::UnknownSubscription(_))
    ));
}

#[tokio::test]
async fn cancelled_subscribe_leaves_no_state_behind() {
    let h = harness();
    *h.source.identities.lock() = (0..100)
        .map(|n| Identity::new(format!("id-{n}"), None, false))
        .collect();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = h
        .subscribe_with("dave", StreamKind::Identities, &cancel)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));

    assert!(h
        .store
        .get_client(&"dave".into())
        .await
        .expect("read")
        .is_none());
    assert!(h.store.list_clients().await.expect("list").is_empty());
    assert!(h.queue("dave").await.is_empty());
}

#[tokio::test]
async fn cancellation_mid_snapshot_rolls_back_partial_state() {
    let h = harness();
    *h.source.identities.lock() = (0..100)
        .map(|n| Identity::new(format!("id-{n}"), None, false))
        .collect();

    // the stop signal fires after the Begin marker and four identities have
    // been queued, partway through the 100-entity snapshot loop
    let cancel = CancellationToken::new();
    let writes = Arc::new(AtomicUsize::new(0));
    let inner = h.store.begin_transaction().await.expect("begin");
    let mut tx: StoreTransaction<'_> = Box::new(CancelAfterWrites {
        inner,
        cancel: cancel.clone(),
        cancel_after: 5,
        writes: writes.clone(),
    });

    let result = h
        .engine
        .subscribe(&mut tx, &"dave".into(), StreamKind::Identities, &cancel)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)));
    tx.rollback().await.expect("rollback");

    // the snapshot loop stopped at the next entity boundary: some but not
    // all of the 100 identities were iterated
    assert_eq!(writes.load(Ordering::SeqCst), 5);

    assert!(h
        .store
        .get_client(&"dave".into())
        .await
        .expect("read")
        .is_none());
    assert!(h.store.list_clients().await.expect("list").is_empty());
    assert!(h.queue("dave").await.is_empty());
}

#[tokio::test]
async fn restart_discards_every_client() {
    let h = harness();
    h.engine.start().await.expect("start");

    h.subscribe("alice", StreamKind::Identities)
        .await
        .expect("subscribe");
    h.subscribe("bob", StreamKind::Trusts)
        .await
        .expect("subscribe");
    h.emit_identity(None, Some(&Identity::new("id-x", None, false)))
        .await;

    h.engine.stop().await;
    h.engine.start().await.expect("restart");

    assert!(h.store.list_clients().await.expect("list").is_empty());
    assert!(h.queue("alice").await.is_empty());
    assert!(h.queue("bob").await.is_empty());

    h.engine.stop().await;
}

#[tokio::test]
async fn stop_interrupts_a_hanging_transfer_promptly() {
    let h = harness();
    h.engine.start().await.expect("start");

    h.subscribe("alice", StreamKind::Identities)
        .await
        .expect("subscribe");
    h.transport.hang.store(true, Ordering::SeqCst);
    h.engine.schedule_deployment();

    // wait until the worker is stuck inside the transport call
    for _ in 0..400 {
        if h.transport.attempts.load(Ordering::SeqCst) > 0 {
            break;
        }
        sleep(Duration::from_millis(5)).await;
    }
    assert!(h.transport.attempts.load(Ordering::SeqCst) > 0);

    tokio::time::timeout(Duration::from_secs(2), h.engine.stop())
        .await
        .expect("stop must return within one transfer boundary");

    // the in-flight notification was rolled back, not counted as a failure
    let client = h
        .store
        .get_client(&"alice".into())
        .await
        .expect("read")
        .expect("client kept");
    assert_eq!(client.failure_count, 0);
    assert!(!h.queue("alice").await.is_empty());
}

#[tokio::test]
async fn deleted_entities_are_delivered_with_an_empty_new_state() {
    let h = harness();
    h.engine.start().await.expect("start");

    h.subscribe("alice", StreamKind::Identities)
        .await
        .expect("subscribe");
    let gone = Identity::new("id-gone", None, false);
    h.emit_identity(Some(&gone), None).await;
    h.wait_until_drained("alice").await;

    assert!(h.transport.delivered().iter().any(|d| matches!(
        d,
        Delivery::IdentityChanged { old: Some(i), new: None, .. } if i.id == "id-gone"
    )));

    h.engine.stop().await;
}
