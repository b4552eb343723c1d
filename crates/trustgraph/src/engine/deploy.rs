//! Ticker-driven deployment of queued notifications.
//!
//! A single worker drains each client's queue in index order, without
//! holding the producer lock: payloads are self-contained clones. Exactly
//! one notification's delivery-and-deletion forms a committed unit, so after
//! a crash the queue matches what the client acknowledged, modulo one
//! possible duplicate the wire protocol requires clients to tolerate.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use trustgraph_common::events::{Client, Notification, NotificationBody, StreamKind};
use trustgraph_common::graph::{GraphEntity, Identity, Score, Trust};
use trustgraph_common::transport::{self, SyncMarker};
use trustgraph_common::Error;

use super::EventEngine;

/// What to do with a client after walking its queue.
enum ClientOutcome {
    /// Queue fully flushed
    Drained,
    /// Delivery failed; try again on a later run
    Retry,
    /// Client must be removed
    Remove,
}

fn decode<E: GraphEntity>(payload: Option<&Vec<u8>>) -> Result<Option<E>, Error> {
    payload
        .map(|bytes| E::from_payload(bytes))
        .transpose()
        .map_err(Error::from)
}

impl EventEngine {
    pub(crate) async fn worker_loop(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<()>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                request = requests.recv() => {
                    if request.is_none() {
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.process_delay) => {}
            }

            match self.deploy_pending(&cancel).await {
                Ok(false) => {}
                Ok(true) => self.schedule_deployment(),
                Err(Error::Cancelled) => break,
                Err(err) => {
                    tracing::error!("deployment run failed: {err}");
                    self.schedule_deployment();
                }
            }
        }
        tracing::debug!("deployment worker exited");
    }

    /// Flush every client's queue once. Returns whether another run is
    /// wanted because at least one client still has undelivered work.
    #[instrument(skip_all)]
    pub(crate) async fn deploy_pending(&self, cancel: &CancellationToken) -> Result<bool, Error> {
        let _core = self.core_lock.lock().await;

        let clients = self.store.list_clients().await?;
        let mut retry = false;
        let mut delivered = 0usize;

        for client in clients {
            match self.deploy_client(&client, cancel, &mut delivered).await {
                Ok(ClientOutcome::Drained) => {}
                Ok(ClientOutcome::Retry) => retry = true,
                Ok(ClientOutcome::Remove) => self.remove_client(&client).await?,
                Err(err @ Error::Cancelled) => return Err(err),
                Err(err) => {
                    tracing::error!(client = %client.transport_id, "delivery aborted: {err}");
                    retry = true;
                }
            }
        }

        tracing::debug!(delivered, retry, "deployment run finished");
        Ok(retry)
    }

    async fn deploy_client(
        &self,
        client: &Client,
        cancel: &CancellationToken,
        delivered: &mut usize,
    ) -> Result<ClientOutcome, Error> {
        let mut client = client.clone();
        let queue = self.store.client_notifications(&client.transport_id).await?;

        for notification in queue {
            let mut tx = self.store.begin_transaction().await?;

            match self.dispatch(&notification, cancel).await {
                Ok(()) => {
                    tx.remove_notification(&client.transport_id, notification.index)
                        .await?;
                    if client.failure_count != 0 {
                        client.failure_count = 0;
                        tx.update_client(&client).await?;
                    }
                    tx.commit().await?;
                    *delivered += 1;
                }
                Err(Error::Cancelled) | Err(Error::Transport(transport::Error::Cancelled)) => {
                    tx.rollback().await?;
                    return Err(Error::Cancelled);
                }
                Err(err) => {
                    tx.rollback().await?;

                    let disconnect =
                        matches!(&err, Error::Transport(cause) if cause.is_disconnect());
                    client.failure_count = client.failure_count.saturating_add(1);

                    let mut tx = self.store.begin_transaction().await?;
                    tx.update_client(&client).await?;
                    tx.commit().await?;

                    tracing::info!(
                        client = %client.transport_id,
                        failures = client.failure_count,
                        "delivery failed: {err}"
                    );

                    if disconnect
                        || client.failure_count >= self.config.disconnect_after_failures
                    {
                        return Ok(ClientOutcome::Remove);
                    }
                    return Ok(ClientOutcome::Retry);
                }
            }
        }

        Ok(ClientOutcome::Drained)
    }

    /// Send one notification, racing the transport call against
    /// cancellation so shutdown never waits for a slow peer.
    async fn dispatch(
        &self,
        notification: &Notification,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.send(notification) => result,
        }
    }

    async fn send(&self, notification: &Notification) -> Result<(), Error> {
        let to = &notification.transport_id;
        match &notification.body {
            NotificationBody::Begin { version, stream } => {
                self.transport
                    .send_sync_marker(
                        to,
                        &notification.subscription,
                        *version,
                        SyncMarker::Begin,
                        *stream,
                    )
                    .await?;
            }
            NotificationBody::End { version, stream } => {
                self.transport
                    .send_sync_marker(
                        to,
                        &notification.subscription,
                        *version,
                        SyncMarker::End,
                        *stream,
                    )
                    .await?;
            }
            NotificationBody::Changed { stream, old, new } => match stream {
                StreamKind::Identities => {
                    let old = decode::<Identity>(old.as_ref())?;
                    let new = decode::<Identity>(new.as_ref())?;
                    self.transport
                        .send_identity_changed(to, old.as_ref(), new.as_ref())
                        .await?;
                }
                StreamKind::Trusts => {
                    let old = decode::<Trust>(old.as_ref())?;
                    let new = decode::<Trust>(new.as_ref())?;
                    self.transport
                        .send_trust_changed(to, old.as_ref(), new.as_ref())
                        .await?;
                }
                StreamKind::Scores => {
                    let old = decode::<Score>(old.as_ref())?;
                    let new = decode::<Score>(new.as_ref())?;
                    self.transport
                        .send_score_changed(to, old.as_ref(), new.as_ref())
                        .await?;
                }
            },
        }
        Ok(())
    }

    /// Drop a client with everything it owns and notify it best-effort.
    async fn remove_client(&self, client: &Client) -> Result<(), Error> {
        let subscriptions = self.store.client_subscriptions(&client.transport_id).await?;

        let mut tx = self.store.begin_transaction().await?;
        tx.remove_client_notifications(&client.transport_id).await?;
        for subscription in &subscriptions {
            tx.remove_subscription(&subscription.id).await?;
        }
        tx.remove_client(&client.transport_id).await?;
        tx.commit().await?;

        tracing::info!(client = %client.transport_id, "client removed after failed delivery");

        for subscription in &subscriptions {
            if let Err(err) = self
                .transport
                .send_unsubscribed(&client.transport_id, subscription.stream, &subscription.id)
                .await
            {
                tracing::debug!(
                    subscription = %subscription.id,
                    "unsubscribed notice not delivered: {err}"
                );
            }
        }
        Ok(())
    }
}
