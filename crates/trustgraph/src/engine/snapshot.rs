//! Initial snapshot construction for new subscriptions.
//!
//! The snapshot is appended as one contiguous block: a `Begin` marker, one
//! `Changed` per current entity of the stream, and the matching `End`
//! marker, all stamped with a fresh version id. The producer lock held by
//! the caller also guards change-event emission, so nothing can interleave
//! with the block. Clients reconcile on `End` by sweeping every local object
//! whose stored version differs.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use trustgraph_common::events::{Client, Notification, NotificationBody, StreamKind, Subscription};
use trustgraph_common::graph::GraphEntity;
use trustgraph_common::Error;

use super::{EventEngine, StoreTransaction};

impl EventEngine {
    /// Queue `Begin`, the current entity set and `End` for a new
    /// subscription. Cancellable between entities.
    pub(crate) async fn build_snapshot(
        &self,
        tx: &mut StoreTransaction<'_>,
        client: &mut Client,
        subscription: &Subscription,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let version = Uuid::new_v4();

        self.push(
            tx,
            client,
            subscription,
            NotificationBody::Begin {
                version,
                stream: subscription.stream,
            },
        )
        .await?;

        let entities = match subscription.stream {
            StreamKind::Identities => {
                let entities = self.source.list_identities().await?;
                self.push_entities(tx, client, subscription, version, entities, cancel)
                    .await?
            }
            StreamKind::Trusts => {
                let entities = self.source.list_trusts().await?;
                self.push_entities(tx, client, subscription, version, entities, cancel)
                    .await?
            }
            StreamKind::Scores => {
                let entities = self.source.list_scores().await?;
                self.push_entities(tx, client, subscription, version, entities, cancel)
                    .await?
            }
        };

        self.push(
            tx,
            client,
            subscription,
            NotificationBody::End {
                version,
                stream: subscription.stream,
            },
        )
        .await?;

        tracing::debug!(%version, entities, "snapshot queued");
        Ok(())
    }

    async fn push_entities<E: GraphEntity>(
        &self,
        tx: &mut StoreTransaction<'_>,
        client: &mut Client,
        subscription: &Subscription,
        version: Uuid,
        entities: Vec<E>,
        cancel: &CancellationToken,
    ) -> Result<usize, Error> {
        let count = entities.len();
        for mut entity in entities {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            entity.set_version_id(version);
            let payload = entity.to_payload()?;
            self.push(
                tx,
                client,
                subscription,
                NotificationBody::Changed {
                    stream: E::STREAM,
                    old: None,
                    new: Some(payload),
                },
            )
            .await?;
        }
        Ok(count)
    }

    async fn push(
        &self,
        tx: &mut StoreTransaction<'_>,
        client: &mut Client,
        subscription: &Subscription,
        body: NotificationBody,
    ) -> Result<(), Error> {
        let index = client.allocate_index();
        tx.add_notification(Notification {
            transport_id: client.transport_id.clone(),
            subscription: subscription.id,
            index,
            body,
        })
        .await?;
        Ok(())
    }
}
