//! Trust-graph domain entities.
//!
//! The engine never holds references into the producer's store: every entity
//! it sees is a deep-copy clone, stamped with an optional snapshot version and
//! serialized into a self-contained CBOR buffer before it is queued. A queued
//! payload can therefore be delivered long after the producer moved on,
//! without any producer-side lock.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::StreamKind;

/// Trust values are expressed in percent, from full distrust to full trust.
pub const TRUST_VALUE_RANGE: std::ops::RangeInclusive<i8> = -100..=100;

/// Largest capacity a score may assign, in percent.
pub const MAX_CAPACITY: u8 = 100;

/// Entity validation and codec errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Value outside the domain range
    #[error("value {0} is outside the allowed range")]
    ValueOutOfRange(i64),
    /// CBOR encoding failed
    #[error(transparent)]
    Encode(#[from] ciborium::ser::Error<std::io::Error>),
    /// CBOR decoding failed
    #[error(transparent)]
    Decode(#[from] ciborium::de::Error<std::io::Error>),
}

/// Common behavior of the entities a stream can observe.
///
/// Implementors are value types: cloning one is a deep copy. The `id` is
/// stable across versions of the same entity, while the version id changes
/// with every snapshot the entity is part of.
pub trait GraphEntity:
    Clone + std::fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// The stream on which changes to this entity type are published
    const STREAM: StreamKind;

    /// Stable identifier, unique within the entity type
    fn id(&self) -> String;

    /// The snapshot version this clone was stamped with, if any
    fn version_id(&self) -> Option<Uuid>;

    /// Stamp this clone with a snapshot version
    fn set_version_id(&mut self, version: Uuid);

    /// Serialize this clone into a self-contained payload buffer
    fn to_payload(&self) -> Result<Vec<u8>, Error> {
        let mut buffer = Vec::new();
        ciborium::into_writer(self, &mut buffer)?;
        Ok(buffer)
    }

    /// Decode a buffer produced by [`GraphEntity::to_payload`]
    fn from_payload(bytes: &[u8]) -> Result<Self, Error> {
        Ok(ciborium::from_reader(bytes)?)
    }
}

/// A participant in the trust graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Stable identifier derived from the identity's public key
    pub id: String,
    /// Self-chosen display name, if the identity published one
    pub nickname: Option<String>,
    /// Whether the identity publishes its own trust list
    pub publishes_trust_list: bool,
    version_id: Option<Uuid>,
}

impl Identity {
    /// Create an identity clone without a snapshot version
    pub fn new(id: impl Into<String>, nickname: Option<String>, publishes_trust_list: bool) -> Self {
        Self {
            id: id.into(),
            nickname,
            publishes_trust_list,
            version_id: None,
        }
    }
}

impl GraphEntity for Identity {
    const STREAM: StreamKind = StreamKind::Identities;

    fn id(&self) -> String {
        self.id.clone()
    }

    fn version_id(&self) -> Option<Uuid> {
        self.version_id
    }

    fn set_version_id(&mut self, version: Uuid) {
        self.version_id = Some(version);
    }
}

/// A directed trust assignment between two identities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trust {
    /// Identity that assigned the trust
    pub truster: String,
    /// Identity the trust is assigned to
    pub trustee: String,
    value: i8,
    /// Free-form justification published with the assignment
    pub comment: String,
    version_id: Option<Uuid>,
}

impl Trust {
    /// Create a trust edge, validating the value range
    pub fn new(
        truster: impl Into<String>,
        trustee: impl Into<String>,
        value: i8,
        comment: impl Into<String>,
    ) -> Result<Self, Error> {
        if !TRUST_VALUE_RANGE.contains(&value) {
            return Err(Error::ValueOutOfRange(value.into()));
        }
        Ok(Self {
            truster: truster.into(),
            trustee: trustee.into(),
            value,
            comment: comment.into(),
            version_id: None,
        })
    }

    /// Trust value in percent
    pub fn value(&self) -> i8 {
        self.value
    }
}

impl GraphEntity for Trust {
    const STREAM: StreamKind = StreamKind::Trusts;

    fn id(&self) -> String {
        format!("{}:{}", self.truster, self.trustee)
    }

    fn version_id(&self) -> Option<Uuid> {
        self.version_id
    }

    fn set_version_id(&mut self, version: Uuid) {
        self.version_id = Some(version);
    }
}

/// A computed score of one identity as seen from another's trust tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Score {
    /// Identity owning the score tree
    pub truster: String,
    /// Identity the score applies to
    pub trustee: String,
    /// Accumulated score value
    pub value: i32,
    /// Distance from the tree owner, in trust steps
    pub rank: u32,
    capacity: u8,
    version_id: Option<Uuid>,
}

impl Score {
    /// Create a score, validating the capacity range
    pub fn new(
        truster: impl Into<String>,
        trustee: impl Into<String>,
        value: i32,
        rank: u32,
        capacity: u8,
    ) -> Result<Self, Error> {
        if capacity > MAX_CAPACITY {
            return Err(Error::ValueOutOfRange(capacity.into()));
        }
        Ok(Self {
            truster: truster.into(),
            trustee: trustee.into(),
            value,
            rank,
            capacity,
            version_id: None,
        })
    }

    /// Share of the truster's influence the trustee may pass on, in percent
    pub fn capacity(&self) -> u8 {
        self.capacity
    }
}

impl GraphEntity for Score {
    const STREAM: StreamKind = StreamKind::Scores;

    fn id(&self) -> String {
        format!("{}:{}", self.truster, self.trustee)
    }

    fn version_id(&self) -> Option<Uuid> {
        self.version_id
    }

    fn set_version_id(&mut self, version: Uuid) {
        self.version_id = Some(version);
    }
}
