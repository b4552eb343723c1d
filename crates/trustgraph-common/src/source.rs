//! Read interface of the trust-graph producer.

use async_trait::async_trait;

use crate::graph::{Identity, Score, Trust};

/// Producer read error
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct Error(Box<dyn std::error::Error + Send + Sync>);

impl Error {
    /// Wrap a backend error
    pub fn new<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self(Box::new(err))
    }
}

/// Snapshot reads against the producer's store.
///
/// The engine calls these while the producer's write lock is held by the
/// caller, so the returned sequences are mutually consistent. Entities come
/// back as clones owned by the caller.
#[async_trait]
pub trait GraphSource: Send + Sync {
    /// Every identity currently known
    async fn list_identities(&self) -> Result<Vec<Identity>, Error>;

    /// Every trust edge currently known
    async fn list_trusts(&self) -> Result<Vec<Trust>, Error>;

    /// Every score currently known
    async fn list_scores(&self) -> Result<Vec<Score>, Error>;
}
