//! Change-event subscription and delivery engine for a trust-graph service.
//!
//! Clients subscribe to streams of domain entities (identities, trust edges,
//! scores) and receive an initial snapshot framed by begin/end markers,
//! followed by strictly ordered incremental change events. Delivery is
//! at-most-once with per-client causal ordering across stream types: a trust
//! change never reaches a client before the identity creation it depends on.
//!
//! Queue state lives in a durable store behind the
//! [`database`](trustgraph_common::database) traits; a ticker-driven worker
//! flushes it over the [`transport`](trustgraph_common::transport) interface,
//! committing each delivered notification as its own transactional unit so a
//! crash never loses acknowledged state.

#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod engine;

#[doc(hidden)]
pub use trustgraph_common::{
    database,
    error::{self, Error},
    events, graph, source, transport,
};

pub use self::engine::{EngineConfig, EventEngine};
