//! Dispatch retryable key fetches under token-bucket admission control.
//!
//! A client that needs the data behind a [Key] builds a [request::Request] bound to a
//! [request::Group] and schedules it. The request is routed to the [Scheduler] bound to the
//! key's [Family], which later calls [request::Request::send] to perform the low-level
//! [Lookup]. Failed lookups are retried under a bounded budget and, once the budget is
//! exhausted, reported to the group's [Consumer] as a classified [Failure].
//!
//! How fast requests may be sent is governed by a [bucket::TokenBucket]. The [starter]
//! dispatcher acquires tokens from a shared bucket before each send so that the node never
//! exceeds its configured bandwidth budget.
//!
//! # Status
//!
//! `commonware-fetch` is **ALPHA** software and is not yet recommended for production use. Developers should
//! expect breaking changes and occasional instability.

use bytes::Bytes;
use std::{fmt, future::Future};
use thiserror::Error;

pub mod bucket;
pub mod failure;
pub use failure::{Failure, Fault};
pub mod key;
pub use key::{Family, Key};
pub mod request;
pub mod starter;

#[cfg(any(test, feature = "mocks"))]
pub mod mocks;

/// Data retrieved for a [Key].
pub type Block = Bytes;

/// Errors caused by invalid configuration or a stopped scheduler.
///
/// These are never retried: they surface immediately to whoever made the call.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("no scheduler bound for {0} keys")]
    Unbound(Family),
    #[error("invalid retry budget: {0}")]
    InvalidRetries(i32),
    #[error("bucket capacity must be positive")]
    InvalidCapacity,
    #[error("tick interval must be positive")]
    InvalidInterval,
    #[error("scheduler closed")]
    Closed,
}

/// Performs the low-level search for a key over the network and the local store.
pub trait Lookup: Clone + Send + 'static {
    /// Fetch the block for `key`.
    ///
    /// `local_only` restricts the search to the local store, `cache` allows the result
    /// to be written into the local store, and `ignore_store` skips the local store when
    /// searching.
    fn fetch(
        &mut self,
        key: Key,
        local_only: bool,
        cache: bool,
        ignore_store: bool,
    ) -> impl Future<Output = Result<Block, Fault>> + Send;
}

/// Accepts requests for later dispatch.
///
/// One scheduler is bound to each key [Family].
pub trait Scheduler<R>: Clone + Send + Sync + 'static {
    /// Queue a request for dispatch.
    ///
    /// Returns [Error::Closed] if the scheduler no longer dispatches requests.
    fn register(&self, request: R) -> Result<(), Error>;
}

/// Receives the result of requests made on behalf of a request group.
pub trait Consumer: Clone + Send + Sync + 'static {
    /// Deliver the block fetched for a key.
    fn deliver(&mut self, key: Key, block: Block) -> impl Future<Output = ()> + Send;

    /// Let the consumer know that a key could not be fetched.
    fn failed(&mut self, key: Key, failure: Failure) -> impl Future<Output = ()> + Send;
}

/// Priority class of a request group.
///
/// Ordered from most to least urgent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Maximum,
    Interactive,
    ImmediateSplitfile,
    Update,
    #[default]
    Bulk,
    Prefetch,
    Minimum,
}

/// Identity of the client on whose behalf a request group runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Client(pub u64);

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Options that control how a request consults the local store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Settings {
    /// Only search the local store.
    pub local_request_only: bool,

    /// Write fetched data into the local store.
    pub cache_local_requests: bool,

    /// Skip the local store when searching.
    pub ignore_store: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_request_only: false,
            cache_local_requests: true,
            ignore_store: false,
        }
    }
}
