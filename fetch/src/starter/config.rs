use crate::{bucket::TokenBucket, Lookup};
use commonware_runtime::Clock;

/// Configuration for the dispatcher.
pub struct Config<E: Clock, L: Lookup> {
    /// Performs the lookup for each dispatched request
    pub lookup: L,

    /// Bucket that admits each dispatch
    ///
    /// May be shared with other dispatchers (and any other work) that draw on the same budget.
    pub bucket: TokenBucket<E>,

    /// Tokens withdrawn from the bucket for each dispatch
    pub cost: u64,
}
