//! Mock implementations of the traits the crate depends on, for use in tests.

mod consumer;
pub use consumer::{Consumer, Event};
mod lookup;
pub use lookup::{Call, Lookup, Response};
mod scheduler;
pub use scheduler::Recorder;
