//! Dispatch requests under token-bucket admission control.
//!
//! The [Actor] owns a priority queue of requests. A [Queue] is bound (as the [crate::Scheduler])
//! to the key families of one or more [crate::request::Group]s, so that every request they
//! schedule (or reschedule after a failure) lands in the actor's queue. Requests are dispatched
//! most urgent [crate::Priority] first and oldest first within a class.
//!
//! Before each dispatch the actor withdraws `cost` tokens from its [crate::bucket::TokenBucket],
//! waiting if the balance does not cover them. The lookup itself runs in its own task so that a
//! slow lookup never holds up the queue. Requests found cancelled are dispatched without
//! withdrawing tokens (only to tell the consumer), and a request cancelled while its lookup was
//! in flight has its tokens returned.

mod actor;
pub use actor::Actor;
mod config;
pub use config::Config;
mod ingress;
pub use ingress::{Queue, Queued};
mod metrics;
