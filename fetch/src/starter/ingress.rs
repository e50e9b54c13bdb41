use crate::{request::Request, Consumer, Error, Scheduler};
use futures::channel::mpsc;
use std::sync::Arc;
use tracing::error;

/// A request that is dispatched by a [super::Actor].
pub type Queued<C> = Arc<Request<Queue<C>, C>>;

/// Hands requests to a running [super::Actor].
///
/// Bind a [Queue] to one or more key families of a [crate::request::Group] to have the requests
/// of those families dispatched by the actor.
pub struct Queue<C> {
    sender: mpsc::UnboundedSender<Queued<C>>,
}

impl<C> Queue<C> {
    pub(super) fn new(sender: mpsc::UnboundedSender<Queued<C>>) -> Self {
        Self { sender }
    }
}

impl<C> Clone for Queue<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<C: Consumer> Scheduler<Queued<C>> for Queue<C> {
    fn register(&self, request: Queued<C>) -> Result<(), Error> {
        self.sender.unbounded_send(request).map_err(|err| {
            error!(key = %err.into_inner().key(), "dispatcher stopped");
            Error::Closed
        })
    }
}
