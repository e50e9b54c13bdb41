use crate::{Block, Failure, Key};
use futures::channel::mpsc;

/// An event that indicates the messages that were sent to the consumer
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// The consumer received the block fetched for a key
    Delivered(Key, Block),

    /// The consumer was told that a key could not be fetched
    Failed(Key, Failure),
}

/// A consumer that can be used for testing
#[derive(Clone)]
pub struct Consumer {
    /// The sender to send events to
    sender: mpsc::UnboundedSender<Event>,
}

impl Consumer {
    /// Create a new consumer
    ///
    /// Returns the consumer and a receiver that can be used to get the events
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }

    /// Create a dummy consumer whose events are dropped
    pub fn dummy() -> Self {
        let (sender, _) = mpsc::unbounded();
        Self { sender }
    }
}

impl crate::Consumer for Consumer {
    async fn deliver(&mut self, key: Key, block: Block) {
        let _ = self.sender.unbounded_send(Event::Delivered(key, block));
    }

    async fn failed(&mut self, key: Key, failure: Failure) {
        let _ = self.sender.unbounded_send(Event::Failed(key, failure));
    }
}
