use crate::{request::Request, Consumer, Error, Scheduler};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};

type Registered<C> = Arc<Request<Recorder<C>, C>>;

/// A scheduler that records registered requests until they are popped
///
/// Clones share the same queue.
pub struct Recorder<C> {
    registered: Arc<Mutex<VecDeque<Registered<C>>>>,
}

impl<C> Clone for Recorder<C> {
    fn clone(&self) -> Self {
        Self {
            registered: self.registered.clone(),
        }
    }
}

impl<C> Default for Recorder<C> {
    fn default() -> Self {
        Self {
            registered: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<C> Recorder<C> {
    /// Create a new recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the oldest registered request
    pub fn pop(&self) -> Option<Registered<C>> {
        self.registered.lock().unwrap().pop_front()
    }

    /// Returns the number of requests waiting to be popped
    pub fn len(&self) -> usize {
        self.registered.lock().unwrap().len()
    }

    /// Returns whether no requests are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<C: Consumer> Scheduler<Registered<C>> for Recorder<C> {
    fn register(&self, request: Registered<C>) -> Result<(), Error> {
        self.registered.lock().unwrap().push_back(request);
        Ok(())
    }
}
