use crate::{Block, Failure, Fault, Key};
use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::{Arc, Mutex},
};

/// A scripted answer to a single lookup
#[derive(Clone, Debug)]
pub enum Response {
    /// Return the block
    Block(Block),

    /// Fail with a classified failure
    Fail(Failure),

    /// Fail with an error outside of the taxonomy
    Unexpected(String),
}

/// A lookup that was performed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub key: Key,
    pub local_only: bool,
    pub cache: bool,
    pub ignore_store: bool,
}

type Hook = Arc<dyn Fn(&Key) + Send + Sync>;

#[derive(Default)]
struct State {
    /// Blocks returned once a key has no scripted responses left
    blocks: HashMap<Key, Block>,

    /// Responses returned (in order) before falling back to `blocks`
    scripted: HashMap<Key, VecDeque<Response>>,

    calls: Vec<Call>,
    hook: Option<Hook>,
}

/// A lookup that can be used for testing
///
/// Keys without a block fail with [Failure::NotFoundLocally] when the lookup is local-only
/// and [Failure::NotFoundInNetwork] otherwise. Clones share the same state.
#[derive(Clone, Default)]
pub struct Lookup {
    state: Arc<Mutex<State>>,
}

impl Lookup {
    /// Create a lookup that knows no blocks
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `block` for `key`
    pub fn insert(&self, key: Key, block: Block) {
        self.state.lock().unwrap().blocks.insert(key, block);
    }

    /// Queue a response for the next unanswered lookup of `key`
    pub fn script(&self, key: Key, response: Response) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(key)
            .or_default()
            .push_back(response);
    }

    /// Run `hook` at the start of every lookup, before it returns
    pub fn on_fetch(&self, hook: impl Fn(&Key) + Send + Sync + 'static) {
        self.state.lock().unwrap().hook = Some(Arc::new(hook));
    }

    /// Returns every lookup performed so far
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Returns the number of lookups performed so far
    pub fn count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

impl crate::Lookup for Lookup {
    async fn fetch(
        &mut self,
        key: Key,
        local_only: bool,
        cache: bool,
        ignore_store: bool,
    ) -> Result<Block, Fault> {
        let (hook, response) = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call {
                key: key.clone(),
                local_only,
                cache,
                ignore_store,
            });
            let scripted = state
                .scripted
                .get_mut(&key)
                .and_then(|responses| responses.pop_front());
            let response = match scripted {
                Some(response) => response,
                None => match state.blocks.get(&key) {
                    Some(block) => Response::Block(block.clone()),
                    None if local_only => Response::Fail(Failure::NotFoundLocally),
                    None => Response::Fail(Failure::NotFoundInNetwork),
                },
            };
            (state.hook.clone(), response)
        };
        if let Some(hook) = hook {
            hook(&key);
        }
        match response {
            Response::Block(block) => Ok(block),
            Response::Fail(failure) => Err(Fault::Classified(failure)),
            Response::Unexpected(message) => Err(Fault::unexpected(io::Error::other(message))),
        }
    }
}
