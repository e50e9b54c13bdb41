use super::{
    config::Config,
    ingress::{Queue, Queued},
    metrics::Metrics,
};
use crate::{bucket::TokenBucket, request::Outcome, Consumer, Lookup, Priority};
use commonware_runtime::{Clock, Handle, Metrics as RuntimeMetrics, Spawner};
use futures::{channel::mpsc, StreamExt};
use std::collections::BTreeMap;
use tracing::{debug, error, trace};

/// Dispatches queued requests in priority order, admitting each through a [TokenBucket].
pub struct Actor<E: Clock + Spawner + RuntimeMetrics, L: Lookup, C: Consumer> {
    context: E,
    lookup: L,
    bucket: TokenBucket<E>,
    cost: u64,

    /// Receives requests registered through the [Queue]
    mailbox: mpsc::UnboundedReceiver<Queued<C>>,

    /// Requests waiting to be dispatched, most urgent first and oldest first within a class
    pending: BTreeMap<(Priority, u64), Queued<C>>,

    /// Arrival counter used to break ties within a priority class
    sequence: u64,

    metrics: Metrics,
}

impl<E: Clock + Spawner + RuntimeMetrics, L: Lookup, C: Consumer> Actor<E, L, C> {
    /// Create a new dispatcher and the [Queue] that feeds it.
    pub fn new(context: E, cfg: Config<E, L>) -> (Self, Queue<C>) {
        let (sender, receiver) = mpsc::unbounded();
        let metrics = Metrics::init(context.clone());
        (
            Self {
                context,
                lookup: cfg.lookup,
                bucket: cfg.bucket,
                cost: cfg.cost,
                mailbox: receiver,
                pending: BTreeMap::new(),
                sequence: 0,
                metrics,
            },
            Queue::new(sender),
        )
    }

    /// Start dispatching requests.
    ///
    /// Runs until every [Queue] has been dropped and no requests remain.
    pub fn start(self) -> Handle<()> {
        self.context.clone().spawn(|_| self.run())
    }

    async fn run(mut self) {
        loop {
            // Wait for work if there is none
            if self.pending.is_empty() {
                let Some(request) = self.mailbox.next().await else {
                    debug!("queue closed");
                    return;
                };
                self.enqueue(request);
            }

            // Pick up everything else that has arrived so the most urgent request goes first
            while let Ok(Some(request)) = self.mailbox.try_next() {
                self.enqueue(request);
            }

            let Some((_, request)) = self.pending.pop_first() else {
                continue;
            };
            self.metrics.queued.set(self.pending.len() as i64);

            // A cancelled request only needs to tell its consumer, which costs nothing
            let charged = !request.is_cancelled();
            if charged {
                trace!(key = %request.key(), cost = self.cost, "waiting for tokens");
                self.bucket.blocking_grab(self.cost).await;
            }
            self.dispatch(request, charged);
        }
    }

    fn enqueue(&mut self, request: Queued<C>) {
        let priority = request.priority();
        trace!(key = %request.key(), ?priority, "queued");
        self.pending.insert((priority, self.sequence), request);
        self.sequence += 1;
        self.metrics.queued.set(self.pending.len() as i64);
    }

    fn dispatch(&mut self, request: Queued<C>, charged: bool) {
        debug!(key = %request.key(), priority = ?request.priority(), "dispatching");
        self.metrics.dispatched.inc();

        let mut lookup = self.lookup.clone();
        let bucket = self.bucket.clone();
        let cost = self.cost;
        let metrics = self.metrics.clone();
        self.context
            .with_label("send")
            .spawn(move |_| async move {
                match request.send(&mut lookup).await {
                    Ok(Outcome::Succeeded) => {
                        metrics.succeeded.inc();
                    }
                    Ok(Outcome::Retrying { .. }) => {
                        metrics.retried.inc();
                    }
                    Ok(Outcome::Failed(_)) => {
                        metrics.failed.inc();
                    }
                    Ok(Outcome::Cancelled) => {
                        metrics.cancelled.inc();

                        // Return tokens that were never spent on a result
                        if charged {
                            bucket.recycle(cost);
                        }
                    }
                    Err(err) => {
                        error!(key = %request.key(), ?err, "failed to send");
                        metrics.failed.inc();
                    }
                }
            });
    }
}
