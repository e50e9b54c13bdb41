//! Retryable requests for the data behind a single key.
//!
//! A [Request] is created by a request group ([Group]) whenever a key needs fetching. It is
//! routed, by the family of its key, to one of the group's schedulers ([Bindings]). The scheduler
//! later calls [Request::send], which performs the lookup and either delivers the block to the
//! group's [Consumer] or retries under the request's budget ([Retries]). Once the budget is
//! exhausted the last failure is reported to the consumer verbatim.
//!
//! # Lifecycle
//!
//! ```text
//! Idle -> Scheduled -> InFlight -> Succeeded
//!            ^            |
//!            +--(retry)---+-----> Failed
//!
//! (any non-terminal state) -> Cancelled
//! ```
//!
//! Cancellation is cooperative: it prevents any future lookup but does not abort one already in
//! flight. The result of such a lookup is discarded.

use crate::{
    Block, Client, Consumer, Error, Failure, Family, Fault, Key, Lookup, Priority, Scheduler,
    Settings,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// How many times a request may be retried after its first attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retries {
    /// At most this many retries (`n + 1` attempts in total).
    Limited(u32),
    /// Retry until the request succeeds or is cancelled.
    Unlimited,
}

impl Retries {
    /// Returns whether the given retry (starting at 1) is allowed.
    pub fn permits(&self, retry: u32) -> bool {
        match self {
            Retries::Limited(max) => retry <= *max,
            Retries::Unlimited => true,
        }
    }
}

impl TryFrom<i32> for Retries {
    type Error = Error;

    /// Interprets `-1` as unlimited. Any other negative budget is invalid.
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Retries::Unlimited),
            n if n >= 0 => Ok(Retries::Limited(n as u32)),
            n => Err(Error::InvalidRetries(n)),
        }
    }
}

/// The scheduler responsible for each key [Family].
#[derive(Clone)]
pub struct Bindings<S> {
    content: Option<S>,
    subspace: Option<S>,
}

impl<S> Default for Bindings<S> {
    fn default() -> Self {
        Self {
            content: None,
            subspace: None,
        }
    }
}

impl<S> Bindings<S> {
    /// Create a table with no schedulers bound.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `scheduler` to `family`, replacing any previous binding.
    pub fn bind(mut self, family: Family, scheduler: S) -> Self {
        match family {
            Family::Content => self.content = Some(scheduler),
            Family::Subspace => self.subspace = Some(scheduler),
        }
        self
    }

    /// Returns the scheduler bound to `family`.
    pub fn get(&self, family: Family) -> Result<&S, Error> {
        let scheduler = match family {
            Family::Content => self.content.as_ref(),
            Family::Subspace => self.subspace.as_ref(),
        };
        scheduler.ok_or(Error::Unbound(family))
    }
}

/// The parts of a request group that its requests depend on.
///
/// The group outlives its requests and is shared between them.
pub struct Group<S, C> {
    priority: Priority,
    client: Client,
    consumer: C,
    bindings: Bindings<S>,
}

impl<S, C> Group<S, C> {
    /// Create a group.
    pub fn new(priority: Priority, client: Client, consumer: C, bindings: Bindings<S>) -> Self {
        Self {
            priority,
            client,
            consumer,
            bindings,
        }
    }

    /// Returns the priority class of the group.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Returns the client the group runs on behalf of.
    pub fn client(&self) -> Client {
        self.client
    }

    /// Returns the schedulers of the group.
    pub fn bindings(&self) -> &Bindings<S> {
        &self.bindings
    }
}

/// Where a request is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Idle,
    Scheduled,
    InFlight,
    Succeeded,
    Failed(Failure),
    Cancelled,
}

impl Status {
    /// Returns whether the request can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Failed(_) | Status::Cancelled
        )
    }
}

/// Result of a call to [Request::send] or [Request::retry].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The block was delivered to the consumer.
    Succeeded,
    /// The request was scheduled again.
    Retrying { attempt: u32 },
    /// The retry budget is exhausted and the failure was reported to the consumer.
    Failed(Failure),
    /// The request was cancelled and the consumer was told so.
    Cancelled,
}

struct State {
    status: Status,
    retry_count: u32,
    cancelled: bool,

    /// Whether the consumer has been told how the request ended.
    reported: bool,
}

impl State {
    /// Returns the recorded outcome once the request has succeeded or failed.
    fn settled(&self) -> Option<Outcome> {
        match self.status {
            Status::Succeeded => Some(Outcome::Succeeded),
            Status::Failed(failure) => Some(Outcome::Failed(failure)),
            _ => None,
        }
    }
}

/// A retryable request for the data behind a single key.
pub struct Request<S, C> {
    key: Key,
    retries: Retries,
    settings: Settings,
    group: Arc<Group<S, C>>,
    state: Mutex<State>,
}

impl<S, C> Request<S, C> {
    /// Returns the key being fetched.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Returns the retry budget.
    pub fn retries(&self) -> Retries {
        self.retries
    }

    /// Returns how many times the request has been retried.
    pub fn retry_count(&self) -> u32 {
        self.state.lock().unwrap().retry_count
    }

    /// Returns the current status.
    pub fn status(&self) -> Status {
        self.state.lock().unwrap().status
    }

    /// Returns whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap().cancelled
    }

    /// Returns whether the request no longer needs to be sent.
    pub fn is_finished(&self) -> bool {
        self.is_cancelled()
    }

    /// Returns the priority class inherited from the group.
    pub fn priority(&self) -> Priority {
        self.group.priority()
    }

    /// Returns the client inherited from the group.
    pub fn client(&self) -> Client {
        self.group.client()
    }

    /// Returns whether the lookup is restricted to the local store.
    pub fn local_only(&self) -> bool {
        self.settings.local_request_only
    }

    /// Returns whether the local store is skipped when searching.
    pub fn ignore_store(&self) -> bool {
        self.settings.ignore_store
    }

    /// Returns whether fetched data is kept out of the local store.
    pub fn dont_cache(&self) -> bool {
        !self.settings.cache_local_requests
    }

    /// Stop the request from being sent again.
    ///
    /// A lookup that is already in flight is not aborted, but its result will be discarded.
    pub fn cancel(&self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        if matches!(state.status, Status::Idle | Status::Scheduled) {
            state.status = Status::Cancelled;
        }
    }
}

impl<S, C> Request<S, C>
where
    S: Scheduler<Arc<Request<S, C>>>,
    C: Consumer,
{
    /// Create a request for `key` on behalf of `group`.
    ///
    /// `max_retries` is the number of retries after the first attempt (`-1` for unlimited).
    ///
    /// Fails if the budget is invalid or if the group has no scheduler for the family of `key`.
    pub fn new(
        key: Key,
        max_retries: i32,
        settings: Settings,
        group: Arc<Group<S, C>>,
    ) -> Result<Arc<Self>, Error> {
        let retries = Retries::try_from(max_retries)?;
        group.bindings().get(key.family())?;
        Ok(Arc::new(Self {
            key,
            retries,
            settings,
            group,
            state: Mutex::new(State {
                status: Status::Idle,
                retry_count: 0,
                cancelled: false,
                reported: false,
            }),
        }))
    }

    /// Register the request with the scheduler responsible for the family of its key.
    ///
    /// A request that has already ended (and been reported) is not registered again.
    pub fn schedule(self: &Arc<Self>) -> Result<(), Error> {
        let family = self.key.family();
        let scheduler = self.group.bindings().get(family)?;
        let previous = {
            let mut state = self.state.lock().unwrap();
            if state.status.is_terminal() && state.reported {
                debug!(key = %self.key, status = ?state.status, "not scheduling: finished");
                return Ok(());
            }
            let previous = state.status;
            if matches!(state.status, Status::Idle | Status::InFlight) {
                state.status = Status::Scheduled;
            }
            previous
        };
        debug!(key = %self.key, %family, "scheduling");
        if let Err(err) = scheduler.register(self.clone()) {
            let mut state = self.state.lock().unwrap();
            if state.status == Status::Scheduled {
                state.status = previous;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Perform the lookup for the key.
    ///
    /// Called by the scheduler when the request is dispatched. A cancelled request finishes
    /// without performing the lookup, and a request that already succeeded or failed returns
    /// its recorded outcome without performing the lookup or notifying anyone.
    pub async fn send<L: Lookup>(self: &Arc<Self>, lookup: &mut L) -> Result<Outcome, Error> {
        let cancelled = {
            let mut state = self.state.lock().unwrap();
            if let Some(outcome) = state.settled() {
                debug!(key = %self.key, ?outcome, "skipping lookup: finished");
                return Ok(outcome);
            }
            if !state.cancelled {
                state.status = Status::InFlight;
            }
            state.cancelled
        };
        if cancelled {
            debug!(key = %self.key, "skipping lookup: cancelled");
            return Ok(self.finish_cancelled().await);
        }

        let result = lookup
            .fetch(
                self.key.clone(),
                self.settings.local_request_only,
                self.settings.cache_local_requests,
                self.settings.ignore_store,
            )
            .await;
        match result {
            Ok(block) => Ok(self.finish_succeeded(block).await),
            Err(Fault::Classified(failure)) => {
                debug!(key = %self.key, ?failure, "lookup failed");
                self.retry(failure).await
            }
            Err(Fault::Unexpected(err)) => {
                error!(key = %self.key, ?err, "lookup failed unexpectedly");
                self.retry(Failure::InternalError).await
            }
        }
    }

    /// Schedule the request again after `failure`, if the budget allows.
    ///
    /// A [Failure::Cancelled] (or a cancelled request) is never retried. A request that already
    /// succeeded or failed returns its recorded outcome unchanged. If the scheduler has stopped,
    /// the request fails with [Failure::InternalError].
    pub async fn retry(self: &Arc<Self>, failure: Failure) -> Result<Outcome, Error> {
        let attempt = {
            let mut state = self.state.lock().unwrap();
            if let Some(outcome) = state.settled() {
                debug!(key = %self.key, ?outcome, "not retrying: finished");
                return Ok(outcome);
            }
            if failure == Failure::Cancelled || state.cancelled {
                None
            } else {
                state.retry_count = state.retry_count.saturating_add(1);
                Some(state.retry_count)
            }
        };
        let Some(attempt) = attempt else {
            return Ok(self.finish_cancelled().await);
        };

        debug!(key = %self.key, attempt, retries = ?self.retries, "attempting to retry");
        if !self.retries.permits(attempt) {
            return Ok(self.finish_failed(failure).await);
        }
        match self.schedule() {
            Ok(()) => Ok(Outcome::Retrying { attempt }),
            Err(Error::Closed) => {
                error!(key = %self.key, attempt, "cannot retry: scheduler closed");
                Ok(self.finish_failed(Failure::InternalError).await)
            }
            Err(err) => Err(err),
        }
    }

    async fn finish_succeeded(&self, block: Block) -> Outcome {
        let cancelled = {
            let mut state = self.state.lock().unwrap();
            if !state.cancelled {
                state.status = Status::Succeeded;
                state.reported = true;
            }
            state.cancelled
        };
        if cancelled {
            debug!(key = %self.key, "discarding result: cancelled");
            return self.finish_cancelled().await;
        }
        debug!(key = %self.key, size = block.len(), "fetched");
        let mut consumer = self.group.consumer.clone();
        consumer.deliver(self.key.clone(), block).await;
        Outcome::Succeeded
    }

    async fn finish_failed(&self, failure: Failure) -> Outcome {
        {
            let mut state = self.state.lock().unwrap();
            state.status = Status::Failed(failure);
            state.reported = true;
        }
        debug!(key = %self.key, ?failure, "giving up");
        let mut consumer = self.group.consumer.clone();
        consumer.failed(self.key.clone(), failure).await;
        Outcome::Failed(failure)
    }

    async fn finish_cancelled(&self) -> Outcome {
        let report = {
            let mut state = self.state.lock().unwrap();
            state.status = Status::Cancelled;
            !std::mem::replace(&mut state.reported, true)
        };
        if report {
            let mut consumer = self.group.consumer.clone();
            consumer.failed(self.key.clone(), Failure::Cancelled).await;
        }
        Outcome::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        key::{ContentKey, SubspaceKey},
        mocks::{Consumer as MockConsumer, Event, Lookup as MockLookup, Recorder, Response},
    };
    use bytes::Bytes;
    use commonware_cryptography::sha256::hash;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use futures::{channel::mpsc, StreamExt};

    type TestRequest = Request<Recorder<MockConsumer>, MockConsumer>;

    fn content_key(data: &[u8]) -> Key {
        ContentKey::from_data(data).into()
    }

    fn subspace_key(name: &str) -> Key {
        SubspaceKey::new(hash(b"alice"), name).into()
    }

    #[allow(clippy::type_complexity)]
    fn setup() -> (
        Arc<Group<Recorder<MockConsumer>, MockConsumer>>,
        Recorder<MockConsumer>,
        mpsc::UnboundedReceiver<Event>,
    ) {
        let (consumer, events) = MockConsumer::new();
        let recorder = Recorder::new();
        let bindings = Family::ALL
            .into_iter()
            .fold(Bindings::new(), |bindings, family| {
                bindings.bind(family, recorder.clone())
            });
        let group = Group::new(Priority::Interactive, Client(7), consumer, bindings);
        (Arc::new(group), recorder, events)
    }

    /// Sends everything the scheduler has queued until it is empty (or `limit` sends were made).
    async fn drain(
        recorder: &Recorder<MockConsumer>,
        lookup: &mut MockLookup,
        limit: usize,
    ) -> Vec<Outcome> {
        let mut outcomes = Vec::new();
        while outcomes.len() < limit {
            let Some(request) = recorder.pop() else {
                break;
            };
            outcomes.push(request.send(lookup).await.unwrap());
        }
        outcomes
    }

    #[test]
    fn test_retries_from_budget() {
        assert_eq!(Retries::try_from(-1), Ok(Retries::Unlimited));
        assert_eq!(Retries::try_from(0), Ok(Retries::Limited(0)));
        assert_eq!(Retries::try_from(3), Ok(Retries::Limited(3)));
        assert_eq!(Retries::try_from(-2), Err(Error::InvalidRetries(-2)));
        assert_eq!(Retries::try_from(i32::MIN), Err(Error::InvalidRetries(i32::MIN)));

        assert!(!Retries::Limited(0).permits(1));
        assert!(Retries::Limited(2).permits(2));
        assert!(!Retries::Limited(2).permits(3));
        assert!(Retries::Unlimited.permits(u32::MAX));
    }

    #[test]
    fn test_unbound_family_rejected() {
        let recorder = Recorder::new();
        let bindings = Bindings::new().bind(Family::Content, recorder.clone());
        assert_eq!(bindings.get(Family::Subspace).err(), Some(Error::Unbound(Family::Subspace)));
        let group = Arc::new(Group::new(
            Priority::Bulk,
            Client(1),
            MockConsumer::dummy(),
            bindings,
        ));
        assert!(group.bindings().get(Family::Content).is_ok());
        assert_eq!(group.priority(), Priority::Bulk);

        // Fails at construction, before anything is scheduled
        let result = TestRequest::new(subspace_key("site"), 3, Settings::default(), group.clone());
        assert_eq!(result.err(), Some(Error::Unbound(Family::Subspace)));
        assert_eq!(recorder.len(), 0);

        // A bound family is accepted
        assert!(TestRequest::new(content_key(b"a"), 3, Settings::default(), group).is_ok());
    }

    #[test]
    fn test_invalid_budget_rejected() {
        let (group, _, _events) = setup();
        let result = TestRequest::new(content_key(b"a"), -5, Settings::default(), group);
        assert_eq!(result.err(), Some(Error::InvalidRetries(-5)));
    }

    #[test]
    fn test_schedule_routes_by_family() {
        let (consumer, _events) = MockConsumer::new();
        let content = Recorder::new();
        let subspace = Recorder::new();
        let bindings = Bindings::new()
            .bind(Family::Content, content.clone())
            .bind(Family::Subspace, subspace.clone());
        let group = Arc::new(Group::new(Priority::Bulk, Client(1), consumer, bindings));

        let request =
            TestRequest::new(content_key(b"a"), 0, Settings::default(), group.clone()).unwrap();
        assert_eq!(request.status(), Status::Idle);
        request.schedule().unwrap();
        assert_eq!(request.status(), Status::Scheduled);
        assert_eq!(content.len(), 1);
        assert_eq!(subspace.len(), 0);

        let request =
            TestRequest::new(subspace_key("site"), 0, Settings::default(), group).unwrap();
        request.schedule().unwrap();
        assert_eq!(content.len(), 1);
        assert_eq!(subspace.len(), 1);
        assert_eq!(subspace.pop().unwrap().key(), &subspace_key("site"));
    }

    #[test_traced]
    fn test_success_delivers_block() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"hello");
            lookup.insert(key.clone(), Bytes::from_static(b"hello"));

            let request = TestRequest::new(key.clone(), 3, Settings::default(), group).unwrap();
            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(outcomes, vec![Outcome::Succeeded]);
            assert_eq!(request.status(), Status::Succeeded);
            assert_eq!(request.retry_count(), 0);
            assert_eq!(lookup.count(), 1);
            assert_eq!(
                events.next().await,
                Some(Event::Delivered(key, Bytes::from_static(b"hello")))
            );
        });
    }

    #[test_traced]
    fn test_attempts_bounded_by_budget() {
        for max_retries in [0, 1, 3, 7] {
            let executor = deterministic::Runner::default();
            executor.start(|_| async move {
                let (group, recorder, mut events) = setup();
                let mut lookup = MockLookup::new();
                let key = content_key(b"missing");

                let request =
                    TestRequest::new(key.clone(), max_retries, Settings::default(), group).unwrap();
                request.schedule().unwrap();
                let outcomes = drain(&recorder, &mut lookup, 100).await;

                // N retries means N + 1 attempts
                let attempts = max_retries as usize + 1;
                assert_eq!(lookup.count(), attempts);
                assert_eq!(outcomes.len(), attempts);
                for (i, outcome) in outcomes.iter().take(attempts - 1).enumerate() {
                    assert_eq!(*outcome, Outcome::Retrying { attempt: i as u32 + 1 });
                }
                assert_eq!(
                    outcomes.last(),
                    Some(&Outcome::Failed(Failure::NotFoundInNetwork))
                );
                assert_eq!(request.status(), Status::Failed(Failure::NotFoundInNetwork));
                assert_eq!(request.retry_count(), max_retries as u32 + 1);
                assert_eq!(
                    events.next().await,
                    Some(Event::Failed(key, Failure::NotFoundInNetwork))
                );
            });
        }
    }

    #[test_traced]
    fn test_unlimited_retries() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let request =
                TestRequest::new(content_key(b"missing"), -1, Settings::default(), group).unwrap();
            request.schedule().unwrap();

            let outcomes = drain(&recorder, &mut lookup, 50).await;
            assert_eq!(outcomes.len(), 50);
            assert!(outcomes.iter().all(|o| matches!(o, Outcome::Retrying { .. })));
            assert_eq!(request.retry_count(), 50);
            assert_eq!(request.status(), Status::Scheduled);
            assert_eq!(recorder.len(), 1);
            assert!(events.try_next().is_err());
        });
    }

    #[test_traced]
    fn test_succeeded_request_not_sent_again() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"a");
            lookup.insert(key.clone(), Bytes::from_static(b"a"));

            let request = TestRequest::new(key.clone(), 3, Settings::default(), group).unwrap();
            assert_eq!(request.send(&mut lookup).await, Ok(Outcome::Succeeded));
            assert_eq!(request.send(&mut lookup).await, Ok(Outcome::Succeeded));
            assert_eq!(lookup.count(), 1);
            assert_eq!(request.status(), Status::Succeeded);
            assert_eq!(
                events.next().await,
                Some(Event::Delivered(key, Bytes::from_static(b"a")))
            );
            assert!(events.try_next().is_err());

            // Neither rescheduled nor retried
            request.schedule().unwrap();
            assert!(recorder.is_empty());
            assert_eq!(
                request.retry(Failure::NoRouteFound).await,
                Ok(Outcome::Succeeded)
            );
            assert_eq!(request.retry_count(), 0);
            assert!(events.try_next().is_err());

            // Cancelling afterwards does not change the result
            request.cancel();
            assert_eq!(request.send(&mut lookup).await, Ok(Outcome::Succeeded));
            assert_eq!(lookup.count(), 1);
            assert!(events.try_next().is_err());
        });
    }

    #[test_traced]
    fn test_failed_request_not_sent_again() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"missing");

            let request = TestRequest::new(key.clone(), 0, Settings::default(), group).unwrap();
            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            let failed = Outcome::Failed(Failure::NotFoundInNetwork);
            assert_eq!(outcomes, vec![failed]);
            assert_eq!(
                events.next().await,
                Some(Event::Failed(key.clone(), Failure::NotFoundInNetwork))
            );

            // The recorded failure is returned without another lookup or report
            lookup.insert(key, Bytes::from_static(b"late"));
            assert_eq!(request.send(&mut lookup).await, Ok(failed));
            assert_eq!(request.retry(Failure::TransferFailed).await, Ok(failed));
            request.schedule().unwrap();
            assert_eq!(lookup.count(), 1);
            assert_eq!(request.retry_count(), 1);
            assert!(recorder.is_empty());
            assert_eq!(request.status(), Status::Failed(Failure::NotFoundInNetwork));
            assert!(events.try_next().is_err());
        });
    }

    #[test_traced]
    fn test_cancel_before_send() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"a");
            lookup.insert(key.clone(), Bytes::from_static(b"a"));

            let request = TestRequest::new(key.clone(), 5, Settings::default(), group).unwrap();
            request.schedule().unwrap();
            request.cancel();
            request.cancel();
            assert!(request.is_finished());
            assert_eq!(request.status(), Status::Cancelled);

            // The lookup is never performed
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(outcomes, vec![Outcome::Cancelled]);
            assert_eq!(lookup.count(), 0);
            assert_eq!(events.next().await, Some(Event::Failed(key, Failure::Cancelled)));

            // Sending again neither looks up nor reports twice
            assert_eq!(request.send(&mut lookup).await, Ok(Outcome::Cancelled));
            assert_eq!(lookup.count(), 0);
            assert!(events.try_next().is_err());
        });
    }

    #[test_traced]
    fn test_cancel_during_lookup_discards_result() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"a");
            lookup.insert(key.clone(), Bytes::from_static(b"a"));

            let request = TestRequest::new(key.clone(), 5, Settings::default(), group).unwrap();
            let target = request.clone();
            lookup.on_fetch(move |_| target.cancel());

            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(outcomes, vec![Outcome::Cancelled]);
            assert_eq!(lookup.count(), 1);
            assert_eq!(request.status(), Status::Cancelled);
            assert_eq!(events.next().await, Some(Event::Failed(key, Failure::Cancelled)));
            assert!(events.try_next().is_err());
        });
    }

    #[test_traced]
    fn test_unexpected_error_is_internal() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"a");
            lookup.script(key.clone(), Response::Unexpected("socket closed".into()));

            let request = TestRequest::new(key.clone(), 0, Settings::default(), group).unwrap();
            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(outcomes, vec![Outcome::Failed(Failure::InternalError)]);
            assert_eq!(events.next().await, Some(Event::Failed(key, Failure::InternalError)));
        });
    }

    #[test_traced]
    fn test_retry_then_success() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = subspace_key("site");
            lookup.script(key.clone(), Response::Fail(Failure::NoRouteFound));
            lookup.script(key.clone(), Response::Unexpected("reset".into()));
            lookup.insert(key.clone(), Bytes::from_static(b"site"));

            let request = TestRequest::new(key.clone(), 2, Settings::default(), group).unwrap();
            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(
                outcomes,
                vec![
                    Outcome::Retrying { attempt: 1 },
                    Outcome::Retrying { attempt: 2 },
                    Outcome::Succeeded
                ]
            );
            assert_eq!(request.retry_count(), 2);
            assert_eq!(
                events.next().await,
                Some(Event::Delivered(key, Bytes::from_static(b"site")))
            );
        });
    }

    #[test_traced]
    fn test_cancelled_failure_not_retried() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, mut events) = setup();
            let mut lookup = MockLookup::new();
            let key = content_key(b"a");
            lookup.script(key.clone(), Response::Fail(Failure::Cancelled));

            let request = TestRequest::new(key.clone(), -1, Settings::default(), group).unwrap();
            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(outcomes, vec![Outcome::Cancelled]);
            assert_eq!(request.retry_count(), 0);
            assert_eq!(recorder.len(), 0);
            assert_eq!(events.next().await, Some(Event::Failed(key, Failure::Cancelled)));
        });
    }

    #[test_traced]
    fn test_settings_forwarded() {
        let executor = deterministic::Runner::default();
        executor.start(|_| async move {
            let (group, recorder, _events) = setup();
            let mut lookup = MockLookup::new();
            let settings = Settings {
                local_request_only: true,
                cache_local_requests: false,
                ignore_store: true,
            };
            let request = TestRequest::new(content_key(b"a"), 0, settings, group).unwrap();
            assert!(request.local_only());
            assert!(request.dont_cache());
            assert!(request.ignore_store());
            assert_eq!(request.priority(), Priority::Interactive);
            assert_eq!(request.client(), Client(7));

            request.schedule().unwrap();
            let outcomes = drain(&recorder, &mut lookup, 10).await;
            assert_eq!(outcomes, vec![Outcome::Failed(Failure::NotFoundLocally)]);

            let calls = lookup.calls();
            assert_eq!(calls.len(), 1);
            assert!(calls[0].local_only);
            assert!(!calls[0].cache);
            assert!(calls[0].ignore_store);
        });
    }
}
