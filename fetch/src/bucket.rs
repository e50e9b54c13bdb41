//! Limit the rate of work with a replenishing balance of tokens.
//!
//! A [TokenBucket] holds a balance of tokens that is credited with one token every
//! `nanos_per_tick` and never rises above `max`. Work is admitted by withdrawing tokens:
//! - [TokenBucket::instant_grab] withdraws only if the balance allows it and never waits.
//! - [TokenBucket::force_grab] withdraws unconditionally, possibly leaving a debt.
//! - [TokenBucket::blocking_grab] waits until the tokens (and any outstanding debt) have been
//!   earned.
//!
//! # Waiting
//!
//! Waiters are ordered by a shared cursor (`next_wake`). Each blocked caller computes how long it
//! must wait to earn what it asked for and schedules its wake-up after everyone queued ahead of
//! it, so concurrent waiters wake one after another instead of all at once (which would
//! over-withdraw). Once the deadline passes, the tokens are withdrawn without re-checking the
//! balance: the wait has paid for them.
//!
//! The bucket is not locked while a caller sleeps, so other callers may recycle tokens, force a
//! withdrawal, or change the rate in the meantime. When the rate gets faster, sleeping callers are
//! woken and shorten their remaining wait accordingly.

use crate::Error;
use commonware_macros::select;
use commonware_runtime::Clock;
use commonware_utils::SystemTimeExt;
use futures::channel::oneshot;
use std::{
    iter,
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};
use tracing::{debug, trace};

/// Nanoseconds in a millisecond.
const NANOS_PER_MILLI: u128 = 1_000_000;

/// Converts a token amount into the signed domain of the balance.
fn signed(tokens: u64) -> i64 {
    i64::try_from(tokens).unwrap_or(i64::MAX)
}

/// Splits a withdrawal larger than the bucket into withdrawals of at most `max` tokens.
///
/// Returns `ceil(tokens / max)` chunks: every chunk is `max` except for a smaller remainder.
pub fn chunks(tokens: u64, max: u64) -> impl Iterator<Item = u64> {
    assert!(max > 0, "max must be positive");
    let full = tokens / max;
    let rest = tokens % max;
    iter::repeat(max)
        .take(full as usize)
        .chain((rest > 0).then_some(rest))
}

/// Scales the time remaining until `deadline` by `to / from`.
fn rescale(now: SystemTime, deadline: SystemTime, from: u64, to: u64) -> SystemTime {
    let Ok(remaining) = deadline.duration_since(now) else {
        return deadline;
    };
    let scaled = remaining.as_nanos() * to as u128 / from as u128;
    now + Duration::from_nanos(u64::try_from(scaled).unwrap_or(u64::MAX))
}

/// Mutable state of a [TokenBucket], updated atomically by each operation.
struct State {
    /// Available tokens (negative when in debt).
    current: i64,

    /// Ceiling of `current`.
    max: i64,

    /// Interval between credits.
    nanos_per_tick: u64,

    /// Time (nanoseconds since the epoch) up to which credits have been applied.
    last_tick: u128,

    /// Earliest time the next blocked caller may wake.
    next_wake: SystemTime,

    /// Blocked callers to wake when the rate gets faster.
    waiters: Vec<oneshot::Sender<()>>,
}

impl State {
    fn new(max: i64, nanos_per_tick: u64, initial: i64, now: SystemTime) -> Self {
        Self {
            current: initial,
            max,
            nanos_per_tick,
            last_tick: now.epoch().as_nanos(),
            next_wake: now,
            waiters: Vec::new(),
        }
    }

    /// Returns the number of whole ticks elapsed since the last credit.
    ///
    /// The partial tick is left in `last_tick` by the caller, so the total credited depends only
    /// on elapsed time and not on how often this is called.
    fn tokens_to_add(&self, now: u128) -> i64 {
        let per_tick = self.nanos_per_tick as u128;
        if self.last_tick + per_tick > now {
            return 0;
        }
        i64::try_from((now - self.last_tick) / per_tick).unwrap_or(i64::MAX)
    }

    /// Credits earned tokens without enforcing the ceiling.
    fn add_tokens_no_clip(&mut self, now: u128) {
        let add = self.tokens_to_add(now);
        self.current = self.current.saturating_add(add);
        self.last_tick += add as u128 * self.nanos_per_tick as u128;
    }

    /// Credits earned tokens and enforces the ceiling.
    fn add_tokens(&mut self, now: u128) {
        self.add_tokens_no_clip(now);
        self.clip();
    }

    fn clip(&mut self) {
        if self.current > self.max {
            self.current = self.max;
        }
    }

    /// Returns how long it takes to earn `tokens`, rounded up to the millisecond.
    fn delay(&self, tokens: i64) -> Duration {
        let nanos = self.nanos_per_tick as u128 * tokens.max(0) as u128;
        let millis = nanos.div_ceil(NANOS_PER_MILLI);
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Applies a new rate, waking blocked callers if it is faster than the old one.
    fn set_rate(&mut self, nanos_per_tick: u64, now: SystemTime) {
        let old = self.nanos_per_tick;
        self.nanos_per_tick = nanos_per_tick;
        if nanos_per_tick >= old {
            return;
        }
        self.next_wake = rescale(now, self.next_wake, old, nanos_per_tick);
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(());
        }
    }
}

/// A token bucket shared by everyone who clones it.
#[derive(Clone)]
pub struct TokenBucket<E: Clock> {
    context: E,
    state: Arc<Mutex<State>>,
}

impl<E: Clock> TokenBucket<E> {
    /// Create a bucket holding at most `max` tokens, credited one token every `nanos_per_tick`,
    /// with a starting balance of `initial`.
    pub fn new(context: E, max: u64, nanos_per_tick: u64, initial: i64) -> Result<Self, Error> {
        let max = Self::validate_max(max)?;
        if nanos_per_tick == 0 {
            return Err(Error::InvalidInterval);
        }
        let state = State::new(max, nanos_per_tick, initial, context.current());
        Ok(Self {
            context,
            state: Arc::new(Mutex::new(state)),
        })
    }

    fn validate_max(max: u64) -> Result<i64, Error> {
        match i64::try_from(max) {
            Ok(max) if max > 0 => Ok(max),
            _ => Err(Error::InvalidCapacity),
        }
    }

    fn now(&self) -> (SystemTime, u128) {
        let now = self.context.current();
        (now, now.epoch().as_nanos())
    }

    /// Withdraw `tokens` if more than `tokens` are available. Never blocks.
    ///
    /// A balance exactly equal to `tokens` is not enough.
    ///
    /// Returns `true` if the tokens were withdrawn.
    pub fn instant_grab(&self, tokens: u64) -> bool {
        let tokens = signed(tokens);
        let (_, now) = self.now();
        let mut state = self.state.lock().unwrap();
        state.add_tokens(now);
        if state.current > tokens {
            state.current -= tokens;
            state.clip();
            return true;
        }
        state.clip();
        false
    }

    /// Withdraw `tokens` unconditionally, going into debt if necessary. Never blocks.
    pub fn force_grab(&self, tokens: u64) {
        let (_, now) = self.now();
        let mut state = self.state.lock().unwrap();
        state.add_tokens(now);
        state.current = state.current.saturating_sub(signed(tokens));
        state.clip();
        trace!(tokens, current = state.current, "force grab");
    }

    /// Withdraw `tokens`, waiting until they have been earned.
    ///
    /// Withdrawals of at least the bucket's capacity are split into chunks of at most `max`
    /// tokens (see [chunks]) so that other waiters can interleave between them.
    pub async fn blocking_grab(&self, tokens: u64) {
        let max = self.max();
        debug!(tokens, max, "blocking grab");
        if tokens < max {
            self.grab_chunk(tokens).await;
            return;
        }
        for chunk in chunks(tokens, max) {
            self.grab_chunk(chunk).await;
        }
    }

    /// Withdraw at most `max` tokens, waiting until they have been earned.
    async fn grab_chunk(&self, tokens: u64) {
        let mut tokens = signed(tokens);

        // Schedule our wake-up behind everyone already waiting
        let (mut wake_at, mut priced_at) = {
            let (now, nanos) = self.now();
            let mut state = self.state.lock().unwrap();
            state.add_tokens(nanos);
            if state.current > tokens {
                state.current -= tokens;
                trace!(tokens, current = state.current, "grabbed without waiting");
                return;
            }
            let mut debt = 0;
            if state.current > 0 {
                tokens -= state.current;
                state.current = 0;
            } else if state.current < 0 {
                debt = -state.current;
                debug!(debt, "neutralizing debt");
                state.current = 0;
            }
            let delay = state.delay(tokens.saturating_add(debt));
            if state.next_wake < now {
                state.next_wake = now;
            }
            let wake_at = state.next_wake + delay;
            state.next_wake = wake_at;
            trace!(tokens, debt, ?delay, "waiting for tokens");
            (wake_at, state.nanos_per_tick)
        };

        // Sleep until the deadline, recomputing it if the rate gets faster
        loop {
            let waiter = {
                let now = self.context.current();
                let mut state = self.state.lock().unwrap();
                if state.nanos_per_tick < priced_at {
                    wake_at = rescale(now, wake_at, priced_at, state.nanos_per_tick);
                    priced_at = state.nanos_per_tick;
                }
                if now >= wake_at {
                    break;
                }
                let (sender, receiver) = oneshot::channel();
                state.waiters.retain(|waiter| !waiter.is_canceled());
                state.waiters.push(sender);
                receiver
            };
            select! {
                _ = self.context.sleep_until(wake_at) => {},
                _ = waiter => {
                    trace!("woken by rate change");
                },
            };
        }

        // The wait paid for the tokens (and any debt), so withdraw even if this leaves a new debt
        let mut state = self.state.lock().unwrap();
        state.current = state.current.saturating_sub(tokens);
        trace!(tokens, current = state.current, "grabbed after waiting");
    }

    /// Return unused tokens to the bucket.
    pub fn recycle(&self, tokens: u64) {
        let mut state = self.state.lock().unwrap();
        state.current = state.current.saturating_add(signed(tokens));
        state.clip();
    }

    /// Credit tokens earned since the last credit.
    pub fn add_tokens(&self) {
        let (_, now) = self.now();
        self.state.lock().unwrap().add_tokens(now);
    }

    /// Returns the current balance (without crediting earned tokens).
    pub fn count(&self) -> i64 {
        self.state.lock().unwrap().current
    }

    /// Returns the capacity of the bucket.
    pub fn max(&self) -> u64 {
        self.state.lock().unwrap().max as u64
    }

    /// Returns the interval between credits.
    pub fn nanos_per_tick(&self) -> u64 {
        self.state.lock().unwrap().nanos_per_tick
    }

    /// Change the interval between credits.
    ///
    /// Tokens earned under the old rate are credited first.
    pub fn change_nanos_per_tick(&self, nanos_per_tick: u64) -> Result<(), Error> {
        if nanos_per_tick == 0 {
            return Err(Error::InvalidInterval);
        }
        let (now, nanos) = self.now();
        let mut state = self.state.lock().unwrap();
        state.add_tokens(nanos);
        state.set_rate(nanos_per_tick, now);
        debug!(nanos_per_tick, "changed rate");
        Ok(())
    }

    /// Change the capacity of the bucket.
    ///
    /// Tokens earned so far are credited before the new ceiling is applied.
    pub fn change_bucket_size(&self, max: u64) -> Result<(), Error> {
        let max = Self::validate_max(max)?;
        let (_, nanos) = self.now();
        let mut state = self.state.lock().unwrap();
        state.add_tokens_no_clip(nanos);
        state.max = max;
        state.clip();
        debug!(max, "changed capacity");
        Ok(())
    }

    /// Change both the interval between credits and the capacity of the bucket.
    pub fn change_nanos_and_bucket_size(&self, nanos_per_tick: u64, max: u64) -> Result<(), Error> {
        if nanos_per_tick == 0 {
            return Err(Error::InvalidInterval);
        }
        let max = Self::validate_max(max)?;
        let (now, nanos) = self.now();
        let mut state = self.state.lock().unwrap();
        state.add_tokens_no_clip(nanos);
        state.set_rate(nanos_per_tick, now);
        state.max = max;
        state.clip();
        debug!(nanos_per_tick, max, "changed rate and capacity");
        Ok(())
    }
}
