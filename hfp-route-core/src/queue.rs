//! Time-ordered message queue
//!
//! Messages are keyed by `(due time, sequence number)`, so messages due at the
//! same instant come out in the order they were posted. Delayed messages hand
//! back a [`TimerToken`] that removes them synchronously, so a cancelled timer
//! can never fire afterwards.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Handle to a delayed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Single-consumer queue of messages ordered by due time
#[derive(Debug)]
pub struct MessageQueue<M> {
    entries: BTreeMap<(Instant, u64), M>,
    timers: HashMap<TimerToken, Instant>,
    next_seq: u64,
}

impl<M> Default for MessageQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MessageQueue<M> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            timers: HashMap::new(),
            next_seq: 0,
        }
    }

    fn next_key(&mut self, when: Instant) -> (Instant, u64) {
        let seq = self.next_seq;
        self.next_seq += 1;
        (when, seq)
    }

    /// Append a message that is due immediately
    pub fn post(&mut self, message: M) {
        self.post_at(Instant::now(), message);
    }

    /// Insert a message due at `when`
    pub fn post_at(&mut self, when: Instant, message: M) {
        let key = self.next_key(when);
        self.entries.insert(key, message);
    }

    /// Insert a message due after `delay`, returning a token that cancels it
    pub fn post_delayed(&mut self, delay: Duration, message: M) -> TimerToken {
        let key = self.next_key(Instant::now() + delay);
        let token = TimerToken(key.1);
        self.entries.insert(key, message);
        self.timers.insert(token, key.0);
        token
    }

    /// Remove a delayed message, returning it if it had not been delivered yet
    pub fn cancel(&mut self, token: TimerToken) -> Option<M> {
        let when = self.timers.remove(&token)?;
        self.entries.remove(&(when, token.0))
    }

    /// Whether a delayed message is still waiting
    pub fn is_pending(&self, token: TimerToken) -> bool {
        self.timers.contains_key(&token)
    }

    /// Remove and return the earliest message due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<M> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.timers.remove(&TimerToken(key.1));
        self.entries.remove(&key)
    }

    /// Due time of the earliest message
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(when, _)| *when)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.entries.clear();
        self.timers.clear();
    }
}
