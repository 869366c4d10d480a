//! Virtual-time timer queue.
//!
//! Timer suspensions register a callback under an absolute deadline on a
//! logical clock owned by the runtime. The host drives the clock explicitly
//! with [`Runtime::advance`](crate::runtime::Runtime::advance); due entries
//! fire in deadline order, interleaving entries scheduled by earlier firings.
//! Clearing a timer removes its entry before it fires; a cleared timer never
//! fires.

use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::time::Duration;

/// A logical timestamp on the runtime's virtual clock, in nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero instant.
    pub const ZERO: Self = Self(0);

    /// Creates a time from nanoseconds since the clock's origin.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds since the clock's origin.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis.saturating_mul(1_000_000))
    }

    /// Returns the time as nanoseconds since the clock's origin.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as milliseconds since the clock's origin, truncated.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Adds a duration, saturating on overflow.
    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        Self(self.0.saturating_add(u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000 {
            write!(f, "{}ms", self.0 / 1_000_000)
        } else {
            write!(f, "{}ns", self.0)
        }
    }
}

/// Handle identifying a scheduled timer entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TimerKey {
    deadline: Time,
    seq: u64,
}

/// The runtime's timer table: deadline-ordered callbacks over a virtual clock.
pub(crate) struct TimerQueue {
    now: Cell<Time>,
    next_seq: Cell<u64>,
    entries: RefCell<BTreeMap<(Time, u64), Box<dyn FnOnce()>>>,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        Self {
            now: Cell::new(Time::ZERO),
            next_seq: Cell::new(0),
            entries: RefCell::new(BTreeMap::new()),
        }
    }

    pub(crate) fn now(&self) -> Time {
        self.now.get()
    }

    /// Registers `fire` to run once the clock reaches `deadline`.
    pub(crate) fn schedule(&self, deadline: Time, fire: Box<dyn FnOnce()>) -> TimerKey {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        self.entries
            .borrow_mut()
            .insert((deadline, seq), fire);
        tracing::trace!(deadline = %deadline, seq, "timer scheduled");
        TimerKey { deadline, seq }
    }

    /// Removes a scheduled entry. No-op if it already fired or was cleared.
    pub(crate) fn clear(&self, key: TimerKey) {
        if self
            .entries
            .borrow_mut()
            .remove(&(key.deadline, key.seq))
            .is_some()
        {
            tracing::trace!(deadline = %key.deadline, seq = key.seq, "timer cleared");
        }
    }

    /// The earliest pending deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Time> {
        self.entries.borrow().keys().next().map(|(t, _)| *t)
    }

    /// Moves the clock to `target`, firing due entries in deadline order.
    ///
    /// Entries scheduled by a firing within the window fire in the same pass.
    /// Callbacks run with no table borrow held, so they may schedule or clear
    /// timers freely.
    pub(crate) fn advance_to(&self, target: Time) {
        loop {
            let due = {
                let mut entries = self.entries.borrow_mut();
                match entries.keys().next().copied() {
                    Some(key) if key.0 <= target => {
                        entries.remove_entry(&key)
                    }
                    _ => None,
                }
            };
            match due {
                Some(((deadline, _), fire)) => {
                    if deadline > self.now.get() {
                        self.now.set(deadline);
                    }
                    fire();
                }
                None => break,
            }
        }
        if target > self.now.get() {
            self.now.set(target);
        }
    }
}

impl fmt::Debug for TimerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerQueue")
            .field("now", &self.now.get())
            .field("pending", &self.entries.borrow().len())
            .finish()
    }
}
