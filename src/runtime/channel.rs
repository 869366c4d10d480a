//! Unbounded FIFO mailboxes with single-shot waiters.
//!
//! A channel is a typed mailbox registered in a runtime-owned table and
//! addressed by a phantom-typed [`ChannelId`]. A send first satisfies the
//! oldest registered waiter, removing it; only when no waiter is present does
//! the message buffer into the queue. A receive first drains the queue; only
//! when the queue is empty does it register a waiter. The queue and the
//! waiter set are therefore never both non-empty at rest, and exactly one
//! waiter is satisfied per send — sends never broadcast.
//!
//! Channels are never explicitly destroyed; a mailbox is abandoned when the
//! process driving it is cancelled.

use core::fmt;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;

/// Identifier for a mailbox carrying messages of type `T`.
///
/// Ids are only minted by [`ChannelTable::create`], so the phantom parameter
/// is authoritative: presenting an id to a channel of a different payload
/// type is impossible without forging one.
pub struct ChannelId<T> {
    raw: u64,
    _payload: PhantomData<fn() -> T>,
}

impl<T> ChannelId<T> {
    const fn new(raw: u64) -> Self {
        Self {
            raw,
            _payload: PhantomData,
        }
    }
}

impl<T> Clone for ChannelId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ChannelId<T> {}

impl<T> PartialEq for ChannelId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for ChannelId<T> {}

impl<T> fmt::Debug for ChannelId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.raw)
    }
}

impl<T> fmt::Display for ChannelId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch{}", self.raw)
    }
}

/// Token identifying a registered waiter, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaiterToken(u64);

struct Mailbox<T> {
    messages: VecDeque<T>,
    waiters: VecDeque<(WaiterToken, Box<dyn FnOnce(T)>)>,
    next_waiter: u64,
}

impl<T> Mailbox<T> {
    fn new() -> Self {
        Self {
            messages: VecDeque::new(),
            waiters: VecDeque::new(),
            next_waiter: 0,
        }
    }
}

/// The runtime's channel registry.
pub(crate) struct ChannelTable {
    next_id: Cell<u64>,
    slots: RefCell<HashMap<u64, Box<dyn Any>>>,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            slots: RefCell::new(HashMap::new()),
        }
    }

    /// Creates a fresh mailbox and returns its id.
    pub(crate) fn create<T: 'static>(&self) -> ChannelId<T> {
        let raw = self.next_id.get();
        self.next_id.set(raw + 1);
        self.slots
            .borrow_mut()
            .insert(raw, Box::new(Mailbox::<T>::new()));
        tracing::trace!(channel = raw, "channel created");
        ChannelId::new(raw)
    }

    /// Delivers a message: satisfies the oldest waiter, or buffers.
    ///
    /// The waiter callback runs with no table borrow held, so it may re-enter
    /// channel operations freely.
    pub(crate) fn send<T: 'static>(&self, id: ChannelId<T>, msg: T) {
        let waiter = {
            let mut slots = self.slots.borrow_mut();
            Self::mailbox_mut::<T>(&mut slots, id).waiters.pop_front()
        };
        match waiter {
            Some((_, waiter)) => {
                tracing::trace!(channel = %id, "send wakes waiter");
                waiter(msg);
            }
            None => {
                let mut slots = self.slots.borrow_mut();
                Self::mailbox_mut::<T>(&mut slots, id).messages.push_back(msg);
            }
        }
    }

    /// Non-blocking drain of the oldest buffered message.
    pub(crate) fn try_recv<T: 'static>(&self, id: ChannelId<T>) -> Option<T> {
        let mut slots = self.slots.borrow_mut();
        Self::mailbox_mut::<T>(&mut slots, id).messages.pop_front()
    }

    /// Receives one message: immediately if buffered, otherwise by waiter.
    ///
    /// Returns `None` when `on_msg` was invoked inline; otherwise the token
    /// of the registered waiter.
    pub(crate) fn recv<T: 'static>(
        &self,
        id: ChannelId<T>,
        on_msg: Box<dyn FnOnce(T)>,
    ) -> Option<WaiterToken> {
        let buffered = {
            let mut slots = self.slots.borrow_mut();
            Self::mailbox_mut::<T>(&mut slots, id).messages.pop_front()
        };
        if let Some(msg) = buffered {
            on_msg(msg);
            return None;
        }
        let mut slots = self.slots.borrow_mut();
        let mailbox = Self::mailbox_mut::<T>(&mut slots, id);
        let token = WaiterToken(mailbox.next_waiter);
        mailbox.next_waiter += 1;
        mailbox.waiters.push_back((token, on_msg));
        Some(token)
    }

    /// Removes a registered waiter. No-op if it was already consumed.
    pub(crate) fn remove_waiter<T: 'static>(&self, id: ChannelId<T>, token: WaiterToken) {
        let mut slots = self.slots.borrow_mut();
        let mailbox = Self::mailbox_mut::<T>(&mut slots, id);
        mailbox.waiters.retain(|(t, _)| *t != token);
    }

    fn mailbox_mut<T: 'static>(
        slots: &mut HashMap<u64, Box<dyn Any>>,
        id: ChannelId<T>,
    ) -> &mut Mailbox<T> {
        slots
            .get_mut(&id.raw)
            .unwrap_or_else(|| panic!("channel {id} is not registered"))
            .downcast_mut::<Mailbox<T>>()
            .unwrap_or_else(|| panic!("channel {id} used with the wrong payload type"))
    }
}

impl fmt::Debug for ChannelTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelTable")
            .field("channels", &self.slots.borrow().len())
            .finish()
    }
}
