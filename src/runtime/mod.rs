//! The runtime context: process scheduler, channel table, and timers.
//!
//! A [`Runtime`] owns every process-wide registry as one explicit value with
//! an explicit construction step — there is no ambient global, so multiple
//! independent runtimes can coexist in one test process. Handles are cheap
//! clones sharing the same context.
//!
//! # Scheduling model
//!
//! One logical thread of control. A spawned process steps its root task until
//! the task either resolves to a value (the process is terminal and leaves
//! the table) or suspends on an asynchronous action (the process records the
//! action's cancel handle). When the action later completes it supplies the
//! next task for the same process id, which re-enters the dispatch queue.
//!
//! Stepping is guarded by a single active-pass flag: a step request issued
//! from within a callback joins the live pass's queue instead of draining
//! reentrantly, so all synchronously resolvable work is handled by a single
//! logical pass before control returns to the host.

mod channel;
mod scheduler;
mod timer;

pub use channel::ChannelId;
pub use scheduler::ProcessId;
pub use timer::Time;

use crate::task::{Cancel, OnDone, Task};
use channel::ChannelTable;
use scheduler::Scheduler;
use std::rc::{Rc, Weak};
use std::time::Duration;
use timer::TimerQueue;

pub(crate) struct RuntimeCore {
    scheduler: Scheduler,
    channels: ChannelTable,
    timers: TimerQueue,
}

/// Handle to a runtime context. Clones share the same context.
#[derive(Clone)]
pub struct Runtime {
    core: Rc<RuntimeCore>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Creates a fresh, empty runtime context.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Rc::new(RuntimeCore {
                scheduler: Scheduler::new(),
                channels: ChannelTable::new(),
                timers: TimerQueue::new(),
            }),
        }
    }

    fn from_core(core: Rc<RuntimeCore>) -> Self {
        Self { core }
    }

    fn weak(&self) -> Weak<RuntimeCore> {
        Rc::downgrade(&self.core)
    }

    /// Weak handle for internal closures that must not keep the context
    /// alive (waiters, standing loops, cancel thunks).
    pub(crate) fn downgrade(&self) -> WeakRuntime {
        WeakRuntime { core: self.weak() }
    }

    // === Processes ===

    /// Spawns a process for `task` and enqueues its first step.
    ///
    /// The returned id is unique for the lifetime of the registry. If a pass
    /// is already draining, the new process is stepped before that pass
    /// returns control to the host.
    pub fn spawn<T: 'static>(&self, task: Task<T>) -> ProcessId {
        let id = self.core.scheduler.fresh_id();
        self.core.scheduler.register(id);
        tracing::trace!(process = %id, "process spawned");
        self.enqueue_step(id, task.map(|_| ()));
        id
    }

    /// Cancels the asynchronous action a process is suspended on.
    ///
    /// Killing a terminal or absent process, or killing twice, is a silent
    /// no-op: cancel-after-completion is valid.
    pub fn kill(&self, id: ProcessId) {
        match self.core.scheduler.running_cancel(id) {
            Some(cancel) => {
                tracing::trace!(process = %id, "process killed");
                cancel.cancel();
            }
            None => tracing::trace!(process = %id, "kill is a no-op"),
        }
    }

    /// Spawns a composite process whose cancellation kills every id in
    /// `ids`, in reverse order of the list.
    ///
    /// The composite stays pending so that the returned handle remains
    /// cancellable after the spawning pass ends; it does no work of its own.
    pub fn batch(&self, ids: Vec<ProcessId>) -> ProcessId {
        let weak = self.weak();
        self.spawn(Task::suspend(move |_done: OnDone<()>| {
            Cancel::new(move || {
                if let Some(core) = weak.upgrade() {
                    let runtime = Runtime::from_core(core);
                    for id in ids.iter().rev() {
                        runtime.kill(*id);
                    }
                }
            })
        }))
    }

    /// True while `id` is present in the process table.
    #[must_use]
    pub fn has_process(&self, id: ProcessId) -> bool {
        self.core.scheduler.is_registered(id)
    }

    /// Number of registered (non-terminal) processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.core.scheduler.process_count()
    }

    /// Pushes a step onto the dispatch queue and drains it unless a pass is
    /// already active.
    ///
    /// Steps produced during the drain — a task resolving synchronously, a
    /// callback spawning another process — append to the same queue and run
    /// before the pass ends, in FIFO order.
    pub(crate) fn enqueue_step(&self, id: ProcessId, task: Task<()>) {
        self.core.scheduler.push_step(id, task);
        if self.core.scheduler.pass_active() {
            return;
        }
        self.core.scheduler.set_pass_active(true);
        while let Some((id, task)) = self.core.scheduler.pop_step() {
            self.step(id, task);
        }
        self.core.scheduler.set_pass_active(false);
    }

    fn step(&self, id: ProcessId, task: Task<()>) {
        match task {
            Task::Value(()) => {
                self.core.scheduler.remove(id);
                tracing::trace!(process = %id, "process completed");
            }
            Task::AsyncAction(resumption) => {
                let weak = self.weak();
                let cancel = resumption.resume(Box::new(move |next| {
                    if let Some(core) = weak.upgrade() {
                        Runtime::from_core(core).enqueue_step(id, next);
                    }
                }));
                self.core.scheduler.set_running(id, cancel);
            }
        }
    }

    // === Channels ===

    /// Creates an unbounded mailbox, returning a sender handle and its id.
    #[must_use]
    pub fn channel<T: 'static>(&self) -> (Sender<T>, ChannelId<T>) {
        let id = self.core.channels.create::<T>();
        (
            Sender {
                core: self.weak(),
                id,
            },
            id,
        )
    }

    /// Delivers a message: wakes the oldest waiter, or buffers in FIFO order.
    pub fn send<T: 'static>(&self, id: ChannelId<T>, msg: T) {
        self.core.channels.send(id, msg);
    }

    /// Non-blocking receive of the oldest buffered message.
    pub fn try_recv<T: 'static>(&self, id: ChannelId<T>) -> Option<T> {
        self.core.channels.try_recv(id)
    }

    /// Receives one message, invoking `on_msg` immediately if one is
    /// buffered, otherwise registering it as a single-shot waiter.
    ///
    /// The returned handle removes the waiter; it is a no-op once the waiter
    /// was consumed or when the message was delivered inline.
    pub fn recv<T: 'static>(&self, id: ChannelId<T>, on_msg: impl FnOnce(T) + 'static) -> Cancel {
        match self.core.channels.recv(id, Box::new(on_msg)) {
            None => Cancel::noop(),
            Some(token) => {
                let weak = self.weak();
                Cancel::new(move || {
                    if let Some(core) = weak.upgrade() {
                        core.channels.remove_waiter(id, token);
                    }
                })
            }
        }
    }

    /// A task that completes with the next message on the channel.
    #[must_use]
    pub fn receive<T: 'static>(&self, id: ChannelId<T>) -> Task<T> {
        let weak = self.weak();
        Task::suspend(move |done: OnDone<T>| match weak.upgrade() {
            Some(core) => {
                Runtime::from_core(core).recv(id, move |msg| done(Task::Value(msg)))
            }
            None => Cancel::noop(),
        })
    }

    // === Timers ===

    /// The current reading of the runtime's virtual clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.core.timers.now()
    }

    /// A task that completes once the virtual clock has advanced past
    /// `duration` from now.
    ///
    /// Cancelling clears the timer if it has not fired; a cleared timer
    /// never fires.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> Task<()> {
        let weak = self.weak();
        Task::suspend(move |done: OnDone<()>| {
            let Some(core) = weak.upgrade() else {
                return Cancel::noop();
            };
            let deadline = core.timers.now().saturating_add(duration);
            let key = core
                .timers
                .schedule(deadline, Box::new(move || done(Task::Value(()))));
            let weak = Rc::downgrade(&core);
            Cancel::new(move || {
                if let Some(core) = weak.upgrade() {
                    core.timers.clear(key);
                }
            })
        })
    }

    /// Advances the virtual clock by `duration`, firing due timers in
    /// deadline order.
    pub fn advance(&self, duration: Duration) {
        let target = self.core.timers.now().saturating_add(duration);
        self.core.timers.advance_to(target);
    }

    /// Fires pending timers until none remain, advancing the clock as far as
    /// needed.
    pub fn run_until_idle(&self) {
        while let Some(deadline) = self.core.timers.next_deadline() {
            self.core.timers.advance_to(deadline);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.core.scheduler)
            .field("channels", &self.core.channels)
            .field("timers", &self.core.timers)
            .finish()
    }
}

/// Weak counterpart of [`Runtime`].
#[derive(Clone)]
pub(crate) struct WeakRuntime {
    core: Weak<RuntimeCore>,
}

impl WeakRuntime {
    pub(crate) fn upgrade(&self) -> Option<Runtime> {
        self.core.upgrade().map(Runtime::from_core)
    }
}

/// Sending half of a channel.
///
/// Holds only a weak reference to the runtime; sending after the runtime is
/// gone silently drops the message.
pub struct Sender<T> {
    core: Weak<RuntimeCore>,
    id: ChannelId<T>,
}

impl<T: 'static> Sender<T> {
    /// Delivers a message to the channel.
    pub fn send(&self, msg: T) {
        if let Some(core) = self.core.upgrade() {
            core.channels.send(self.id, msg);
        } else {
            tracing::trace!(channel = %self.id, "send after runtime drop is ignored");
        }
    }

    /// The id of the channel this sender feeds.
    #[must_use]
    pub fn channel_id(&self) -> ChannelId<T> {
        self.id
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            core: Weak::clone(&self.core),
            id: self.id,
        }
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sender({})", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};

    #[test]
    fn spawn_steps_to_completion() {
        let rt = Runtime::new();
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        let id = rt.spawn(Task::exec(move || hit2.set(true)));
        assert!(hit.get());
        assert!(!rt.has_process(id), "terminal process leaves the table");
    }

    #[test]
    fn spawns_during_a_pass_run_before_it_returns() {
        let rt = Runtime::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let rt2 = rt.clone();
        let order2 = Rc::clone(&order);
        rt.spawn(Task::exec(move || {
            order2.borrow_mut().push("outer");
            let order3 = Rc::clone(&order2);
            rt2.spawn(Task::exec(move || order3.borrow_mut().push("inner")));
            // The inner spawn is queued, not run inline: the active pass
            // drains it after this step finishes.
            order2.borrow_mut().push("outer-end");
        }));
        assert_eq!(*order.borrow(), vec!["outer", "outer-end", "inner"]);
    }

    #[test]
    fn kill_cancels_a_pending_sleep() {
        let rt = Runtime::new();
        let fired = Rc::new(Cell::new(false));
        let fired2 = Rc::clone(&fired);
        let id = rt.spawn(
            rt.sleep(Duration::from_millis(10))
                .and_then(move |()| Task::exec(move || fired2.set(true))),
        );
        rt.kill(id);
        rt.advance(Duration::from_millis(20));
        assert!(!fired.get(), "cancelled timer must not fire");
    }

    #[test]
    fn kill_after_completion_is_a_noop() {
        let rt = Runtime::new();
        let id = rt.spawn(Task::succeed(7));
        rt.kill(id);
        rt.kill(id);
    }

    #[test]
    fn process_ids_are_never_reused() {
        let rt = Runtime::new();
        let a = rt.spawn(Task::succeed(()));
        let b = rt.spawn(Task::succeed(()));
        assert_ne!(a, b);
        assert!(!rt.has_process(a));
        assert!(!rt.has_process(b));
    }

    #[test]
    fn batch_cancellation_fans_out_in_reverse() {
        let rt = Runtime::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let mut ids = Vec::new();
        for label in ["first", "second"] {
            let order = Rc::clone(&order);
            ids.push(rt.spawn(Task::suspend(move |_done: OnDone<()>| {
                Cancel::new(move || order.borrow_mut().push(label))
            })));
        }
        let group = rt.batch(ids);
        rt.kill(group);
        assert_eq!(*order.borrow(), vec!["second", "first"]);
        // Killing the group again is a no-op.
        rt.kill(group);
        assert_eq!(order.borrow().len(), 2);
    }

    #[test]
    fn receive_task_wakes_on_send() {
        let rt = Runtime::new();
        let (tx, rx) = rt.channel::<u32>();
        let got = Rc::new(Cell::new(None));
        let got2 = Rc::clone(&got);
        rt.spawn(
            rt.receive(rx)
                .and_then(move |n| Task::exec(move || got2.set(Some(n)))),
        );
        assert_eq!(got.get(), None);
        tx.send(42);
        assert_eq!(got.get(), Some(42));
    }

    #[test]
    fn chained_suspensions_thread_cancellation() {
        // A process sleeping in the second link of an and_then chain: after
        // the first sleep fires, killing the process must cancel the second
        // sleep, which is the action currently outstanding.
        let rt = Runtime::new();
        let done = Rc::new(Cell::new(false));
        let done2 = Rc::clone(&done);
        let rt2 = rt.clone();
        let id = rt.spawn(rt.sleep(Duration::from_millis(5)).and_then(move |()| {
            rt2.sleep(Duration::from_millis(5))
                .and_then(move |()| Task::exec(move || done2.set(true)))
        }));
        rt.advance(Duration::from_millis(5));
        rt.kill(id);
        rt.advance(Duration::from_millis(20));
        assert!(!done.get(), "second link was cancelled");
    }
}
