//! Task values: computations that are either done or suspended on an
//! asynchronous action.
//!
//! A [`Task`] is a two-variant descriptor. `Value` carries a finished result;
//! `AsyncAction` carries a [`Resumption`], a one-shot continuation-acceptor:
//! given a completion callback it arranges for that callback to be invoked
//! exactly once with the *next* task, and hands back a [`Cancel`] thunk that
//! prevents the invocation if fired first.
//!
//! Tasks compose with [`Task::and_then`]. Chaining onto a `Value` runs the
//! continuation immediately; chaining onto an `AsyncAction` defers until the
//! action completes. Cancellation threads through composition at the
//! scheduler: each time a pending action completes, the composed remainder is
//! re-stepped and the new pending action's cancel handle replaces the old one
//! in the owning process record, so cancelling the process always cancels
//! whichever sub-action is currently outstanding.
//!
//! No task may be stepped by more than one caller at a time; a resumption is
//! consumed on first use.

use core::fmt;
use std::cell::RefCell;
use std::rc::Rc;

/// Completion callback handed to a resumption.
///
/// Invoked exactly once with the task that continues the computation.
pub type OnDone<T> = Box<dyn FnOnce(Task<T>)>;

/// An idempotent cancellation thunk.
///
/// Cancelling twice, or after the guarded action already completed, is a
/// silent no-op. Clones share the same underlying thunk, so any clone spends
/// it for all of them.
#[derive(Clone)]
pub struct Cancel {
    thunk: Rc<RefCell<Option<Box<dyn FnOnce()>>>>,
}

impl Cancel {
    /// Wraps a thunk to run on the first `cancel` call.
    #[must_use]
    pub fn new(thunk: impl FnOnce() + 'static) -> Self {
        Self {
            thunk: Rc::new(RefCell::new(Some(Box::new(thunk)))),
        }
    }

    /// A cancel handle that does nothing.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            thunk: Rc::new(RefCell::new(None)),
        }
    }

    /// Fires the thunk if it has not fired yet.
    pub fn cancel(&self) {
        let thunk = self.thunk.borrow_mut().take();
        if let Some(thunk) = thunk {
            thunk();
        }
    }

    /// Returns true once the thunk has fired (or never existed).
    #[must_use]
    pub fn is_spent(&self) -> bool {
        self.thunk.borrow().is_none()
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("spent", &self.is_spent())
            .finish()
    }
}

/// A one-shot registration for resuming a suspended task.
pub struct Resumption<T> {
    run: Box<dyn FnOnce(OnDone<T>) -> Cancel>,
}

impl<T: 'static> Resumption<T> {
    /// Wraps a continuation-acceptor.
    ///
    /// The acceptor must invoke the callback it is given exactly once, with
    /// the task that continues the computation, unless the returned [`Cancel`]
    /// fires first.
    #[must_use]
    pub fn new(run: impl FnOnce(OnDone<T>) -> Cancel + 'static) -> Self {
        Self { run: Box::new(run) }
    }

    /// Registers the completion callback, consuming the resumption.
    pub fn resume(self, done: OnDone<T>) -> Cancel {
        (self.run)(done)
    }
}

impl<T> fmt::Debug for Resumption<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Resumption(..)")
    }
}

/// A computation that either already has a result or will obtain one via an
/// asynchronous action.
pub enum Task<T> {
    /// A finished computation.
    Value(T),
    /// A computation suspended on an external trigger.
    AsyncAction(Resumption<T>),
}

impl<T: 'static> Task<T> {
    /// A task that is already complete.
    #[must_use]
    pub fn succeed(value: T) -> Self {
        Task::Value(value)
    }

    /// A task suspended on the given continuation-acceptor.
    #[must_use]
    pub fn suspend(run: impl FnOnce(OnDone<T>) -> Cancel + 'static) -> Self {
        Task::AsyncAction(Resumption::new(run))
    }

    /// A task that runs an impure thunk at step time and completes with its
    /// result.
    ///
    /// The thunk does not run when the task is built; it runs when the task
    /// is stepped, synchronously, inside the active scheduler pass.
    #[must_use]
    pub fn exec(thunk: impl FnOnce() -> T + 'static) -> Self {
        Task::suspend(move |done| {
            done(Task::Value(thunk()));
            Cancel::noop()
        })
    }

    /// Sequences `next` after this task.
    ///
    /// On a `Value` the continuation runs immediately. On an `AsyncAction`
    /// the continuation is deferred: when the action completes, the callback
    /// receives the remainder of the chain as a single composed task.
    #[must_use]
    pub fn and_then<U: 'static>(self, next: impl FnOnce(T) -> Task<U> + 'static) -> Task<U> {
        match self {
            Task::Value(value) => next(value),
            Task::AsyncAction(resumption) => Task::suspend(move |done: OnDone<U>| {
                resumption.resume(Box::new(move |task| done(task.and_then(next))))
            }),
        }
    }

    /// Transforms the task's result.
    #[must_use]
    pub fn map<U: 'static>(self, f: impl FnOnce(T) -> U + 'static) -> Task<U> {
        self.and_then(move |value| Task::Value(f(value)))
    }

    /// True if the task is already complete.
    #[must_use]
    pub fn is_value(&self) -> bool {
        matches!(self, Task::Value(_))
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Value(_) => f.write_str("Task::Value(..)"),
            Task::AsyncAction(_) => f.write_str("Task::AsyncAction(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    /// Steps a task to completion, driving resumptions synchronously, and
    /// returns the final value. Panics if a resumption defers.
    fn run_sync<T: 'static>(task: Task<T>) -> T {
        let out: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
        let mut current = task;
        loop {
            match current {
                Task::Value(v) => return v,
                Task::AsyncAction(res) => {
                    let slot = Rc::clone(&out);
                    let next: Rc<RefCell<Option<Task<T>>>> = Rc::new(RefCell::new(None));
                    let next2 = Rc::clone(&next);
                    let _ = res.resume(Box::new(move |task| {
                        if let Task::Value(v) = task {
                            *slot.borrow_mut() = Some(v);
                        } else {
                            *next2.borrow_mut() = Some(task);
                        }
                    }));
                    if let Some(v) = out.borrow_mut().take() {
                        return v;
                    }
                    current = next
                        .borrow_mut()
                        .take()
                        .expect("resumption deferred in run_sync");
                }
            }
        }
    }

    #[test]
    fn and_then_on_value_runs_immediately() {
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        let task = Task::succeed(1).and_then(move |n| {
            hit2.set(true);
            Task::succeed(n + 1)
        });
        assert!(hit.get(), "continuation should run at composition time");
        assert_eq!(run_sync(task), 2);
    }

    #[test]
    fn exec_defers_until_stepped() {
        let hit = Rc::new(Cell::new(false));
        let hit2 = Rc::clone(&hit);
        let task = Task::exec(move || hit2.set(true));
        assert!(!hit.get(), "thunk must not run at construction");
        run_sync(task);
        assert!(hit.get());
    }

    #[test]
    fn and_then_chains_across_a_suspension() {
        let task = Task::exec(|| 20).and_then(|n| Task::exec(move || n + 22));
        assert_eq!(run_sync(task), 42);
    }

    #[test]
    fn map_applies_to_result() {
        assert_eq!(run_sync(Task::exec(|| 21).map(|n| n * 2)), 42);
    }

    #[test]
    fn cancel_is_idempotent() {
        let count = Rc::new(Cell::new(0));
        let count2 = Rc::clone(&count);
        let cancel = Cancel::new(move || count2.set(count2.get() + 1));
        assert!(!cancel.is_spent());
        cancel.cancel();
        cancel.cancel();
        assert_eq!(count.get(), 1);
        assert!(cancel.is_spent());
    }

    #[test]
    fn composed_cancel_reaches_pending_action() {
        // Suspend, compose, resume the outer action: cancelling the handle
        // returned by the resumption must fire the inner action's thunk.
        let cancelled = Rc::new(Cell::new(false));
        let cancelled2 = Rc::clone(&cancelled);
        let inner = Task::suspend(move |_done: OnDone<i32>| {
            Cancel::new(move || cancelled2.set(true))
        });
        let composed = inner.and_then(|n| Task::succeed(n + 1));
        let Task::AsyncAction(res) = composed else {
            unreachable!("composition onto an async action must stay async");
        };
        let handle = res.resume(Box::new(|_| {}));
        handle.cancel();
        assert!(cancelled.get());
    }
}
