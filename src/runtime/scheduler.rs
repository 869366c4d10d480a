//! Process records and the scheduler's dispatch queue.
//!
//! This module owns the data: the process table, the id counter, the queue of
//! `(ProcessId, Task)` pairs awaiting a stepping pass, and the single
//! active-pass flag. The drain loop that steps entries lives on
//! [`Runtime`](crate::runtime::Runtime), which drives these tables.
//!
//! Invariants:
//! - a process id is registered at most once at any time; re-registering an
//!   id before removal is a programming defect and panics;
//! - ids are minted from a monotonically increasing counter and are never
//!   reused for the lifetime of the registry;
//! - at most one stepping pass is active; step requests issued while a pass
//!   drains are appended to the same pass's queue.

use crate::task::{Cancel, Task};
use core::fmt;
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};

/// A unique identifier for a scheduled process.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(u64);

impl fmt::Debug for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessId({})", self.0)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// The scheduling state of a registered process.
pub(crate) enum ProcessState {
    /// Spawned or woken; its next task travels in the dispatch queue.
    Ready,
    /// Suspended on an asynchronous action whose cancel handle is stored.
    Running(Cancel),
}

impl fmt::Debug for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("Ready"),
            Self::Running(_) => f.write_str("Running(..)"),
        }
    }
}

/// Process registry plus the pending-step queue.
pub(crate) struct Scheduler {
    next_id: Cell<u64>,
    table: RefCell<HashMap<ProcessId, ProcessState>>,
    queue: RefCell<VecDeque<(ProcessId, Task<()>)>>,
    pass_active: Cell<bool>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Cell::new(0),
            table: RefCell::new(HashMap::new()),
            queue: RefCell::new(VecDeque::new()),
            pass_active: Cell::new(false),
        }
    }

    /// Mints a fresh process id, unique for the registry's lifetime.
    pub(crate) fn fresh_id(&self) -> ProcessId {
        let raw = self.next_id.get();
        self.next_id.set(raw + 1);
        ProcessId(raw)
    }

    /// Registers a new process as `Ready`.
    ///
    /// # Panics
    ///
    /// Panics if the id is already registered: registration before removal
    /// is a programming defect.
    pub(crate) fn register(&self, id: ProcessId) {
        let previous = self.table.borrow_mut().insert(id, ProcessState::Ready);
        assert!(
            previous.is_none(),
            "process {id} is already registered in the process table"
        );
    }

    /// Removes a terminal process. The id is never handed out again.
    pub(crate) fn remove(&self, id: ProcessId) {
        self.table.borrow_mut().remove(&id);
    }

    /// Stores the cancel handle of a process suspended on an async action.
    pub(crate) fn set_running(&self, id: ProcessId, cancel: Cancel) {
        self.table.borrow_mut().insert(id, ProcessState::Running(cancel));
    }

    /// The cancel handle of a `Running` process, if it is in that state.
    pub(crate) fn running_cancel(&self, id: ProcessId) -> Option<Cancel> {
        match self.table.borrow().get(&id) {
            Some(ProcessState::Running(cancel)) => Some(cancel.clone()),
            _ => None,
        }
    }

    /// True while the id is present in the process table.
    pub(crate) fn is_registered(&self, id: ProcessId) -> bool {
        self.table.borrow().contains_key(&id)
    }

    pub(crate) fn process_count(&self) -> usize {
        self.table.borrow().len()
    }

    /// Appends a step request to the dispatch queue.
    pub(crate) fn push_step(&self, id: ProcessId, task: Task<()>) {
        #[cfg(debug_assertions)]
        {
            let queue = self.queue.borrow();
            assert!(
                !queue.iter().any(|(queued, _)| *queued == id),
                "process {id} already has a queued step"
            );
        }
        self.queue.borrow_mut().push_back((id, task));
    }

    pub(crate) fn pop_step(&self) -> Option<(ProcessId, Task<()>)> {
        self.queue.borrow_mut().pop_front()
    }

    pub(crate) fn pass_active(&self) -> bool {
        self.pass_active.get()
    }

    pub(crate) fn set_pass_active(&self, active: bool) {
        self.pass_active.set(active);
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("processes", &self.table.borrow().len())
            .field("queued", &self.queue.borrow().len())
            .field("pass_active", &self.pass_active.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic() {
        let sched = Scheduler::new();
        let a = sched.fresh_id();
        let b = sched.fresh_id();
        assert!(b > a);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn double_registration_is_a_defect() {
        let sched = Scheduler::new();
        let id = sched.fresh_id();
        sched.register(id);
        sched.register(id);
    }

    #[test]
    fn remove_then_fresh_never_reuses() {
        let sched = Scheduler::new();
        let a = sched.fresh_id();
        sched.register(a);
        sched.remove(a);
        let b = sched.fresh_id();
        assert_ne!(a, b);
    }

    #[test]
    fn running_cancel_only_for_running() {
        let sched = Scheduler::new();
        let id = sched.fresh_id();
        sched.register(id);
        assert!(sched.running_cancel(id).is_none());
        sched.set_running(id, Cancel::noop());
        assert!(sched.running_cancel(id).is_some());
    }
}
