//! Portside: a single-threaded cooperative execution runtime with
//! replayable boundary ports.
//!
//! # Overview
//!
//! Portside steps tasks to completion without preemption. Suspension points
//! are explicit: a task hands control away only where it registers an
//! asynchronous action, and every such action exposes a cancellation thunk.
//! A process scheduler serializes all stepping into guarded passes, so an
//! inherently callback-driven substrate still delivers deterministic
//! ordering, with no reentrancy, no double registration, and no lost
//! wake-ups.
//!
//! # Core Guarantees
//!
//! - **Deterministic ordering**: within one dispatch pass, effects spawn in
//!   batch order; channel mailboxes are FIFO when no waiter is present
//! - **At most one active pass**: step requests issued during a drain join
//!   the live pass's queue instead of running inline
//! - **Composable cancellation**: cancelling a composed task cancels
//!   whichever sub-action is currently outstanding; cancelling twice, or
//!   after completion, is a no-op
//! - **Validated boundaries**: inbound payloads pass a declarative decoder
//!   or fail loudly with a structured error trail
//! - **Fail-fast**: no retries anywhere; defects abort with a diagnostic
//!
//! # Module Structure
//!
//! - [`task`]: task values, resumptions, and cancel thunks
//! - [`runtime`]: the runtime context — scheduler, channels, virtual timers
//! - [`program`]: worker programs, the effect dispatch loop, boundary ports
//! - [`decode`]: declarative payload decoding at the system edge
//! - [`replay`]: script-driven conformance replay over the port contract
//! - [`error`]: error taxonomy
//! - [`test_utils`]: shared test logging helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod decode;
pub mod error;
pub mod program;
pub mod replay;
pub mod runtime;
pub mod task;
pub mod test_utils;

pub use error::{Error, Result};
pub use program::ports::{IncomingPort, OutgoingPort, Ports, Subscriber};
pub use program::{Cmd, Instance, Program, Sub};
pub use runtime::{ChannelId, ProcessId, Runtime, Sender, Time};
pub use task::{Cancel, OnDone, Resumption, Task};
