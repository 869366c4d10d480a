//! Replay harness: checks a script of expected boundary interactions
//! against a running instance.
//!
//! A [`Script`] is an ordered list of steps, each either an outbound
//! observation (`command`) or an inbound injection (`send`), with a port
//! name and a payload. Running the script:
//!
//! - subscribes an observer to every outgoing port; each emission must match
//!   the next expected step — same kind, same port, structurally equal
//!   payload — advancing a cursor;
//! - activates the instance and drains its timers;
//! - injects each `send` step in order, draining after each one;
//! - at the end, the cursor must equal the total step count and every port's
//!   observed outbound count must equal its expected count.
//!
//! Any mismatch is fatal and reported with the step index, the port name,
//! and the expected and actual values. The harness contains no scheduling
//! logic of its own; it only consumes the boundary-channel contract.
//!
//! The script's wire form is the JSON shape
//! `{ "ports": [["command", "out", "hello"], ...], "flags": ... }`.

use crate::error::Error;
use crate::program::Instance;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// One expected boundary interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// An outbound emission the instance is expected to produce.
    Command {
        /// The outgoing port name.
        port: String,
        /// The expected payload, compared structurally.
        payload: Value,
    },
    /// An inbound payload the harness injects.
    Send {
        /// The incoming port name.
        port: String,
        /// The payload to inject.
        payload: Value,
    },
}

impl Step {
    /// The port this step names.
    #[must_use]
    pub fn port(&self) -> &str {
        match self {
            Self::Command { port, .. } | Self::Send { port, .. } => port,
        }
    }
}

impl<'de> Deserialize<'de> for Step {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct StepVisitor;

        impl<'de> Visitor<'de> for StepVisitor {
            type Value = Step;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a [kind, port, payload] triple")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Step, A::Error> {
                let kind: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let port: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let payload: Value = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                match kind.as_str() {
                    "command" => Ok(Step::Command { port, payload }),
                    "send" => Ok(Step::Send { port, payload }),
                    other => Err(de::Error::unknown_variant(other, &["command", "send"])),
                }
            }
        }

        deserializer.deserialize_seq(StepVisitor)
    }
}

/// An ordered replay script, with optional boot flags.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Script {
    /// The expected interactions, in order.
    #[serde(default)]
    pub ports: Vec<Step>,
    /// Flags handed to the program at boot.
    #[serde(default)]
    pub flags: Option<Value>,
}

impl Script {
    /// A script from an in-memory step list.
    #[must_use]
    pub fn new(ports: Vec<Step>) -> Self {
        Self { ports, flags: None }
    }

    /// The flags to boot with, defaulting to `null`.
    #[must_use]
    pub fn boot_flags(&self) -> Value {
        self.flags.clone().unwrap_or(Value::Null)
    }
}

impl std::str::FromStr for Script {
    type Err = serde_json::Error;

    /// Parses the JSON wire form.
    fn from_str(text: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(text)
    }
}

/// A fatal protocol violation observed during a replay.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReplayError {
    /// More outbound events occurred than the script expects.
    #[error(
        "expected {expected} boundary events but port `{port}` emitted an extra one with payload {payload}"
    )]
    UnexpectedEvent {
        /// Total number of expected steps.
        expected: usize,
        /// The port that over-emitted.
        port: String,
        /// The extra payload.
        payload: Value,
    },
    /// An outbound event arrived where an injection was expected.
    #[error(
        "event {index}: expected an injection into `{expected_port}` but port `{port}` emitted {payload}"
    )]
    KindMismatch {
        /// Index of the violated step.
        index: usize,
        /// The port the script expected to inject into.
        expected_port: String,
        /// The port that emitted instead.
        port: String,
        /// The emitted payload.
        payload: Value,
    },
    /// An outbound event arrived on the wrong port.
    #[error("event {index}: expected a command on `{expected_port}` but port `{port}` emitted {payload}")]
    PortMismatch {
        /// Index of the violated step.
        index: usize,
        /// The port the script expected.
        expected_port: String,
        /// The port that emitted.
        port: String,
        /// The emitted payload.
        payload: Value,
    },
    /// An outbound event carried the wrong payload.
    #[error("event {index}: wrong payload on port `{port}`: expected {expected}, got {actual}")]
    PayloadMismatch {
        /// Index of the violated step.
        index: usize,
        /// The port name.
        port: String,
        /// The expected payload.
        expected: Value,
        /// The observed payload.
        actual: Value,
    },
    /// The run ended before the script was consumed.
    #[error("run ended after {observed} of {expected} boundary events")]
    Incomplete {
        /// How many steps were consumed.
        observed: usize,
        /// How many the script expects.
        expected: usize,
    },
    /// A port's total outbound count disagreed with the script.
    #[error("port `{port}`: observed {observed} outbound events, expected {expected}")]
    CountMismatch {
        /// The port name.
        port: String,
        /// The observed count.
        observed: usize,
        /// The expected count.
        expected: usize,
    },
    /// An injection step failed at the boundary.
    #[error("injection at event {index} failed: {source}")]
    Injection {
        /// Index of the failing step.
        index: usize,
        /// The boundary error.
        #[source]
        source: Error,
    },
}

struct ReplayState {
    cursor: usize,
    observed: HashMap<String, usize>,
    failure: Option<ReplayError>,
}

impl ReplayState {
    fn observe(&mut self, steps: &[Step], port: &str, payload: &Value) {
        if self.failure.is_some() {
            return;
        }
        match steps.get(self.cursor) {
            None => {
                self.failure = Some(ReplayError::UnexpectedEvent {
                    expected: steps.len(),
                    port: port.to_string(),
                    payload: payload.clone(),
                });
            }
            Some(Step::Send {
                port: expected_port,
                ..
            }) => {
                self.failure = Some(ReplayError::KindMismatch {
                    index: self.cursor,
                    expected_port: expected_port.clone(),
                    port: port.to_string(),
                    payload: payload.clone(),
                });
            }
            Some(Step::Command {
                port: expected_port,
                payload: expected,
            }) => {
                if expected_port != port {
                    self.failure = Some(ReplayError::PortMismatch {
                        index: self.cursor,
                        expected_port: expected_port.clone(),
                        port: port.to_string(),
                        payload: payload.clone(),
                    });
                } else if expected != payload {
                    self.failure = Some(ReplayError::PayloadMismatch {
                        index: self.cursor,
                        port: port.to_string(),
                        expected: expected.clone(),
                        actual: payload.clone(),
                    });
                } else {
                    tracing::trace!(index = self.cursor, port, "observation matched");
                    self.cursor += 1;
                    *self.observed.entry(port.to_string()).or_default() += 1;
                }
            }
        }
    }
}

/// Runs a booted (not yet activated) instance against a script.
///
/// Fails fast: the first violation aborts the replay and is returned.
pub fn run(instance: &Instance, script: &Script) -> Result<(), ReplayError> {
    let steps = Rc::new(script.ports.clone());
    let state = Rc::new(RefCell::new(ReplayState {
        cursor: 0,
        observed: HashMap::new(),
        failure: None,
    }));

    for port in instance.outgoing_ports() {
        let name = port.name().to_string();
        let steps = Rc::clone(&steps);
        let state = Rc::clone(&state);
        port.subscribe(Rc::new(move |payload: &Value| {
            state.borrow_mut().observe(&steps, &name, payload);
        }));
    }

    instance.activate();
    instance.runtime().run_until_idle();
    check_failure(&state)?;

    loop {
        let next = {
            let state = state.borrow();
            script.ports.get(state.cursor).cloned()
        };
        match next {
            Some(Step::Send { port, payload }) => {
                let index = state.borrow().cursor;
                tracing::trace!(index, port = %port, "injecting");
                // Consume the injection step before emissions it provokes
                // are observed against the steps after it.
                state.borrow_mut().cursor += 1;
                instance
                    .send(&port, payload)
                    .map_err(|source| ReplayError::Injection { index, source })?;
                instance.runtime().run_until_idle();
                check_failure(&state)?;
            }
            // A command the instance never produced: stall. Reported below.
            Some(Step::Command { .. }) | None => break,
        }
    }

    let state = state.borrow();
    if let Some(failure) = &state.failure {
        return Err(failure.clone());
    }
    if state.cursor != script.ports.len() {
        return Err(ReplayError::Incomplete {
            observed: state.cursor,
            expected: script.ports.len(),
        });
    }
    let mut expected_counts: HashMap<&str, usize> = HashMap::new();
    for step in &script.ports {
        if let Step::Command { port, .. } = step {
            *expected_counts.entry(port.as_str()).or_default() += 1;
        }
    }
    for (port, expected) in expected_counts {
        let observed = state.observed.get(port).copied().unwrap_or(0);
        if observed != expected {
            return Err(ReplayError::CountMismatch {
                port: port.to_string(),
                observed,
                expected,
            });
        }
    }
    Ok(())
}

fn check_failure(state: &Rc<RefCell<ReplayState>>) -> Result<(), ReplayError> {
    match &state.borrow().failure {
        Some(failure) => Err(failure.clone()),
        None => Ok(()),
    }
}
