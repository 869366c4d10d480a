//! Boundary channels: the named edge between a program and its host.
//!
//! Two port kinds, both identified by a unique name — declaring the same
//! name twice, in either direction, is a setup error:
//!
//! - **Outgoing** ports carry values from the program to the host. The host
//!   registers plain callbacks with [`OutgoingPort::subscribe`]; emitting is
//!   an effect whose task synchronously invokes every currently subscribed
//!   callback, then resolves carrying no message.
//! - **Incoming** ports carry values from the host to the program. Each one
//!   is a standing subscription process with its own channel:
//!   [`Instance::send`](crate::program::Instance::send) runs the port's
//!   decoder against the raw payload; success pushes the decoded value into
//!   the channel, waking the standing process, which forwards one application
//!   message per active listener; failure is surfaced immediately, naming the
//!   port and the decode trail.
//!
//! Ports are declared up front on a [`Ports`] set, before the program boots,
//! so the handles can be captured by the program's `update` and
//! `subscriptions` closures.

use crate::decode::Decoder;
use crate::error::Error;
use crate::program::{Cmd, Sub};
use crate::runtime::{ChannelId, Runtime, Sender};
use crate::task::Task;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

/// A host-side callback receiving outbound payloads.
///
/// Subscription identity is `Rc` pointer identity: keep a clone of the
/// handle you subscribed to be able to unsubscribe it later.
pub type Subscriber = Rc<dyn Fn(&Value)>;

/// The declaration set for a program's boundary ports.
///
/// Created against a runtime so that each incoming port's channel exists
/// from declaration time; payloads injected before activation buffer in the
/// mailbox and are delivered once the standing process starts.
pub struct Ports {
    runtime: Runtime,
    names: HashSet<String>,
    outgoing: Vec<OutgoingPort>,
    incoming: Vec<IncomingRegistration>,
}

impl Ports {
    /// Creates an empty declaration set on the given runtime.
    #[must_use]
    pub fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            names: HashSet::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    fn claim_name(&mut self, name: &str) -> Result<(), Error> {
        if self.names.insert(name.to_string()) {
            Ok(())
        } else {
            Err(Error::DuplicatePort {
                name: name.to_string(),
            })
        }
    }

    /// Declares an outgoing port.
    pub fn outgoing(&mut self, name: &str) -> Result<OutgoingPort, Error> {
        self.claim_name(name)?;
        let port = OutgoingPort {
            state: Rc::new(OutgoingState {
                name: name.to_string(),
                subscribers: RefCell::new(Vec::new()),
            }),
        };
        self.outgoing.push(port.clone());
        Ok(port)
    }

    /// Declares an incoming port validated by `decoder`.
    pub fn incoming<M: Clone + 'static>(
        &mut self,
        name: &str,
        decoder: Decoder<M>,
    ) -> Result<IncomingPort<M>, Error> {
        self.claim_name(name)?;
        let (sender, channel) = self.runtime.channel::<M>();
        let state = Rc::new(IncomingState {
            name: name.to_string(),
            decoder,
            sender,
            listeners: RefCell::new(Vec::new()),
            on_listener_count: RefCell::new(None),
        });

        let clear_state = Rc::clone(&state);
        let notify_state = Rc::clone(&state);
        let inject_state = Rc::clone(&state);
        let loop_state = Rc::clone(&state);
        let loop_runtime = self.runtime.clone();
        self.incoming.push(IncomingRegistration {
            name: name.to_string(),
            clear: Box::new(move || clear_state.listeners.borrow_mut().clear()),
            notify: Box::new(move || notify_state.notify_listener_count()),
            inject: Rc::new(move |raw| inject_state.inject(raw)),
            spawn_forwarder: Box::new(move || {
                loop_runtime.spawn(forward_loop(&loop_runtime, channel, loop_state));
            }),
        });
        Ok(IncomingPort { state })
    }

    pub(crate) fn into_parts(self) -> (Runtime, Vec<OutgoingPort>, Vec<IncomingRegistration>) {
        (self.runtime, self.outgoing, self.incoming)
    }
}

impl fmt::Debug for Ports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ports")
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.incoming.len())
            .finish()
    }
}

/// Erased per-port hooks collected at declaration time, consumed at boot.
pub(crate) struct IncomingRegistration {
    pub(crate) name: String,
    /// Drops every listener (start of a subscription-registry replacement).
    pub(crate) clear: Box<dyn Fn()>,
    /// Reports the new listener count to the port's notifier hook.
    pub(crate) notify: Box<dyn Fn()>,
    /// Decodes and delivers one host payload.
    pub(crate) inject: Rc<dyn Fn(Value) -> Result<(), Error>>,
    /// Spawns the standing forward process. Runs once, at activation.
    pub(crate) spawn_forwarder: Box<dyn FnOnce()>,
}

// === Outgoing ===

struct OutgoingState {
    name: String,
    subscribers: RefCell<Vec<Subscriber>>,
}

impl OutgoingState {
    fn emit(&self, payload: &Value) {
        // Snapshot so a callback may subscribe or unsubscribe reentrantly
        // without affecting this notification round.
        let subscribers: Vec<Subscriber> = self.subscribers.borrow().clone();
        tracing::debug!(
            port = %self.name,
            subscribers = subscribers.len(),
            "outbound emission"
        );
        for subscriber in &subscribers {
            subscriber(payload);
        }
    }
}

/// Host-subscribable outbound boundary channel.
#[derive(Clone)]
pub struct OutgoingPort {
    state: Rc<OutgoingState>,
}

impl OutgoingPort {
    /// The port's declared name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Registers a host callback. Subscribing the same `Rc` twice registers
    /// it twice; distinct callbacks are notified in subscription order.
    pub fn subscribe(&self, callback: Subscriber) {
        self.state.subscribers.borrow_mut().push(callback);
    }

    /// Removes a previously subscribed callback by pointer identity.
    ///
    /// Unsubscribing a callback that is not currently subscribed succeeds
    /// silently.
    pub fn unsubscribe(&self, callback: &Subscriber) {
        let mut subscribers = self.state.subscribers.borrow_mut();
        if let Some(at) = subscribers.iter().position(|s| Rc::ptr_eq(s, callback)) {
            subscribers.remove(at);
        }
    }

    /// Number of currently subscribed callbacks.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.state.subscribers.borrow().len()
    }

    /// An effect that emits `payload` to every subscriber current at step
    /// time, then resolves. Emitting with no subscribers completes
    /// successfully and delivers nothing.
    #[must_use]
    pub fn send<Msg: 'static>(&self, payload: Value) -> Cmd<Msg> {
        let state = Rc::clone(&self.state);
        Cmd::effect(Task::exec(move || {
            state.emit(&payload);
            None
        }))
    }
}

impl fmt::Debug for OutgoingPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OutgoingPort({})", self.state.name)
    }
}

// === Incoming ===

struct IncomingState<M> {
    name: String,
    decoder: Decoder<M>,
    sender: Sender<M>,
    listeners: RefCell<Vec<Rc<dyn Fn(M)>>>,
    on_listener_count: RefCell<Option<Box<dyn Fn(usize)>>>,
}

impl<M: Clone + 'static> IncomingState<M> {
    fn inject(&self, raw: Value) -> Result<(), Error> {
        match self.decoder.run(&raw) {
            Ok(decoded) => {
                tracing::debug!(port = %self.name, "inbound payload accepted");
                self.sender.send(decoded);
                Ok(())
            }
            Err(source) => {
                tracing::warn!(port = %self.name, error = %source, "inbound payload rejected");
                Err(Error::InboundDecode {
                    port: self.name.clone(),
                    source,
                })
            }
        }
    }

    fn notify_listener_count(&self) {
        let count = self.listeners.borrow().len();
        tracing::trace!(port = %self.name, listeners = count, "listener count updated");
        if let Some(hook) = self.on_listener_count.borrow().as_ref() {
            hook(count);
        }
    }

    fn forward(&self, msg: &M) {
        let listeners: Vec<Rc<dyn Fn(M)>> = self.listeners.borrow().clone();
        tracing::debug!(
            port = %self.name,
            listeners = listeners.len(),
            "inbound delivery"
        );
        for listener in &listeners {
            listener(msg.clone());
        }
    }
}

/// Host-drivable inbound boundary channel carrying decoded values of `M`.
pub struct IncomingPort<M> {
    state: Rc<IncomingState<M>>,
}

impl<M> Clone for IncomingPort<M> {
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }
}

impl<M: Clone + 'static> IncomingPort<M> {
    /// The port's declared name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// A subscription forwarding each decoded payload as `tagger(payload)`.
    #[must_use]
    pub fn subscribe<Msg: 'static>(&self, tagger: impl Fn(M) -> Msg + 'static) -> Sub<Msg> {
        let state = Rc::clone(&self.state);
        let tagger: Rc<dyn Fn(M) -> Msg> = Rc::new(tagger);
        Sub::new(move |send_to_app| {
            let send = Rc::clone(send_to_app);
            let tagger = Rc::clone(&tagger);
            state
                .listeners
                .borrow_mut()
                .push(Rc::new(move |msg: M| send(tagger(msg))));
        })
    }

    /// Installs a hook invoked with the new listener count on every
    /// subscription-registry replacement, so a port with zero listeners can
    /// release host-side resources.
    pub fn on_listener_count(&self, hook: impl Fn(usize) + 'static) {
        *self.state.on_listener_count.borrow_mut() = Some(Box::new(hook));
    }
}

impl<M> fmt::Debug for IncomingPort<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IncomingPort({})", self.state.name)
    }
}

/// The standing subscription process: receive one decoded payload, forward
/// it to the active listeners, and loop.
fn forward_loop<M: Clone + 'static>(
    runtime: &Runtime,
    channel: ChannelId<M>,
    state: Rc<IncomingState<M>>,
) -> Task<()> {
    let weak = runtime.downgrade();
    runtime.receive(channel).and_then(move |msg: M| {
        let forward_state = Rc::clone(&state);
        Task::exec(move || forward_state.forward(&msg)).and_then(move |()| {
            match weak.upgrade() {
                Some(runtime) => forward_loop(&runtime, channel, state),
                None => Task::Value(()),
            }
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode;
    use serde_json::json;

    #[test]
    fn duplicate_names_across_kinds_are_rejected() {
        let runtime = Runtime::new();
        let mut ports = Ports::new(&runtime);
        ports.outgoing("status").expect("first declaration");
        let err = ports
            .incoming("status", decode::int())
            .expect_err("same name in the other direction");
        assert!(matches!(err, Error::DuplicatePort { name } if name == "status"));
    }

    #[test]
    fn unsubscribe_unknown_callback_is_silent() {
        let runtime = Runtime::new();
        let mut ports = Ports::new(&runtime);
        let port = ports.outgoing("out").expect("declaration");
        let never_subscribed: Subscriber = Rc::new(|_| {});
        port.unsubscribe(&never_subscribed);
        assert_eq!(port.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_by_identity() {
        let runtime = Runtime::new();
        let mut ports = Ports::new(&runtime);
        let port = ports.outgoing("out").expect("declaration");
        let first: Subscriber = Rc::new(|_| {});
        let second: Subscriber = Rc::new(|_| {});
        port.subscribe(Rc::clone(&first));
        port.subscribe(Rc::clone(&second));
        port.unsubscribe(&first);
        assert_eq!(port.subscriber_count(), 1);
    }

    #[test]
    fn incoming_inject_rejects_bad_payloads() {
        let runtime = Runtime::new();
        let mut ports = Ports::new(&runtime);
        let _port = ports.incoming("in", decode::int()).expect("declaration");
        let registration = &ports.incoming[0];
        let err = (registration.inject)(json!("not a number")).unwrap_err();
        match err {
            Error::InboundDecode { port, source } => {
                assert_eq!(port, "in");
                assert_eq!(source.message(), "Expecting an INT");
            }
            other => unreachable!("expected InboundDecode, got {other:?}"),
        }
        assert!((registration.inject)(json!(42)).is_ok());
    }
}
