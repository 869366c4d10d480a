//! Worker programs and the effect dispatch loop.
//!
//! A [`Program`] is the application seen by the runtime: an `init` producing
//! the first model and effect batch, an `update` consuming one message and
//! producing the next effect batch, and a `subscriptions` function declaring
//! the currently active inbound listeners for a model.
//!
//! The dispatch loop serializes state-transition cycles. Every call to
//! `dispatch` enqueues an `(effect batch, subscription set)` pair; a single
//! guarded drain then, per pair: (a) replaces the subscription registry
//! wholesale — clearing every port's listener list, repopulating it from the
//! new set, then notifying each port of its listener count — and (b) hands
//! the effect batch to a standing dispatch process, which spawns one process
//! per effect in batch order and groups the spawned ids under one cancel
//! handle. An effect's successful result, when it carries a message, re-enters
//! `update`, whose own dispatch is queued behind the active pass — effects of
//! a reentrantly triggered transition are never interleaved with the current
//! one.
//!
//! Booting is split in two: [`Program::boot`] registers everything and queues
//! the initial dispatch, and [`Instance::activate`] starts the standing
//! processes and runs it. Hosts subscribe to outgoing ports between the two,
//! so init-time emissions are observable.

pub mod ports;

use crate::decode::{self, Decoder};
use crate::error::Error;
use crate::runtime::{ChannelId, Runtime, Sender, WeakRuntime};
use crate::task::Task;
use ports::{IncomingRegistration, OutgoingPort, Ports};
use serde_json::Value;
use std::cell::{Cell, OnceCell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::rc::Rc;

/// The application entry point for messages, shared with every listener.
pub(crate) type SendToApp<Msg> = Rc<dyn Fn(Msg)>;

/// An ordered batch of outbound effects.
///
/// Each effect is a task whose successful result optionally carries a
/// message back into the application.
pub struct Cmd<Msg> {
    pub(crate) effects: Vec<Task<Option<Msg>>>,
}

impl<Msg: 'static> Cmd<Msg> {
    /// The empty batch.
    #[must_use]
    pub fn none() -> Self {
        Self {
            effects: Vec::new(),
        }
    }

    /// A single effect whose result may carry a message.
    #[must_use]
    pub fn effect(task: Task<Option<Msg>>) -> Self {
        Self {
            effects: vec![task],
        }
    }

    /// A single effect whose result always carries a message.
    #[must_use]
    pub fn perform(task: Task<Msg>) -> Self {
        Self::effect(task.map(Some))
    }

    /// Concatenates batches, preserving order.
    #[must_use]
    pub fn batch(cmds: Vec<Cmd<Msg>>) -> Self {
        Self {
            effects: cmds.into_iter().flat_map(|cmd| cmd.effects).collect(),
        }
    }

    /// True if the batch contains no effects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }
}

impl<Msg> fmt::Debug for Cmd<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cmd({} effects)", self.effects.len())
    }
}

/// One declared subscription: a listener to attach during a
/// subscription-registry replacement.
pub struct Sub<Msg> {
    attach: Box<dyn Fn(&SendToApp<Msg>)>,
}

impl<Msg> Sub<Msg> {
    pub(crate) fn new(attach: impl Fn(&SendToApp<Msg>) + 'static) -> Self {
        Self {
            attach: Box::new(attach),
        }
    }
}

impl<Msg> fmt::Debug for Sub<Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Sub(..)")
    }
}

/// A worker program: no view, only state transitions and boundary traffic.
pub struct Program<Flags, Model, Msg> {
    flags: Decoder<Flags>,
    init: Box<dyn FnOnce(Flags) -> (Model, Cmd<Msg>)>,
    update: Rc<dyn Fn(Msg, &mut Model) -> Cmd<Msg>>,
    subscriptions: Rc<dyn Fn(&Model) -> Vec<Sub<Msg>>>,
}

impl<Model: 'static, Msg: 'static> Program<(), Model, Msg> {
    /// A worker that takes no flags.
    #[must_use]
    pub fn worker(
        init: impl FnOnce() -> (Model, Cmd<Msg>) + 'static,
        update: impl Fn(Msg, &mut Model) -> Cmd<Msg> + 'static,
        subscriptions: impl Fn(&Model) -> Vec<Sub<Msg>> + 'static,
    ) -> Self {
        Self::with_flags(decode::succeed(()), move |()| init(), update, subscriptions)
    }
}

impl<Flags: 'static, Model: 'static, Msg: 'static> Program<Flags, Model, Msg> {
    /// A worker whose boot value is decoded by `flags`.
    #[must_use]
    pub fn with_flags(
        flags: Decoder<Flags>,
        init: impl FnOnce(Flags) -> (Model, Cmd<Msg>) + 'static,
        update: impl Fn(Msg, &mut Model) -> Cmd<Msg> + 'static,
        subscriptions: impl Fn(&Model) -> Vec<Sub<Msg>> + 'static,
    ) -> Self {
        Self {
            flags,
            init: Box::new(init),
            update: Rc::new(update),
            subscriptions: Rc::new(subscriptions),
        }
    }

    /// Boots the program against a declared port set.
    ///
    /// Decodes `flags`, runs `init`, and queues the initial dispatch; nothing
    /// is executed until [`Instance::activate`]. Fails if the flags do not
    /// decode.
    pub fn boot(self, ports: Ports, flags: Value) -> Result<Instance, Error> {
        let Program {
            flags: flags_decoder,
            init,
            update,
            subscriptions,
        } = self;
        let decoded_flags = flags_decoder
            .run(&flags)
            .map_err(|source| Error::InvalidFlags { source })?;
        let (runtime, outgoing, incoming) = ports.into_parts();

        let mut slots = Vec::with_capacity(incoming.len());
        let mut injectors = HashMap::new();
        let mut after_boot: Vec<Box<dyn FnOnce()>> = Vec::new();
        for registration in incoming {
            let IncomingRegistration {
                name,
                clear,
                notify,
                inject,
                spawn_forwarder,
            } = registration;
            slots.push(SubSlot { clear, notify });
            injectors.insert(name, inject);
            after_boot.push(spawn_forwarder);
        }

        let (cmd_sender, cmd_channel) = runtime.channel::<Vec<Task<Option<Msg>>>>();
        let dispatch = Rc::new(Dispatch {
            runtime: runtime.downgrade(),
            queue: RefCell::new(VecDeque::new()),
            pass_active: Cell::new(false),
            slots,
            cmd_sender,
            send_to_app: OnceCell::new(),
        });

        let (model, init_cmds) = init(decoded_flags);
        let model = Rc::new(RefCell::new(model));

        let app_dispatch = Rc::clone(&dispatch);
        let app_model = Rc::clone(&model);
        let app_subscriptions = Rc::clone(&subscriptions);
        let send_to_app: SendToApp<Msg> = Rc::new(move |msg| {
            let cmds = {
                let mut model = app_model.borrow_mut();
                update(msg, &mut model)
            };
            let subs = app_subscriptions(&app_model.borrow());
            app_dispatch.dispatch(cmds, subs);
        });
        assert!(
            dispatch.send_to_app.set(send_to_app).is_ok(),
            "message entry point is installed exactly once"
        );

        let loop_runtime = runtime.clone();
        let loop_dispatch = Rc::clone(&dispatch);
        after_boot.push(Box::new(move || {
            loop_runtime.spawn(effects_loop(&loop_runtime, cmd_channel, loop_dispatch));
        }));

        let init_dispatch = dispatch;
        let init_model = model;
        after_boot.push(Box::new(move || {
            let subs = subscriptions(&init_model.borrow());
            init_dispatch.dispatch(init_cmds, subs);
        }));

        Ok(Instance {
            runtime,
            outgoing,
            injectors,
            after_boot: RefCell::new(after_boot),
        })
    }
}

impl<Flags, Model, Msg> fmt::Debug for Program<Flags, Model, Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Program(..)")
    }
}

/// Erased per-port registry hooks, one per incoming port.
struct SubSlot {
    clear: Box<dyn Fn()>,
    notify: Box<dyn Fn()>,
}

/// The effect dispatch loop shared by `send_to_app` and the initial boot.
struct Dispatch<Msg> {
    runtime: WeakRuntime,
    queue: RefCell<VecDeque<(Cmd<Msg>, Vec<Sub<Msg>>)>>,
    pass_active: Cell<bool>,
    slots: Vec<SubSlot>,
    cmd_sender: Sender<Vec<Task<Option<Msg>>>>,
    send_to_app: OnceCell<SendToApp<Msg>>,
}

impl<Msg: 'static> Dispatch<Msg> {
    /// Enqueues one state-transition cycle and drains unless a pass is
    /// already active.
    fn dispatch(&self, cmds: Cmd<Msg>, subs: Vec<Sub<Msg>>) {
        self.queue.borrow_mut().push_back((cmds, subs));
        if self.pass_active.get() {
            return;
        }
        self.pass_active.set(true);
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some((cmds, subs)) = next else { break };
            tracing::debug!(effects = cmds.effects.len(), subs = subs.len(), "dispatch cycle");
            self.reset_subscriptions(subs);
            if let Some(runtime) = self.runtime.upgrade() {
                let sender = self.cmd_sender.clone();
                let effects = cmds.effects;
                runtime.spawn(Task::exec(move || sender.send(effects)));
            }
        }
        self.pass_active.set(false);
    }

    /// Replaces the subscription registry atomically: clear every listener
    /// list, attach the new set, then notify each port of its count.
    fn reset_subscriptions(&self, subs: Vec<Sub<Msg>>) {
        for slot in &self.slots {
            (slot.clear)();
        }
        let send = self
            .send_to_app
            .get()
            .expect("message entry point installed at boot");
        for sub in &subs {
            (sub.attach)(send);
        }
        for slot in &self.slots {
            (slot.notify)();
        }
    }
}

/// The standing dispatch process: receive one effect batch, spawn a process
/// per effect in batch order, group the ids, and loop.
fn effects_loop<Msg: 'static>(
    runtime: &Runtime,
    channel: ChannelId<Vec<Task<Option<Msg>>>>,
    dispatch: Rc<Dispatch<Msg>>,
) -> Task<()> {
    runtime.receive(channel).and_then(move |effects| {
        let spawn_dispatch = Rc::clone(&dispatch);
        Task::exec(move || {
            let Some(runtime) = spawn_dispatch.runtime.upgrade() else {
                return;
            };
            let send = Rc::clone(
                spawn_dispatch
                    .send_to_app
                    .get()
                    .expect("message entry point installed at boot"),
            );
            tracing::debug!(effects = effects.len(), "spawning effect batch");
            let mut spawned = Vec::with_capacity(effects.len());
            for task in effects {
                let send = Rc::clone(&send);
                spawned.push(runtime.spawn(task.and_then(move |result| {
                    Task::exec(move || {
                        if let Some(msg) = result {
                            send(msg);
                        }
                    })
                })));
            }
            let _group = runtime.batch(spawned);
        })
        .and_then(move |()| match dispatch.runtime.upgrade() {
            Some(runtime) => effects_loop(&runtime, channel, dispatch),
            None => Task::Value(()),
        })
    })
}

/// A booted program: the host's view of its boundary ports.
pub struct Instance {
    runtime: Runtime,
    outgoing: Vec<OutgoingPort>,
    injectors: HashMap<String, Rc<dyn Fn(Value) -> Result<(), Error>>>,
    after_boot: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Instance {
    /// Starts the standing processes and runs the initial dispatch.
    ///
    /// Call after subscribing to outgoing ports; calling again is a no-op.
    pub fn activate(&self) {
        let actions: Vec<Box<dyn FnOnce()>> = self.after_boot.borrow_mut().drain(..).collect();
        for action in actions {
            action();
        }
    }

    /// The runtime this instance runs on.
    #[must_use]
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Looks up an outgoing port by name.
    #[must_use]
    pub fn outgoing(&self, name: &str) -> Option<OutgoingPort> {
        self.outgoing.iter().find(|port| port.name() == name).cloned()
    }

    /// The outgoing ports, in declaration order.
    #[must_use]
    pub fn outgoing_ports(&self) -> &[OutgoingPort] {
        &self.outgoing
    }

    /// Injects a raw payload into the named incoming port.
    ///
    /// The payload is validated before delivery; a decode failure is
    /// surfaced immediately and nothing is delivered.
    pub fn send(&self, port: &str, payload: Value) -> Result<(), Error> {
        match self.injectors.get(port) {
            Some(inject) => inject(payload),
            None => Err(Error::UnknownPort {
                name: port.to_string(),
            }),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.injectors.len())
            .finish()
    }
}
