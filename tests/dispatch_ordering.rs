//! Ordering guarantees of the effect dispatch loop and the scheduler.
//!
//! - effects of a state transition triggered reentrantly by another
//!   transition's own processing are never interleaved with the first
//!   transition's effects
//! - host callbacks may inject synchronously from within an emission; the
//!   provoked work joins the active pass and runs before control returns
//! - timer-driven effects stay pending until the clock advances, and a
//!   cancelled group never fires

use portside::test_utils::init_test_logging;
use portside::{decode, Cmd, Ports, Program, Runtime, Task};
use serde_json::{json, Value as Json};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

#[test]
fn reentrant_transition_effects_are_not_interleaved() {
    init_test_logging();

    #[derive(Debug, Clone, Copy)]
    enum Msg {
        Kick,
        Follow,
    }

    let runtime = Runtime::new();
    let mut ports = Ports::new(&runtime);
    let out = ports.outgoing("out").expect("declare out");
    let program: Program<(), (), Msg> = Program::worker(
        || ((), Cmd::perform(Task::succeed(Msg::Kick))),
        move |msg, _model| match msg {
            // The middle effect feeds `Follow` back into the application
            // while `Kick`'s batch is still being processed.
            Msg::Kick => Cmd::batch(vec![
                out.send(json!("a1")),
                Cmd::perform(Task::succeed(Msg::Follow)),
                out.send(json!("a2")),
            ]),
            Msg::Follow => out.send(json!("b")),
        },
        |_model| Vec::new(),
    );
    let instance = program.boot(ports, Json::Null).expect("boot");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = Rc::clone(&seen);
    instance
        .outgoing("out")
        .expect("port exists")
        .subscribe(Rc::new(move |payload: &Json| {
            seen2.borrow_mut().push(payload.clone());
        }));
    instance.activate();

    assert_eq!(*seen.borrow(), vec![json!("a1"), json!("a2"), json!("b")]);
}

#[test]
fn host_may_inject_from_within_an_emission() {
    init_test_logging();

    #[derive(Debug, Clone, Copy)]
    enum Msg {
        Got(i64),
    }

    let runtime = Runtime::new();
    let mut ports = Ports::new(&runtime);
    let out = ports.outgoing("out").expect("declare out");
    let input = ports.incoming("in", decode::int()).expect("declare in");
    let program: Program<(), (), Msg> = Program::worker(
        || ((), Cmd::none()),
        move |Msg::Got(n), _model| out.send(json!(n)),
        move |_model| vec![input.subscribe(Msg::Got)],
    );
    let instance = Rc::new(program.boot(ports, Json::Null).expect("boot"));

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = Rc::clone(&seen);
    let injector = Rc::clone(&instance);
    instance
        .outgoing("out")
        .expect("port exists")
        .subscribe(Rc::new(move |payload: &Json| {
            seen2.borrow_mut().push(payload.clone());
            if payload == &json!(1) {
                injector.send("in", json!(2)).expect("reentrant injection");
            }
        }));
    instance.activate();

    instance.send("in", json!(1)).expect("first injection");
    assert_eq!(*seen.borrow(), vec![json!(1), json!(2)]);
}

#[test]
fn timer_effect_fires_only_after_advance() {
    init_test_logging();

    #[derive(Debug, Clone, Copy)]
    enum Msg {
        Tick,
    }

    let runtime = Runtime::new();
    let mut ports = Ports::new(&runtime);
    let out = ports.outgoing("out").expect("declare out");
    let sleep_runtime = runtime.clone();
    let program: Program<(), (), Msg> = Program::worker(
        move || {
            (
                (),
                Cmd::perform(
                    sleep_runtime
                        .sleep(Duration::from_millis(10))
                        .map(|()| Msg::Tick),
                ),
            )
        },
        move |Msg::Tick, _model| out.send(json!("tick")),
        |_model| Vec::new(),
    );
    let instance = program.boot(ports, Json::Null).expect("boot");
    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen2 = Rc::clone(&seen);
    instance
        .outgoing("out")
        .expect("port exists")
        .subscribe(Rc::new(move |payload: &Json| {
            seen2.borrow_mut().push(payload.clone());
        }));
    instance.activate();
    assert!(seen.borrow().is_empty(), "effect is pending on the timer");

    runtime.advance(Duration::from_millis(5));
    assert!(seen.borrow().is_empty(), "deadline not reached yet");

    runtime.advance(Duration::from_millis(5));
    assert_eq!(*seen.borrow(), vec![json!("tick")]);
}

#[test]
fn killing_a_batch_handle_cancels_pending_group_members() {
    init_test_logging();
    let runtime = Runtime::new();
    let fired = Rc::new(RefCell::new(Vec::new()));
    let mut members = Vec::new();
    for label in ["p1", "p2"] {
        let fired = Rc::clone(&fired);
        members.push(runtime.spawn(
            runtime
                .sleep(Duration::from_millis(10))
                .and_then(move |()| Task::exec(move || fired.borrow_mut().push(label))),
        ));
    }
    let group = runtime.batch(members);
    runtime.kill(group);
    runtime.advance(Duration::from_millis(50));
    assert!(
        fired.borrow().is_empty(),
        "neither member's pending action fires after the group is cancelled"
    );
}
