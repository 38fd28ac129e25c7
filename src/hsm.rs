// SPDX-License-Identifier: MIT
//
// HSM engine (C7): states are plain function pointers arranged into a
// tree only through their response to the reserved WALK message. This
// is a direct structural port of `hsm_init`/`hsm_start`/`msg_handler`/
// `transition_state` in `include/hsm/hsm.h` and `lib/hsm/hsm.c` — the
// three-phase transition algorithm (collect target's ancestor chain
// while watching for `current_state`, walk up from `current_state`
// exiting levels until a common ancestor turns up, then enter down
// from the common ancestor to the target) carries over with the same
// shape, replacing the original's fixed-size C array of parent
// pointers with a `Vec` bounded by the same const-generic `N`.

use std::sync::{Arc, Mutex, Weak};

use crate::message::Envelope;
use crate::subscriber::Subscriber;

/// Default bound on HSM nesting depth, matching the original's
/// `CONFIG_HSM_MAX_NESTED_STATES`.
pub const MAX_NESTED_STATES: usize = 8;

/// `WALK` is never handled by user code; states must answer it with
/// `Parent` or `TopState` only, exposing the hierarchy without side
/// effects. Reserved at the top of the 16-bit msg-id space, exactly
/// mirroring `enum hsm_msg_id`.
pub const WALK: u16 = 0xFFFF;
/// Published to a state when it is entered.
pub const ENTRY: u16 = 0xFFFE;
/// Published to a state when it is exited.
pub const EXIT: u16 = 0xFFFD;

/// A state function. Takes the owning `Hsm` (so it can read application
/// data the embedding type stores alongside it, via its own
/// `container_of`-style accessor), the dispatched msg-id, and an
/// untyped payload pointer (null for `Walk`/`Entry`/`Exit`).
pub type StateFn<const N: usize> = fn(&Hsm<N>, u16, *const u8) -> StateReturn<N>;

/// What a state returns in response to a dispatched message.
#[derive(Clone, Copy, PartialEq)]
pub enum StateReturn<const N: usize> {
    /// The state handled the message.
    Consumed,
    /// "I don't handle this; forward to my parent."
    Parent(StateFn<N>),
    /// Same as `Parent`, but there is no parent above this state.
    TopState,
    /// "Transition to this new state."
    Transition(StateFn<N>),
}

/// A hierarchical state machine: a current leaf state plus the
/// embedded Callback subscriber whose handler drives dispatch. The
/// embedding object is responsible for attaching `subscriber()` to a
/// broker — the HSM itself never touches one directly; `Walk`/`Entry`/
/// `Exit` are always invoked as direct function calls, never routed
/// through pub/sub.
pub struct Hsm<const N: usize = MAX_NESTED_STATES> {
    current: Mutex<StateFn<N>>,
    subscriber: Arc<Subscriber>,
}

impl<const N: usize> Hsm<N> {
    /// Initialize an HSM: set its starting state and wire its embedded
    /// subscriber's handler to this engine's dispatch loop.
    pub fn new(max_pub_msg_id: u16, initial_state: StateFn<N>) -> Arc<Self> {
        let subscriber = Subscriber::callback(max_pub_msg_id);
        let hsm = Arc::new(Self { current: Mutex::new(initial_state), subscriber });
        let weak: Weak<Hsm<N>> = Arc::downgrade(&hsm);
        hsm.subscriber.set_handler(Box::new(move |msg_id, envelope: &Envelope| {
            if let Some(hsm) = weak.upgrade() {
                hsm.dispatch(msg_id, envelope);
            } else {
                log::error!("HSM dispatched to after the Hsm itself was dropped");
            }
        }));
        hsm
    }

    /// The embedded Callback subscriber. Attach this to a broker to
    /// start receiving application messages.
    pub fn subscriber(&self) -> &Arc<Subscriber> {
        &self.subscriber
    }

    pub fn current_state(&self) -> StateFn<N> {
        *self.current.lock().unwrap()
    }

    /// Send `Entry` to `current_state` and every one of its ancestors,
    /// topmost first. Must be called once, after the HSM's subscriber
    /// (if any) is attached and before any real message is dispatched.
    pub fn start(&self) {
        let leaf = self.current_state();
        let chain = self.collect_ancestors(leaf);
        for state in chain.iter().rev() {
            self.send_entry(*state);
        }
    }

    /// Collect `state` and its ancestor chain via repeated `Walk`
    /// calls, `state` first and the topmost ancestor last. Bounded by
    /// `N`: once the chain reaches capacity, further parents are
    /// silently ignored rather than growing without bound.
    fn collect_ancestors(&self, state: StateFn<N>) -> Vec<StateFn<N>> {
        let mut chain = vec![state];
        let mut scratch = state;
        while chain.len() < N {
            match scratch(self, WALK, std::ptr::null()) {
                StateReturn::Parent(parent) => {
                    chain.push(parent);
                    scratch = parent;
                }
                StateReturn::TopState => break,
                _ => debug_assert!(false, "a state must answer Walk with Parent or TopState"),
            }
        }
        chain
    }

    fn send_entry(&self, state: StateFn<N>) {
        let ret = state(self, ENTRY, std::ptr::null());
        debug_assert!(!matches!(ret, StateReturn::Transition(_)), "Entry must not return Transition");
    }

    fn send_exit(&self, state: StateFn<N>) -> StateReturn<N> {
        let ret = state(self, EXIT, std::ptr::null());
        debug_assert!(!matches!(ret, StateReturn::Transition(_)), "Exit must not return Transition");
        ret
    }

    /// Dispatch a non-reserved message: walk up from `current_state`
    /// via `Parent` returns until the message is `Consumed`, a state
    /// claims `TopState`, or a state asks for a `Transition`.
    fn dispatch(&self, msg_id: u16, envelope: &Envelope) {
        debug_assert!(msg_id != WALK, "Walk is never delivered through the broker");
        let payload = envelope.raw().payload_ptr() as *const u8;
        let mut scratch = self.current_state();
        let outcome = loop {
            match scratch(self, msg_id, payload) {
                StateReturn::Parent(parent) => scratch = parent,
                other => break other,
            }
        };
        if let StateReturn::Transition(target) = outcome {
            let current = self.current_state();
            if target != current {
                self.transition_to(current, target);
            }
        }
    }

    /// Least-common-ancestor transition from `current` to `target`.
    /// Three phases, in the order the original `transition_state`
    /// runs them: collect `target`'s ancestor chain while watching for
    /// `current` among it; if not found, walk up from `current`
    /// exiting each level until a common ancestor turns up or the
    /// source chain is exhausted; finally enter down from just below
    /// the common ancestor to `target`.
    fn transition_to(&self, current: StateFn<N>, target: StateFn<N>) {
        let mut target_chain = vec![target];
        let mut lca_index = if target == current { Some(0) } else { None };
        let mut scratch = target;
        while lca_index.is_none() && target_chain.len() < N {
            match scratch(self, WALK, std::ptr::null()) {
                StateReturn::Parent(parent) => {
                    if parent == current {
                        lca_index = Some(target_chain.len());
                    }
                    target_chain.push(parent);
                    scratch = parent;
                }
                StateReturn::TopState => break,
                _ => debug_assert!(false, "a state must answer Walk with Parent or TopState"),
            }
        }

        if lca_index.is_none() {
            let mut level = current;
            let mut steps = 0;
            while steps < N {
                steps += 1;
                let exit_ret = self.send_exit(level);
                debug_assert!(matches!(exit_ret, StateReturn::Consumed), "Exit must return Consumed");
                match level(self, WALK, std::ptr::null()) {
                    StateReturn::Parent(parent) => {
                        if let Some(idx) = target_chain.iter().position(|s| *s == parent) {
                            lca_index = Some(idx);
                            break;
                        }
                        level = parent;
                    }
                    StateReturn::TopState => break,
                    _ => debug_assert!(false, "a state must answer Walk with Parent or TopState"),
                }
            }
        }

        // No common ancestor found (disjoint trees, or the bound was
        // exhausted): enter the whole target chain, topmost first.
        let lca_index = lca_index.unwrap_or(target_chain.len());
        for state in target_chain[..lca_index].iter().rev() {
            self.send_entry(*state);
        }
        *self.current.lock().unwrap() = target;
    }
}
