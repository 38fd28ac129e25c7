// SPDX-License-Identifier: MIT
//
// HSM engine scenarios: transition across disjoint trees (S4) and
// transition down into a descendant (S5), exercised through the
// embedded Callback subscriber's `publish_direct` path rather than
// calling `dispatch` directly, so the test also covers the subscriber
// wiring `Hsm::new` sets up.

use std::sync::{Arc, Mutex};

use pub_sub::hsm::{Hsm, StateReturn, EXIT};
use pub_sub::message::StaticRoute;
use pub_sub::{Envelope, MsgHeader, RawMsg, ALLOC_ID_STATIC};

fn private_envelope(id: u16) -> Envelope {
    let boxed = Box::new(MsgHeader::new(id, ALLOC_ID_STATIC));
    let ptr = Box::into_raw(boxed) as *mut u8;
    let raw = unsafe { RawMsg::from_header_ptr(std::ptr::NonNull::new_unchecked(ptr)) };
    unsafe { Envelope::from_parts(raw, Arc::new(StaticRoute)) }
}

// Must be private (greater than the Hsm's max_pub_msg_id of 8) since
// these tests drive dispatch through `publish_direct`.
const TRANSITION_MSG: u16 = 100;

static TRACE: Mutex<Vec<&str>> = Mutex::new(Vec::new());

fn top_a(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        EXIT => {
            TRACE.lock().unwrap().push("exit TopA");
            StateReturn::Consumed
        }
        pub_sub::hsm::ENTRY => {
            TRACE.lock().unwrap().push("entry TopA");
            StateReturn::Consumed
        }
        _ => StateReturn::TopState,
    }
}

fn sub_a(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        EXIT => {
            TRACE.lock().unwrap().push("exit SubA");
            StateReturn::Consumed
        }
        _ => StateReturn::Parent(top_a),
    }
}

fn start_a(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        EXIT => {
            TRACE.lock().unwrap().push("exit StartA");
            StateReturn::Consumed
        }
        TRANSITION_MSG => StateReturn::Transition(child_b),
        _ => StateReturn::Parent(sub_a),
    }
}

fn top_b(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        pub_sub::hsm::ENTRY => {
            TRACE.lock().unwrap().push("entry TopB");
            StateReturn::Consumed
        }
        _ => StateReturn::TopState,
    }
}

fn child_b(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        pub_sub::hsm::ENTRY => {
            TRACE.lock().unwrap().push("entry ChildB");
            StateReturn::Consumed
        }
        _ => StateReturn::Parent(top_b),
    }
}

#[test]
fn s4_transition_across_disjoint_trees_via_publish_direct() {
    TRACE.lock().unwrap().clear();

    let hsm: Arc<Hsm<4>> = Hsm::new(8, start_a);
    hsm.subscriber().publish_direct(private_envelope(TRANSITION_MSG)).unwrap();

    let trace = TRACE.lock().unwrap().clone();
    assert_eq!(trace, vec!["exit StartA", "exit SubA", "exit TopA", "entry TopB", "entry ChildB"]);
    assert_eq!(hsm.current_state() as usize, child_b as usize);
}

static S5_TRACE: Mutex<Vec<&str>> = Mutex::new(Vec::new());

fn start_state(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        TRANSITION_MSG => StateReturn::Transition(grandchild),
        _ => StateReturn::TopState,
    }
}

fn child_state(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        pub_sub::hsm::ENTRY => {
            S5_TRACE.lock().unwrap().push("entry Child");
            StateReturn::Consumed
        }
        _ => StateReturn::Parent(start_state),
    }
}

fn grandchild(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
    match msg_id {
        pub_sub::hsm::ENTRY => {
            S5_TRACE.lock().unwrap().push("entry Grandchild");
            StateReturn::Consumed
        }
        _ => StateReturn::Parent(child_state),
    }
}

#[test]
fn s5_transition_to_a_descendant_via_publish_direct() {
    S5_TRACE.lock().unwrap().clear();

    let hsm: Arc<Hsm<4>> = Hsm::new(8, start_state);
    hsm.subscriber().publish_direct(private_envelope(TRANSITION_MSG)).unwrap();

    let trace = S5_TRACE.lock().unwrap().clone();
    assert_eq!(trace, vec!["entry Child", "entry Grandchild"]);
    assert_eq!(hsm.current_state() as usize, grandchild as usize);
}

#[test]
fn transition_to_the_already_current_state_is_a_no_op() {
    fn solo(_: &Hsm<4>, msg_id: u16, _: *const u8) -> StateReturn<4> {
        match msg_id {
            TRANSITION_MSG => StateReturn::Transition(solo),
            _ => StateReturn::TopState,
        }
    }

    let hsm: Arc<Hsm<4>> = Hsm::new(8, solo);
    hsm.subscriber().publish_direct(private_envelope(TRANSITION_MSG)).unwrap();
    assert_eq!(hsm.current_state() as usize, solo as usize);
}
