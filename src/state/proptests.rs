//! Property-based tests for the state machine
//!
//! Random event sequences against a fresh machine.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::prelude::*;

use super::machine::tests::Recorder;
use super::*;

fn arb_event() -> impl Strategy<Value = Event> {
    prop::sample::select(Event::ALL.to_vec())
}

fn arb_events() -> impl Strategy<Value = Vec<Event>> {
    prop::collection::vec(arb_event(), 0..64)
}

proptest! {
    #[test]
    fn prop_state_always_follows_table(events in arb_events()) {
        let recorder = Recorder::default();
        let mut machine = ConversationMachine::new(recorder.clone());

        for event in events {
            let before = machine.state();
            let effects_before = recorder.calls().len();
            let result = machine.dispatch(event);

            match rule(before, event) {
                Some(expected) => {
                    let calls = recorder.calls();
                    prop_assert_eq!(machine.state(), expected.target);
                    prop_assert_eq!(&calls[effects_before..], expected.effects);
                }
                None => {
                    prop_assert!(!result.is_changed());
                    prop_assert_eq!(machine.state(), before);
                    prop_assert_eq!(recorder.calls().len(), effects_before);
                }
            }
            prop_assert!(State::ALL.contains(&machine.state()));
        }
    }

    #[test]
    fn prop_connection_lost_always_lands_in_network_error(events in arb_events()) {
        let mut machine = ConversationMachine::new(Recorder::default());
        for event in events {
            machine.dispatch(event);
        }
        machine.dispatch(Event::ConnectionLost);
        prop_assert_eq!(machine.state(), State::NetworkError);
    }

    #[test]
    fn prop_enter_notifications_track_changes(events in arb_events()) {
        let mut machine = ConversationMachine::new(Recorder::default());
        let entered = Rc::new(RefCell::new(Vec::new()));
        let exited = Rc::new(RefCell::new(Vec::new()));

        let enter = {
            let entered = Rc::clone(&entered);
            machine.subscribe(ObserveKind::Enter, move |t| entered.borrow_mut().push(t.current))
        };
        let exit = {
            let exited = Rc::clone(&exited);
            machine.subscribe(ObserveKind::Exit, move |t| exited.borrow_mut().push(t.current))
        };

        let mut expected_entered = Vec::new();
        let mut expected_exited = Vec::new();
        for event in events {
            if let TransitionResult::Changed { from, to, .. } = machine.dispatch(event) {
                expected_exited.push(from);
                expected_entered.push(to);
            }
        }

        let entered = entered.borrow().clone();
        let exited = exited.borrow().clone();
        prop_assert_eq!(entered, expected_entered.clone());
        prop_assert_eq!(exited, expected_exited);
        prop_assert_eq!(machine.transition_count(), expected_entered.len() as u64);

        enter.unsubscribe();
        exit.unsubscribe();
    }
}
