//! Core conversation state machine implementation
//!
//! Applies the static transition table, invokes side effects on the call
//! context, and fans transitions out to registered observers.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info};

use super::observer::{ObserveKind, Registry, Subscription, Transition};
use super::table::{rule, Effect, Event, State};

/// External operations a transition may call out to
///
/// Calls are fire-and-forget: the machine neither awaits nor inspects them,
/// and a panicking implementation is the caller's problem.
pub trait CallContext {
    /// Begin capturing microphone audio
    fn start_listening(&mut self);
    /// Drop the pending or playing server response
    fn clear_response(&mut self);
    /// Re-establish the server connection
    fn reconnect(&mut self);
}

/// Outcome of a single `dispatch`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionResult {
    /// The event had a table entry and the machine moved
    Changed {
        from: State,
        to: State,
        event: Event,
        effects: &'static [Effect],
    },
    /// No table entry for this event in this state
    Unchanged { state: State, event: Event },
}

impl TransitionResult {
    /// State the machine is in after the dispatch
    pub fn state(&self) -> State {
        match self {
            TransitionResult::Changed { to, .. } => *to,
            TransitionResult::Unchanged { state, .. } => *state,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, TransitionResult::Changed { .. })
    }
}

/// The conversation state machine for one call session
///
/// Single-threaded by construction (`!Send`); drive it from one task.
pub struct ConversationMachine<C> {
    /// Current state
    state: State,
    /// State before the current one
    last: Option<State>,
    /// When the current state was entered
    entered_at: Instant,
    /// Number of applied transitions
    transitions: u64,
    context: C,
    observers: Rc<RefCell<Registry>>,
}

impl<C: CallContext> ConversationMachine<C> {
    /// Create a machine in `Calling`
    pub fn new(context: C) -> Self {
        Self {
            state: State::Calling,
            last: None,
            entered_at: Instant::now(),
            transitions: 0,
            context,
            observers: Rc::new(RefCell::new(Registry::default())),
        }
    }

    /// Get the current state
    pub fn state(&self) -> State {
        self.state
    }

    /// State before the current one, if any transition has happened
    pub fn last(&self) -> Option<State> {
        self.last
    }

    /// Number of transitions applied so far
    pub fn transition_count(&self) -> u64 {
        self.transitions
    }

    /// Whether `event` would move the machine from its current state
    pub fn can(&self, event: Event) -> bool {
        rule(self.state, event).is_some()
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.context
    }

    /// Number of live observers
    pub fn observer_count(&self) -> usize {
        self.observers.borrow().len()
    }

    /// Register an observer; the returned handle deregisters it
    pub fn subscribe(
        &mut self,
        kind: ObserveKind,
        callback: impl FnMut(&Transition) + 'static,
    ) -> Subscription {
        Registry::insert(&self.observers, kind, callback)
    }

    /// Apply `event` to the current state
    pub fn dispatch(&mut self, event: Event) -> TransitionResult {
        self.dispatch_with(event, None)
    }

    /// Apply `event`, attaching a debug payload to the observer notifications
    ///
    /// The payload never influences the transition.
    pub fn dispatch_with(&mut self, event: Event, payload: Option<Value>) -> TransitionResult {
        let from = self.state;
        let Some(rule) = rule(from, event) else {
            return TransitionResult::Unchanged { state: from, event };
        };
        let to = rule.target;
        let before_from = self.last;
        let duration_ms = self.entered_at.elapsed().as_millis() as u64;

        info!(
            from = %from,
            to = %to,
            event = %event,
            duration_ms = duration_ms,
            "state transition"
        );

        // Update state
        self.state = to;
        self.last = Some(from);
        self.entered_at = Instant::now();
        self.transitions += 1;

        // Side effects see the new state
        for effect in rule.effects {
            self.apply_effect(*effect);
        }

        // Observers: exit for the old state, enter, then enter:<state>
        let exit = Transition {
            current: from,
            last: before_from,
            action: event,
            next: Some(to),
            payload: payload.clone(),
        };
        self.notify(ObserveKind::Exit, &exit);

        let enter = Transition {
            current: to,
            last: Some(from),
            action: event,
            next: None,
            payload,
        };
        self.notify(ObserveKind::Enter, &enter);
        self.notify(ObserveKind::EnterState(to), &enter);

        TransitionResult::Changed {
            from,
            to,
            event,
            effects: rule.effects,
        }
    }

    fn apply_effect(&mut self, effect: Effect) {
        debug!(?effect, "applying side effect");
        match effect {
            Effect::StartListening => self.context.start_listening(),
            Effect::ClearResponse => self.context.clear_response(),
            Effect::Reconnect => self.context.reconnect(),
        }
    }

    fn notify(&self, kind: ObserveKind, transition: &Transition) {
        let observers = self.observers.borrow_mut().snapshot(kind);
        for (active, callback) in observers {
            // An earlier observer in this fan-out may have unsubscribed it
            if active.get() {
                (callback.borrow_mut())(transition);
            }
        }
    }
}

impl<C> std::fmt::Debug for ConversationMachine<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationMachine")
            .field("state", &self.state)
            .field("last", &self.last)
            .field("transitions", &self.transitions)
            .finish_non_exhaustive()
    }
}
