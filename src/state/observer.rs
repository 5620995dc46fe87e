//! Observer registry for state enter/exit notifications

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use super::table::{Event, State};

/// What an observer wants to be told about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveKind {
    /// Every state entry
    Enter,
    /// Every state exit
    Exit,
    /// Entry into one particular state
    EnterState(State),
}

impl std::fmt::Display for ObserveKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObserveKind::Enter => write!(f, "enter"),
            ObserveKind::Exit => write!(f, "exit"),
            ObserveKind::EnterState(state) => write!(f, "enter:{state}"),
        }
    }
}

/// Observation kind string that does not name a known kind or state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown observation kind: {0:?}")]
pub struct ParseKindError(pub String);

impl FromStr for ObserveKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enter" => Ok(ObserveKind::Enter),
            "exit" => Ok(ObserveKind::Exit),
            _ => s
                .strip_prefix("enter:")
                .and_then(State::from_name)
                .map(ObserveKind::EnterState)
                .ok_or_else(|| ParseKindError(s.to_string())),
        }
    }
}

/// Payload handed to observers
///
/// For exit observers `current` is still the state being left, matching what
/// a listener attached to that state would see, and `next` names the
/// destination. Enter observers get `next: None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub current: State,
    pub last: Option<State>,
    pub action: Event,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<State>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

type Callback = Rc<RefCell<dyn FnMut(&Transition)>>;

struct Entry {
    id: u64,
    kind: ObserveKind,
    active: Rc<Cell<bool>>,
    callback: Callback,
}

/// Ordered list of observers, shared with outstanding [`Subscription`]s
#[derive(Default)]
pub(crate) struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

impl Registry {
    pub(crate) fn insert(
        registry: &Rc<RefCell<Registry>>,
        kind: ObserveKind,
        callback: impl FnMut(&Transition) + 'static,
    ) -> Subscription {
        let mut inner = registry.borrow_mut();
        let id = inner.next_id;
        inner.next_id += 1;

        let active = Rc::new(Cell::new(true));
        inner.entries.push(Entry {
            id,
            kind,
            active: Rc::clone(&active),
            callback: Rc::new(RefCell::new(callback)),
        });

        Subscription {
            id,
            kind,
            active,
            registry: Rc::downgrade(registry),
        }
    }

    /// Callbacks registered for `kind`, in registration order
    ///
    /// The snapshot lets callbacks unsubscribe themselves or others while the
    /// fan-out is running.
    pub(crate) fn snapshot(&mut self, kind: ObserveKind) -> Vec<(Rc<Cell<bool>>, Callback)> {
        self.entries.retain(|entry| entry.active.get());
        self.entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| (Rc::clone(&entry.active), Rc::clone(&entry.callback)))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.active.get())
            .count()
    }

    fn remove(&mut self, id: u64) {
        self.entries.retain(|entry| entry.id != id);
    }
}

/// Handle returned by `subscribe`; call [`Subscription::unsubscribe`] to stop
/// receiving notifications
///
/// Dropping the handle without unsubscribing leaves the observer registered
/// for the lifetime of the machine.
#[must_use = "dropping a Subscription does not unsubscribe it"]
pub struct Subscription {
    id: u64,
    kind: ObserveKind,
    active: Rc<Cell<bool>>,
    registry: Weak<RefCell<Registry>>,
}

impl Subscription {
    pub fn kind(&self) -> ObserveKind {
        self.kind
    }

    /// Deregister the observer. It will not be invoked again, even by a
    /// fan-out that is currently running.
    pub fn unsubscribe(self) {
        self.active.set(false);

        // Pruned on the next snapshot if the registry is busy
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.try_borrow_mut() {
                registry.remove(self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.active.get())
            .finish()
    }
}
