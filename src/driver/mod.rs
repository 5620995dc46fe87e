//! Call driver: feeds the conversation state machine
//!
//! Owns one [`ConversationMachine`] per call session and translates raw
//! signals into machine events:
//! - Tap gating: interrupt while Welcome/Thinking/Speaking, retry in NetworkError
//! - Speech debounce before `userSpeaking`
//! - Response de-duplication before `receiveResponse`
//! - Auto-transition timers out of Welcome and Speaking

mod signal;
mod timer;

pub use signal::Signal;
pub use timer::ScopedTimer;

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, trace};

use crate::config::Timing;
use crate::events::{CallEvent, EndReason};
use crate::state::{
    CallContext, ConversationMachine, Effect, Event, ObserveKind, State, Subscription,
    TransitionResult,
};

/// Side-effect context that publishes each effect as a [`CallEvent::Command`]
#[derive(Debug, Clone)]
pub struct CommandContext {
    events: broadcast::Sender<CallEvent>,
}

impl CommandContext {
    pub fn new(events: broadcast::Sender<CallEvent>) -> Self {
        Self { events }
    }

    fn publish(&self, command: Effect) {
        if self.events.send(CallEvent::Command { command }).is_err() {
            trace!(?command, "no listeners for command");
        }
    }
}

impl CallContext for CommandContext {
    fn start_listening(&mut self) {
        self.publish(Effect::StartListening);
    }

    fn clear_response(&mut self) {
        self.publish(Effect::ClearResponse);
    }

    fn reconnect(&mut self) {
        self.publish(Effect::Reconnect);
    }
}

/// A delayed event, valid only while the machine is still where it was armed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimerInput {
    event: Event,
    armed_in: State,
    epoch: u64,
}

/// Drives one call session
pub struct CallDriver {
    machine: ConversationMachine<CommandContext>,
    timing: Timing,
    events: broadcast::Sender<CallEvent>,
    timer_tx: mpsc::UnboundedSender<TimerInput>,
    timer_rx: mpsc::UnboundedReceiver<TimerInput>,
    /// Auto-transition timer of the current state
    state_timer: Option<ScopedTimer>,
    /// Pending recording-to-speech confirmation
    debounce: Option<ScopedTimer>,
    /// Bumped on every state change; stale timer deliveries carry an old one
    epoch: u64,
    /// Id of the last response seen, to drop repeats
    last_response: Option<String>,
    enter_subscription: Option<Subscription>,
    /// Latest state for status readers that may miss broadcast events
    status: Option<watch::Sender<State>>,
}

impl CallDriver {
    /// Start a session in `Calling`
    pub fn new(timing: Timing, events: broadcast::Sender<CallEvent>) -> Self {
        let mut machine = ConversationMachine::new(CommandContext::new(events.clone()));

        let publisher = events.clone();
        let enter_subscription = machine.subscribe(ObserveKind::Enter, move |transition| {
            let event = CallEvent::from(transition);
            if publisher.send(event).is_err() {
                trace!(state = %transition.current, "no listeners for state change");
            }
        });

        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        info!(state = %machine.state(), "call session started");

        Self {
            machine,
            timing,
            events,
            timer_tx,
            timer_rx,
            state_timer: None,
            debounce: None,
            epoch: 0,
            last_response: None,
            enter_subscription: Some(enter_subscription),
            status: None,
        }
    }

    /// Mirror every state change into `status`, starting with the current one
    pub fn with_status(mut self, status: watch::Sender<State>) -> Self {
        status.send_replace(self.state());
        self.status = Some(status);
        self
    }

    /// Get the current state
    pub fn state(&self) -> State {
        self.machine.state()
    }

    pub fn machine(&self) -> &ConversationMachine<CommandContext> {
        &self.machine
    }

    /// Run until the user hangs up or the signal source closes
    pub async fn run(&mut self, signals: &mut mpsc::Receiver<Signal>) -> EndReason {
        loop {
            tokio::select! {
                signal = signals.recv() => {
                    let Some(signal) = signal else {
                        return self.end(EndReason::Closed);
                    };
                    if let ControlFlow::Break(reason) = self.handle_signal(signal) {
                        return self.end(reason);
                    }
                }
                Some(input) = self.timer_rx.recv() => {
                    self.handle_timer(input);
                }
            }
        }
    }

    /// Apply one external signal
    pub fn handle_signal(&mut self, signal: Signal) -> ControlFlow<EndReason> {
        debug!(%signal, state = %self.state(), "signal received");

        match signal {
            Signal::ConnectionReady => {
                self.dispatch(Event::ConnectionReady);
            }
            Signal::ConnectionLost => {
                self.dispatch(Event::ConnectionLost);
            }
            Signal::RecordingStarted => self.arm_debounce(),
            Signal::RecordingStopped => {
                if self.debounce.take().is_some() {
                    // Listening has no state timer, so this only voids the debounce
                    self.epoch += 1;
                    debug!("recording stopped before speech was confirmed");
                }
            }
            Signal::Response { id } => self.handle_response(id),
            Signal::Tap => {
                let state = self.state();
                if state.is_interruptible() {
                    self.dispatch(Event::Interrupt);
                } else if state == State::NetworkError {
                    self.dispatch(Event::Retry);
                } else {
                    debug!(%state, "tap ignored");
                }
            }
            Signal::Interrupt => {
                self.dispatch(Event::Interrupt);
            }
            Signal::Retry => {
                self.dispatch(Event::Retry);
            }
            Signal::HangUp => return ControlFlow::Break(EndReason::HungUp),
        }

        ControlFlow::Continue(())
    }

    /// Apply any timer deliveries already queued, returning how many
    pub fn process_pending_timers(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(input) = self.timer_rx.try_recv() {
            self.handle_timer(input);
            handled += 1;
        }
        handled
    }

    fn handle_response(&mut self, id: String) {
        if self.last_response.as_deref() == Some(id.as_str()) {
            debug!(%id, "duplicate response ignored");
            return;
        }
        self.last_response = Some(id);

        match self.state() {
            State::Thinking => {
                self.dispatch(Event::ReceiveResponse);
            }
            state => debug!(%state, "response arrived outside Thinking, keep playing"),
        }
    }

    fn arm_debounce(&mut self) {
        if self.state() != State::Listening {
            debug!(state = %self.state(), "recording outside Listening ignored");
            return;
        }
        if self.debounce.is_some() {
            return;
        }
        self.debounce = Some(self.arm(self.timing.speech_debounce, Event::UserSpeaking));
    }

    fn handle_timer(&mut self, input: TimerInput) {
        if input.epoch != self.epoch || input.armed_in != self.state() {
            debug!(event = %input.event, armed_in = %input.armed_in, "stale timer ignored");
            return;
        }
        match input.event {
            Event::UserSpeaking => self.debounce = None,
            _ => self.state_timer = None,
        }
        debug!(event = %input.event, state = %self.state(), "timer elapsed");
        self.dispatch(input.event);
    }

    fn dispatch(&mut self, event: Event) -> TransitionResult {
        let result = self.machine.dispatch(event);
        match result {
            TransitionResult::Changed { to, .. } => self.on_state_changed(to),
            TransitionResult::Unchanged { state, event } => {
                debug!(%state, %event, "event has no transition here");
            }
        }
        result
    }

    /// Release the previous state's timers and arm the new state's
    fn on_state_changed(&mut self, entered: State) {
        if let Some(status) = &self.status {
            status.send_replace(entered);
        }
        self.epoch += 1;
        self.state_timer = None;
        self.debounce = None;

        self.state_timer = match entered {
            State::Welcome => Some(self.arm(self.timing.welcome_delay, Event::FinishWelcome)),
            State::Speaking => Some(self.arm(self.timing.speaking_delay, Event::FinishSpeaking)),
            _ => None,
        };
        if self.state_timer.is_some() {
            debug!(state = %entered, "auto-transition timer armed");
        }
    }

    fn arm(&self, delay: Duration, event: Event) -> ScopedTimer {
        let input = TimerInput {
            event,
            armed_in: self.state(),
            epoch: self.epoch,
        };
        ScopedTimer::arm(delay, self.timer_tx.clone(), input)
    }

    fn end(&mut self, reason: EndReason) -> EndReason {
        self.state_timer = None;
        self.debounce = None;
        if let Some(subscription) = self.enter_subscription.take() {
            subscription.unsubscribe();
        }

        info!(
            ?reason,
            state = %self.state(),
            transitions = self.machine.transition_count(),
            "call session ended"
        );
        let _ = self.events.send(CallEvent::SessionEnded { reason });
        reason
    }
}

impl std::fmt::Debug for CallDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDriver")
            .field("machine", &self.machine)
            .field("epoch", &self.epoch)
            .field("state_timer", &self.state_timer.is_some())
            .field("debounce", &self.debounce.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMING: Timing = Timing {
        welcome_delay: Duration::from_millis(3000),
        speaking_delay: Duration::from_millis(3000),
        speech_debounce: Duration::from_millis(500),
    };

    fn create_driver() -> (CallDriver, broadcast::Receiver<CallEvent>) {
        let (tx, rx) = broadcast::channel(256);
        (CallDriver::new(TIMING, tx), rx)
    }

    /// Let paused time run forward, then apply whatever timers fired
    async fn advance(driver: &mut CallDriver, ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        driver.process_pending_timers();
    }

    fn drain(rx: &mut broadcast::Receiver<CallEvent>) -> Vec<CallEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn commands(events: &[CallEvent]) -> Vec<Effect> {
        events
            .iter()
            .filter_map(|event| match event {
                CallEvent::Command { command } => Some(*command),
                _ => None,
            })
            .collect()
    }

    fn entered(events: &[CallEvent]) -> Vec<State> {
        events
            .iter()
            .filter_map(|event| match event {
                CallEvent::StateChanged { current, .. } => Some(*current),
                _ => None,
            })
            .collect()
    }

    /// Connect, let the welcome finish, and confirm speech
    async fn drive_to_thinking(driver: &mut CallDriver) {
        let _ = driver.handle_signal(Signal::ConnectionReady);
        advance(driver, 3001).await;
        let _ = driver.handle_signal(Signal::RecordingStarted);
        advance(driver, 501).await;
        assert_eq!(driver.state(), State::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_welcome_auto_advances() {
        let (mut driver, mut rx) = create_driver();

        let _ = driver.handle_signal(Signal::ConnectionReady);
        assert_eq!(driver.state(), State::Welcome);

        advance(&mut driver, 2999).await;
        assert_eq!(driver.state(), State::Welcome);

        advance(&mut driver, 2).await;
        assert_eq!(driver.state(), State::Listening);

        let events = drain(&mut rx);
        assert_eq!(entered(&events), vec![State::Welcome, State::Listening]);
        assert_eq!(commands(&events), vec![Effect::StartListening]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_welcome_never_finishes() {
        let (mut driver, mut rx) = create_driver();

        let _ = driver.handle_signal(Signal::ConnectionReady);
        advance(&mut driver, 1000).await;
        let _ = driver.handle_signal(Signal::Tap);
        assert_eq!(driver.state(), State::Listening);

        advance(&mut driver, 5000).await;
        assert_eq!(driver.state(), State::Listening);

        let events = drain(&mut rx);
        assert_eq!(entered(&events), vec![State::Welcome, State::Listening]);
        assert_eq!(
            commands(&events),
            vec![Effect::ClearResponse, Effect::StartListening]
        );
        assert_eq!(driver.machine().transition_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_cancels_welcome_timer() {
        let (mut driver, _rx) = create_driver();

        let _ = driver.handle_signal(Signal::ConnectionReady);
        let _ = driver.handle_signal(Signal::ConnectionLost);
        assert_eq!(driver.state(), State::NetworkError);

        advance(&mut driver, 5000).await;
        assert_eq!(driver.state(), State::NetworkError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speaking_timer_restarts_on_reentry() {
        let (mut driver, _rx) = create_driver();
        drive_to_thinking(&mut driver).await;

        let _ = driver.handle_signal(Signal::Response { id: "r1".into() });
        assert_eq!(driver.state(), State::Speaking);

        advance(&mut driver, 2000).await;
        let _ = driver.handle_signal(Signal::Interrupt);
        assert_eq!(driver.state(), State::Listening);

        let _ = driver.handle_signal(Signal::RecordingStarted);
        advance(&mut driver, 501).await;
        let _ = driver.handle_signal(Signal::Response { id: "r2".into() });
        assert_eq!(driver.state(), State::Speaking);

        // The first Speaking timer would have fired by now
        advance(&mut driver, 1000).await;
        assert_eq!(driver.state(), State::Speaking);

        advance(&mut driver, 2100).await;
        assert_eq!(driver.state(), State::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speech_debounce() {
        let (mut driver, _rx) = create_driver();
        let _ = driver.handle_signal(Signal::ConnectionReady);
        advance(&mut driver, 3001).await;
        assert_eq!(driver.state(), State::Listening);

        let _ = driver.handle_signal(Signal::RecordingStarted);
        advance(&mut driver, 300).await;
        let _ = driver.handle_signal(Signal::RecordingStopped);
        advance(&mut driver, 1000).await;
        assert_eq!(driver.state(), State::Listening);

        let _ = driver.handle_signal(Signal::RecordingStarted);
        advance(&mut driver, 499).await;
        assert_eq!(driver.state(), State::Listening);
        advance(&mut driver, 2).await;
        assert_eq!(driver.state(), State::Thinking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recording_outside_listening_is_ignored() {
        let (mut driver, _rx) = create_driver();
        let _ = driver.handle_signal(Signal::ConnectionReady);

        let _ = driver.handle_signal(Signal::RecordingStarted);
        advance(&mut driver, 600).await;
        assert_eq!(driver.state(), State::Welcome);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_response_ignored() {
        let (mut driver, _rx) = create_driver();
        drive_to_thinking(&mut driver).await;

        let _ = driver.handle_signal(Signal::Response { id: "same".into() });
        assert_eq!(driver.state(), State::Speaking);
        let _ = driver.handle_signal(Signal::Tap);
        assert_eq!(driver.state(), State::Listening);

        let _ = driver.handle_signal(Signal::RecordingStarted);
        advance(&mut driver, 501).await;
        assert_eq!(driver.state(), State::Thinking);

        let _ = driver.handle_signal(Signal::Response { id: "same".into() });
        assert_eq!(driver.state(), State::Thinking);

        let _ = driver.handle_signal(Signal::Response { id: "next".into() });
        assert_eq!(driver.state(), State::Speaking);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_during_welcome_keeps_playing() {
        let (mut driver, _rx) = create_driver();
        let _ = driver.handle_signal(Signal::ConnectionReady);

        let _ = driver.handle_signal(Signal::Response { id: "greeting".into() });
        assert_eq!(driver.state(), State::Welcome);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tap_retries_from_network_error() {
        let (mut driver, mut rx) = create_driver();

        let _ = driver.handle_signal(Signal::Tap);
        assert_eq!(driver.state(), State::Calling);

        let _ = driver.handle_signal(Signal::ConnectionLost);
        let _ = driver.handle_signal(Signal::Tap);
        assert_eq!(driver.state(), State::Reconnecting);

        let _ = driver.handle_signal(Signal::Tap);
        assert_eq!(driver.state(), State::Reconnecting);

        let _ = driver.handle_signal(Signal::ConnectionLost);
        assert_eq!(driver.state(), State::NetworkError);

        let events = drain(&mut rx);
        assert_eq!(commands(&events), vec![Effect::Reconnect]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_delivery_is_discarded() {
        let (mut driver, _rx) = create_driver();
        let _ = driver.handle_signal(Signal::ConnectionReady);
        let armed_epoch = driver.epoch;

        let _ = driver.handle_signal(Signal::Tap);
        assert_eq!(driver.state(), State::Listening);

        // A delivery that raced the abort
        driver
            .timer_tx
            .send(TimerInput {
                event: Event::FinishWelcome,
                armed_in: State::Welcome,
                epoch: armed_epoch,
            })
            .unwrap();
        assert_eq!(driver.process_pending_timers(), 1);
        assert_eq!(driver.state(), State::Listening);
        assert_eq!(driver.machine().transition_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_holds_latest_state() {
        let (status_tx, mut status_rx) = watch::channel(State::NetworkError);
        let (driver, _rx) = create_driver();
        let mut driver = driver.with_status(status_tx.clone());
        assert_eq!(*status_rx.borrow_and_update(), State::Calling);

        // Several changes with nobody reading in between
        let _ = driver.handle_signal(Signal::ConnectionReady);
        let _ = driver.handle_signal(Signal::Tap);
        let _ = driver.handle_signal(Signal::ConnectionLost);
        assert!(status_rx.has_changed().unwrap());
        assert_eq!(*status_rx.borrow_and_update(), State::NetworkError);

        // A fresh session resets the snapshot
        let (next, _rx) = create_driver();
        let _next = next.with_status(status_tx);
        assert_eq!(*status_rx.borrow_and_update(), State::Calling);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_hang_up() {
        let (mut driver, mut rx) = create_driver();
        let (tx, mut signals) = mpsc::channel(8);

        tx.send(Signal::ConnectionReady).await.unwrap();
        tx.send(Signal::HangUp).await.unwrap();

        let reason = driver.run(&mut signals).await;
        assert_eq!(reason, EndReason::HungUp);
        assert_eq!(driver.state(), State::Welcome);

        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&CallEvent::SessionEnded {
                reason: EndReason::HungUp
            })
        );
        assert_eq!(driver.machine().observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_applies_timers() {
        let (mut driver, _rx) = create_driver();
        let (tx, mut signals) = mpsc::channel(8);

        tx.send(Signal::ConnectionReady).await.unwrap();
        drop(tx);

        // Channel closes right away, before the welcome timer
        let reason = driver.run(&mut signals).await;
        assert_eq!(reason, EndReason::Closed);
        assert_eq!(driver.state(), State::Welcome);

        let (tx, mut signals) = mpsc::channel(8);
        tx.send(Signal::ConnectionReady).await.unwrap();
        let (mut driver, _rx) = create_driver();
        let outcome = tokio::time::timeout(Duration::from_millis(3500), driver.run(&mut signals)).await;
        assert!(outcome.is_err(), "session should still be running");
        assert_eq!(driver.state(), State::Listening);
    }
}
