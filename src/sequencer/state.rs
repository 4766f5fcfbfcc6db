//! States and the entry protocol.
//!
//! Every visit to a state runs the same protocol:
//!
//! 1. Clear the error flag.
//! 2. Spawn the action unit: all asynchronous actions concurrently, then the
//!    synchronous ones in registration order.
//! 3. Pend on the signal channel until the unit releases, racing it against
//!    `Pause`, `Resume` and `Abort`.
//! 4. On release, route a raised error flag to the error hook, otherwise take the
//!    first transition whose guard matches the store. A hold-on-complete state with
//!    no match waits for the machine's completion flag and tries again.
//! 5. On `Abort` (or cancellation of the machine), abort the unit and report it so
//!    the machine can enter its idle state.
//!
//! `Pause` holds only the next transition. Actions already running keep running, and
//! commands already sent to hardware are not retracted.

use super::action::{Action, ActionError};
use super::cancel::RunControl;
use super::channel::Signal;
use super::store::GlobalArgumentStore;
use crate::error::{AppResult, SequencerError};
use futures::future::{pending, try_join_all};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, warn};

/// Store condition gating a transition.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    key: String,
    field: Option<String>,
    value: Value,
}

impl Guard {
    /// Match when `store[key] == value`.
    pub fn new(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            field: None,
            value: value.into(),
        }
    }

    /// Match when `store[key][field] == value`.
    pub fn field(key: impl Into<String>, field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            field: Some(field.into()),
            value: value.into(),
        }
    }

    /// Values are compared as JSON, so `1` and `1.0` differ.
    pub fn matches(&self, store: &GlobalArgumentStore) -> bool {
        store.lookup(&self.key, self.field.as_deref()).as_ref() == Some(&self.value)
    }
}

/// An outgoing edge, optionally guarded.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// State entered
    pub target: String,
    /// Condition for taking it; `None` always matches
    pub guard: Option<Guard>,
}

/// Event name for a transition between two states.
pub fn transition_event(source: &str, target: &str) -> String {
    format!("{}_to_{}", source, target)
}

/// A named node: actions run on entry, transitions taken after.
#[derive(Debug, Clone)]
pub struct State {
    id: String,
    actions: Vec<Action>,
    transitions: Vec<Transition>,
    hold_on_complete: bool,
    idle: bool,
    initial: bool,
    error_target: Option<String>,
}

impl State {
    /// A state with no actions or transitions.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actions: Vec::new(),
            transitions: Vec::new(),
            hold_on_complete: false,
            idle: false,
            initial: false,
            error_target: None,
        }
    }

    /// Entered from the synthetic start pseudostate.
    pub fn initial(mut self) -> Self {
        self.initial = true;
        self
    }

    /// The rest state `Abort` leads to.
    pub fn idle(mut self) -> Self {
        self.idle = true;
        self
    }

    /// Wait for the completion flag instead of failing when no transition matches.
    pub fn hold_on_complete(mut self) -> Self {
        self.hold_on_complete = true;
        self
    }

    /// Register an action run on every entry.
    pub fn action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Unconditional transition.
    pub fn transition(mut self, target: impl Into<String>) -> Self {
        self.transitions.push(Transition {
            target: target.into(),
            guard: None,
        });
        self
    }

    /// Transition taken when `guard` matches.
    pub fn transition_when(mut self, target: impl Into<String>, guard: Guard) -> Self {
        self.transitions.push(Transition {
            target: target.into(),
            guard: Some(guard),
        });
        self
    }

    /// Route action failures in this state to `target`.
    pub fn on_error(mut self, target: impl Into<String>) -> Self {
        self.error_target = Some(target.into());
        self
    }

    /// State identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Actions in registration order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Transitions in evaluation order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Target of the error route, if any.
    pub fn error_target(&self) -> Option<&str> {
        self.error_target.as_deref()
    }

    /// Whether `Abort` leads here.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Whether the machine starts here.
    pub fn is_initial(&self) -> bool {
        self.initial
    }

    /// Whether the state waits for the completion flag.
    pub fn is_hold_on_complete(&self) -> bool {
        self.hold_on_complete
    }

    /// First transition whose guard matches, in registration order.
    pub fn evaluate(&self, store: &GlobalArgumentStore) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.guard.as_ref().map_or(true, |g| g.matches(store)))
    }

    pub(crate) async fn enter(&self, env: &EntryEnv<'_>) -> AppResult<EntryOutcome> {
        // Step 1: a fresh entry starts with the error flag lowered.
        let mut error_flag: Option<(String, String)> = None;

        let entry = env.control.child();
        let mut unit = UnitHandle(tokio::spawn(run_unit(
            self.id.clone(),
            self.actions.clone(),
            Arc::clone(env.store),
            entry.clone(),
        )));

        let mut signals = SignalPend::lock(env.signals.as_deref()).await;

        let released = match self.pend(env, &mut signals, &mut unit).await {
            Pend::Released(result) if !(env.control.is_cancelled() || is_abort(&result)) => result,
            Pend::Released(Err(ActionError::Fatal(error))) => return Err(error),
            // The unit won the race against cancellation; it is still an abort.
            Pend::Released(_) => {
                info!(machine = env.machine, state = %self.id, "Actions released on abort");
                entry.cancel();
                return Ok(EntryOutcome::Aborted);
            }
            Pend::Aborted => {
                info!(machine = env.machine, state = %self.id, "Abort: cancelling actions");
                entry.cancel();
                unit.cancel().await;
                return Ok(EntryOutcome::Aborted);
            }
        };

        match released {
            Ok(()) => {}
            Err(ActionError::Fatal(error)) => return Err(error),
            Err(ActionError::Flagged { action, error }) => {
                warn!(machine = env.machine, state = %self.id, %action, %error, "Action failed");
                error_flag = Some((action, error.to_string()));
            }
        }

        if let Some((action, reason)) = error_flag {
            return Ok(EntryOutcome::Failed { action, reason });
        }

        loop {
            if let Some(transition) = self.evaluate(env.store) {
                return Ok(EntryOutcome::Transition {
                    event: transition_event(&self.id, &transition.target),
                });
            }
            if !self.hold_on_complete {
                return Err(SequencerError::NoTransition(self.id.clone()));
            }
            if self.transitions.is_empty() {
                return Ok(EntryOutcome::Terminal);
            }

            debug!(machine = env.machine, state = %self.id, "Holding for completion");
            if !self.await_completion(env, &mut signals).await {
                return Ok(EntryOutcome::Aborted);
            }
        }
    }

    async fn pend(
        &self,
        env: &EntryEnv<'_>,
        signals: &mut SignalPend<'_>,
        unit: &mut UnitHandle,
    ) -> Pend {
        loop {
            tokio::select! {
                result = &mut unit.0 => return Pend::Released(flatten(&self.id, result)),
                _ = env.control.cancelled() => return Pend::Aborted,
                signal = signals.next() => match signal {
                    Signal::Abort => return Pend::Aborted,
                    Signal::Pause => {
                        if !self.hold_paused(env, signals).await {
                            return Pend::Aborted;
                        }
                    }
                    Signal::Resume => debug!(state = %self.id, "Resume without pause ignored"),
                },
            }
        }
    }

    /// Block until `Resume` (true) or `Abort` (false).
    async fn hold_paused(&self, env: &EntryEnv<'_>, signals: &mut SignalPend<'_>) -> bool {
        info!(machine = env.machine, state = %self.id, "Paused");
        env.control.gate().pause();
        let resumed = loop {
            tokio::select! {
                _ = env.control.cancelled() => break false,
                signal = signals.next() => match signal {
                    Signal::Resume => break true,
                    Signal::Abort => break false,
                    Signal::Pause => {}
                },
            }
        };
        env.control.gate().resume();
        if resumed {
            info!(machine = env.machine, state = %self.id, "Resumed");
        }
        resumed
    }

    /// Wait for the completion flag, then lower it. `false` on abort.
    async fn await_completion(&self, env: &EntryEnv<'_>, signals: &mut SignalPend<'_>) -> bool {
        let mut complete = env.completion.subscribe();
        loop {
            tokio::select! {
                done = async { complete.wait_for(|done| *done).await.is_ok() } => {
                    if done {
                        env.completion.send_replace(false);
                        return true;
                    }
                    return false;
                }
                _ = env.control.cancelled() => return false,
                signal = signals.next() => match signal {
                    Signal::Abort => return false,
                    Signal::Pause => {
                        if !self.hold_paused(env, signals).await {
                            return false;
                        }
                    }
                    Signal::Resume => {}
                },
            }
        }
    }
}

/// What a state entry needs from its machine.
pub(crate) struct EntryEnv<'a> {
    pub machine: &'a str,
    pub store: &'a Arc<GlobalArgumentStore>,
    /// Root machines pend on the signal channel; nested ones only on cancellation.
    pub signals: Option<Arc<Mutex<mpsc::Receiver<Signal>>>>,
    pub control: &'a RunControl,
    pub completion: &'a watch::Sender<bool>,
}

#[derive(Debug)]
pub(crate) enum EntryOutcome {
    Transition { event: String },
    Failed { action: String, reason: String },
    Aborted,
    Terminal,
}

enum Pend {
    Released(Result<(), ActionError>),
    Aborted,
}

struct SignalPend<'a> {
    receiver: Option<MutexGuard<'a, mpsc::Receiver<Signal>>>,
    closed: bool,
}

impl<'a> SignalPend<'a> {
    async fn lock(signals: Option<&'a Mutex<mpsc::Receiver<Signal>>>) -> SignalPend<'a> {
        let receiver = match signals {
            Some(mutex) => Some(mutex.lock().await),
            None => None,
        };
        SignalPend {
            receiver,
            closed: false,
        }
    }

    /// Next signal; never resolves once the channel is closed or absent.
    async fn next(&mut self) -> Signal {
        if !self.closed {
            if let Some(receiver) = self.receiver.as_mut() {
                if let Some(signal) = receiver.recv().await {
                    return signal;
                }
                self.closed = true;
            }
        }
        pending().await
    }
}

/// Aborts the unit when dropped, so cancelling a parent unit reaches nested ones.
struct UnitHandle(JoinHandle<Result<(), ActionError>>);

impl UnitHandle {
    async fn cancel(&mut self) {
        self.0.abort();
        let _ = (&mut self.0).await;
    }
}

impl Drop for UnitHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn is_abort(result: &Result<(), ActionError>) -> bool {
    matches!(
        result,
        Err(ActionError::Flagged {
            error: SequencerError::Aborted,
            ..
        })
    )
}

fn flatten(state: &str, joined: Result<Result<(), ActionError>, JoinError>) -> Result<(), ActionError> {
    match joined {
        Ok(result) => result,
        Err(error) => Err(ActionError::Flagged {
            action: state.to_string(),
            error: SequencerError::ActionFailure {
                action: state.to_string(),
                message: error.to_string(),
            },
        }),
    }
}

async fn run_unit(
    state: String,
    actions: Vec<Action>,
    store: Arc<GlobalArgumentStore>,
    control: RunControl,
) -> Result<(), ActionError> {
    let (concurrent, sequential): (Vec<&Action>, Vec<&Action>) =
        actions.iter().partition(|action| action.is_async());

    try_join_all(
        concurrent
            .iter()
            .map(|action| action.async_exec(action.args(Arc::clone(&store), control.clone()))),
    )
    .await?;

    for action in sequential {
        action.exec(action.args(Arc::clone(&store), control.clone()))?;
    }
    debug!(%state, actions = actions.len(), "Action unit finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_first_matching_transition_wins() {
        let store = GlobalArgumentStore::new();
        store.insert("Mode", json!("auto"));
        let state = State::new("waiting")
            .transition_when("manual", Guard::new("Mode", "manual"))
            .transition_when("auto", Guard::new("Mode", "auto"))
            .transition("fallback");
        assert_eq!(state.evaluate(&store).unwrap().target, "auto");

        store.insert("Mode", json!("other"));
        assert_eq!(state.evaluate(&store).unwrap().target, "fallback");
    }

    #[test]
    fn test_field_guard() {
        let store = GlobalArgumentStore::new();
        store.insert("Cursor", json!({"Control Loop Complete": false}));
        let guard = Guard::field("Cursor", "Control Loop Complete", true);
        assert!(!guard.matches(&store));
        store.insert("Cursor", json!({"Control Loop Complete": true}));
        assert!(guard.matches(&store));
    }

    #[test]
    fn test_event_names() {
        assert_eq!(transition_event("indexing", "moving"), "indexing_to_moving");
    }
}
