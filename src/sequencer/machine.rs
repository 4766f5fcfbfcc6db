//! The state machine core: registration, dispatch and the run loop.
//!
//! Every move between states goes through [`StateMachineCore::dispatch`], which looks
//! the `(source, event)` pair up in a table built at registration time:
//!
//! - `start_machine` from the synthetic `start` pseudostate to the initial state
//! - `{source}_to_{target}` for each registered transition
//! - `error` for each state with an error route
//! - `enter_idle` from any state to the idle state
//!
//! Unknown events are rejected with `UnknownEvent` rather than ignored.

use super::cancel::RunControl;
use super::context::Context;
use super::state::{transition_event, EntryEnv, EntryOutcome, State};
use super::store::keys;
use crate::error::{AppResult, SequencerError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Synthetic pseudostate the machine starts from.
pub const START: &str = "start";
/// Event leading from `start` into the initial state.
pub const START_EVENT: &str = "start_machine";
/// Event leading from any state into the idle state.
pub const IDLE_EVENT: &str = "enter_idle";
/// Event leading from a failed state to its error route.
pub const ERROR_EVENT: &str = "error";

/// How a `run` ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A terminal state was reached normally.
    Completed {
        /// The terminal state
        state: String,
    },
    /// Aborted with nowhere to go: the machine's control was cancelled, or it has no
    /// idle state.
    Aborted {
        /// State the abort interrupted
        state: String,
    },
    /// An action failed and the machine stopped, either in its error sink or, with no
    /// route, in the failing state itself.
    Halted {
        /// State the machine stopped in
        state: String,
        /// Failing action and its error
        reason: String,
    },
}

/// What the error hook records under the `Fault` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Machine that recorded the fault
    pub machine: String,
    /// State whose action failed
    pub state: String,
    /// Action name and failure
    pub message: String,
}

/// Event-driven state machine over a shared [`Context`].
pub struct StateMachineCore {
    name: String,
    context: Arc<Context>,
    root: bool,
    states: Vec<State>,
    events: HashMap<(String, String), String>,
    completion: watch::Sender<bool>,
    current: watch::Sender<Option<String>>,
}

impl StateMachineCore {
    /// A root machine. Claims `context`; a second root machine on the same context
    /// fails with `ContextInUse`.
    pub fn new(name: impl Into<String>, context: Arc<Context>) -> AppResult<Self> {
        let name = name.into();
        context.claim(&name)?;
        Ok(Self::build(name, context, true))
    }

    /// A machine running inside a state of a root machine. Shares the context and
    /// observes cancellation only through the `RunControl` it is run with.
    pub fn nested(name: impl Into<String>, context: Arc<Context>) -> Self {
        Self::build(name.into(), context, false)
    }

    fn build(name: String, context: Arc<Context>, root: bool) -> Self {
        let (completion, _) = watch::channel(false);
        let (current, _) = watch::channel(None);
        Self {
            name,
            context,
            root,
            states: Vec::new(),
            events: HashMap::new(),
            completion,
            current,
        }
    }

    /// Register a state and its outgoing events.
    pub fn register(&mut self, state: State) -> AppResult<()> {
        if state.id() == START || self.state(state.id()).is_some() {
            return Err(SequencerError::DuplicateState(state.id().to_string()));
        }
        let mut names = HashSet::new();
        for action in state.actions() {
            if !names.insert(action.name()) {
                return Err(SequencerError::DuplicateAction {
                    state: state.id().to_string(),
                    action: action.name().to_string(),
                });
            }
        }
        if state.is_initial() {
            if let Some(existing) = self.initial_state() {
                return Err(SequencerError::Configuration(format!(
                    "'{}' and '{}' are both initial",
                    existing,
                    state.id()
                )));
            }
            self.events.insert(
                (START.to_string(), START_EVENT.to_string()),
                state.id().to_string(),
            );
        }
        if state.is_idle() {
            if let Some(existing) = self.idle_state() {
                return Err(SequencerError::Configuration(format!(
                    "'{}' and '{}' are both idle",
                    existing,
                    state.id()
                )));
            }
        }

        for transition in state.transitions() {
            self.events.insert(
                (
                    state.id().to_string(),
                    transition_event(state.id(), &transition.target),
                ),
                transition.target.clone(),
            );
        }
        if let Some(target) = state.error_target() {
            self.events.insert(
                (state.id().to_string(), ERROR_EVENT.to_string()),
                target.to_string(),
            );
        }

        self.states.push(state);
        Ok(())
    }

    /// Builder-style `register`.
    pub fn with_state(mut self, state: State) -> AppResult<Self> {
        self.register(state)?;
        Ok(self)
    }

    /// Name given at construction.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Context shared with nested machines.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Registered state by id.
    pub fn state(&self, id: &str) -> Option<&State> {
        self.states.iter().find(|s| s.id() == id)
    }

    /// Id of the initial state.
    pub fn initial_state(&self) -> Option<&str> {
        self.states.iter().find(|s| s.is_initial()).map(State::id)
    }

    /// Id of the idle state, if any.
    pub fn idle_state(&self) -> Option<&str> {
        self.states.iter().find(|s| s.is_idle()).map(State::id)
    }

    /// Follow `event` out of `source`.
    pub fn dispatch(&self, source: &str, event: &str) -> AppResult<&str> {
        if event == IDLE_EVENT {
            if source == START || self.state(source).is_some() {
                if let Some(idle) = self.idle_state() {
                    return Ok(idle);
                }
            }
        } else if let Some(target) = self.events.get(&(source.to_string(), event.to_string())) {
            return Ok(target.as_str());
        }
        Err(SequencerError::UnknownEvent {
            event: event.to_string(),
            state: source.to_string(),
        })
    }

    /// Externally settable flag hold-on-complete states wait on.
    pub fn set_complete(&self) {
        self.completion.send_replace(true);
    }

    /// Follow the state the machine is in.
    pub fn watch_state(&self) -> watch::Receiver<Option<String>> {
        self.current.subscribe()
    }

    /// Check that the machine can start and every route lands on a registered state.
    pub fn validate(&self) -> AppResult<()> {
        if self.initial_state().is_none() {
            return Err(SequencerError::NoInitialState);
        }
        for target in self.events.values() {
            if self.state(target).is_none() {
                return Err(SequencerError::UnknownState(target.clone()));
            }
        }
        Ok(())
    }

    /// Generic error hook: follow the state's own route, else stop where we are.
    fn handle_error(&self, state: &str, message: &str) -> AppResult<Option<String>> {
        let fault = Fault {
            machine: self.name.clone(),
            state: state.to_string(),
            message: message.to_string(),
        };
        self.context.store().set_as(keys::FAULT, &fault)?;

        match self.dispatch(state, ERROR_EVENT) {
            Ok(target) => {
                warn!(machine = %self.name, state, target, "Routing failure");
                Ok(Some(target.to_string()))
            }
            Err(_) => {
                error!(machine = %self.name, state, message, "Unhandled failure; machine halted");
                Ok(None)
            }
        }
    }

    /// Run until a terminal state, a halt, or an abort with nowhere to go.
    ///
    /// Fatal configuration faults end the run with `Err`.
    pub async fn run(&self, control: RunControl) -> AppResult<RunOutcome> {
        self.validate()?;
        let signals = self.root.then(|| self.context.channel().signals());

        let mut current = self.dispatch(START, START_EVENT)?.to_string();
        let mut failure: Option<(String, String)> = None;
        info!(machine = %self.name, initial = %current, "Machine started");

        loop {
            self.current.send_replace(Some(current.clone()));
            let state = self
                .state(&current)
                .ok_or_else(|| SequencerError::UnknownState(current.clone()))?;
            debug!(machine = %self.name, state = %current, "Entering state");

            let env = EntryEnv {
                machine: &self.name,
                store: self.context.store(),
                signals: signals.clone(),
                control: &control,
                completion: &self.completion,
            };

            match state.enter(&env).await {
                Err(fault) => {
                    error!(machine = %self.name, state = %current, error = %fault, "Fatal fault");
                    return Err(fault);
                }
                Ok(EntryOutcome::Transition { event }) => {
                    // Nested machines hold their next transition while the rig is paused.
                    if !self.root && !control.pass_gate().await {
                        return Ok(RunOutcome::Aborted { state: current });
                    }
                    let target = self.dispatch(&current, &event)?.to_string();
                    info!(machine = %self.name, from = %current, to = %target, "Transition");
                    failure = None;
                    current = target;
                }
                Ok(EntryOutcome::Failed { action, reason }) => {
                    let message = format!("{}: {}", action, reason);
                    match self.handle_error(&current, &message)? {
                        Some(target) => {
                            failure = Some((current, message));
                            current = target;
                        }
                        None => {
                            return Ok(RunOutcome::Halted {
                                state: current,
                                reason: message,
                            })
                        }
                    }
                }
                Ok(EntryOutcome::Aborted) => {
                    if control.is_cancelled() {
                        info!(machine = %self.name, state = %current, "Machine cancelled");
                        return Ok(RunOutcome::Aborted { state: current });
                    }
                    match self.dispatch(&current, IDLE_EVENT) {
                        Ok(idle) => {
                            info!(machine = %self.name, from = %current, to = %idle, "Aborted to idle");
                            failure = None;
                            current = idle.to_string();
                        }
                        Err(_) => return Ok(RunOutcome::Aborted { state: current }),
                    }
                }
                Ok(EntryOutcome::Terminal) => {
                    info!(machine = %self.name, state = %current, "Machine stopped");
                    return Ok(match failure.take() {
                        Some((state, reason)) => RunOutcome::Halted { state, reason },
                        None => RunOutcome::Completed { state: current },
                    });
                }
            }
        }
    }
}

impl Drop for StateMachineCore {
    fn drop(&mut self) {
        if self.root {
            self.context.release(&self.name);
        }
    }
}
