//! Generic asynchronous state-machine engine.
//!
//! The pieces, leaf first:
//!
//! - [`store`]: the shared key/value registry states and actions communicate through
//! - [`channel`]: inbound signals and payloads, outbound reports
//! - [`cancel`]: hierarchical cancellation and the pause gate
//! - [`action`]: sync/async callables with granted store keys
//! - [`state`]: a named node and the entry protocol
//! - [`machine`]: registration, event dispatch, error routing and the run loop
//! - [`control_loop`] and [`expander`]: the data a calibration run walks through
//!
//! Nothing here knows about monochromators or lock-ins; the rig itself is wired in
//! [`crate::spectral`].

pub mod action;
pub mod cancel;
pub mod channel;
pub mod context;
pub mod control_loop;
pub mod expander;
pub mod machine;
pub mod state;
pub mod store;

pub use action::{Action, ActionArgs, ActionResult};
pub use cancel::{CancelToken, PauseGate, RunControl};
pub use channel::{ControlHandle, Payload, Publisher, Report, Signal};
pub use context::Context;
pub use control_loop::{ControlLoop, Cursor, ManualCommand, MeasureSpec};
pub use expander::{expand_series, SequenceSpec, SubsystemSpec, Threshold};
pub use machine::{RunOutcome, StateMachineCore};
pub use state::{Guard, State};
pub use store::GlobalArgumentStore;
