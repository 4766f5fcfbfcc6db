//! Auto: runs the expanded control loop through a nested machine.
//!
//! ```text
//! moving -> measuring -> indexing --(Control Loop Complete == false)--> moving
//!                                 \--(Control Loop Complete == true)--> done
//! ```
//!
//! The nested machine runs under the control of Auto's own entry, so an `Abort`
//! received by the root reaches whichever nested state is active, and a `Pause`
//! holds the nested machine's next transition.

pub mod indexing;
pub mod measuring;
pub mod moving;

use super::{DONE, TROUBLESHOOTING, WAITING};
use crate::error::{AppResult, SequencerError};
use crate::sequencer::control_loop::ControlBlock;
use crate::sequencer::store::keys::{CONTROL, CURSOR};
use crate::sequencer::{
    Action, ActionArgs, ActionResult, Context, Cursor, Report, RunOutcome, State,
    StateMachineCore,
};
use std::sync::Arc;
use tracing::info;

/// Name of the nested machine.
pub const CONTROL_LOOP_MACHINE: &str = "control_loop";

/// The Auto state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::AUTO)
        .action(Action::asynchronous("run_control_loop", &[CONTROL], move |args| {
            let context = Arc::clone(&context);
            async move { run_control_loop(context, args).await }
        }))
        .transition(WAITING)
        .on_error(TROUBLESHOOTING)
}

/// Build the nested moving/measuring/indexing/done machine.
pub fn control_loop_machine(context: &Arc<Context>) -> AppResult<StateMachineCore> {
    StateMachineCore::nested(CONTROL_LOOP_MACHINE, Arc::clone(context))
        .with_state(moving::state(context))?
        .with_state(measuring::state(context))?
        .with_state(indexing::state())?
        .with_state(done())
}

fn done() -> State {
    State::new(DONE)
        .hold_on_complete()
        .action(Action::sync("finish", &[CURSOR], |args| {
            let cursor: Cursor = args.get_as(CURSOR)?.unwrap_or_default();
            info!(complete = cursor.control_loop_complete, "Control loop finished");
            Ok(())
        }))
}

async fn run_control_loop(context: Arc<Context>, args: ActionArgs) -> ActionResult {
    let machine = control_loop_machine(&context)?;
    match machine.run(args.control().clone()).await? {
        RunOutcome::Completed { .. } => {
            let block: ControlBlock = args.get_as(CONTROL)?.unwrap_or_default();
            let sequences = block.control_loop.map_or(0, |l| l.series_len());
            info!(sequences, "Auto sequence finished");
            context.publisher().send(Report::SeriesComplete { sequences });
            Ok(())
        }
        RunOutcome::Aborted { .. } => Err(SequencerError::Aborted),
        RunOutcome::Halted { state, reason } => Err(SequencerError::ActionFailure {
            action: format!("{}/{}", CONTROL_LOOP_MACHINE, state),
            message: reason,
        }),
    }
}
