//! Moving: bring every participating instrument to the current step.

use super::super::{command_instrument, MEASURING};
use crate::config::FailurePolicy;
use crate::core::Selector;
use crate::error::SequencerError;
use crate::metadata::MetadataMap;
use crate::sequencer::control_loop::{ControlBlock, ControlLoop};
use crate::sequencer::store::keys::{CONTROL, CURSOR, METADATA};
use crate::sequencer::{Action, ActionArgs, ActionResult, Context, Cursor, State};
use std::sync::Arc;
use tracing::{error, info};

/// The Moving state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::super::MOVING)
        .initial()
        .action(Action::asynchronous(
            "move_instruments",
            &[CONTROL, CURSOR, METADATA],
            move |args| {
                let context = Arc::clone(&context);
                async move { move_instruments(&context, args).await }
            },
        ))
        .transition(MEASURING)
}

pub(crate) fn loaded_loop(args: &ActionArgs) -> Result<ControlLoop, SequencerError> {
    let block: ControlBlock = args.require_as(CONTROL)?;
    block
        .control_loop
        .ok_or_else(|| SequencerError::MissingKey(format!("{}.Loop", CONTROL)))
}

async fn move_instruments(context: &Context, args: ActionArgs) -> ActionResult {
    let control_loop = loaded_loop(&args)?;
    let cursor: Cursor = args.get_as(CURSOR)?.unwrap_or_default();
    let mut metadata: MetadataMap = args.get_as(METADATA)?.unwrap_or_default();

    for id in control_loop.participants(cursor.series_index) {
        context.instruments().require(id)?;
    }

    let machine = &context.settings().machine;
    let mut failures = Vec::new();
    for (id, entry) in context.instruments().iter() {
        let Some(step) = control_loop.step(id, cursor.series_index, cursor.sequence_index) else {
            continue;
        };

        match command_instrument(id, entry.adapter.as_ref(), step, machine).await {
            Ok(confirmed) => {
                let applied = Selector::Keys(step.keys().cloned().collect()).select(&confirmed);
                metadata.fold(id, &applied);
                context.publisher().parameters(id, confirmed);
            }
            Err(e) => {
                error!(instrument = id, error = %e, "Move failed");
                failures.push(e);
                if machine.moving_failure_policy == FailurePolicy::StopRemaining {
                    break;
                }
            }
        }
    }

    // Instruments moved before a failure stay moved; record where they are.
    args.set_as(METADATA, &metadata)?;

    match failures.into_iter().next() {
        Some(first) => Err(first),
        None => {
            info!(
                series = cursor.series_index,
                step = cursor.sequence_index,
                "Instruments in position"
            );
            Ok(())
        }
    }
}
