//! Waiting: the idle state. Resets per-run data, then blocks for the next request.

use super::{MODE_AUTO, MODE_MANUAL, TROUBLESHOOTING};
use crate::error::SequencerError;
use crate::metadata::MetadataMap;
use crate::sequencer::control_loop::ControlBlock;
use crate::sequencer::store::keys::{CONTROL, CURSOR, METADATA, MODE};
use crate::sequencer::{
    expand_series, Action, ActionArgs, ActionResult, Context, Cursor, Guard, Payload, State,
};
use std::sync::Arc;
use tracing::info;

/// The Waiting state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::WAITING)
        .idle()
        .action(Action::asynchronous(
            "await_request",
            &[CONTROL, CURSOR, METADATA, MODE],
            move |args| {
                let context = Arc::clone(&context);
                async move { await_request(&context, args).await }
            },
        ))
        .action(Action::sync("announce_request", &[MODE], announce_request))
        .transition_when(super::MANUAL, Guard::new(MODE, MODE_MANUAL))
        .transition_when(super::AUTO, Guard::new(MODE, MODE_AUTO))
        .on_error(TROUBLESHOOTING)
}

async fn await_request(context: &Context, args: ActionArgs) -> ActionResult {
    args.set_as(CONTROL, &ControlBlock::default())?;
    args.set_as(CURSOR, &Cursor::default())?;
    args.set_as(METADATA, &MetadataMap::new())?;
    args.remove(MODE)?;

    let payload = tokio::select! {
        payload = context.channel().next_payload() => payload,
        _ = args.control().cancelled() => return Err(SequencerError::Aborted),
    };

    match payload {
        Some(Payload::Series(series)) => {
            let control_loop = expand_series(&series, &context.settings().expander)?;
            args.set_as(
                CONTROL,
                &ControlBlock {
                    control_loop: Some(control_loop),
                    manual: None,
                },
            )?;
            args.set_as(MODE, &MODE_AUTO)
        }
        Some(Payload::Manual(command)) => {
            args.set_as(
                CONTROL,
                &ControlBlock {
                    control_loop: None,
                    manual: Some(command),
                },
            )?;
            args.set_as(MODE, &MODE_MANUAL)
        }
        None => {
            info!("Payload channel closed; idling until shutdown");
            args.control().cancelled().await;
            Err(SequencerError::Aborted)
        }
    }
}

fn announce_request(args: ActionArgs) -> ActionResult {
    let mode: Option<String> = args.get_as(MODE)?;
    info!(mode = mode.as_deref().unwrap_or("none"), "Request received");
    Ok(())
}
