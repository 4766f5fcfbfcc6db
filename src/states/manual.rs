//! Manual: apply a one-shot operator command.
//!
//! Settings are applied instrument by instrument in registration order and the
//! read-back published. Requested measurements then run concurrently. The command is
//! taken out of the store before anything is applied, so it is never replayed.

use super::{command_instrument, within, TROUBLESHOOTING, WAITING};
use crate::error::SequencerError;
use crate::measurement::MeasurementRequest;
use crate::core::Selector;
use crate::metadata::MetadataMap;
use crate::sequencer::control_loop::ControlBlock;
use crate::sequencer::store::keys::CONTROL;
use crate::sequencer::{Action, ActionArgs, ActionResult, Context, Report, State};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The Manual state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::MANUAL)
        .action(Action::asynchronous("apply_manual", &[CONTROL], move |args| {
            let context = Arc::clone(&context);
            async move { apply_manual(&context, args).await }
        }))
        .transition(WAITING)
        .on_error(TROUBLESHOOTING)
}

async fn apply_manual(context: &Context, args: ActionArgs) -> ActionResult {
    let mut block: ControlBlock = args.get_as(CONTROL)?.unwrap_or_default();
    let command = block.manual.take().unwrap_or_default();
    args.set_as(CONTROL, &block)?;

    for id in command.keys() {
        context.instruments().require(id)?;
    }

    let machine = &context.settings().machine;
    let mut metadata = MetadataMap::new();
    for (id, entry) in context.instruments().iter() {
        let Some(request) = command.get(id) else {
            continue;
        };
        if request.settings.is_empty() {
            continue;
        }
        let confirmed =
            command_instrument(id, entry.adapter.as_ref(), &request.settings, machine).await?;
        let applied = Selector::Keys(request.settings.keys().cloned().collect()).select(&confirmed);
        metadata.fold(id, &applied);
        context.publisher().parameters(id, confirmed);
    }

    let mut measurements = Vec::new();
    for (id, request) in &command {
        let Some(spec) = &request.measurement else {
            continue;
        };
        let duration = Duration::try_from_secs_f64(spec.duration).map_err(|e| {
            SequencerError::Measurement(format!("'{}': invalid duration: {}", id, e))
        })?;
        let entry = context.instruments().require(id)?.clone();
        let measurement = MeasurementRequest {
            instrument: id.clone(),
            sample_rate: spec.sample_rate,
            duration,
            path: spec.file.clone(),
            metadata: metadata.clone(),
        };
        let limit = machine.action_timeout().map(|limit| limit + duration);
        measurements.push(async move {
            let operation = format!("{} measurement", measurement.instrument);
            let result = within(limit, &operation, async {
                entry
                    .procedure
                    .run(Arc::clone(&entry.adapter), &measurement)
                    .await
                    .map_err(|e| SequencerError::Measurement(format!("{:#}", e)))
            })
            .await;
            (measurement.instrument, result)
        });
    }

    let total = measurements.len();
    let mut failures = Vec::new();
    for (id, result) in join_all(measurements).await {
        match result {
            Ok(report) => info!(instrument = %id, path = %report.path.display(), "Manual measurement saved"),
            Err(e) => {
                error!(instrument = %id, error = %e, "Manual measurement failed");
                failures.push(format!("{}: {}", id, e));
            }
        }
    }
    if !failures.is_empty() {
        return Err(SequencerError::Measurement(format!(
            "{} of {} measurements failed: {}",
            failures.len(),
            total,
            failures.join("; ")
        )));
    }

    context.publisher().send(Report::ManualComplete);
    Ok(())
}
