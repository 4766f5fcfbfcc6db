//! Measuring: run every flagged instrument's procedure for the current step.
//!
//! With the default `CompleteSiblings` policy a failing measurement does not stop
//! the others; the failures are reported together once all have finished.

use super::super::{within, INDEXING};
use super::moving::loaded_loop;
use crate::config::FailurePolicy;
use crate::error::SequencerError;
use crate::measurement::MeasurementRequest;
use crate::metadata::MetadataMap;
use crate::sequencer::store::keys::{CONTROL, CURSOR, METADATA};
use crate::sequencer::{Action, ActionArgs, ActionResult, Context, Cursor, State};
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// The Measuring state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::super::MEASURING)
        .action(Action::asynchronous(
            "measure",
            &[CONTROL, CURSOR, METADATA],
            move |args| {
                let context = Arc::clone(&context);
                async move { measure(&context, args).await }
            },
        ))
        .transition(INDEXING)
}

async fn measure(context: &Context, args: ActionArgs) -> ActionResult {
    let control_loop = loaded_loop(&args)?;
    let cursor: Cursor = args.get_as(CURSOR)?.unwrap_or_default();
    let metadata: MetadataMap = args.get_as(METADATA)?.unwrap_or_default();

    let info = control_loop.info(cursor.series_index).ok_or_else(|| {
        SequencerError::MissingKey(format!("sequence {}", cursor.series_index))
    })?;
    let measure = &info.measure;
    let duration = Duration::try_from_secs_f64(measure.sample_time).map_err(|e| {
        SequencerError::Measurement(format!("'{}': invalid sample time: {}", info.name, e))
    })?;
    let storage = context.settings().storage.clone();
    let root = measure.storage_root.clone().unwrap_or(storage.root);
    let limit = context
        .settings()
        .machine
        .action_timeout()
        .map(|limit| limit + duration);

    let mut tasks = Vec::new();
    for id in &measure.instruments {
        let entry = context.instruments().require(id)?.clone();
        let sample_rate = control_loop
            .step(id, cursor.series_index, cursor.sequence_index)
            .and_then(|step| step.get("sample_rate"))
            .and_then(|rate| rate.as_f64())
            .unwrap_or(measure.sample_rate);
        let request = MeasurementRequest {
            instrument: id.clone(),
            sample_rate,
            duration,
            path: root.join(format!("{}_{}{}", info.name, id, storage.extension)),
            metadata: metadata.clone(),
        };
        tasks.push(async move {
            let operation = format!("{} measurement", request.instrument);
            within(limit, &operation, async {
                entry
                    .procedure
                    .run(Arc::clone(&entry.adapter), &request)
                    .await
                    .map_err(|e| SequencerError::Measurement(format!("{:#}", e)))
            })
            .await
            .map_err(|e| format!("{}: {}", request.instrument, e))
        });
    }

    let total = tasks.len();
    let failures: Vec<String> = match context.settings().machine.measuring_failure_policy {
        FailurePolicy::CompleteSiblings => join_all(tasks)
            .await
            .into_iter()
            .filter_map(Result::err)
            .collect(),
        FailurePolicy::StopRemaining => match try_join_all(tasks).await {
            Ok(_) => Vec::new(),
            Err(failure) => vec![failure],
        },
    };

    if failures.is_empty() {
        info!(
            sequence = %info.name,
            step = cursor.sequence_index,
            measurements = total,
            "Measurements complete"
        );
        return Ok(());
    }
    for failure in &failures {
        error!(failure = %failure, "Measurement failed");
    }
    Err(SequencerError::Measurement(format!(
        "{} of {} measurements failed: {}",
        failures.len(),
        total,
        failures.join("; ")
    )))
}
