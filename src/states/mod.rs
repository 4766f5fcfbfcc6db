//! The states of the spectral-calibration rig.
//!
//! Root machine: `initializing -> waiting -> {manual | auto} -> waiting`, with every
//! failure routed to `troubleshooting`. `auto` embeds the control-loop machine
//! `moving -> measuring -> indexing -> {moving | done}`.

pub mod auto;
pub mod initializing;
pub mod manual;
pub mod troubleshooting;
pub mod waiting;

use crate::config::MachineConfig;
use crate::core::{InstrumentAdapter, ParameterMap, Selector};
use crate::error::{AppResult, SequencerError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Root state opening instruments.
pub const INITIALIZING: &str = "initializing";
/// Root idle state.
pub const WAITING: &str = "waiting";
/// Root state applying manual commands.
pub const MANUAL: &str = "manual";
/// Root state running the control loop.
pub const AUTO: &str = "auto";
/// Root state reporting faults.
pub const TROUBLESHOOTING: &str = "troubleshooting";

/// Nested state commanding instruments.
pub const MOVING: &str = "moving";
/// Nested state taking measurements.
pub const MEASURING: &str = "measuring";
/// Nested state advancing the cursor.
pub const INDEXING: &str = "indexing";
/// Nested terminal state.
pub const DONE: &str = "done";

/// `Mode` store values Waiting dispatches on.
pub const MODE_AUTO: &str = "auto";
/// Request for the Manual state.
pub const MODE_MANUAL: &str = "manual";

fn instrument_error(instrument: &str, error: anyhow::Error) -> SequencerError {
    SequencerError::instrument(instrument, format!("{:#}", error))
}

/// Await one hardware call, bounded by the opt-in `limit`. `None` waits indefinitely.
pub(crate) async fn within<T, F>(limit: Option<Duration>, operation: &str, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    let Some(limit) = limit else {
        return call.await;
    };
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            let timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
            warn!(operation, timeout_ms, "Hardware call timed out");
            Err(SequencerError::Timeout {
                operation: operation.to_string(),
                timeout_ms,
            })
        }
    }
}

/// Read every parameter of an instrument.
pub(crate) async fn read_instrument(
    instrument: &str,
    adapter: &dyn InstrumentAdapter,
    limit: Option<Duration>,
) -> AppResult<ParameterMap> {
    within(limit, &format!("{} read", instrument), async {
        adapter
            .get_parameters(&Selector::All)
            .await
            .map_err(|e| instrument_error(instrument, e))
    })
    .await
}

/// Bring an instrument to `target` and confirm it got there.
///
/// Fields already at their target value are left out of the write. Returns the
/// instrument's full parameter map as read back after the write. Each adapter call
/// is bounded by `machine.action_timeout_ms` when set.
pub(crate) async fn command_instrument(
    instrument: &str,
    adapter: &dyn InstrumentAdapter,
    target: &ParameterMap,
    machine: &MachineConfig,
) -> AppResult<ParameterMap> {
    let limit = machine.action_timeout();
    let tolerance = machine.verify_tolerance;
    let current = read_instrument(instrument, adapter, limit).await?;

    let changes: ParameterMap = target
        .iter()
        .filter(|(name, value)| {
            current
                .get(*name)
                .map_or(true, |now| !value.matches(now, tolerance))
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    if changes.is_empty() {
        debug!(instrument, "Already in position");
        return Ok(current);
    }

    debug!(instrument, ?changes, "Commanding");
    within(limit, &format!("{} write", instrument), async {
        adapter
            .set_parameters(&changes)
            .await
            .map_err(|e| instrument_error(instrument, e))
    })
    .await?;

    let confirmed = read_instrument(instrument, adapter, limit).await?;

    for (name, commanded) in &changes {
        match confirmed.get(name) {
            Some(actual) if commanded.matches(actual, tolerance) => {}
            actual => {
                return Err(SequencerError::VerifyMismatch {
                    instrument: instrument.to_string(),
                    parameter: name.clone(),
                    commanded: commanded.to_string(),
                    actual: actual.map_or_else(|| "<missing>".to_string(), ToString::to_string),
                })
            }
        }
    }
    Ok(confirmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{parameters, ParameterValue};
    use crate::instrument::mock::MockInstrument;

    #[tokio::test]
    async fn test_matching_fields_are_not_written() {
        let mono = MockInstrument::new("cs260")
            .with_parameters(parameters([("wavelength", 0.7), ("grating", 1.0)]));
        let target = parameters([
            ("wavelength", ParameterValue::Float(0.8)),
            ("grating", ParameterValue::Int(1)),
        ]);

        let confirmed = command_instrument("cs260", &mono, &target, &MachineConfig::default())
            .await
            .unwrap();
        assert_eq!(confirmed["wavelength"], ParameterValue::Float(0.8));
        assert_eq!(mono.set_calls(), vec![parameters([("wavelength", 0.8)])]);
    }

    #[tokio::test]
    async fn test_no_write_when_in_position() {
        let ndf = MockInstrument::new("ndf").with_parameters(parameters([("position", 2i64)]));
        command_instrument("ndf", &ndf, &parameters([("position", 2i64)]), &MachineConfig::default())
            .await
            .unwrap();
        assert!(ndf.set_calls().is_empty());
    }

    #[tokio::test]
    async fn test_read_back_mismatch() {
        let ndf = MockInstrument::new("ndf").with_parameters(parameters([("position", 1i64)]));
        ndf.stick("position");
        let err = command_instrument("ndf", &ndf, &parameters([("position", 3i64)]), &MachineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::VerifyMismatch { .. }));
        assert!(!err.is_fatal());
    }

    #[tokio::test]
    async fn test_slow_write_times_out_when_limited() {
        let ndf = MockInstrument::new("ndf").with_parameters(parameters([("position", 1i64)]));
        let machine = MachineConfig {
            action_timeout_ms: Some(50),
            ..MachineConfig::default()
        };
        ndf.set_latency(200);
        let err = command_instrument("ndf", &ndf, &parameters([("position", 3i64)]), &machine)
            .await
            .unwrap_err();
        assert!(matches!(err, SequencerError::Timeout { ref operation, .. } if operation == "ndf read"));
        assert!(!err.is_fatal());

        // Unlimited by default: the same slow instrument gets there.
        command_instrument("ndf", &ndf, &parameters([("position", 3i64)]), &MachineConfig::default())
            .await
            .unwrap();
    }
}
