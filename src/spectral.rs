//! Assembly of the spectral-calibration rig.

use crate::config::Settings;
use crate::error::AppResult;
use crate::instrument::InstrumentRegistry;
use crate::sequencer::{ControlHandle, Context, StateMachineCore};
use crate::states;
use std::sync::Arc;

/// Name of the root machine.
pub const SPECTRAL_MACHINE: &str = "spectral";

/// Build the root machine on `context`.
pub fn spectral_machine(context: &Arc<Context>) -> AppResult<StateMachineCore> {
    StateMachineCore::new(SPECTRAL_MACHINE, Arc::clone(context))?
        .with_state(states::initializing::state(context))?
        .with_state(states::waiting::state(context))?
        .with_state(states::manual::state(context))?
        .with_state(states::auto::state(context))?
        .with_state(states::troubleshooting::state(context))
}

/// A ready-to-run rig: the root machine, the handle driving it, and their context.
pub struct Rig {
    /// Root machine
    pub machine: StateMachineCore,
    /// Handle for signals, payloads and reports
    pub handle: ControlHandle,
    /// Shared context
    pub context: Arc<Context>,
}

impl Rig {
    /// Validate the settings and wire the root machine.
    pub fn build(settings: Settings, instruments: InstrumentRegistry) -> AppResult<Self> {
        settings.validate()?;
        let (context, handle) = Context::new(settings, instruments);
        let machine = spectral_machine(&context)?;
        machine.validate()?;
        Ok(Self {
            machine,
            handle,
            context,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SequencerError;

    #[test]
    fn test_root_machine_layout() {
        let rig = Rig::build(Settings::default(), InstrumentRegistry::new()).unwrap();
        assert_eq!(rig.machine.initial_state(), Some(states::INITIALIZING));
        assert_eq!(rig.machine.idle_state(), Some(states::WAITING));
        assert_eq!(
            rig.machine.dispatch(states::AUTO, "error").unwrap(),
            states::TROUBLESHOOTING
        );
        assert_eq!(
            rig.machine.dispatch(states::MANUAL, "manual_to_waiting").unwrap(),
            states::WAITING
        );
        assert!(matches!(
            rig.machine.dispatch(states::TROUBLESHOOTING, "error"),
            Err(SequencerError::UnknownEvent { .. })
        ));
    }

    #[test]
    fn test_second_root_machine_is_rejected() {
        let rig = Rig::build(Settings::default(), InstrumentRegistry::new()).unwrap();
        assert!(matches!(
            spectral_machine(&rig.context),
            Err(SequencerError::ContextInUse(_))
        ));
    }

    #[test]
    fn test_nested_machine_layout() {
        let rig = Rig::build(Settings::default(), InstrumentRegistry::new()).unwrap();
        let nested = states::auto::control_loop_machine(&rig.context).unwrap();
        nested.validate().unwrap();
        assert_eq!(nested.initial_state(), Some(states::MOVING));
        assert_eq!(
            nested.dispatch(states::INDEXING, "indexing_to_done").unwrap(),
            states::DONE
        );
    }
}
