//! Troubleshooting: the sink for action failures.
//!
//! Publishes the recorded fault and stops. There are no outgoing transitions and no
//! automatic recovery; the root machine's `run` returns `Halted`.

use crate::sequencer::machine::Fault;
use crate::sequencer::store::keys::FAULT;
use crate::sequencer::{Action, ActionArgs, ActionResult, Context, Report, State};
use std::sync::Arc;
use tracing::error;

/// The Troubleshooting state.
pub fn state(context: &Arc<Context>) -> State {
    let context = Arc::clone(context);
    State::new(super::TROUBLESHOOTING)
        .hold_on_complete()
        .action(
            Action::sync("report_fault", &[FAULT], move |args| report_fault(&context, args))
                .without_error_flag(),
        )
}

fn report_fault(context: &Context, args: ActionArgs) -> ActionResult {
    let fault: Fault = args.require_as(FAULT)?;
    error!(state = %fault.state, message = %fault.message, "Rig halted; operator attention required");
    context.publisher().send(Report::Fault {
        state: fault.state,
        message: fault.message,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::instrument::InstrumentRegistry;
    use crate::sequencer::{RunControl, RunOutcome, StateMachineCore};
    use tracing_test::traced_test;

    #[traced_test]
    #[tokio::test]
    async fn test_fault_is_published_and_logged() {
        let (context, _handle) = Context::new(Settings::default(), InstrumentRegistry::new());
        let fault = Fault {
            machine: "spectral".into(),
            state: "auto".into(),
            message: "lockin: no signal".into(),
        };
        context.store().set_as(FAULT, &fault).unwrap();
        let mut reports = context.publisher().subscribe();

        let machine = StateMachineCore::new("m", Arc::clone(&context))
            .unwrap()
            .with_state(state(&context).initial())
            .unwrap();
        let outcome = machine.run(RunControl::new()).await.unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(
            reports.try_recv().unwrap(),
            Report::Fault {
                state: "auto".into(),
                message: "lockin: no signal".into(),
            }
        );
        assert!(logs_contain("operator attention required"));
    }
}
