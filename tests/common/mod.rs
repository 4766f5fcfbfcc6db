//! Shared bench for the integration tests: three mock instruments and a rig around them.
#![allow(dead_code)]

use spectral_daq::config::Settings;
use spectral_daq::core::{parameters, ParameterValue};
use spectral_daq::instrument::mock::MockInstrument;
use spectral_daq::instrument::InstrumentRegistry;
use spectral_daq::measurement::SamplingProcedure;
use spectral_daq::sequencer::{
    Context, ControlHandle, MeasureSpec, Report, RunControl, RunOutcome, SequenceSpec,
    SubsystemSpec,
};
use spectral_daq::error::AppResult;
use spectral_daq::spectral::Rig;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

/// Monochromator, lock-in and filter wheel, registered in that order.
pub struct Bench {
    pub cs260: MockInstrument,
    pub lockin: MockInstrument,
    pub ndf: MockInstrument,
}

impl Bench {
    pub fn new() -> Self {
        Self {
            cs260: MockInstrument::new("cs260").with_parameters(parameters([
                ("wavelength", ParameterValue::from(0.4)),
                ("grating", ParameterValue::from(1i64)),
                ("filter", ParameterValue::from(1i64)),
                ("shutter", ParameterValue::from("closed")),
            ])),
            lockin: MockInstrument::new("lockin")
                .with_parameters(parameters([
                    ("sensitivity", ParameterValue::from(0.5)),
                    ("time_constant", ParameterValue::from(0.1)),
                ]))
                .with_readout(["signal"]),
            ndf: MockInstrument::new("ndf")
                .with_parameters(parameters([("position", ParameterValue::from(1i64))])),
        }
    }

    pub fn registry(&self) -> InstrumentRegistry {
        let mut registry = InstrumentRegistry::new();
        registry.register(Arc::new(self.cs260.clone())).unwrap();
        registry
            .register_with(
                Arc::new(self.lockin.clone()),
                Arc::new(SamplingProcedure::new(vec!["signal".to_string()])),
            )
            .unwrap();
        registry.register(Arc::new(self.ndf.clone())).unwrap();
        registry
    }
}

pub fn settings(storage: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.storage.root = storage.to_path_buf();
    settings
}

/// Sweep `start..=stop` on the monochromator, track sensitivity on the lock-in, hold
/// the filter wheel at position 2, and measure the lock-in at every step.
pub fn sweep_sequence(name: &str, start: f64, stop: f64) -> SequenceSpec {
    let mut subsystems = BTreeMap::new();
    subsystems.insert(
        "cs260".to_string(),
        SubsystemSpec::Sweep {
            start,
            stop,
            step: 0.1,
            grating_breakpoints: None,
            filter_breakpoints: None,
            shutter: None,
            fixed: Default::default(),
        },
    );
    subsystems.insert(
        "lockin".to_string(),
        SubsystemSpec::Dependent {
            parameter: "sensitivity".to_string(),
            default: Some(1.0),
            transitions: vec![(0.65, 2.0).into()],
            fixed: parameters([("sample_rate", ParameterValue::from(100.0))]),
        },
    );
    subsystems.insert(
        "ndf".to_string(),
        SubsystemSpec::Fixed {
            parameters: parameters([("position", ParameterValue::from(2i64))]),
        },
    );
    SequenceSpec {
        name: name.to_string(),
        subsystems,
        measure: MeasureSpec {
            sample_time: 0.05,
            instruments: vec!["lockin".to_string()],
            ..Default::default()
        },
    }
}

/// Start the root machine on a background task.
pub fn start(rig: Rig) -> (Running, broadcast::Receiver<Report>) {
    let reports = rig.handle.subscribe();
    let control = RunControl::new();
    let machine = rig.machine;
    let states = machine.watch_state();
    let task = tokio::spawn({
        let control = control.clone();
        async move { machine.run(control).await }
    });
    let running = Running {
        handle: rig.handle,
        context: rig.context,
        control,
        states,
        task,
    };
    (running, reports)
}

pub struct Running {
    pub handle: ControlHandle,
    pub context: Arc<Context>,
    pub control: RunControl,
    pub states: watch::Receiver<Option<String>>,
    pub task: JoinHandle<AppResult<RunOutcome>>,
}

impl Running {
    /// Cancel the machine and collect how it ended.
    pub async fn shutdown(self) -> RunOutcome {
        self.control.cancel();
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("machine did not stop")
            .expect("machine task panicked")
            .expect("machine failed")
    }

    /// Wait for the machine to end on its own.
    pub async fn finished(self) -> AppResult<RunOutcome> {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("machine did not stop")
            .expect("machine task panicked")
    }
}

/// Wait for the first report matching `pred`, skipping the rest.
pub async fn wait_for<F>(reports: &mut broadcast::Receiver<Report>, pred: F) -> Report
where
    F: Fn(&Report) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match reports.recv().await {
                Ok(report) if pred(&report) => return report,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("report channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for report")
}

/// Wait until the machine reports being in `state`.
pub async fn wait_for_state(
    states: &mut watch::Receiver<Option<String>>,
    state: &str,
) {
    tokio::time::timeout(WAIT, states.wait_for(|s| s.as_deref() == Some(state)))
        .await
        .expect("timed out waiting for state")
        .expect("machine dropped");
}
