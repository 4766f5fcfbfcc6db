//! Manual commands: settings applied, one-shot measurements taken, nothing replayed.

mod common;

use common::{start, wait_for, wait_for_state, Bench};
use spectral_daq::core::{parameters, ParameterValue};
use spectral_daq::sequencer::control_loop::{ManualInstrumentCommand, ManualMeasurement};
use spectral_daq::sequencer::{ManualCommand, Payload, Report};
use spectral_daq::spectral::Rig;
use spectral_daq::states;
use tempfile::tempdir;

#[tokio::test]
async fn test_manual_command_applies_and_measures() {
    let dir = tempdir().unwrap();
    let bench = Bench::new();
    let rig = Rig::build(common::settings(dir.path()), bench.registry()).unwrap();
    let (mut running, mut reports) = start(rig);

    let file = dir.path().join("manual").join("dark.csv");
    let mut command = ManualCommand::new();
    command.insert(
        "cs260".to_string(),
        ManualInstrumentCommand {
            settings: parameters([("shutter", ParameterValue::from("closed"))]),
            measurement: None,
        },
    );
    command.insert(
        "lockin".to_string(),
        ManualInstrumentCommand {
            settings: parameters([("sensitivity", ParameterValue::from(2.0))]),
            measurement: Some(ManualMeasurement {
                sample_rate: 50.0,
                duration: 0.1,
                file: file.clone(),
            }),
        },
    );

    running.handle.submit(Payload::Manual(command)).await.unwrap();
    wait_for(&mut reports, |r| matches!(r, Report::ManualComplete)).await;
    wait_for_state(&mut running.states, states::WAITING).await;

    // Already closed: no write. Sensitivity changed: one write.
    assert!(bench.cs260.set_calls().is_empty());
    assert_eq!(
        bench.lockin.set_calls(),
        vec![parameters([("sensitivity", ParameterValue::from(2.0))])]
    );

    let text = std::fs::read_to_string(&file).unwrap();
    assert!(text.contains("# lockin SENSITIVITY: 2"));
    assert_eq!(text.lines().filter(|l| !l.starts_with('#')).count(), 6);

    // Back in Waiting with the command consumed.
    let control = running.context.store().value("Control").unwrap();
    assert!(control.get("Manual").is_none());
    running.shutdown().await;
}

#[tokio::test]
async fn test_manual_command_for_unknown_instrument_faults() {
    let dir = tempdir().unwrap();
    let bench = Bench::new();
    let rig = Rig::build(common::settings(dir.path()), bench.registry()).unwrap();
    let (running, mut reports) = start(rig);

    let mut command = ManualCommand::new();
    command.insert("laser".to_string(), ManualInstrumentCommand::default());
    running.handle.submit(Payload::Manual(command)).await.unwrap();

    let fault = wait_for(&mut reports, |r| matches!(r, Report::Fault { .. })).await;
    assert!(matches!(
        fault,
        Report::Fault { ref state, ref message } if state == states::MANUAL && message.contains("laser")
    ));
    running.finished().await.unwrap();
}

#[tokio::test]
async fn test_manual_metadata_records_the_read_back() {
    let dir = tempdir().unwrap();
    let bench = Bench::new();
    let rig = Rig::build(common::settings(dir.path()), bench.registry()).unwrap();
    let (running, mut reports) = start(rig);

    // Within tolerance of the current 0.5: nothing is written and 0.5 is what the
    // lock-in actually holds.
    let file = dir.path().join("manual").join("settled.csv");
    let mut command = ManualCommand::new();
    command.insert(
        "lockin".to_string(),
        ManualInstrumentCommand {
            settings: parameters([("sensitivity", ParameterValue::from(0.5000000001))]),
            measurement: Some(ManualMeasurement {
                sample_rate: 50.0,
                duration: 0.05,
                file: file.clone(),
            }),
        },
    );
    running.handle.submit(Payload::Manual(command)).await.unwrap();
    wait_for(&mut reports, |r| matches!(r, Report::ManualComplete)).await;

    assert!(bench.lockin.set_calls().is_empty());
    let text = std::fs::read_to_string(&file).unwrap();
    assert!(text.lines().any(|l| l == "# lockin SENSITIVITY: 0.5"), "{}", text);
    assert!(!text.contains("0.5000000001"));
    running.shutdown().await;
}
