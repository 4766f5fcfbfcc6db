//! Pause, resume and abort delivered while the nested control loop is running.

mod common;

use common::{start, sweep_sequence, wait_for, wait_for_state, Bench};
use spectral_daq::core::{ParameterValue, Selector};
use spectral_daq::instrument::mock::MockCall;
use spectral_daq::sequencer::store::keys;
use spectral_daq::sequencer::{Payload, Report};
use spectral_daq::spectral::Rig;
use spectral_daq::states;
use std::time::Duration;
use tempfile::tempdir;

fn moved_to(report: &Report, instrument: &str, wavelength: f64) -> bool {
    match report {
        Report::Parameters {
            instrument: id,
            parameters,
        } => {
            id == instrument
                && parameters.get("wavelength").and_then(ParameterValue::as_f64)
                    == Some(wavelength)
        }
        _ => false,
    }
}

fn signal_reads(calls: &[MockCall]) -> usize {
    calls
        .iter()
        .filter(|call| matches!(call, MockCall::Get(Selector::Keys(keys)) if keys == &["signal"]))
        .count()
}

#[tokio::test]
async fn test_abort_mid_move_returns_to_waiting() {
    let dir = tempdir().unwrap();
    let bench = Bench::new();
    let rig = Rig::build(common::settings(dir.path()), bench.registry()).unwrap();
    let (mut running, mut reports) = start(rig);
    wait_for_state(&mut running.states, states::WAITING).await;

    // The filter wheel is the last instrument moved; slow it so the abort lands
    // while its write is still in flight.
    let ndf = bench.ndf.clone().with_latency(300);
    running
        .handle
        .submit(Payload::Series(vec![sweep_sequence("visible", 0.5, 0.7)]))
        .await
        .unwrap();
    wait_for(&mut reports, |r| moved_to(r, "cs260", 0.5)).await;
    wait_for_state(&mut running.states, states::AUTO).await;

    running.handle.abort().await.unwrap();
    wait_for_state(&mut running.states, states::WAITING).await;

    // The interrupted write never landed and nothing ran after it.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(ndf.set_calls().is_empty());
    assert_eq!(signal_reads(&bench.lockin.call_log()), 0);
    assert!(!running.context.store().contains(keys::FAULT));
    assert_eq!(running.handle.latest()["ndf"]["position"], ParameterValue::Int(1));

    // Still usable afterwards.
    ndf.with_latency(0);
    running
        .handle
        .submit(Payload::Series(vec![sweep_sequence("retry", 0.5, 0.5)]))
        .await
        .unwrap();
    let done = wait_for(&mut reports, |r| matches!(r, Report::SeriesComplete { .. })).await;
    assert_eq!(done, Report::SeriesComplete { sequences: 1 });
    running.shutdown().await;
}

#[tokio::test]
async fn test_pause_holds_the_next_nested_transition() {
    let dir = tempdir().unwrap();
    let bench = Bench::new();
    bench.ndf.clone().with_latency(200);
    let rig = Rig::build(common::settings(dir.path()), bench.registry()).unwrap();
    let (running, mut reports) = start(rig);

    running
        .handle
        .submit(Payload::Series(vec![sweep_sequence("visible", 0.5, 0.6)]))
        .await
        .unwrap();
    wait_for(&mut reports, |r| moved_to(r, "cs260", 0.5)).await;
    running.handle.pause().await.unwrap();

    // Moving finishes the filter wheel, but Measuring does not start.
    wait_for(&mut reports, |r| {
        matches!(r, Report::Parameters { instrument, .. } if instrument == "ndf")
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(signal_reads(&bench.lockin.call_log()), 0);
    assert_eq!(running.handle.latest()["ndf"]["position"], ParameterValue::Int(2));

    running.handle.resume().await.unwrap();
    let done = wait_for(&mut reports, |r| matches!(r, Report::SeriesComplete { .. })).await;
    assert_eq!(done, Report::SeriesComplete { sequences: 1 });
    assert!(signal_reads(&bench.lockin.call_log()) > 0);
    running.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_from_waiting_is_never_a_fault() {
    for _ in 0..50 {
        let dir = tempdir().unwrap();
        let bench = Bench::new();
        let rig = Rig::build(common::settings(dir.path()), bench.registry()).unwrap();
        let (mut running, _reports) = start(rig);
        wait_for_state(&mut running.states, states::WAITING).await;

        let context = std::sync::Arc::clone(&running.context);
        let outcome = running.shutdown().await;
        assert_eq!(
            outcome,
            spectral_daq::sequencer::RunOutcome::Aborted {
                state: states::WAITING.to_string()
            }
        );
        assert!(!context.store().contains(keys::FAULT));
    }
}
