//! The shipped settings and sequence files load and expand cleanly.

use spectral_daq::config::Settings;
use spectral_daq::core::ParameterValue;
use spectral_daq::instrument::InstrumentRegistry;
use spectral_daq::sequence_file::{load_series, save, SequenceFile};
use spectral_daq::sequencer::expand_series;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn repo_path(relative: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join(relative)
}

#[test]
fn test_shipped_series_expands() {
    let settings = Settings::load(Some(&repo_path("config/spectral.toml"))).unwrap();
    let series = load_series(&repo_path("sequences")).unwrap();
    let names: Vec<_> = series.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["visible", "near_ir"]);

    let control_loop = expand_series(&series, &settings.expander).unwrap();
    assert_eq!(control_loop.series_len(), 2);
    assert_eq!(control_loop.sequence_len(0), 7);
    assert_eq!(control_loop.sequence_len(1), 8);

    // The power meter only takes part in the first sequence.
    assert_eq!(control_loop.steps["power"][1].len(), 0);
    assert_eq!(
        control_loop.step("ndf", 0, 6).unwrap()["position"],
        ParameterValue::Int(2)
    );
    assert_eq!(
        control_loop.step("cs260", 1, 7).unwrap()["grating"],
        ParameterValue::Int(2)
    );

    // Every instrument the series names is configured.
    let registry = InstrumentRegistry::simulated(&settings.instruments).unwrap();
    for instrument in control_loop.steps.keys() {
        assert!(registry.get(instrument).is_some(), "{}", instrument);
    }
}

#[test]
fn test_saved_series_reloads_identically() {
    let series = load_series(&repo_path("sequences")).unwrap();
    let dir = tempdir().unwrap();
    for (index, spec) in series.iter().enumerate() {
        save(&dir.path().join(format!("{:02}.seq", index)), spec).unwrap();
    }
    assert_eq!(load_series(dir.path()).unwrap(), series);

    let text = std::fs::read_to_string(dir.path().join("00.seq")).unwrap();
    assert_eq!(SequenceFile::parse(&text).unwrap().render(), text);
}
