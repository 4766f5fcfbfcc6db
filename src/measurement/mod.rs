//! Measurement procedures run by the Measuring and Manual states.
//!
//! A procedure receives an adapter and a [`MeasurementRequest`] and is expected to
//! sample the instrument for the requested duration and persist what it saw. The
//! default [`SamplingProcedure`] polls readout parameters at a fixed rate and appends
//! the samples to a CSV file.

use crate::core::{InstrumentAdapter, ParameterMap, Selector};
use crate::metadata::MetadataMap;
use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// One measurement to take.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRequest {
    /// Instrument identifier
    pub instrument: String,
    /// Samples per second
    pub sample_rate: f64,
    /// How long to sample
    pub duration: Duration,
    /// Output file
    pub path: PathBuf,
    /// Rig settings the samples were taken under
    pub metadata: MetadataMap,
}

/// What a procedure produced.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementReport {
    /// File the samples were appended to
    pub path: PathBuf,
    /// Number of samples taken
    pub samples: usize,
}

/// A timestamped readout.
#[derive(Debug, Clone)]
pub struct Sample {
    /// When the readout was taken
    pub timestamp: DateTime<Utc>,
    /// Readout parameter values
    pub readings: ParameterMap,
}

/// Samples an instrument and persists the result.
#[async_trait]
pub trait MeasurementProcedure: Send + Sync {
    async fn run(
        &self,
        adapter: Arc<dyn InstrumentAdapter>,
        request: &MeasurementRequest,
    ) -> Result<MeasurementReport>;
}

/// Polls `readout` at the requested rate and appends rows to a CSV file.
#[derive(Debug, Clone)]
pub struct SamplingProcedure {
    readout: Selector,
}

impl Default for SamplingProcedure {
    fn default() -> Self {
        Self {
            readout: Selector::All,
        }
    }
}

impl SamplingProcedure {
    /// Sample only `names`; an empty list samples every parameter.
    pub fn new(names: Vec<String>) -> Self {
        let readout = if names.is_empty() {
            Selector::All
        } else {
            Selector::Keys(names)
        };
        Self { readout }
    }

    /// Number of samples a request yields. Always at least one.
    pub fn sample_count(request: &MeasurementRequest) -> usize {
        let count = (request.sample_rate * request.duration.as_secs_f64()).round();
        if count.is_finite() && count >= 1.0 {
            count as usize
        } else {
            1
        }
    }
}

#[async_trait]
impl MeasurementProcedure for SamplingProcedure {
    async fn run(
        &self,
        adapter: Arc<dyn InstrumentAdapter>,
        request: &MeasurementRequest,
    ) -> Result<MeasurementReport> {
        if !(request.sample_rate.is_finite() && request.sample_rate > 0.0) {
            bail!(
                "Invalid sample rate {} for '{}'",
                request.sample_rate,
                request.instrument
            );
        }

        let count = Self::sample_count(request);
        let period = Duration::from_secs_f64(1.0 / request.sample_rate).max(Duration::from_micros(1));
        let mut ticker = tokio::time::interval(period);
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            ticker.tick().await;
            let readings = adapter
                .get_parameters(&self.readout)
                .await
                .with_context(|| format!("Failed to sample '{}'", request.instrument))?;
            samples.push(Sample {
                timestamp: Utc::now(),
                readings,
            });
        }

        write_samples(request, &samples)?;
        debug!(
            instrument = %request.instrument,
            path = %request.path.display(),
            samples = samples.len(),
            "Measurement written"
        );
        Ok(MeasurementReport {
            path: request.path.clone(),
            samples: samples.len(),
        })
    }
}

// =============================================================================
// CSV Output
// =============================================================================

#[cfg(feature = "storage_csv")]
mod csv_enabled {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use std::path::Path;

    /// Append `samples` to the request's file, writing the metadata block and header
    /// first when the file is new.
    pub fn write_samples(request: &MeasurementRequest, samples: &[Sample]) -> Result<()> {
        if let Some(parent) = request.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create storage directory at {:?}", parent)
                })?;
            }
        }

        let reading_names: Vec<String> = samples
            .first()
            .map(|s| s.readings.keys().cloned().collect())
            .unwrap_or_default();
        let mut header = vec!["timestamp".to_string()];
        header.extend(request.metadata.iter().map(|(k, _)| k.clone()));
        header.extend(reading_names.iter().cloned());

        let is_new = std::fs::metadata(&request.path).map_or(true, |m| m.len() == 0);
        if !is_new {
            let existing = existing_header(&request.path)?;
            if existing != header {
                bail!(
                    "CSV columns of {:?} do not match this measurement: file has [{}], samples have [{}]",
                    request.path,
                    existing.join(", "),
                    header.join(", ")
                );
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&request.path)
            .with_context(|| format!("Failed to open CSV file at {:?}", request.path))?;

        if is_new {
            for (key, value) in request.metadata.iter() {
                writeln!(file, "# {}: {}", key, value)
                    .context("Failed to write metadata to CSV file")?;
            }
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if is_new {
            writer
                .write_record(&header)
                .context("Failed to write CSV header")?;
        }

        for sample in samples {
            let mut row = vec![sample.timestamp.to_rfc3339()];
            row.extend(request.metadata.iter().map(|(_, v)| v.to_string()));
            row.extend(reading_names.iter().map(|name| {
                sample
                    .readings
                    .get(name)
                    .map(ToString::to_string)
                    .unwrap_or_default()
            }));
            writer
                .write_record(&row)
                .context("Failed to write sample to CSV file")?;
        }
        writer.flush().context("Failed to flush CSV writer")?;
        Ok(())
    }

    /// The first non-comment record of an existing file.
    fn existing_header(path: &Path) -> Result<Vec<String>> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .comment(Some(b'#'))
            .from_path(path)
            .with_context(|| format!("Failed to read CSV file at {:?}", path))?;
        match reader.records().next() {
            Some(record) => {
                let record = record.with_context(|| format!("Failed to read CSV header of {:?}", path))?;
                Ok(record.iter().map(str::to_string).collect())
            }
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(not(feature = "storage_csv"))]
mod csv_disabled {
    use super::*;
    use crate::error::SequencerError;

    pub fn write_samples(_request: &MeasurementRequest, _samples: &[Sample]) -> Result<()> {
        Err(SequencerError::FeatureNotEnabled("storage_csv".to_string()).into())
    }
}

#[cfg(feature = "storage_csv")]
use csv_enabled::write_samples;

#[cfg(not(feature = "storage_csv"))]
use csv_disabled::write_samples;

#[cfg(all(test, feature = "storage_csv"))]
mod tests {
    use super::*;
    use crate::core::parameters;
    use crate::instrument::mock::MockInstrument;

    fn request(path: PathBuf) -> MeasurementRequest {
        let mut metadata = MetadataMap::new();
        metadata.fold("cs260", &parameters([("wavelength", 0.7)]));
        MeasurementRequest {
            instrument: "lockin".into(),
            sample_rate: 100.0,
            duration: Duration::from_millis(30),
            path,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_sampling_writes_metadata_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visible_lockin.csv");
        let lockin: Arc<dyn InstrumentAdapter> =
            Arc::new(MockInstrument::new("lockin").with_readout(["signal"]));

        let procedure = SamplingProcedure::new(vec!["signal".into()]);
        let report = procedure.run(lockin, &request(path.clone())).await.unwrap();
        assert_eq!(report.samples, 3);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "# cs260 WAVELENGTH: 0.7");
        assert_eq!(lines[1], "timestamp,cs260 WAVELENGTH,signal");
        assert_eq!(lines.len(), 2 + 3);
    }

    #[tokio::test]
    async fn test_repeated_steps_append() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("seq_lockin.csv");
        let lockin: Arc<dyn InstrumentAdapter> =
            Arc::new(MockInstrument::new("lockin").with_readout(["signal"]));
        let procedure = SamplingProcedure::new(vec![]);

        procedure.run(lockin.clone(), &request(path.clone())).await.unwrap();
        procedure.run(lockin, &request(path.clone())).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("timestamp")).count(), 1);
        assert_eq!(text.lines().count(), 2 + 6);
    }

    #[tokio::test]
    async fn test_append_with_different_columns_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("visible_lockin.csv");
        let lockin: Arc<dyn InstrumentAdapter> =
            Arc::new(MockInstrument::new("lockin").with_readout(["signal"]));
        let procedure = SamplingProcedure::new(vec!["signal".into()]);
        procedure.run(lockin.clone(), &request(path.clone())).await.unwrap();

        // Same file, but the rig now also reports the filter wheel.
        let mut other = request(path.clone());
        other.metadata.fold("ndf", &parameters([("position", 2i64)]));
        let err = procedure.run(lockin, &other).await.unwrap_err();
        assert!(err.to_string().contains("do not match"), "{}", err);

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2 + 3);
    }

    #[tokio::test]
    async fn test_rejects_zero_rate() {
        let dir = tempfile::tempdir().unwrap();
        let mut req = request(dir.path().join("x.csv"));
        req.sample_rate = 0.0;
        let lockin: Arc<dyn InstrumentAdapter> = Arc::new(MockInstrument::new("lockin"));
        assert!(SamplingProcedure::default().run(lockin, &req).await.is_err());
    }
}
