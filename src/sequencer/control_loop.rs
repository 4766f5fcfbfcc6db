//! The expanded control loop and the cursor that walks it.
//!
//! ```text
//! ControlLoop.steps:  instrument -> [Sequence; series length]
//! Sequence:           [Step; sweep length]
//! Step:               parameter -> value
//! ```
//!
//! An instrument that does not take part in a sequence holds an empty step list at
//! that series index. Every participating instrument's step list for one sequence has
//! the same length.

use crate::core::ParameterMap;
use crate::error::ExpansionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// One index's worth of settings for one instrument.
pub type Step = ParameterMap;

/// All steps of one instrument in one sequence.
pub type Sequence = Vec<Step>;

/// How and where to measure during a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasureSpec {
    /// Seconds sampled per step
    pub sample_time: f64,
    /// Samples per second, unless the instrument's step carries `sample_rate`
    pub sample_rate: f64,
    /// Output directory; the configured storage root when unset
    pub storage_root: Option<PathBuf>,
    /// Instruments measured at every step
    pub instruments: Vec<String>,
}

impl Default for MeasureSpec {
    fn default() -> Self {
        Self {
            sample_time: 1.0,
            sample_rate: 10.0,
            storage_root: None,
            instruments: Vec::new(),
        }
    }
}

/// Per-sequence information carried alongside the steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceInfo {
    /// Sequence name, used to name measurement files
    pub name: String,
    /// What to measure at every step
    pub measure: MeasureSpec,
}

/// Fully expanded `instrument -> sequence -> step` structure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlLoop {
    /// Steps keyed by instrument, then sequence
    pub steps: BTreeMap<String, Vec<Sequence>>,
    /// Per-sequence information, in series order
    pub sequences: Vec<SequenceInfo>,
}

impl ControlLoop {
    /// Number of sequences in the series.
    pub fn series_len(&self) -> usize {
        self.sequences.len()
    }

    /// Number of steps in the sequence at `series_index`.
    pub fn sequence_len(&self, series_index: usize) -> usize {
        self.steps
            .values()
            .filter_map(|sequences| sequences.get(series_index))
            .map(Vec::len)
            .max()
            .unwrap_or(0)
    }

    /// Step `step_index` of sequence `series_index` for `instrument`.
    pub fn step(&self, instrument: &str, series_index: usize, step_index: usize) -> Option<&Step> {
        self.steps
            .get(instrument)?
            .get(series_index)?
            .get(step_index)
    }

    /// Instruments with steps in the sequence at `series_index`.
    pub fn participants(&self, series_index: usize) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|(_, sequences)| sequences.get(series_index).map_or(false, |s| !s.is_empty()))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Information for the sequence at `series_index`.
    pub fn info(&self, series_index: usize) -> Option<&SequenceInfo> {
        self.sequences.get(series_index)
    }

    /// Check the cross-instrument shape invariants.
    pub fn validate(&self) -> Result<(), ExpansionError> {
        if self.sequences.is_empty() {
            return Err(ExpansionError::EmptySeries);
        }
        for (instrument, sequences) in &self.steps {
            if sequences.len() != self.sequences.len() {
                return Err(ExpansionError::LengthMismatch {
                    sequence: "<series>".to_string(),
                    subsystem: instrument.clone(),
                    expected: self.sequences.len(),
                    got: sequences.len(),
                });
            }
        }
        for (index, info) in self.sequences.iter().enumerate() {
            let expected = self.sequence_len(index);
            for (instrument, sequences) in &self.steps {
                let got = sequences[index].len();
                if got != 0 && got != expected {
                    return Err(ExpansionError::LengthMismatch {
                        sequence: info.name.clone(),
                        subsystem: instrument.clone(),
                        expected,
                        got,
                    });
                }
            }
        }
        Ok(())
    }
}

/// Position within the control loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Sequence within the series
    #[serde(rename = "Series Index")]
    pub series_index: usize,
    /// Step within the sequence
    #[serde(rename = "Sequence Index")]
    pub sequence_index: usize,
    /// Set once the last step of the last sequence has run
    #[serde(rename = "Control Loop Complete")]
    pub control_loop_complete: bool,
}

impl Cursor {
    /// Store field the Indexing transitions are guarded on.
    pub const COMPLETE_FIELD: &'static str = "Control Loop Complete";

    /// Advance lexicographically: step first, then sequence, then wrap and complete.
    pub fn advance(&mut self, control_loop: &ControlLoop) {
        self.control_loop_complete = false;
        let steps = control_loop.sequence_len(self.series_index);
        if self.sequence_index + 1 < steps {
            self.sequence_index += 1;
        } else if self.series_index + 1 < control_loop.series_len() {
            self.sequence_index = 0;
            self.series_index += 1;
        } else {
            self.sequence_index = 0;
            self.series_index = 0;
            self.control_loop_complete = true;
        }
    }
}

/// Per-instrument part of a manual command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualInstrumentCommand {
    /// Settings to apply
    pub settings: ParameterMap,
    /// One-shot measurement to take after applying
    pub measurement: Option<ManualMeasurement>,
}

/// One-shot measurement requested by a manual command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualMeasurement {
    /// Samples per second
    pub sample_rate: f64,
    /// Seconds
    pub duration: f64,
    /// Output file
    pub file: PathBuf,
}

/// One-shot command applied by the Manual state.
pub type ManualCommand = BTreeMap<String, ManualInstrumentCommand>;

/// What the Control store key holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlBlock {
    /// Expanded series for the Auto state
    #[serde(rename = "Loop", default, skip_serializing_if = "Option::is_none")]
    pub control_loop: Option<ControlLoop>,
    /// Pending command for the Manual state
    #[serde(rename = "Manual", default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<ManualCommand>,
}
