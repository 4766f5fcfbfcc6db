//! Expansion of operator sequence specs into a [`ControlLoop`].
//!
//! Each sequence names its subsystems. At most one is the primary sweep; the rest
//! are derived from the sweep's wavelength array or broadcast unchanged:
//!
//! | kind        | per-step output                                            |
//! |-------------|------------------------------------------------------------|
//! | `sweep`     | `wavelength`, `grating` (1-3), `filter` (1-4), `shutter`   |
//! | `dependent` | one parameter from a threshold table (sensitivity, ND position) |
//! | `follow`    | one parameter equal to `wavelength * scale`                |
//! | `fixed`     | the same map at every step                                 |
//!
//! Expansion is two-pass: the sweep is expanded first and every other subsystem is
//! expanded against its wavelength array, so the order subsystems appear in does not
//! matter. All scratch state lives inside one `expand_sequence` call.

use super::control_loop::{ControlLoop, MeasureSpec, Sequence, SequenceInfo, Step};
use crate::config::ExpanderConfig;
use crate::core::{ParameterMap, ParameterValue};
use crate::error::ExpansionError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Decimal places wavelengths are rounded to, so `0.7 + 7 * 0.1` lands on `1.4`.
const WAVELENGTH_DECIMALS: i32 = 9;

/// Slack when counting sweep points, absorbing binary representation error.
const COUNT_EPSILON: f64 = 1e-9;

/// A `(wavelength, value)` threshold: past `wavelength`, the subsystem takes `value`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    /// Wavelength the threshold takes effect past
    pub wavelength: f64,
    /// Value taken past it
    pub value: f64,
}

impl From<(f64, f64)> for Threshold {
    fn from((wavelength, value): (f64, f64)) -> Self {
        Self { wavelength, value }
    }
}

/// How one subsystem is expanded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubsystemSpec {
    /// The primary wavelength sweep.
    Sweep {
        /// First wavelength
        start: f64,
        /// Last wavelength, included
        stop: f64,
        /// Increment between steps
        step: f64,
        /// Overrides the configured grating bands
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grating_breakpoints: Option<Vec<f64>>,
        /// Overrides the configured filter bands
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filter_breakpoints: Option<Vec<f64>>,
        /// Overrides the configured shutter value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shutter: Option<String>,
        /// Added unchanged to every step
        #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
        fixed: ParameterMap,
    },
    /// A parameter looked up from thresholds on the sweep wavelength.
    ///
    /// `transitions` MUST already be sorted ascending by wavelength. The pass never
    /// revisits an earlier threshold, and the order is not checked.
    Dependent {
        /// Parameter being set
        parameter: String,
        /// Value before the first threshold; falls back to the configured default
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
        /// Thresholds, ascending by wavelength
        transitions: Vec<Threshold>,
        /// Added unchanged to every step
        #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
        fixed: ParameterMap,
    },
    /// A parameter tracking the sweep wavelength.
    Follow {
        /// Parameter being set
        #[serde(default = "default_follow_parameter")]
        parameter: String,
        /// Multiplier applied to the wavelength
        #[serde(default = "default_scale")]
        scale: f64,
        /// Added unchanged to every step
        #[serde(default, skip_serializing_if = "ParameterMap::is_empty")]
        fixed: ParameterMap,
    },
    /// The same settings at every step.
    Fixed {
        /// Settings repeated at every step
        parameters: ParameterMap,
    },
}

fn default_follow_parameter() -> String {
    "wavelength".to_string()
}

fn default_scale() -> f64 {
    1.0
}

/// One operator-defined sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Name
    pub name: String,
    /// Subsystem specs keyed by instrument identifier.
    pub subsystems: BTreeMap<String, SubsystemSpec>,
    /// Measurement settings
    #[serde(default)]
    pub measure: MeasureSpec,
}

/// Expand a whole series. Every instrument named anywhere gets one entry per
/// sequence, empty where it does not take part.
pub fn expand_series(
    series: &[SequenceSpec],
    defaults: &ExpanderConfig,
) -> Result<ControlLoop, ExpansionError> {
    if series.is_empty() {
        return Err(ExpansionError::EmptySeries);
    }

    let mut control_loop = ControlLoop::default();
    for spec in series {
        for instrument in spec.subsystems.keys() {
            control_loop
                .steps
                .entry(instrument.clone())
                .or_insert_with(|| Vec::with_capacity(series.len()));
        }
    }

    for spec in series {
        let mut expanded = expand_sequence(spec, defaults)?;
        for (instrument, sequences) in control_loop.steps.iter_mut() {
            sequences.push(expanded.remove(instrument).unwrap_or_default());
        }
        control_loop.sequences.push(SequenceInfo {
            name: spec.name.clone(),
            measure: spec.measure.clone(),
        });
    }

    control_loop.validate()?;
    info!(
        sequences = control_loop.series_len(),
        instruments = control_loop.steps.len(),
        "Control loop expanded"
    );
    Ok(control_loop)
}

/// Expand one sequence into per-instrument step lists of equal length.
pub fn expand_sequence(
    spec: &SequenceSpec,
    defaults: &ExpanderConfig,
) -> Result<BTreeMap<String, Sequence>, ExpansionError> {
    let mut primary: Option<(&String, &SubsystemSpec)> = None;
    for (instrument, subsystem) in &spec.subsystems {
        if matches!(subsystem, SubsystemSpec::Sweep { .. }) {
            if primary.is_some() {
                return Err(ExpansionError::MultiplePrimarySweeps(spec.name.clone()));
            }
            primary = Some((instrument, subsystem));
        }
    }

    let mut out = BTreeMap::new();

    // First pass: the sweep, which fixes the sequence length.
    let waves = match primary {
        Some((
            instrument,
            SubsystemSpec::Sweep {
                start,
                stop,
                step,
                grating_breakpoints,
                filter_breakpoints,
                shutter,
                fixed,
            },
        )) => {
            let waves = sweep_wavelengths(&spec.name, *start, *stop, *step)?;
            let grating = breakpoints(
                &spec.name,
                "grating",
                grating_breakpoints.as_ref().unwrap_or(&defaults.grating_breakpoints),
                2,
            )?;
            let filter = breakpoints(
                &spec.name,
                "filter",
                filter_breakpoints.as_ref().unwrap_or(&defaults.filter_breakpoints),
                3,
            )?;
            let shutter = shutter.clone().unwrap_or_else(|| defaults.shutter.clone());

            let steps = waves
                .iter()
                .map(|&wave| {
                    let mut step = fixed.clone();
                    step.insert("wavelength".into(), ParameterValue::Float(wave));
                    step.insert("grating".into(), ParameterValue::Int(band(wave, grating)));
                    step.insert("filter".into(), ParameterValue::Int(band(wave, filter)));
                    step.insert("shutter".into(), ParameterValue::String(shutter.clone()));
                    step
                })
                .collect();
            out.insert(instrument.clone(), steps);
            Some(waves)
        }
        _ => None,
    };

    let len = waves.as_ref().map_or(1, Vec::len);

    // Second pass: everything derived from, or broadcast along, the sweep.
    for (instrument, subsystem) in &spec.subsystems {
        let steps: Sequence = match subsystem {
            SubsystemSpec::Sweep { .. } => continue,
            SubsystemSpec::Dependent {
                parameter,
                default,
                transitions,
                fixed,
            } => {
                let waves = waves.as_ref().ok_or_else(|| missing_primary(spec, instrument))?;
                let initial = default.unwrap_or(defaults.dependent_default);
                dependent_values(waves, transitions, initial)
                    .into_iter()
                    .map(|value| with_value(fixed, parameter, dependent_value(parameter, value)))
                    .collect()
            }
            SubsystemSpec::Follow {
                parameter,
                scale,
                fixed,
            } => {
                let waves = waves.as_ref().ok_or_else(|| missing_primary(spec, instrument))?;
                waves
                    .iter()
                    .map(|wave| with_value(fixed, parameter, ParameterValue::Float(round(wave * scale))))
                    .collect()
            }
            SubsystemSpec::Fixed { parameters } => vec![parameters.clone(); len],
        };
        out.insert(instrument.clone(), steps);
    }

    for (instrument, steps) in &out {
        if steps.len() != len {
            return Err(ExpansionError::LengthMismatch {
                sequence: spec.name.clone(),
                subsystem: instrument.clone(),
                expected: len,
                got: steps.len(),
            });
        }
    }

    debug!(sequence = %spec.name, steps = len, "Sequence expanded");
    Ok(out)
}

/// `start, start + step, ...` up to the first value at or past `stop`.
///
/// When `step` does not divide `stop - start` the final value overshoots `stop`
/// by less than one step.
pub fn sweep_wavelengths(
    sequence: &str,
    start: f64,
    stop: f64,
    step: f64,
) -> Result<Vec<f64>, ExpansionError> {
    let invalid = |reason: String| ExpansionError::InvalidSweep {
        sequence: sequence.to_string(),
        reason,
    };
    if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
        return Err(invalid("non-finite bound".into()));
    }
    if step <= 0.0 {
        return Err(invalid(format!("step {} must be positive", step)));
    }
    if stop < start {
        return Err(invalid(format!("stop {} is below start {}", stop, start)));
    }

    let intervals = ((stop - start) / step - COUNT_EPSILON).ceil().max(0.0) as usize;
    Ok((0..=intervals)
        .map(|i| round(start + i as f64 * step))
        .collect())
}

/// Band number for `wave`: one plus the number of breakpoints it lies strictly above.
pub fn band(wave: f64, breakpoints: &[f64]) -> i64 {
    1 + breakpoints.iter().filter(|&&b| wave > b).count() as i64
}

/// Single monotonic pass over `waves` against ascending `thresholds`.
pub fn dependent_values(waves: &[f64], thresholds: &[Threshold], initial: f64) -> Vec<f64> {
    let mut next = 0;
    let mut current = initial;
    waves
        .iter()
        .map(|&wave| {
            while next < thresholds.len() && wave > thresholds[next].wavelength {
                current = thresholds[next].value;
                next += 1;
            }
            current
        })
        .collect()
}

fn breakpoints<'a>(
    sequence: &str,
    table: &'static str,
    values: &'a [f64],
    expected: usize,
) -> Result<&'a [f64], ExpansionError> {
    if values.len() != expected || values.windows(2).any(|w| w[0] >= w[1]) {
        return Err(ExpansionError::InvalidBreakpoints {
            sequence: sequence.to_string(),
            table,
            expected,
            got: values.to_vec(),
        });
    }
    Ok(values)
}

fn missing_primary(spec: &SequenceSpec, instrument: &str) -> ExpansionError {
    ExpansionError::MissingPrimarySweep {
        sequence: spec.name.clone(),
        subsystem: instrument.to_string(),
    }
}

/// Positions and other integral settings stay integers.
fn dependent_value(parameter: &str, value: f64) -> ParameterValue {
    if parameter == "position" && value.fract() == 0.0 {
        ParameterValue::Int(value as i64)
    } else {
        ParameterValue::Float(value)
    }
}

fn with_value(fixed: &ParameterMap, parameter: &str, value: ParameterValue) -> Step {
    let mut step = fixed.clone();
    step.insert(parameter.to_string(), value);
    step
}

fn round(value: f64) -> f64 {
    let scale = 10f64.powi(WAVELENGTH_DECIMALS);
    (value * scale).round() / scale
}
