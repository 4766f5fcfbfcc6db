//! Core traits and data types for the calibration rig.
//!
//! This module defines the foundational abstractions shared by the sequencer, the
//! states and the instrument layer:
//!
//! - [`ParameterValue`]: one instrument setting or reading (wavelength, grating, ...)
//! - [`ParameterMap`]: a named set of settings, the unit every adapter call speaks
//! - [`Selector`]: which parameters (or store keys) a read is interested in
//! - [`InstrumentAdapter`]: the capability contract every instrument driver satisfies
//!
//! # Data Flow
//!
//! ```text
//! Step (ParameterMap) --set_parameters--> InstrumentAdapter --get_parameters--> Report
//! ```
//!
//! # Thread Safety
//!
//! Adapters are shared as `Arc<dyn InstrumentAdapter>` between the Initializing,
//! Moving, Measuring and Manual states, so the trait requires `Send + Sync` and takes
//! `&self`. Drivers keep their mutable state behind their own locks.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// =============================================================================
// Parameter Values
// =============================================================================

/// A single instrument setting or reading.
///
/// Serialised untagged so sequence files and reports carry plain JSON literals
/// (`1.4`, `2`, `"open"`, `true`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    /// Boolean flag
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// Text value
    String(String),
    /// No value
    Null,
}

impl fmt::Display for ParameterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParameterValue::Bool(b) => write!(f, "{}", b),
            ParameterValue::Int(i) => write!(f, "{}", i),
            ParameterValue::Float(fl) => write!(f, "{}", fl),
            ParameterValue::String(s) => write!(f, "{}", s),
            ParameterValue::Null => write!(f, "null"),
        }
    }
}

impl ParameterValue {
    /// Extract value as a string, parsing from various types
    pub fn as_string(&self) -> Option<String> {
        match self {
            ParameterValue::String(s) => Some(s.clone()),
            ParameterValue::Bool(b) => Some(b.to_string()),
            ParameterValue::Int(i) => Some(i.to_string()),
            ParameterValue::Float(f) => Some(f.to_string()),
            ParameterValue::Null => None,
        }
    }

    /// Extract value as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Float(f) => Some(*f),
            ParameterValue::Int(i) => Some(*i as f64),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ParameterValue::Int(i) => Some(*i),
            ParameterValue::Float(f) => Some(*f as i64),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Extract value as bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParameterValue::Bool(b) => Some(*b),
            ParameterValue::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Compare a commanded value against what an instrument reports.
    ///
    /// Drivers frequently echo numbers as strings (`"1.40"` for `1.4`), so whenever
    /// both sides read as numbers they are compared within `tolerance`. Everything
    /// else falls back to string equality.
    pub fn matches(&self, other: &ParameterValue, tolerance: f64) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() <= tolerance,
            _ => self.as_string() == other.as_string(),
        }
    }
}

impl From<bool> for ParameterValue {
    fn from(value: bool) -> Self {
        ParameterValue::Bool(value)
    }
}

impl From<i64> for ParameterValue {
    fn from(value: i64) -> Self {
        ParameterValue::Int(value)
    }
}

impl From<u32> for ParameterValue {
    fn from(value: u32) -> Self {
        ParameterValue::Int(i64::from(value))
    }
}

impl From<i32> for ParameterValue {
    fn from(value: i32) -> Self {
        ParameterValue::Int(i64::from(value))
    }
}

impl From<f64> for ParameterValue {
    fn from(value: f64) -> Self {
        ParameterValue::Float(value)
    }
}

impl From<&str> for ParameterValue {
    fn from(value: &str) -> Self {
        ParameterValue::String(value.to_string())
    }
}

impl From<String> for ParameterValue {
    fn from(value: String) -> Self {
        ParameterValue::String(value)
    }
}

/// Named instrument settings. Ordered so reports and CSV columns are stable.
pub type ParameterMap = BTreeMap<String, ParameterValue>;

/// Build a [`ParameterMap`] from `(name, value)` pairs.
pub fn parameters<I, K, V>(pairs: I) -> ParameterMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<ParameterValue>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

// =============================================================================
// Selectors
// =============================================================================

/// Which entries a read should return.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selector {
    /// Every entry.
    All,
    /// A single named entry.
    Key(String),
    /// A list of named entries.
    Keys(Vec<String>),
}

impl Selector {
    /// Whether `name` is covered by this selector.
    pub fn includes(&self, name: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Key(key) => key == name,
            Selector::Keys(keys) => keys.iter().any(|k| k == name),
        }
    }

    /// Restrict a map to the selected entries. Missing keys are skipped.
    pub fn select<V: Clone>(&self, map: &BTreeMap<String, V>) -> BTreeMap<String, V> {
        map.iter()
            .filter(|(k, _)| self.includes(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl From<&str> for Selector {
    fn from(value: &str) -> Self {
        if value == "All" {
            Selector::All
        } else {
            Selector::Key(value.to_string())
        }
    }
}

// =============================================================================
// Instrument Trait
// =============================================================================

/// Capability contract consumed by the sequencer states.
///
/// `set_parameters` may apply a subset before failing; partial application is
/// driver-defined and never rolled back by the sequencer.
#[async_trait]
pub trait InstrumentAdapter: Send + Sync {
    /// Stable name used as the control-loop and metadata key.
    fn identifier(&self) -> String;

    /// Connect to the hardware.
    async fn open(&self) -> anyhow::Result<()>;

    /// Read the selected parameters.
    async fn get_parameters(&self, selector: &Selector) -> anyhow::Result<ParameterMap>;

    /// Command new values.
    async fn set_parameters(&self, parameters: &ParameterMap) -> anyhow::Result<()>;
}
