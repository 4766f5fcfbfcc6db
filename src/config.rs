//! Rig configuration using Figment.
//!
//! Settings are layered, lowest precedence first:
//! 1. Built-in defaults (`Settings::default()`)
//! 2. A TOML file (optional)
//! 3. Environment variables prefixed with `SPECTRAL_`, nested keys split on `__`
//!
//! ```text
//! SPECTRAL_APPLICATION__LOG_LEVEL=debug
//! SPECTRAL_MACHINE__ACTION_TIMEOUT_MS=30000
//! SPECTRAL_STORAGE__ROOT=/data/calibration
//! ```
//!
//! # Example
//!
//! ```no_run
//! use spectral_daq::config::Settings;
//!
//! let settings = Settings::load(Some("config/spectral.toml".as_ref()))?;
//! println!("Writing measurements to {}", settings.storage.root.display());
//! # Ok::<(), spectral_daq::error::SequencerError>(())
//! ```

use crate::core::ParameterMap;
use crate::error::{AppResult, SequencerError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SPECTRAL_";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// State machine tuning
    pub machine: MachineConfig,
    /// Defaults used when expanding sequences
    pub expander: ExpanderConfig,
    /// Measurement output
    pub storage: StorageConfig,
    /// Simulated instruments brought up by the CLI
    pub instruments: Vec<InstrumentDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Emit JSON log lines instead of human-readable ones
    pub json_logs: bool,
}

/// How a state reacts when one of several instruments fails.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Skip every instrument after the failing one.
    StopRemaining,
    /// Let the other instruments finish, then report the failure.
    CompleteSiblings,
}

/// State machine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MachineConfig {
    /// Capacity of the inbound signal channel
    pub signal_capacity: usize,
    /// Capacity of the inbound payload channel
    pub payload_capacity: usize,
    /// Capacity of the outbound report broadcast
    pub broadcast_capacity: usize,
    /// Optional limit on each hardware call. `None` waits indefinitely.
    ///
    /// A measurement is allowed its own duration on top of the limit. The idle wait
    /// for a request is never limited.
    pub action_timeout_ms: Option<u64>,
    /// Absolute tolerance used when confirming numeric instrument values
    pub verify_tolerance: f64,
    /// Failure handling while moving instruments
    pub moving_failure_policy: FailurePolicy,
    /// Failure handling while measuring
    pub measuring_failure_policy: FailurePolicy,
}

/// Sequence expansion defaults
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExpanderConfig {
    /// Two ascending wavelengths separating grating bands 1|2|3
    pub grating_breakpoints: Vec<f64>,
    /// Three ascending wavelengths separating filter bands 1|2|3|4
    pub filter_breakpoints: Vec<f64>,
    /// Shutter value carried by every swept step
    pub shutter: String,
    /// Value a dependent subsystem holds before its first threshold
    pub dependent_default: f64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory measurement files are written to
    pub root: PathBuf,
    /// Measurement file extension, including the dot
    pub extension: String,
}

/// A simulated instrument.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentDefinition {
    /// Unique instrument identifier
    pub id: String,
    /// Simulated command latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
    /// Power-on parameter values
    #[serde(default)]
    pub parameters: ParameterMap,
    /// Parameters sampled while measuring; empty samples everything
    #[serde(default)]
    pub readout: Vec<String>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Spectral Calibration".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            signal_capacity: 16,
            payload_capacity: 16,
            broadcast_capacity: 256,
            action_timeout_ms: None,
            verify_tolerance: 1e-6,
            moving_failure_policy: FailurePolicy::StopRemaining,
            measuring_failure_policy: FailurePolicy::CompleteSiblings,
        }
    }
}

impl MachineConfig {
    /// The opt-in hardware timeout as a `Duration`.
    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ExpanderConfig {
    fn default() -> Self {
        Self {
            grating_breakpoints: vec![1.4, 2.5],
            filter_breakpoints: vec![0.6, 1.0, 1.6],
            shutter: "open".to_string(),
            dependent_default: 0.5,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data"),
            extension: ".csv".to_string(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl Settings {
    /// Load settings from defaults, an optional TOML file and the environment.
    ///
    /// A missing file is not an error; figment simply contributes nothing for it.
    ///
    /// # Errors
    ///
    /// Returns `SequencerError::Config` when a layer cannot be parsed and
    /// `SequencerError::Configuration` when the merged settings fail validation.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        let settings: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Check invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `SequencerError::Configuration` describing the first violation.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(SequencerError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let machine = &self.machine;
        for (name, value) in [
            ("signal_capacity", machine.signal_capacity),
            ("payload_capacity", machine.payload_capacity),
            ("broadcast_capacity", machine.broadcast_capacity),
        ] {
            if value == 0 {
                return Err(SequencerError::Configuration(format!(
                    "machine.{} must be positive",
                    name
                )));
            }
        }
        if machine.action_timeout_ms == Some(0) {
            return Err(SequencerError::Configuration(
                "machine.action_timeout_ms must be positive when set".to_string(),
            ));
        }
        if !(machine.verify_tolerance.is_finite() && machine.verify_tolerance > 0.0) {
            return Err(SequencerError::Configuration(format!(
                "machine.verify_tolerance must be positive, got {}",
                machine.verify_tolerance
            )));
        }

        check_breakpoints("grating", &self.expander.grating_breakpoints, 2)?;
        check_breakpoints("filter", &self.expander.filter_breakpoints, 3)?;

        if !self.storage.extension.starts_with('.') {
            return Err(SequencerError::Configuration(format!(
                "storage.extension '{}' must start with '.'",
                self.storage.extension
            )));
        }

        let mut ids = std::collections::HashSet::new();
        for instrument in &self.instruments {
            if instrument.id.is_empty() {
                return Err(SequencerError::Configuration(
                    "Instrument id cannot be empty".to_string(),
                ));
            }
            if !ids.insert(&instrument.id) {
                return Err(SequencerError::Configuration(format!(
                    "Duplicate instrument ID: '{}'",
                    instrument.id
                )));
            }
        }

        Ok(())
    }
}

fn check_breakpoints(table: &str, values: &[f64], expected: usize) -> AppResult<()> {
    if values.len() != expected {
        return Err(SequencerError::Configuration(format!(
            "expander.{}_breakpoints needs {} values, got {}",
            table,
            expected,
            values.len()
        )));
    }
    if values.windows(2).any(|w| w[0] >= w[1]) {
        return Err(SequencerError::Configuration(format!(
            "expander.{}_breakpoints must be strictly ascending: {:?}",
            table, values
        )));
    }
    Ok(())
}
