//! Custom error types for the sequencer.
//!
//! This module defines the primary error type, `SequencerError`, for the whole crate.
//! Using the `thiserror` crate, it gives the state machine one consistent vocabulary
//! for the three kinds of trouble a calibration run can hit:
//!
//! ## Error Hierarchy
//!
//! - **Action failures** (`ActionFailure`, `VerifyMismatch`, `Instrument`,
//!   `Measurement`, `Aborted`): a registered action raised or returned a failure. The
//!   owning state raises its error flag and the machine routes to its error target
//!   (Troubleshooting on the spectral machine). `VerifyMismatch` is the special case of
//!   an adapter echoing a value that differs from the commanded one.
//! - **Configuration faults** (`NoTransition`, `UnregisteredKey`, `UnknownEvent`, ...):
//!   the machine was wired incorrectly. These are fatal: the machine stops instead of
//!   guessing. See [`SequencerError::is_fatal`].
//! - **Infrastructure** (`Config`, `Io`, `Json`, `Csv`, `Expansion`): wrapped errors
//!   from the crates the sequencer is built on.
//!
//! By using `#[from]`, `SequencerError` can be created from the underlying error types,
//! so the `?` operator works throughout the crate.

use thiserror::Error;

/// Convenience alias for results using the sequencer error type.
pub type AppResult<T> = std::result::Result<T, SequencerError>;

/// Errors raised while building a control loop from a series.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpansionError {
    /// The series has no sequences.
    #[error("Series is empty")]
    EmptySeries,

    /// A sequence declares two sweeps.
    #[error("Sequence '{0}' declares more than one primary sweep")]
    MultiplePrimarySweeps(String),

    /// A sequence has no sweep to drive its other subsystems.
    #[error("Sequence '{sequence}': subsystem '{subsystem}' needs a primary sweep")]
    MissingPrimarySweep {
        /// Sequence name
        sequence: String,
        /// Subsystem that needs the sweep
        subsystem: String,
    },

    /// Sweep start, stop or step is unusable.
    #[error("Sequence '{sequence}': invalid sweep ({reason})")]
    InvalidSweep {
        /// Sequence name
        sequence: String,
        /// What is wrong with the sweep
        reason: String,
    },

    /// Breakpoint list has the wrong length or order.
    #[error("Sequence '{sequence}': expected {expected} ascending {table} breakpoints, got {got:?}")]
    InvalidBreakpoints {
        /// Sequence name
        sequence: String,
        /// `grating` or `filter`
        table: &'static str,
        /// Required number of breakpoints
        expected: usize,
        /// Breakpoints given
        got: Vec<f64>,
    },

    /// Subsystems of one sequence disagree on the step count.
    #[error("Sequence '{sequence}': subsystem '{subsystem}' expanded to {got} steps, expected {expected}")]
    LengthMismatch {
        /// Sequence name
        sequence: String,
        /// Subsystem out of step
        subsystem: String,
        /// Steps in the sweep
        expected: usize,
        /// Steps in the subsystem
        got: usize,
    },
}

/// The primary error type for the sequencer.
#[derive(Error, Debug)]
pub enum SequencerError {
    /// Settings could not be extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Settings or machine wiring are invalid. Fatal.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Store value (de)serialisation failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Measurement file failure.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A cargo feature needed for the operation is off.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    /// The series could not be expanded.
    #[error("Expansion error: {0}")]
    Expansion(#[from] ExpansionError),

    /// Malformed sequence file.
    #[error("Sequence file error at line {line}: {message}")]
    SequenceFile {
        /// 1-based line number
        line: usize,
        /// What is wrong with it
        message: String,
    },

    /// An adapter call failed.
    #[error("Instrument '{instrument}' error: {message}")]
    Instrument {
        /// Instrument identifier
        instrument: String,
        /// Adapter error, with its causes
        message: String,
    },

    /// No instrument registered under this id.
    #[error("Instrument '{0}' is not registered")]
    UnknownInstrument(String),

    /// Read-back after a write differs from the commanded value.
    #[error("Instrument '{instrument}' did not confirm '{parameter}': commanded {commanded}, read back {actual}")]
    VerifyMismatch {
        /// Instrument identifier
        instrument: String,
        /// Parameter that did not confirm
        parameter: String,
        /// Value written
        commanded: String,
        /// Value read back
        actual: String,
    },

    /// A measurement procedure failed.
    #[error("Measurement error: {0}")]
    Measurement(String),

    /// An action or nested machine failed.
    #[error("Action '{action}' failed: {message}")]
    ActionFailure {
        /// Action, or `machine/state` for a nested machine
        action: String,
        /// Failure reason
        message: String,
    },

    /// An action touched a store key it was not granted. Fatal.
    #[error("Action '{action}' used key '{key}' it was not granted")]
    UnregisteredKey {
        /// Offending action
        action: String,
        /// Key it reached for
        key: String,
    },

    /// A required store key is absent.
    #[error("Store key '{0}' is not present")]
    MissingKey(String),

    /// No transition matched on release. Fatal.
    #[error("No valid transition out of state '{0}'")]
    NoTransition(String),

    /// The event table has no such event. Fatal.
    #[error("Event '{event}' is not registered for state '{state}'")]
    UnknownEvent {
        /// Event name
        event: String,
        /// State it was dispatched from
        state: String,
    },

    /// A route targets a state that is not registered. Fatal.
    #[error("State '{0}' is not registered")]
    UnknownState(String),

    /// A state id is registered twice.
    #[error("State '{0}' is registered twice")]
    DuplicateState(String),

    /// An action name is registered twice on one state.
    #[error("Action '{action}' is registered twice on state '{state}'")]
    DuplicateAction {
        /// State being registered
        state: String,
        /// Repeated action name
        action: String,
    },

    /// No state is marked initial.
    #[error("Machine has no initial state")]
    NoInitialState,

    /// Another root machine already owns the context.
    #[error("Context is already owned by machine '{0}'")]
    ContextInUse(String),

    /// The run was cancelled. Never routed as a failure.
    #[error("Operation aborted")]
    Aborted,

    /// A hardware call exceeded the opt-in limit.
    #[error("'{operation}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Instrument and call, e.g. `ndf write`
        operation: String,
        /// The configured limit
        timeout_ms: u64,
    },
}

impl SequencerError {
    /// Shorthand for an instrument-side failure.
    pub fn instrument(instrument: impl Into<String>, err: impl std::fmt::Display) -> Self {
        SequencerError::Instrument {
            instrument: instrument.into(),
            message: err.to_string(),
        }
    }

    /// Configuration faults stop the machine; everything else is an action failure
    /// that routes through the error hook.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SequencerError::Configuration(_)
                | SequencerError::UnregisteredKey { .. }
                | SequencerError::NoTransition(_)
                | SequencerError::UnknownEvent { .. }
                | SequencerError::UnknownState(_)
                | SequencerError::DuplicateState(_)
                | SequencerError::DuplicateAction { .. }
                | SequencerError::NoInitialState
                | SequencerError::ContextInUse(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SequencerError::instrument("cs260", "serial timeout");
        assert_eq!(err.to_string(), "Instrument 'cs260' error: serial timeout");
    }

    #[test]
    fn test_fatal_classification() {
        assert!(SequencerError::NoTransition("waiting".into()).is_fatal());
        assert!(SequencerError::UnregisteredKey {
            action: "moving".into(),
            key: "Control".into()
        }
        .is_fatal());
        assert!(!SequencerError::VerifyMismatch {
            instrument: "ndf".into(),
            parameter: "position".into(),
            commanded: "3".into(),
            actual: "2".into(),
        }
        .is_fatal());
        assert!(!SequencerError::Aborted.is_fatal());
    }

    #[test]
    fn test_expansion_error_wraps() {
        let err: SequencerError = ExpansionError::EmptySeries.into();
        assert!(err.to_string().contains("Series is empty"));
    }
}
