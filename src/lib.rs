//! Core library for the spectral-calibration rig.
//!
//! This library contains the sequencer (an async, hierarchical state machine with a
//! shared argument store), the sequence expander that turns operator series into a
//! per-step control loop, the instrument and measurement seams, and the concrete
//! states of the rig. It is used by the `spectral-cal` binary and the integration
//! tests.

pub mod config;
pub mod core;
pub mod error;
pub mod instrument;
pub mod logging;
pub mod measurement;
pub mod metadata;
pub mod sequence_file;
pub mod sequencer;
pub mod spectral;
pub mod states;
