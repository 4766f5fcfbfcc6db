//! Instrument registry.
//!
//! The registry is the ordered set of instruments a machine drives. Registration
//! order is significant: Initializing opens instruments in this order and Moving
//! commands them in this order, which is what makes "stop at the first failing
//! instrument" well defined.

pub mod mock;

use crate::config::InstrumentDefinition;
use crate::core::InstrumentAdapter;
use crate::error::{AppResult, SequencerError};
use crate::measurement::{MeasurementProcedure, SamplingProcedure};
use mock::MockInstrument;
use std::sync::Arc;

/// An adapter together with the procedure used to measure on it.
#[derive(Clone)]
pub struct RegisteredInstrument {
    /// Hardware adapter
    pub adapter: Arc<dyn InstrumentAdapter>,
    /// Measurement procedure for this instrument
    pub procedure: Arc<dyn MeasurementProcedure>,
}

/// Ordered, name-addressed collection of instruments.
#[derive(Clone, Default)]
pub struct InstrumentRegistry {
    entries: Vec<(String, RegisteredInstrument)>,
}

impl InstrumentRegistry {
    /// Create an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter with the default sampling procedure.
    pub fn register(&mut self, adapter: Arc<dyn InstrumentAdapter>) -> AppResult<()> {
        self.register_with(adapter, Arc::new(SamplingProcedure::default()))
    }

    /// Register an adapter with a specific measurement procedure.
    pub fn register_with(
        &mut self,
        adapter: Arc<dyn InstrumentAdapter>,
        procedure: Arc<dyn MeasurementProcedure>,
    ) -> AppResult<()> {
        let id = adapter.identifier();
        if self.get(&id).is_some() {
            return Err(SequencerError::Configuration(format!(
                "Instrument '{}' is registered twice",
                id
            )));
        }
        self.entries
            .push((id, RegisteredInstrument { adapter, procedure }));
        Ok(())
    }

    /// Build simulated instruments from configuration.
    pub fn simulated(definitions: &[InstrumentDefinition]) -> AppResult<Self> {
        let mut registry = Self::new();
        for definition in definitions {
            let mock = MockInstrument::new(definition.id.clone())
                .with_parameters(definition.parameters.clone())
                .with_readout(definition.readout.clone())
                .with_latency(definition.latency_ms);
            let procedure = SamplingProcedure::new(definition.readout.clone());
            registry.register_with(Arc::new(mock), Arc::new(procedure))?;
        }
        Ok(registry)
    }

    /// Entry registered under `id`.
    pub fn get(&self, id: &str) -> Option<&RegisteredInstrument> {
        self.entries
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, entry)| entry)
    }

    /// Look up an instrument or fail with `UnknownInstrument`.
    pub fn require(&self, id: &str) -> AppResult<&RegisteredInstrument> {
        self.get(id)
            .ok_or_else(|| SequencerError::UnknownInstrument(id.to_string()))
    }

    /// Instruments in registration order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &RegisteredInstrument)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// Identifiers in registration order.
    pub fn names(&self) -> Vec<String> {
        self.entries.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
