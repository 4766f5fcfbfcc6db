//! Simulated instrument for tests and dry runs.
//!
//! `MockInstrument` keeps its parameters in memory and provides:
//! - Simulated command latency
//! - Controllable failure injection (next call, every call)
//! - "Stuck" parameters that ignore writes, so a read-back disagrees with the command
//! - Call logging for test verification
//!
//! Readout parameters (for example a lock-in's `signal`) are synthesised on every read
//! from a slowly advancing phase, so repeated samples differ.

use crate::core::{InstrumentAdapter, ParameterMap, ParameterValue, Selector};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// One recorded adapter call.
#[derive(Clone, Debug, PartialEq)]
pub enum MockCall {
    /// `open` was called.
    Open,
    /// `get_parameters` was called.
    Get(Selector),
    /// `set_parameters` was called with this map.
    Set(ParameterMap),
}

/// In-memory instrument.
///
/// # Example
///
/// ```
/// use spectral_daq::core::{parameters, InstrumentAdapter, Selector};
/// use spectral_daq::instrument::mock::MockInstrument;
///
/// # tokio_test::block_on(async {
/// let ndf = MockInstrument::new("ndf").with_parameters(parameters([("position", 1i64)]));
/// ndf.set_parameters(&parameters([("position", 3i64)])).await.unwrap();
/// let now = ndf.get_parameters(&Selector::All).await.unwrap();
/// assert_eq!(now["position"].as_i64(), Some(3));
/// # });
/// ```
#[derive(Clone)]
pub struct MockInstrument {
    id: String,
    parameters: Arc<Mutex<ParameterMap>>,
    readout: Arc<Vec<String>>,
    phase: Arc<Mutex<f64>>,
    latency_ms: Arc<AtomicU64>,
    opened: Arc<AtomicBool>,
    should_fail_next: Arc<AtomicBool>,
    should_fail_always: Arc<AtomicBool>,
    stuck: Arc<Mutex<BTreeSet<String>>>,
    call_log: Arc<Mutex<Vec<MockCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockInstrument {
    /// Create an instrument with no parameters and no latency.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parameters: Arc::new(Mutex::new(ParameterMap::new())),
            readout: Arc::new(Vec::new()),
            phase: Arc::new(Mutex::new(0.0)),
            latency_ms: Arc::new(AtomicU64::new(0)),
            opened: Arc::new(AtomicBool::new(false)),
            should_fail_next: Arc::new(AtomicBool::new(false)),
            should_fail_always: Arc::new(AtomicBool::new(false)),
            stuck: Arc::new(Mutex::new(BTreeSet::new())),
            call_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Set the power-on parameter values.
    pub fn with_parameters(self, parameters: ParameterMap) -> Self {
        *lock(&self.parameters) = parameters;
        self
    }

    /// Declare parameters whose values are synthesised on every read.
    pub fn with_readout<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.readout = Arc::new(names.into_iter().map(Into::into).collect());
        self
    }

    /// Set simulated latency in milliseconds
    pub fn with_latency(self, ms: u64) -> Self {
        self.latency_ms.store(ms, Ordering::SeqCst);
        self
    }

    /// Change the simulated latency of a running instrument.
    pub fn set_latency(&self, ms: u64) {
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Names of the synthesised readout parameters.
    pub fn readout(&self) -> &[String] {
        &self.readout
    }

    /// Inject a failure for the next operation
    pub fn inject_next_failure(&self) {
        self.should_fail_next.store(true, Ordering::SeqCst);
    }

    /// Make every following operation fail until cleared.
    pub fn set_failing(&self, failing: bool) {
        self.should_fail_always.store(failing, Ordering::SeqCst);
    }

    /// Ignore future writes to `parameter`, so read-back keeps the old value.
    pub fn stick(&self, parameter: impl Into<String>) {
        lock(&self.stuck).insert(parameter.into());
    }

    /// Whether `open` has succeeded.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Get the call log
    pub fn call_log(&self) -> Vec<MockCall> {
        lock(&self.call_log).clone()
    }

    /// Only the `set_parameters` payloads, in call order.
    pub fn set_calls(&self) -> Vec<ParameterMap> {
        lock(&self.call_log)
            .iter()
            .filter_map(|call| match call {
                MockCall::Set(map) => Some(map.clone()),
                _ => None,
            })
            .collect()
    }

    /// Clear the call log
    pub fn clear_log(&self) {
        lock(&self.call_log).clear();
    }

    fn log_call(&self, call: MockCall) {
        lock(&self.call_log).push(call);
    }

    fn check_failure(&self) -> bool {
        self.should_fail_next.swap(false, Ordering::SeqCst)
            || self.should_fail_always.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
    }

    fn synthesise(&self, name: &str, state: &ParameterMap) -> ParameterValue {
        let mut phase = lock(&self.phase);
        *phase += 0.1;
        // Use a simple deterministic noise instead of an RNG
        let noise = (*phase * 37.0).sin() * 0.05;
        let wavelength = state
            .get("wavelength")
            .and_then(ParameterValue::as_f64)
            .unwrap_or(1.0);
        let base = if name.contains("dark") { 0.0 } else { 1.0 / (1.0 + wavelength) };
        ParameterValue::Float(base + noise)
    }
}

#[async_trait]
impl InstrumentAdapter for MockInstrument {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    async fn open(&self) -> Result<()> {
        self.simulate_latency().await;
        self.log_call(MockCall::Open);
        if self.check_failure() {
            bail!("Injected failure opening '{}'", self.id);
        }
        self.opened.store(true, Ordering::SeqCst);
        debug!(instrument = %self.id, "Mock instrument opened");
        Ok(())
    }

    async fn get_parameters(&self, selector: &Selector) -> Result<ParameterMap> {
        self.simulate_latency().await;
        self.log_call(MockCall::Get(selector.clone()));
        if self.check_failure() {
            bail!("Injected failure reading '{}'", self.id);
        }

        let mut state = selector.select(&lock(&self.parameters));
        for name in self.readout.iter().filter(|n| selector.includes(n)) {
            let value = self.synthesise(name, &lock(&self.parameters));
            state.insert(name.clone(), value);
        }
        Ok(state)
    }

    async fn set_parameters(&self, parameters: &ParameterMap) -> Result<()> {
        self.simulate_latency().await;
        self.log_call(MockCall::Set(parameters.clone()));
        if self.check_failure() {
            bail!("Injected failure writing '{}'", self.id);
        }

        let stuck = lock(&self.stuck).clone();
        let mut state = lock(&self.parameters);
        for (name, value) in parameters {
            if !stuck.contains(name) {
                state.insert(name.clone(), value.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parameters;

    #[tokio::test]
    async fn test_set_then_get() {
        let mono = MockInstrument::new("cs260")
            .with_parameters(parameters([("wavelength", 0.5), ("grating", 1.0)]));
        mono.set_parameters(&parameters([("wavelength", 1.2)]))
            .await
            .unwrap();
        let now = mono.get_parameters(&Selector::All).await.unwrap();
        assert_eq!(now["wavelength"], ParameterValue::Float(1.2));
        assert_eq!(mono.set_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection_is_consumed() {
        let mono = MockInstrument::new("cs260");
        mono.inject_next_failure();
        assert!(mono.open().await.is_err());
        assert!(mono.open().await.is_ok());
        assert!(mono.is_open());
    }

    #[tokio::test]
    async fn test_stuck_parameter_keeps_old_value() {
        let ndf = MockInstrument::new("ndf").with_parameters(parameters([("position", 1i64)]));
        ndf.stick("position");
        ndf.set_parameters(&parameters([("position", 4i64)]))
            .await
            .unwrap();
        let now = ndf.get_parameters(&Selector::from("position")).await.unwrap();
        assert_eq!(now["position"], ParameterValue::Int(1));
    }

    #[tokio::test]
    async fn test_readout_varies() {
        let lockin = MockInstrument::new("lockin").with_readout(["signal"]);
        let a = lockin.get_parameters(&Selector::All).await.unwrap();
        let b = lockin.get_parameters(&Selector::All).await.unwrap();
        assert_ne!(a["signal"], b["signal"]);
    }
}
