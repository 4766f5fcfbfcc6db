//! The per-rig bundle every state and action works against.

use super::channel::{ControlChannel, ControlHandle, Publisher};
use super::store::GlobalArgumentStore;
use crate::config::Settings;
use crate::error::{AppResult, SequencerError};
use crate::instrument::InstrumentRegistry;
use std::sync::{Arc, Mutex, PoisonError};

/// Store, channels, instruments and settings for one rig.
///
/// A `Context` belongs to exactly one root machine. Nested machines run inside a
/// state of that root machine and share its context.
pub struct Context {
    store: Arc<GlobalArgumentStore>,
    channel: ControlChannel,
    instruments: InstrumentRegistry,
    settings: Arc<Settings>,
    owner: Mutex<Option<String>>,
}

impl Context {
    /// Build a context and the handle the outside world drives it with.
    pub fn new(settings: Settings, instruments: InstrumentRegistry) -> (Arc<Self>, ControlHandle) {
        let machine = &settings.machine;
        let (channel, handle) = ControlChannel::new(
            machine.signal_capacity,
            machine.payload_capacity,
            machine.broadcast_capacity,
        );
        let context = Self {
            store: Arc::new(GlobalArgumentStore::new()),
            channel,
            instruments,
            settings: Arc::new(settings),
            owner: Mutex::new(None),
        };
        (Arc::new(context), handle)
    }

    /// The shared store. Actions should go through their `ActionArgs` instead.
    pub fn store(&self) -> &Arc<GlobalArgumentStore> {
        &self.store
    }

    /// Inbound signal and payload channels.
    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// Outbound report publisher.
    pub fn publisher(&self) -> &Publisher {
        self.channel.publisher()
    }

    /// Registered instruments.
    pub fn instruments(&self) -> &InstrumentRegistry {
        &self.instruments
    }

    /// Validated settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Name of the root machine currently owning this context.
    pub fn owner(&self) -> Option<String> {
        self.owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn claim(&self, machine: &str) -> AppResult<()> {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        match owner.as_ref() {
            Some(current) => Err(SequencerError::ContextInUse(current.clone())),
            None => {
                *owner = Some(machine.to_string());
                Ok(())
            }
        }
    }

    pub(crate) fn release(&self, machine: &str) {
        let mut owner = self.owner.lock().unwrap_or_else(PoisonError::into_inner);
        if owner.as_deref() == Some(machine) {
            *owner = None;
        }
    }
}
