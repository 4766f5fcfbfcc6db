//! Shared key/value registry bridging states and actions.
//!
//! One store exists per [`Context`](super::context::Context); it is not a process
//! global, so several rigs can run side by side in one process. Values are
//! `serde_json::Value`, which lets typed structures (the control loop, the cursor,
//! the metadata map) round-trip through [`GlobalArgumentStore::get_as`] and
//! [`GlobalArgumentStore::set_as`].
//!
//! Access is serialised by an `RwLock`: each `set` is atomic, but read-modify-write
//! sequences across calls are not. Every key has a single writing state at any time.

use crate::core::Selector;
use crate::error::AppResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Named store entries.
pub type StoreMap = BTreeMap<String, Value>;

/// Well-known store keys.
pub mod keys {
    /// Control block: the expanded loop and any pending manual command.
    pub const CONTROL: &str = "Control";
    /// Position within the control loop.
    pub const CURSOR: &str = "Cursor";
    /// Flattened last-known instrument settings.
    pub const METADATA: &str = "Metadata";
    /// What Waiting dispatched: `"auto"` or `"manual"`.
    pub const MODE: &str = "Mode";
    /// The failure Troubleshooting reports.
    pub const FAULT: &str = "Fault";
}

/// Shared key-value store every action reads and writes through.
#[derive(Debug, Default)]
pub struct GlobalArgumentStore {
    entries: RwLock<StoreMap>,
}

impl GlobalArgumentStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreMap> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreMap> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merge `partial` in, overwriting existing keys.
    pub fn set(&self, partial: StoreMap) {
        self.write().extend(partial);
    }

    /// Overwrite a single key.
    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.write().insert(key.into(), value);
    }

    /// Return the selected entries. Absent keys are omitted.
    pub fn get(&self, selector: &Selector) -> StoreMap {
        selector.select(&self.read())
    }

    /// Clone a single value.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.read().get(key).cloned()
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &str) -> Option<Value> {
        self.write().remove(key)
    }

    /// Whether `key` is present.
    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    /// Deserialize a value. `Ok(None)` when the key is absent or null.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> AppResult<Option<T>> {
        match self.value(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
        }
    }

    /// Serialize and store a value.
    pub fn set_as<T: Serialize>(&self, key: &str, value: &T) -> AppResult<()> {
        let value = serde_json::to_value(value)?;
        self.insert(key, value);
        Ok(())
    }

    /// Look up `key`, or one field of the object stored at `key`.
    pub fn lookup(&self, key: &str, field: Option<&str>) -> Option<Value> {
        let entries = self.read();
        let value = entries.get(key)?;
        match field {
            None => Some(value.clone()),
            Some(field) => value.get(field).cloned(),
        }
    }
}
