//! Last-known instrument settings attached to measurement records.
//!
//! The `MetadataMap` is a flattened view of every setting the Moving state has
//! confirmed, keyed `"{instrument} {PARAM}"` (for example `"cs260 WAVELENGTH"`). It is
//! rebuilt incrementally as steps are applied and only reset once a whole series has
//! finished, so a measurement always carries the full rig configuration it was taken
//! under, not just the fields that changed on the latest step.
//!
//! Measurement files carry it twice: as `# key: value` comment lines ahead of the
//! header (a snapshot of the first step written to the file) and as per-row columns.

use crate::core::{ParameterMap, ParameterValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Flattened `"{instrument} {PARAM}"` settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct MetadataMap {
    entries: BTreeMap<String, ParameterValue>,
}

impl MetadataMap {
    /// Create an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata key for one instrument parameter.
    pub fn key(instrument: &str, parameter: &str) -> String {
        format!("{} {}", instrument, parameter.to_uppercase())
    }

    /// Fold an instrument's confirmed parameters in, overwriting older values.
    pub fn fold(&mut self, instrument: &str, parameters: &ParameterMap) {
        for (name, value) in parameters {
            self.entries
                .insert(Self::key(instrument, name), value.clone());
        }
    }

    /// Value recorded under a flattened key.
    pub fn get(&self, key: &str) -> Option<&ParameterValue> {
        self.entries.get(key)
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.entries.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every recorded setting.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parameters;

    #[test]
    fn test_fold_flattens_and_overwrites() {
        let mut metadata = MetadataMap::new();
        metadata.fold("cs260", &parameters([("wavelength", 0.7), ("grating", 1.0)]));
        metadata.fold("cs260", &parameters([("wavelength", 0.8)]));
        metadata.fold("ndf", &parameters([("position", 2i64)]));

        assert_eq!(metadata.len(), 3);
        assert_eq!(
            metadata.get("cs260 WAVELENGTH"),
            Some(&ParameterValue::Float(0.8))
        );
        assert_eq!(metadata.get("ndf POSITION"), Some(&ParameterValue::Int(2)));
    }

    #[test]
    fn test_serializes_as_plain_map() {
        let mut metadata = MetadataMap::new();
        metadata.fold("ndf", &parameters([("position", 2i64)]));
        assert_eq!(
            serde_json::to_string(&metadata).unwrap(),
            r#"{"ndf POSITION":2}"#
        );
    }
}
