//! Sequence files: the operator-facing text form of a [`SequenceSpec`].
//!
//! ```text
//! [Sequence Info]
//! sequence name = "visible"
//!
//! [Measure]
//! sample_time = 0.5
//! instruments = ["lockin"]
//!
//! [cs260]
//! kind = "sweep"
//! start = 0.5
//! stop = 1.0
//! step = 0.1
//! ```
//!
//! Every value is a JSON literal so numbers, strings, lists and tables keep their
//! type. Lines starting with `#` or `;` are comments and are dropped on load.
//! A file written by [`SequenceFile::render`] parses back to the same text.

use crate::error::{AppResult, SequencerError};
use crate::sequencer::{MeasureSpec, SequenceSpec, SubsystemSpec};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Section holding the sequence name.
pub const INFO_SECTION: &str = "Sequence Info";
/// Key of the name in the info section.
pub const NAME_KEY: &str = "sequence name";
/// Section holding the measurement settings.
pub const MEASURE_SECTION: &str = "Measure";
/// Extension picked up by [`load_series`].
pub const EXTENSION: &str = "seq";

/// One `[section]` with its entries in file order. Values are kept as raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Name
    pub name: String,
    /// `key = value` pairs in file order
    pub entries: Vec<(String, String)>,
}

impl Section {
    /// Empty section.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Vec::new(),
        }
    }

    /// Raw value of `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn push_value(&mut self, key: &str, value: &Value) -> AppResult<()> {
        self.entries
            .push((key.to_string(), serde_json::to_string(value)?));
        Ok(())
    }

    fn to_object(&self) -> AppResult<Map<String, Value>> {
        let mut object = Map::new();
        for (key, raw) in &self.entries {
            let value = serde_json::from_str(raw).map_err(|e| SequencerError::SequenceFile {
                line: 0,
                message: format!("[{}] {}: {}", self.name, key, e),
            })?;
            object.insert(key.clone(), value);
        }
        Ok(object)
    }
}

/// Parsed sequence file, sections in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequenceFile {
    /// Sections in file order
    pub sections: Vec<Section>,
}

impl SequenceFile {
    /// Parse the text format. Errors carry the 1-based line number.
    pub fn parse(text: &str) -> AppResult<Self> {
        let mut file = Self::default();
        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(header) = line.strip_prefix('[') {
                let name = header.strip_suffix(']').ok_or_else(|| SequencerError::SequenceFile {
                    line: index + 1,
                    message: format!("unterminated section header '{}'", line),
                })?;
                let name = name.trim();
                if file.section(name).is_some() {
                    return Err(SequencerError::SequenceFile {
                        line: index + 1,
                        message: format!("section '{}' appears twice", name),
                    });
                }
                file.sections.push(Section::new(name));
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| SequencerError::SequenceFile {
                line: index + 1,
                message: format!("expected 'key = value', got '{}'", line),
            })?;
            let section = file.sections.last_mut().ok_or_else(|| SequencerError::SequenceFile {
                line: index + 1,
                message: "entry outside of any section".to_string(),
            })?;
            section
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(file)
    }

    /// Render back to text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (index, section) in self.sections.iter().enumerate() {
            if index > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "[{}]", section.name);
            for (key, value) in &section.entries {
                let _ = writeln!(out, "{} = {}", key, value);
            }
        }
        out
    }

    /// Section named `name`, if present.
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    /// Encode a sequence, one section per subsystem.
    pub fn from_spec(spec: &SequenceSpec) -> AppResult<Self> {
        let mut info = Section::new(INFO_SECTION);
        info.push_value(NAME_KEY, &Value::String(spec.name.clone()))?;
        let mut sections = vec![info, object_section(MEASURE_SECTION, &spec.measure)?];
        for (instrument, subsystem) in &spec.subsystems {
            sections.push(object_section(instrument, subsystem)?);
        }
        Ok(Self { sections })
    }

    /// Decode into a sequence.
    pub fn to_spec(&self) -> AppResult<SequenceSpec> {
        let info = self.section(INFO_SECTION).ok_or_else(|| SequencerError::SequenceFile {
            line: 0,
            message: format!("missing [{}] section", INFO_SECTION),
        })?;
        let name = match info.to_object()?.remove(NAME_KEY) {
            Some(Value::String(name)) => name,
            _ => {
                return Err(SequencerError::SequenceFile {
                    line: 0,
                    message: format!("[{}] needs a string '{}'", INFO_SECTION, NAME_KEY),
                })
            }
        };

        let mut measure = MeasureSpec::default();
        let mut subsystems = BTreeMap::new();
        for section in &self.sections {
            match section.name.as_str() {
                INFO_SECTION => {}
                MEASURE_SECTION => {
                    measure = serde_json::from_value(Value::Object(section.to_object()?))?;
                }
                instrument => {
                    let spec: SubsystemSpec =
                        serde_json::from_value(Value::Object(section.to_object()?))?;
                    subsystems.insert(instrument.to_string(), spec);
                }
            }
        }

        Ok(SequenceSpec {
            name,
            subsystems,
            measure,
        })
    }
}

fn object_section<T: serde::Serialize>(name: &str, value: &T) -> AppResult<Section> {
    let mut section = Section::new(name);
    if let Value::Object(fields) = serde_json::to_value(value)? {
        for (key, value) in fields.iter().filter(|(_, v)| !v.is_null()) {
            section.push_value(key, value)?;
        }
    }
    Ok(section)
}

/// Read one sequence file.
pub fn load(path: &Path) -> AppResult<SequenceSpec> {
    let text = fs::read_to_string(path)?;
    let spec = SequenceFile::parse(&text)?.to_spec()?;
    debug!(path = %path.display(), sequence = %spec.name, "Sequence file loaded");
    Ok(spec)
}

/// Write one sequence file, creating parent directories.
pub fn save(path: &Path, spec: &SequenceSpec) -> AppResult<()> {
    fs::write(path, SequenceFile::from_spec(spec)?.render())?;
    Ok(())
}

/// Load every `.seq` file in `dir` as one series, in file-name order.
pub fn load_series(dir: &Path) -> AppResult<Vec<SequenceSpec>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map_or(false, |ext| ext == EXTENSION))
        .collect();
    paths.sort();

    let series = paths
        .iter()
        .map(|path| load(path))
        .collect::<AppResult<Vec<_>>>()?;
    info!(dir = %dir.display(), sequences = series.len(), "Series loaded");
    Ok(series)
}
