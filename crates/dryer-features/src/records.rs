//! Read access to the dryer log and to external validation documents.

use std::fs;
use std::path::{Path, PathBuf};

use dryer_core::{Error, ProductionRecord, Result, ValidationEntry};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

/// The append-only dryer log, a JSON array of timestamped snapshots.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    path: PathBuf,
    records: Vec<ProductionRecord>,
}

impl RecordStore {
    /// Loads the log; a missing file yields an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            warn!(path = %path.display(), "dryer log not found, starting empty");
            return Ok(Self {
                path,
                records: Vec::new(),
            });
        }

        let records = read_array(&path)?;
        info!(path = %path.display(), records = records.len(), "loaded dryer log");
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn latest(&self) -> Option<&ProductionRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[ProductionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn append(&mut self, record: ProductionRecord) {
        self.records.push(record);
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&self.records)?)?;
        Ok(())
    }
}

/// Loads an external validation document.
pub fn load_validation_entries(path: &Path) -> Result<Vec<ValidationEntry>> {
    let entries: Vec<ValidationEntry> = read_array(path)?;
    if entries.is_empty() {
        return Err(Error::InsufficientData(format!(
            "validation file {} has no entries",
            path.display()
        )));
    }
    Ok(entries)
}

/// Reads a JSON array, skipping elements that do not match `T`.
fn read_array<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let text = fs::read_to_string(path)?;
    let document: Value = serde_json::from_str(&text)?;
    let Value::Array(items) = document else {
        return Err(Error::Serialization(format!(
            "{} must contain a JSON array",
            path.display()
        )));
    };

    let mut parsed = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match serde_json::from_value(item) {
            Ok(value) => parsed.push(value),
            Err(err) => warn!(index, error = %err, "skipping malformed entry"),
        }
    }
    Ok(parsed)
}
