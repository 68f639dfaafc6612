//! Metadata persistence.
//!
//! A [`Repository`] stores one JSON object per recording. Saves are partial:
//! only the changed top-level fields are sent and merged into the stored
//! object, so a chunk update never rewrites unrelated column metadata.
//!
//! [`import_record`] deserializes a record that may come from a peer running
//! another schema version, stripping fields this version does not know.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Passes [`import_record`] makes before abandoning an import.
pub const MAX_IMPORT_PASSES: usize = 8;

/// File name of a recording's metadata inside its directory.
pub const RECORD_FILE: &str = "recording.json";

/// Storage of recording metadata, keyed by recording id.
pub trait Repository: Send + Sync {
    fn load(&self, id: &str) -> Result<Option<Value>>;

    /// Merges `changes` into the stored top-level object, creating it if
    /// needed.
    fn save(&self, id: &str, changes: Map<String, Value>) -> Result<()>;

    /// Returns false if there was nothing to delete.
    fn delete(&self, id: &str) -> Result<bool>;
}

/// In-memory repository, mostly for tests and short-lived consumers.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    records: Mutex<HashMap<String, Map<String, Value>>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Repository for MemoryRepository {
    fn load(&self, id: &str) -> Result<Option<Value>> {
        Ok(self.records.lock().get(id).cloned().map(Value::Object))
    }

    fn save(&self, id: &str, changes: Map<String, Value>) -> Result<()> {
        let mut records = self.records.lock();
        records.entry(id.to_string()).or_default().extend(changes);
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(self.records.lock().remove(id).is_some())
    }
}

/// One `recording.json` per recording, next to its slice files:
/// `<root>/<id>/recording.json`.
///
/// Writes go to a temporary file that is synced and renamed over the old one.
#[derive(Debug)]
pub struct JsonFileRepository {
    root: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), lock: Mutex::new(()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(RECORD_FILE)
    }

    /// Ids of every stored recording, sorted.
    pub fn ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.root.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().join(RECORD_FILE).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        let path = self.path(id);
        if !path.exists() {
            return Ok(None);
        }
        match serde_json::from_slice(&fs::read(&path)?)? {
            Value::Object(map) => Ok(Some(map)),
            _ => Err(Error::Codec(format!("{} does not hold a JSON object", path.display()))),
        }
    }
}

impl Repository for JsonFileRepository {
    fn load(&self, id: &str) -> Result<Option<Value>> {
        let _held = self.lock.lock();
        Ok(self.read(id)?.map(Value::Object))
    }

    fn save(&self, id: &str, changes: Map<String, Value>) -> Result<()> {
        let _held = self.lock.lock();
        let mut record = self.read(id)?.unwrap_or_default();
        record.extend(changes);

        let path = self.path(id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec_pretty(&Value::Object(record))?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        debug!(id, path = %path.display(), "Saved recording metadata");
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let _held = self.lock.lock();
        let path = self.path(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }
}

/// `(unknown field, expected fields)` from serde's unknown-field message.
fn parse_unknown_field(message: &str) -> Option<(String, Vec<String>)> {
    if !message.starts_with("unknown field `") {
        return None;
    }
    let mut quoted = message.split('`').skip(1).step_by(2).map(str::to_string);
    let field = quoted.next()?;
    Some((field, quoted.collect()))
}

/// Removes `field` from every object that looks like an instance of the
/// struct that rejected it: at least half of its other keys are among that
/// struct's `expected` fields.
fn strip_field(value: &mut Value, field: &str, expected: &[String]) -> usize {
    let mut removed = 0;
    match value {
        Value::Object(map) => {
            let (known, unknown) = map
                .keys()
                .filter(|k| k.as_str() != field)
                .fold((0, 0), |(known, unknown), k| {
                    if expected.iter().any(|e| e == k) {
                        (known + 1, unknown)
                    } else {
                        (known, unknown + 1)
                    }
                });
            if map.contains_key(field) && known >= unknown {
                map.remove(field);
                removed += 1;
            }
            for child in map.values_mut() {
                removed += strip_field(child, field, expected);
            }
        }
        Value::Array(items) => {
            for item in items {
                removed += strip_field(item, field, expected);
            }
        }
        _ => {}
    }
    removed
}

/// Deserializes `value`, stripping unknown fields and retrying.
///
/// Each pass removes one unknown field name wherever it appears in an
/// object of the struct that rejected it. After [`MAX_IMPORT_PASSES`] the
/// import is abandoned. Returns the record and the stripped field names.
pub fn import_record<T: DeserializeOwned>(mut value: Value) -> Result<(T, Vec<String>)> {
    let mut stripped = Vec::new();
    for pass in 0..MAX_IMPORT_PASSES {
        let err = match serde_json::from_value::<T>(value.clone()) {
            Ok(record) => {
                if !stripped.is_empty() {
                    warn!(fields = ?stripped, "Imported record after stripping unknown fields");
                }
                return Ok((record, stripped));
            }
            Err(err) => err,
        };
        let Some((field, expected)) = parse_unknown_field(&err.to_string()) else {
            return Err(err.into());
        };
        let removed = strip_field(&mut value, &field, &expected);
        if removed == 0 {
            return Err(err.into());
        }
        debug!(pass, field = %field, removed, "Stripped unknown field");
        stripped.push(field);
    }
    error!(passes = MAX_IMPORT_PASSES, fields = ?stripped, "Abandoning import with unknown fields");
    Err(Error::InvalidInput(format!(
        "import abandoned after {} passes (stripped {:?})",
        MAX_IMPORT_PASSES, stripped
    )))
}
