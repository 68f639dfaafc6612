//! The receiving side of the sync protocol.
//!
//! A [`PeerStore`] keeps pushed recordings under a root directory laid out
//! like the producer's: `<root>/<id>/recording.json` plus slice files. It
//! checks every slice upload against the write pointers declared by the
//! last metadata push:
//!
//! * partial uploads must start at or before the bytes already held (a
//!   resend overwrites the overlap) and may not run past the declared size;
//! * full raw uploads must match the declared size exactly;
//! * full compressed uploads must decompress to the declared size, and
//!   replace the raw file.
//!
//! An HTTP front end maps the routes of [`super::transport`] onto it;
//! [`LocalTransport`] calls it in-process.

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::TransferError;
use crate::repository::{import_record, JsonFileRepository, Repository};
use crate::slice::{Compression, Slice, SlicePayload};
use crate::sync::transport::{PulledSlice, Transport};

fn status(status: u16, message: impl Into<String>) -> TransferError {
    TransferError::Status { status, message: message.into() }
}

fn internal(err: impl std::fmt::Display) -> TransferError {
    status(500, err.to_string())
}

/// Splits `<hash>.bin[.<ext>]`.
fn parse_filename(filename: &str) -> Result<(&str, Option<Compression>), TransferError> {
    let bad = || status(400, format!("bad slice file name '{}'", filename));
    let (hash, rest) = filename.split_once(".bin").ok_or_else(bad)?;
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(bad());
    }
    match rest {
        "" => Ok((hash, None)),
        ext => {
            let ext = ext.strip_prefix('.').ok_or_else(bad)?;
            Compression::from_extension(ext).map(|c| (hash, Some(c))).ok_or_else(bad)
        }
    }
}

/// The slice `hash` as declared in pushed metadata.
fn declared_slice(metadata: &Value, hash: &str) -> Option<Slice> {
    let columns = metadata.get("columns")?.as_object()?;
    let found = columns
        .values()
        .flat_map(|column| {
            ["value_slices", "time_slices"]
                .into_iter()
                .filter_map(move |axis| column.get(axis).and_then(Value::as_array))
                .flatten()
        })
        .find(|slice| slice.get("hash").and_then(Value::as_str) == Some(hash))?;
    import_record::<Slice>(found.clone()).ok().map(|(slice, _)| slice)
}

/// Directory-backed receiver of pushed recordings.
#[derive(Debug)]
pub struct PeerStore {
    root: PathBuf,
    repository: JsonFileRepository,
    lock: Mutex<()>,
}

impl PeerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self { repository: JsonFileRepository::new(&root), root, lock: Mutex::new(()) }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Stores `metadata` as the current declaration for `id`.
    pub fn receive_metadata(&self, id: &str, metadata: &Value) -> Result<(), TransferError> {
        let Value::Object(fields) = metadata else {
            return Err(status(400, "metadata must be a JSON object"));
        };
        if fields.get("id").and_then(Value::as_str) != Some(id) {
            return Err(status(400, format!("metadata does not describe recording '{}'", id)));
        }
        let _held = self.lock.lock();
        self.repository.save(id, fields.clone()).map_err(internal)?;
        debug!(id, "Received metadata");
        Ok(())
    }

    /// Applies one slice upload.
    pub fn receive_slice(&self, id: &str, payload: &SlicePayload) -> Result<(), TransferError> {
        let _held = self.lock.lock();
        let metadata = self
            .repository
            .load(id)
            .map_err(internal)?
            .ok_or_else(|| status(404, format!("no metadata for recording '{}'", id)))?;
        let (hash, compression) = parse_filename(&payload.filename)?;
        let declared = declared_slice(&metadata, hash)
            .ok_or_else(|| status(409, format!("slice {} is not declared by the metadata", hash)))?;
        let declared_size = declared.raw_size();

        let dir = self.dir(id);
        fs::create_dir_all(&dir).map_err(internal)?;
        let path = dir.join(&payload.filename);

        if payload.partial {
            if compression.is_some() {
                return Err(status(400, "partial uploads must be raw"));
            }
            let held = fs::metadata(&path).map(|m| m.len() as usize).unwrap_or(0);
            if payload.offset > held {
                return Err(status(
                    409,
                    format!("gap in slice {}: offset {} beyond the {} bytes held", hash, payload.offset, held),
                ));
            }
            let end = payload.offset + payload.bytes.len();
            if end > declared_size {
                return Err(status(
                    409,
                    format!("slice {} overrun: {} bytes beyond the declared {}", hash, end, declared_size),
                ));
            }
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)
                .map_err(internal)?;
            file.set_len(payload.offset as u64).map_err(internal)?;
            file.seek(SeekFrom::Start(payload.offset as u64)).map_err(internal)?;
            file.write_all(&payload.bytes).map_err(internal)?;
            file.sync_data().map_err(internal)?;
            debug!(id, slice = hash, offset = payload.offset, end, "Received partial slice");
            return Ok(());
        }

        let raw_len = match compression {
            None => payload.bytes.len(),
            Some(c) => c.decompress(&payload.bytes).map_err(|e| status(422, e.to_string()))?.len(),
        };
        if raw_len != declared_size {
            return Err(status(
                409,
                format!("slice {} holds {} bytes, {} declared", hash, raw_len, declared_size),
            ));
        }
        let tmp = dir.join(format!("{}.tmp", payload.filename));
        {
            let mut file = fs::File::create(&tmp).map_err(internal)?;
            file.write_all(&payload.bytes).map_err(internal)?;
            file.sync_all().map_err(internal)?;
        }
        fs::rename(&tmp, &path).map_err(internal)?;
        if compression.is_some() {
            let raw = dir.join(format!("{}.bin", hash));
            if raw.exists() {
                fs::remove_file(raw).map_err(internal)?;
            }
        }
        info!(id, file = %payload.filename, bytes = payload.bytes.len(), "Received slice");
        Ok(())
    }

    pub fn metadata(&self, id: &str) -> Result<Value, TransferError> {
        self.repository
            .load(id)
            .map_err(internal)?
            .ok_or_else(|| status(404, format!("no recording '{}'", id)))
    }

    /// The stored file of slice `hash`, compressed if it was replaced.
    pub fn slice(&self, id: &str, hash: &str) -> Result<PulledSlice, TransferError> {
        let _held = self.lock.lock();
        let dir = self.dir(id);
        let prefix = format!("{}.bin", hash);
        let mut found: Option<String> = None;
        if dir.exists() {
            for entry in fs::read_dir(&dir).map_err(internal)? {
                let name = entry.map_err(internal)?.file_name().to_string_lossy().into_owned();
                if !name.starts_with(&prefix) || name.ends_with(".tmp") {
                    continue;
                }
                // A compressed file wins over a leftover raw one.
                if found.as_deref().map_or(true, |f| f.len() < name.len()) {
                    found = Some(name);
                }
            }
        }
        let filename = found.ok_or_else(|| status(404, format!("no slice {} for '{}'", hash, id)))?;
        let bytes = fs::read(dir.join(&filename)).map_err(internal)?;
        Ok(PulledSlice { filename, bytes })
    }

    /// Forgets a recording entirely.
    pub fn remove(&self, id: &str) -> Result<bool, TransferError> {
        let _held = self.lock.lock();
        let dir = self.dir(id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir).map_err(internal)?;
        Ok(true)
    }
}

/// [`Transport`] that hands every call to an in-process [`PeerStore`].
#[derive(Debug, Clone)]
pub struct LocalTransport {
    store: Arc<PeerStore>,
}

impl LocalTransport {
    pub fn new(store: Arc<PeerStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<PeerStore> {
        &self.store
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn push_metadata(&self, id: &str, metadata: &Value) -> Result<(), TransferError> {
        self.store.receive_metadata(id, metadata)
    }

    async fn push_slice(&self, id: &str, payload: &SlicePayload) -> Result<(), TransferError> {
        self.store.receive_slice(id, payload)
    }

    async fn pull_metadata(&self, id: &str) -> Result<Value, TransferError> {
        self.store.metadata(id)
    }

    async fn pull_slice(&self, id: &str, hash: &str) -> Result<PulledSlice, TransferError> {
        self.store.slice(id, hash)
    }
}
