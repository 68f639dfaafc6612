//! Storage slices: the atomic, append-only unit of the storage engine.
//!
//! A slice holds one contiguous run of same-typed samples of one quantity,
//! either its values or its time axis. Samples are buffered in memory and
//! written to a backing file (`<hash>.bin`) on flush. Once the slice reaches
//! its byte capacity the owning column switches to a fresh slice, much like
//! a double-buffered log writer switching buffers once the active one fills.
//!
//! # Status progression
//!
//! ```text
//! open ──► full ──► finally analyzed ──► compressed ──► sent
//!                                         ▲               ▲
//!                 (container closed) ─────┴───────────────┘
//! ```
//!
//! * `full`: the capacity is reached; appends are refused.
//! * `finally_analyzed`: full and folded into the statistics; the decoded
//!   buffer may be released.
//! * `compressed`: the raw file was replaced by `<hash>.bin.<ext>`. Only
//!   allowed when full or once the container is closed.
//! * `sent`: fully transmitted. Reachable when full or the container is
//!   closed; compression clears it, as the compressed bytes must be sent again.
//!
//! # Pointers
//!
//! * `write_pointer`: samples durably on disk.
//! * `analyze_pointer`: samples folded into the running statistics.
//! * `send_pointer`: raw bytes the receiving peer has confirmed.
//!
//! # Append modes
//!
//! [`Slice::append`] buffers decoded values; [`Slice::append_raw`] buffers
//! pre-encoded device bytes. A slice uses exactly one of the two.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::codec::{decode_values, encode_values, DType};
use crate::config::Role;
use crate::error::{Error, Result};
use crate::stats::Running;

/// Which axis of a column a slice belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    Value,
    Time,
}

/// Compression applied to a full slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// LZ4 block with the raw size prepended (lz4_flex). Ignores the level.
    Lz4,
    /// LZ4 frame format with a compression level (lz4).
    Lz4Frame,
}

impl Compression {
    /// File-name suffix after `.bin.`.
    pub fn extension(self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Lz4Frame => "lz4f",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "lz4" => Some(Compression::Lz4),
            "lz4f" => Some(Compression::Lz4Frame),
            _ => None,
        }
    }

    pub fn compress(self, raw: &[u8], level: u32) -> Result<Vec<u8>> {
        match self {
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(raw)),
            Compression::Lz4Frame => {
                let mut encoder = lz4::EncoderBuilder::new().level(level).build(Vec::new())?;
                encoder.write_all(raw)?;
                let (out, result) = encoder.finish();
                result?;
                Ok(out)
            }
        }
    }

    pub fn decompress(self, packed: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Lz4 => lz4_flex::decompress_size_prepended(packed)
                .map_err(|e| Error::Codec(format!("lz4 block: {}", e))),
            Compression::Lz4Frame => {
                let mut decoder = lz4::Decoder::new(packed)?;
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

/// The container-level state a slice operation needs.
#[derive(Debug, Clone, Copy)]
pub struct SliceIo<'a> {
    /// Directory holding the recording's slice files.
    pub dir: &'a Path,
    pub role: Role,
    /// False once the container recorded a consistency fault.
    pub consistent: bool,
    /// The container is closed: compression and full sends are allowed for
    /// slices that never filled up.
    pub closed: bool,
    pub reclaim_memory: bool,
}

/// Result of [`Slice::analyze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzeOutcome {
    /// New samples were folded into the statistics.
    Analyzed,
    /// Already finally analyzed; nothing to do.
    Skipped,
    /// Binary slice not yet full or not yet flushed; statistics postponed.
    Deferred,
}

/// Result of [`Slice::compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressOutcome {
    Compressed { raw: usize, compressed: usize },
    /// Already compressed with the requested algorithm.
    AlreadyCompressed,
    /// Already compressed with another algorithm; nothing was changed.
    Conflict { existing: Compression },
    /// Neither full nor closed, or empty.
    NotEligible,
}

/// Bytes of a slice ready to be transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePayload {
    pub hash: String,
    pub filename: String,
    pub partial: bool,
    /// Byte offset of `bytes` in the raw file; zero for full payloads.
    pub offset: usize,
    pub bytes: Vec<u8>,
    /// The slice's `send_pointer` once the peer confirms this payload.
    pub send_pointer_after: usize,
}

/// One fixed-capacity binary buffer of a column's value or time axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Slice {
    hash: String,
    quantity: String,
    axis: Axis,
    dtype: DType,
    /// Capacity in bytes.
    capacity: usize,
    write_pointer: usize,
    analyze_pointer: usize,
    send_pointer: usize,
    full: bool,
    finally_analyzed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compressed: Option<Compression>,
    sent: bool,
    /// Raw binary fast path in use.
    binary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_start: Option<f64>,
    stats: Running,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    compressed_size: Option<usize>,

    #[serde(skip)]
    pending: Vec<f64>,
    #[serde(skip)]
    pending_bytes: Vec<u8>,
    /// Decoded view of every sample, flushed or not. `None` until loaded.
    #[serde(skip)]
    cache: Option<Vec<f64>>,
    #[serde(skip)]
    inconsistent: bool,
}

impl Slice {
    /// Creates an empty, open slice. No file exists until the first flush.
    pub fn new(hash: String, quantity: &str, axis: Axis, dtype: DType, capacity: usize) -> Self {
        Self {
            hash,
            quantity: quantity.to_string(),
            axis,
            dtype,
            capacity,
            write_pointer: 0,
            analyze_pointer: 0,
            send_pointer: 0,
            full: false,
            finally_analyzed: false,
            compressed: None,
            sent: false,
            binary: false,
            time_start: None,
            stats: Running::default(),
            compressed_size: None,
            pending: Vec::new(),
            pending_bytes: Vec::new(),
            cache: Some(Vec::new()),
            inconsistent: false,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn quantity(&self) -> &str {
        &self.quantity
    }

    pub fn axis(&self) -> Axis {
        self.axis
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn capacity_samples(&self) -> usize {
        self.dtype.samples_per_slice(self.capacity)
    }

    /// Samples held, flushed or not.
    pub fn len(&self) -> usize {
        self.write_pointer + self.pending_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn remaining(&self) -> usize {
        self.capacity_samples().saturating_sub(self.len())
    }

    fn pending_len(&self) -> usize {
        if self.binary {
            self.pending_bytes.len() / self.dtype.size()
        } else {
            self.pending.len()
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending_len() > 0
    }

    pub fn write_pointer(&self) -> usize {
        self.write_pointer
    }

    pub fn analyze_pointer(&self) -> usize {
        self.analyze_pointer
    }

    pub fn send_pointer(&self) -> usize {
        self.send_pointer
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_finally_analyzed(&self) -> bool {
        self.finally_analyzed
    }

    pub fn compression(&self) -> Option<Compression> {
        self.compressed
    }

    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    pub fn is_loaded(&self) -> bool {
        self.cache.is_some()
    }

    pub fn time_start(&self) -> Option<f64> {
        self.time_start
    }

    pub(crate) fn set_time_start_if_unset(&mut self, time: f64) {
        if self.time_start.is_none() {
            self.time_start = Some(time);
        }
    }

    pub fn stats(&self) -> &Running {
        &self.stats
    }

    /// Bytes flushed to the raw form. Unaffected by compression.
    pub fn raw_size(&self) -> usize {
        self.write_pointer * self.dtype.size()
    }

    pub fn compressed_size(&self) -> Option<usize> {
        self.compressed_size
    }

    /// Name of the current backing file.
    pub fn file_name(&self) -> String {
        match self.compressed {
            None => format!("{}.bin", self.hash),
            Some(c) => format!("{}.bin.{}", self.hash, c.extension()),
        }
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    fn raw_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}.bin", self.hash))
    }

    pub fn file_exists(&self, dir: &Path) -> bool {
        self.path(dir).exists()
    }

    /// Whether [`Slice::append`] would accept a sample.
    pub fn check_value_append(&self) -> Result<()> {
        self.check_appendable()?;
        if self.binary {
            return Err(Error::InvalidInput(format!("slice {} holds raw binary samples", self.hash)));
        }
        Ok(())
    }

    fn check_appendable(&self) -> Result<()> {
        if self.compressed.is_some() {
            return Err(Error::InvalidInput(format!("slice {} is compressed", self.hash)));
        }
        if self.full {
            return Err(Error::InvalidInput(format!("slice {} is full", self.hash)));
        }
        if self.inconsistent {
            return Err(Error::Inconsistent(format!("slice {}", self.hash)));
        }
        Ok(())
    }

    fn update_full(&mut self) {
        if self.len() >= self.capacity_samples() {
            self.full = true;
        }
    }

    /// Buffers one decoded sample.
    ///
    /// The value must already be cast to the slice's element type.
    pub fn append(&mut self, value: f64) -> Result<()> {
        self.check_value_append()?;
        self.pending.push(value);
        if let Some(cache) = self.cache.as_mut() {
            cache.push(value);
        }
        self.update_full();
        Ok(())
    }

    /// Buffers pre-encoded samples and returns how many were added.
    ///
    /// Marks the slice as binary and drops any cached decoded view, which is
    /// rebuilt lazily by [`Slice::load`].
    pub fn append_raw(&mut self, bytes: &[u8]) -> Result<usize> {
        self.check_appendable()?;
        if !self.binary && !self.is_empty() {
            return Err(Error::InvalidInput(format!("slice {} already holds decoded samples", self.hash)));
        }
        let size = self.dtype.size();
        if bytes.len() % size != 0 {
            return Err(Error::InvalidInput(format!(
                "{} bytes is not a whole number of {} samples",
                bytes.len(),
                self.dtype
            )));
        }
        let samples = bytes.len() / size;
        if samples > self.remaining() {
            return Err(Error::InvalidInput(format!(
                "{} samples exceed the {} remaining in slice {}",
                samples,
                self.remaining(),
                self.hash
            )));
        }

        self.binary = true;
        self.pending_bytes.extend_from_slice(bytes);
        self.cache = None;
        self.update_full();
        Ok(samples)
    }

    /// Writes unwritten samples to the backing file and returns how many.
    ///
    /// # Errors
    ///
    /// * [`Error::Inconsistent`] if the container is marked inconsistent.
    /// * [`Error::Consistency`] if the file length disagrees with the write
    ///   pointer afterwards. The slice then refuses further writes.
    pub fn flush(&mut self, io: &SliceIo) -> Result<usize> {
        if !io.consistent || self.inconsistent {
            return Err(Error::Inconsistent(format!("slice {}", self.hash)));
        }
        if !self.has_pending() {
            return Ok(0);
        }
        if self.compressed.is_some() {
            return Err(Error::InvalidInput(format!("slice {} is compressed", self.hash)));
        }

        let encoded;
        let bytes: &[u8] = if self.binary {
            &self.pending_bytes
        } else {
            encoded = encode_values(&self.pending, self.dtype);
            &encoded.bytes
        };
        let samples = bytes.len() / self.dtype.size();

        fs::create_dir_all(io.dir)?;
        let mut file = OpenOptions::new().create(true).append(true).open(self.raw_path(io.dir))?;
        file.write_all(bytes)?;
        file.sync_data()?;
        let on_disk = file.metadata()?.len() as usize;

        self.write_pointer += samples;
        self.pending.clear();
        self.pending_bytes.clear();

        let expected = self.raw_size();
        if on_disk != expected {
            self.inconsistent = true;
            error!(
                slice = %self.hash,
                expected_bytes = expected,
                on_disk_bytes = on_disk,
                "Slice file length disagrees with write pointer"
            );
            return Err(Error::Consistency {
                context: format!("slice {}", self.hash),
                expected: self.write_pointer,
                found: on_disk / self.dtype.size(),
            });
        }

        debug!(slice = %self.hash, samples, write_pointer = self.write_pointer, "Flushed slice");
        Ok(samples)
    }

    fn read_disk(&self, dir: &Path) -> Result<Vec<u8>> {
        let path = self.path(dir);
        if self.write_pointer == 0 && !path.exists() {
            return Ok(Vec::new());
        }
        let stored = fs::read(&path)?;
        match self.compressed {
            Some(c) => c.decompress(&stored),
            None => Ok(stored),
        }
    }

    /// Decodes the backing file on first use and returns every sample.
    ///
    /// # Errors
    ///
    /// [`Error::Consistency`] on the producer side if the decoded length
    /// differs from the write pointer. A consumer logs a warning and keeps
    /// whatever could be decoded.
    pub fn load(&mut self, io: &SliceIo) -> Result<&[f64]> {
        if self.cache.is_none() {
            let disk = self.read_disk(io.dir)?;
            let whole = disk.len() / self.dtype.size() * self.dtype.size();
            let mut values = decode_values(&disk[..whole], self.dtype)?;

            if values.len() != self.write_pointer || whole != disk.len() {
                match io.role {
                    Role::Producer => {
                        self.inconsistent = true;
                        error!(
                            slice = %self.hash,
                            expected = self.write_pointer,
                            found = values.len(),
                            "Decoded sample count disagrees with write pointer"
                        );
                        return Err(Error::Consistency {
                            context: format!("slice {}", self.hash),
                            expected: self.write_pointer,
                            found: values.len(),
                        });
                    }
                    Role::Consumer => warn!(
                        slice = %self.hash,
                        expected = self.write_pointer,
                        found = values.len(),
                        "Decoded sample count disagrees with write pointer, keeping decoded data"
                    ),
                }
            }

            if self.binary {
                values.extend(decode_values(&self.pending_bytes, self.dtype)?);
            } else {
                values.extend_from_slice(&self.pending);
            }
            self.cache = Some(values);
        }
        Ok(self.cache.as_deref().unwrap_or(&[]))
    }

    /// Samples `[start, end)`, clipped to what is available.
    pub fn values_in(&mut self, io: &SliceIo, start: usize, end: usize) -> Result<Vec<f64>> {
        let values = self.load(io)?;
        let end = end.min(values.len());
        let start = start.min(end);
        Ok(values[start..end].to_vec())
    }

    /// Highest sample value. Uses the running statistics when they cover
    /// every sample, and decodes the slice otherwise.
    pub fn max_value(&mut self, io: &SliceIo) -> Result<Option<f64>> {
        if self.analyze_pointer == self.len() && self.stats.count > 0 {
            return Ok(self.stats.max);
        }
        let values = self.load(io)?;
        Ok(values.iter().copied().reduce(f64::max))
    }

    /// Folds unanalyzed samples into the running statistics.
    ///
    /// `keep_values` is set for quantities whose later statistics need the
    /// decoded samples; otherwise a finally-analyzed slice drops its decoded
    /// buffer when the container reclaims memory.
    pub fn analyze(&mut self, io: &SliceIo, keep_values: bool) -> Result<AnalyzeOutcome> {
        if self.finally_analyzed {
            return Ok(AnalyzeOutcome::Skipped);
        }
        // Raw slices are decoded once, when they can no longer grow.
        if self.binary && ((!self.full && !io.closed) || !self.pending_bytes.is_empty()) {
            return Ok(AnalyzeOutcome::Deferred);
        }

        let len = self.len();
        if self.analyze_pointer < len {
            let from = self.analyze_pointer;
            self.load(io)?;
            if let Some(cache) = self.cache.as_ref() {
                let to = len.min(cache.len());
                self.stats.fold(&cache[from.min(to)..to]);
            }
            self.analyze_pointer = len;
        }

        if self.full {
            self.finally_analyzed = true;
            if io.reclaim_memory && !keep_values {
                self.release_memory();
            }
        }
        Ok(AnalyzeOutcome::Analyzed)
    }

    /// Drops the decoded buffer. Only finally-analyzed slices with nothing
    /// pending may release it.
    pub fn release_memory(&mut self) -> bool {
        if self.finally_analyzed && !self.has_pending() && self.cache.is_some() {
            self.cache = None;
            true
        } else {
            false
        }
    }

    /// Replaces the raw backing file with a compressed one.
    ///
    /// The compressed file is written and synced under a temporary name,
    /// renamed into place, and only then is the raw file removed. A
    /// successful compression clears `sent`.
    pub fn compress(&mut self, io: &SliceIo, algorithm: Compression, level: u32) -> Result<CompressOutcome> {
        match self.compressed {
            Some(existing) if existing == algorithm => return Ok(CompressOutcome::AlreadyCompressed),
            Some(existing) => {
                error!(
                    slice = %self.hash,
                    existing = existing.extension(),
                    requested = algorithm.extension(),
                    "Refusing to compress slice with a different algorithm"
                );
                return Ok(CompressOutcome::Conflict { existing });
            }
            None => {}
        }
        if !(self.full || io.closed) {
            return Ok(CompressOutcome::NotEligible);
        }
        self.flush(io)?;
        if self.write_pointer == 0 {
            return Ok(CompressOutcome::NotEligible);
        }

        let raw_path = self.raw_path(io.dir);
        let raw = fs::read(&raw_path)?;
        if raw.len() != self.raw_size() {
            self.inconsistent = true;
            return Err(Error::Consistency {
                context: format!("slice {}", self.hash),
                expected: self.write_pointer,
                found: raw.len() / self.dtype.size(),
            });
        }
        let packed = algorithm.compress(&raw, level)?;

        let final_path = io.dir.join(format!("{}.bin.{}", self.hash, algorithm.extension()));
        let tmp_path = io.dir.join(format!("{}.bin.{}.tmp", self.hash, algorithm.extension()));
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(&packed)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        fs::remove_file(&raw_path)?;

        self.compressed = Some(algorithm);
        self.compressed_size = Some(packed.len());
        self.sent = false;
        debug!(slice = %self.hash, raw = raw.len(), compressed = packed.len(), "Compressed slice");
        Ok(CompressOutcome::Compressed { raw: raw.len(), compressed: packed.len() })
    }

    /// Adopts the form a pulled file arrived in.
    pub(crate) fn set_received_form(&mut self, compression: Option<Compression>, stored_size: usize) {
        self.compressed = compression;
        self.compressed_size = compression.map(|_| stored_size);
        self.cache = None;
    }

    /// Flushed raw bytes the peer has not confirmed yet.
    ///
    /// `None` once compressed (partial sends are no longer allowed), when
    /// already sent, or when nothing new was flushed.
    pub fn partial_payload(&self, io: &SliceIo) -> Result<Option<SlicePayload>> {
        if self.compressed.is_some() || self.sent {
            return Ok(None);
        }
        let flushed = self.raw_size();
        if self.send_pointer >= flushed {
            return Ok(None);
        }

        let mut file = File::open(self.raw_path(io.dir))?;
        file.seek(SeekFrom::Start(self.send_pointer as u64))?;
        let mut bytes = vec![0u8; flushed - self.send_pointer];
        file.read_exact(&mut bytes)?;

        Ok(Some(SlicePayload {
            hash: self.hash.clone(),
            filename: format!("{}.bin", self.hash),
            partial: true,
            offset: self.send_pointer,
            bytes,
            send_pointer_after: flushed,
        }))
    }

    /// The whole backing file, once the slice is eligible for a full send.
    pub fn full_payload(&self, io: &SliceIo) -> Result<Option<SlicePayload>> {
        if self.sent || !(self.full || io.closed) || self.write_pointer == 0 || self.has_pending() {
            return Ok(None);
        }
        let bytes = fs::read(self.path(io.dir))?;
        Ok(Some(SlicePayload {
            hash: self.hash.clone(),
            filename: self.file_name(),
            partial: false,
            offset: 0,
            bytes,
            send_pointer_after: self.raw_size(),
        }))
    }

    /// Records a payload the peer accepted.
    ///
    /// `sent` is only set when the slice can no longer grow: it is full or
    /// the container is closed, and every flushed byte is confirmed.
    pub fn confirm_transfer(&mut self, payload: &SlicePayload, closed: bool) {
        if payload.partial {
            if self.compressed.is_some() {
                warn!(slice = %self.hash, "Ignoring partial confirmation for a compressed slice");
                return;
            }
            self.send_pointer = self.send_pointer.max(payload.send_pointer_after);
        } else {
            if payload.filename != self.file_name() {
                warn!(
                    slice = %self.hash,
                    sent = %payload.filename,
                    current = %self.file_name(),
                    "Slice changed form while being sent, keeping it unsent"
                );
                return;
            }
            self.send_pointer = payload.send_pointer_after;
        }

        let complete = self.send_pointer >= self.raw_size() && !self.has_pending();
        if complete && (self.full || closed) {
            self.sent = true;
        }
    }
}

/// Hashes already used by slices of one recording.
#[derive(Debug, Default, Clone)]
pub struct SliceHashes {
    taken: HashSet<String>,
}

impl SliceHashes {
    /// Registers an existing hash; false if it was already taken.
    pub fn insert(&mut self, hash: &str) -> bool {
        self.taken.insert(hash.to_string())
    }

    /// A fresh 8-character hex hash unique within the recording.
    pub fn generate(&mut self) -> String {
        loop {
            let hash = format!("{:08x}", rand::random::<u32>());
            if self.taken.insert(hash.clone()) {
                return hash;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.taken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }
}
