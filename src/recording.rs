//! The recording container.
//!
//! A [`Recording`] owns the columns of one measurement session, its data
//! chunks, labelled chunks and markers, and coordinates flushing,
//! finalization, compression and persistence of its metadata.
//!
//! There is one writer per recording: every mutating operation takes
//! `&mut self`. Metadata persistence is guarded by a shared
//! [`PersistGuard`]; appends and flushes wait a bounded time for it and
//! fail with [`Error::Busy`] if it stays held.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use slice_recorder::config::RecordingConfig;
//! # use slice_recorder::recording::{Recording, RecordingContext};
//! # use slice_recorder::repository::JsonFileRepository;
//! # fn main() -> slice_recorder::error::Result<()> {
//! let config = RecordingConfig::with_data_dir("/tmp/recordings");
//! let repository = Arc::new(JsonFileRepository::new("/tmp/recordings"));
//! let ctx = RecordingContext::new(config, repository);
//!
//! let mut rec = Recording::create(&ctx)?;
//! rec.set_start_time(chrono::Utc::now())?;
//! rec.append_value("heart_rate", 62.0, 0.0)?;
//! rec.append_combined("acc", &[12.0, -3.0, 980.0], 0.0)?;
//! rec.close()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::chunk::{
    collect_windows, scan_ranges, validate_window, EndBound, FinalizeOutcome, TimeChunk, WindowBound, WindowOutcome,
};
use crate::clock::{Clock, RelativeClock, SystemClock};
use crate::column::{Column, CompressSummary};
use crate::config::{RecordingConfig, Role};
use crate::error::{Error, Result};
use crate::registry::QuantityRegistry;
use crate::repository::{import_record, Repository};
use crate::slice::{SliceHashes, SliceIo, SlicePayload};
use crate::sync::SyncMode;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_LEN: usize = 10;

/// Container-level totals, recomputed by [`Recording::final_analyse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Totals {
    #[serde(default)]
    pub duration: Option<f64>,
    pub sample_count: usize,
    pub raw_size: usize,
    pub compressed_size: usize,
}

/// The persisted form of a recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordingRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub slice_capacity: usize,
    #[serde(default)]
    pub closed: bool,
    #[serde(default = "default_consistent")]
    pub consistent: bool,
    #[serde(default)]
    pub totals: Totals,
    #[serde(default)]
    pub columns: BTreeMap<String, Column>,
    #[serde(default)]
    pub combined: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub data_chunks: Vec<TimeChunk>,
    #[serde(default)]
    pub labelled_chunks: Vec<TimeChunk>,
    #[serde(default)]
    pub markers: Vec<TimeChunk>,
}

fn default_consistent() -> bool {
    true
}

/// Groups of top-level fields written by [`Recording::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaField {
    Times,
    Flags,
    SliceCapacity,
    Totals,
    Columns,
    Combined,
    DataChunks,
    LabelledChunks,
    Markers,
}

impl MetaField {
    pub const ALL: [MetaField; 9] = [
        MetaField::Times,
        MetaField::Flags,
        MetaField::SliceCapacity,
        MetaField::Totals,
        MetaField::Columns,
        MetaField::Combined,
        MetaField::DataChunks,
        MetaField::LabelledChunks,
        MetaField::Markers,
    ];
}

/// Selects a chunk for window reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkRef {
    Data(usize),
    Labelled(usize),
}

/// Held while metadata is being persisted.
#[derive(Debug, Default)]
pub struct PersistGuard {
    busy: AtomicBool,
}

/// Releases the [`PersistGuard`] when dropped.
#[must_use]
#[derive(Debug)]
pub struct PersistTicket<'a> {
    guard: &'a PersistGuard,
}

impl PersistGuard {
    pub fn try_acquire(&self) -> Option<PersistTicket<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| PersistTicket { guard: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Waits up to `attempts × backoff` for the guard to be released.
    pub fn wait_idle(&self, attempts: u32, backoff: Duration) -> bool {
        for _ in 0..attempts {
            if !self.is_busy() {
                return true;
            }
            thread::sleep(backoff);
        }
        !self.is_busy()
    }
}

impl Drop for PersistTicket<'_> {
    fn drop(&mut self) {
        self.guard.busy.store(false, Ordering::Release);
    }
}

/// Everything a recording needs from its environment.
#[derive(Clone)]
pub struct RecordingContext {
    pub config: Arc<RecordingConfig>,
    pub registry: Arc<QuantityRegistry>,
    pub repository: Arc<dyn Repository>,
    pub clock: Arc<dyn Clock>,
}

impl RecordingContext {
    /// Built-in quantity registry and the system clock.
    pub fn new(config: RecordingConfig, repository: Arc<dyn Repository>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(QuantityRegistry::default()),
            repository,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_registry(mut self, registry: QuantityRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

pub struct Recording {
    record: RecordingRecord,
    ctx: RecordingContext,
    role: Role,
    hashes: SliceHashes,
    guard: Arc<PersistGuard>,
}

impl fmt::Debug for Recording {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recording")
            .field("id", &self.record.id)
            .field("role", &self.role)
            .field("closed", &self.record.closed)
            .field("consistent", &self.record.consistent)
            .field("columns", &self.record.columns.len())
            .finish_non_exhaustive()
    }
}

fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    let code: String = (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect();
    format!("{}-{}", prefix, code)
}

fn check_time(time: f64) -> Result<()> {
    if !time.is_finite() || time < 0.0 {
        return Err(Error::InvalidInput(format!(
            "time {} must be a finite offset at or after the start",
            time
        )));
    }
    Ok(())
}

impl Recording {
    /// Creates and persists a new producer-side recording.
    pub fn create(ctx: &RecordingContext) -> Result<Self> {
        ctx.config.validate()?;
        let id = loop {
            let id = generate_id(&ctx.config.storage.producer_prefix);
            if ctx.repository.load(&id)?.is_none() {
                break id;
            }
        };
        let now = ctx.clock.now();
        let record = RecordingRecord {
            id,
            created_at: now,
            modified_at: now,
            start_time: None,
            end_time: None,
            slice_capacity: ctx.config.storage.slice_capacity,
            closed: false,
            consistent: true,
            totals: Totals::default(),
            columns: BTreeMap::new(),
            combined: BTreeMap::new(),
            data_chunks: Vec::new(),
            labelled_chunks: Vec::new(),
            markers: Vec::new(),
        };
        let mut rec = Self {
            record,
            ctx: ctx.clone(),
            role: Role::Producer,
            hashes: SliceHashes::default(),
            guard: Arc::new(PersistGuard::default()),
        };
        rec.save(&MetaField::ALL)?;
        info!(id = %rec.record.id, capacity = rec.record.slice_capacity, "Created recording");
        Ok(rec)
    }

    /// Loads a stored recording.
    ///
    /// A producer reopening an unclosed recording retrospectively finalizes
    /// every open data chunk that has a successor.
    pub fn open(ctx: &RecordingContext, id: &str, role: Role) -> Result<Self> {
        let value = ctx.repository.load(id)?.ok_or_else(|| Error::NotFound(id.to_string()))?;
        let (record, _stripped): (RecordingRecord, _) = import_record(value)?;
        let mut rec = Self::from_record(ctx, record, role);
        if role == Role::Producer && !rec.record.closed {
            rec.repair_chunks()?;
        }
        debug!(id, ?role, columns = rec.record.columns.len(), "Opened recording");
        Ok(rec)
    }

    /// Stores a record received from a peer and opens it.
    pub fn adopt(ctx: &RecordingContext, record: RecordingRecord, role: Role) -> Result<Self> {
        let mut rec = Self::from_record(ctx, record, role);
        rec.save(&MetaField::ALL)?;
        info!(id = %rec.record.id, ?role, "Adopted recording");
        Ok(rec)
    }

    fn from_record(ctx: &RecordingContext, record: RecordingRecord, role: Role) -> Self {
        let mut hashes = SliceHashes::default();
        for slice in record.columns.values().flat_map(|c| c.slices()) {
            if !hashes.insert(slice.hash()) {
                warn!(id = %record.id, slice = slice.hash(), "Duplicate slice hash in stored recording");
            }
        }
        Self {
            record,
            ctx: ctx.clone(),
            role,
            hashes,
            guard: Arc::new(PersistGuard::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    pub fn record(&self) -> &RecordingRecord {
        &self.record
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.record.closed
    }

    pub fn is_consistent(&self) -> bool {
        self.record.consistent
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        self.record.start_time
    }

    pub fn slice_capacity(&self) -> usize {
        self.record.slice_capacity
    }

    pub fn totals(&self) -> &Totals {
        &self.record.totals
    }

    pub fn columns(&self) -> &BTreeMap<String, Column> {
        &self.record.columns
    }

    pub fn column(&self, quantity: &str) -> Option<&Column> {
        self.record.columns.get(quantity)
    }

    pub fn data_chunks(&self) -> &[TimeChunk] {
        &self.record.data_chunks
    }

    pub fn labelled_chunks(&self) -> &[TimeChunk] {
        &self.record.labelled_chunks
    }

    pub fn markers(&self) -> &[TimeChunk] {
        &self.record.markers
    }

    pub fn persist_guard(&self) -> Arc<PersistGuard> {
        Arc::clone(&self.guard)
    }

    pub fn registry(&self) -> &QuantityRegistry {
        &self.ctx.registry
    }

    /// Directory holding this recording's slice files.
    pub fn dir(&self) -> PathBuf {
        self.ctx.config.storage.data_dir.join(&self.record.id)
    }

    fn io<'a>(&self, dir: &'a Path) -> SliceIo<'a> {
        SliceIo {
            dir,
            role: self.role,
            consistent: self.record.consistent,
            closed: self.record.closed,
            reclaim_memory: self.ctx.config.storage.reclaim_memory,
        }
    }

    fn relative(&self) -> Result<RelativeClock> {
        self.record.start_time.map(RelativeClock::new).ok_or(Error::NotStarted)
    }

    /// Seconds from the start time to `at`.
    pub fn offset_of(&self, at: DateTime<Utc>) -> Result<f64> {
        Ok(self.relative()?.offset(at))
    }

    /// Latest time stored on any time axis.
    pub fn last_time(&self) -> Option<f64> {
        self.record
            .columns
            .values()
            .filter(|c| !c.borrows_time_axis())
            .filter_map(Column::last_time)
            .reduce(f64::max)
    }

    fn wait_persisted(&self) -> Result<()> {
        let persist = &self.ctx.config.persist;
        if self.guard.wait_idle(persist.busy_attempts, persist.busy_backoff()) {
            Ok(())
        } else {
            warn!(id = %self.record.id, "Gave up waiting for metadata persistence");
            Err(Error::Busy(self.record.id.clone()))
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.record.closed {
            return Err(Error::Closed(self.record.id.clone()));
        }
        if !self.record.consistent {
            return Err(Error::Inconsistent(format!("recording {}", self.record.id)));
        }
        if self.record.start_time.is_none() {
            return Err(Error::NotStarted);
        }
        self.wait_persisted()
    }

    /// Marks a producer-side recording inconsistent on a consistency fault
    /// and hands the error back.
    fn record_fault(&mut self, err: Error) -> Error {
        if err.is_consistency() && self.role == Role::Producer && self.record.consistent {
            self.record.consistent = false;
            error!(id = %self.record.id, error = %err, "Marking recording inconsistent, writes are blocked");
            if let Err(save_err) = self.save(&[MetaField::Flags, MetaField::Columns]) {
                error!(id = %self.record.id, error = %save_err, "Failed to persist inconsistent flag");
            }
        }
        err
    }

    fn field_values(&self, field: MetaField) -> Result<Vec<(&'static str, Value)>> {
        let r = &self.record;
        Ok(match field {
            MetaField::Times => vec![
                ("created_at", serde_json::to_value(r.created_at)?),
                ("start_time", serde_json::to_value(r.start_time)?),
                ("end_time", serde_json::to_value(r.end_time)?),
            ],
            MetaField::Flags => vec![("closed", Value::Bool(r.closed)), ("consistent", Value::Bool(r.consistent))],
            MetaField::SliceCapacity => vec![("slice_capacity", serde_json::to_value(r.slice_capacity)?)],
            MetaField::Totals => vec![("totals", serde_json::to_value(&r.totals)?)],
            MetaField::Columns => vec![("columns", serde_json::to_value(&r.columns)?)],
            MetaField::Combined => vec![("combined", serde_json::to_value(&r.combined)?)],
            MetaField::DataChunks => vec![("data_chunks", serde_json::to_value(&r.data_chunks)?)],
            MetaField::LabelledChunks => vec![("labelled_chunks", serde_json::to_value(&r.labelled_chunks)?)],
            MetaField::Markers => vec![("markers", serde_json::to_value(&r.markers)?)],
        })
    }

    /// Persists the given top-level fields, plus the id and `modified_at`.
    pub fn save(&mut self, fields: &[MetaField]) -> Result<()> {
        self.record.modified_at = self.ctx.clock.now();
        self.wait_persisted()?;
        let guard = Arc::clone(&self.guard);
        let Some(_ticket) = guard.try_acquire() else {
            return Err(Error::Busy(self.record.id.clone()));
        };

        let mut changes = Map::new();
        changes.insert("id".into(), Value::String(self.record.id.clone()));
        changes.insert("modified_at".into(), serde_json::to_value(self.record.modified_at)?);
        for &field in fields {
            for (key, value) in self.field_values(field)? {
                changes.insert(key.to_string(), value);
            }
        }
        self.ctx.repository.save(&self.record.id, changes)
    }

    /// Full metadata, as pushed to a peer.
    pub fn metadata(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.record)?)
    }

    /// Sets the absolute time all offsets are relative to.
    pub fn set_start_time(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.record.closed {
            return Err(Error::Closed(self.record.id.clone()));
        }
        if self.record.start_time.is_some() && self.record.columns.values().any(|c| !c.is_empty()) {
            return Err(Error::InvalidInput("the start time is fixed once samples exist".into()));
        }
        self.record.start_time = Some(at);
        self.save(&[MetaField::Times])
    }

    #[doc(hidden)]
    pub fn override_slice_capacity(&mut self, capacity: usize) -> Result<()> {
        if !self.record.columns.is_empty() {
            return Err(Error::InvalidInput("slice capacity is fixed once a column exists".into()));
        }
        if capacity == 0 {
            return Err(Error::InvalidInput("slice capacity must be positive".into()));
        }
        self.record.slice_capacity = capacity;
        self.save(&[MetaField::SliceCapacity])
    }

    /// Opens a data chunk if none is open.
    fn ensure_data_chunk(&mut self) -> Result<()> {
        if self.record.data_chunks.last().is_some_and(|c| !c.finalized) {
            return Ok(());
        }
        let clock = self.relative()?;
        let offset = self
            .record
            .data_chunks
            .last()
            .map_or(0.0, |c| c.offset + c.duration.unwrap_or(0.0));
        let index = self.record.data_chunks.len();
        self.record
            .data_chunks
            .push(TimeChunk::open_data(index, &clock, offset, &self.record.columns));
        debug!(id = %self.record.id, chunk = index, offset, "Opened data chunk");
        self.save(&[MetaField::DataChunks])
    }

    /// Appends one sample of a standalone quantity at `time` seconds.
    pub fn append_value(&mut self, quantity: &str, value: f64, time: f64) -> Result<()> {
        self.check_writable()?;
        check_time(time)?;
        let spec = self.ctx.registry.get(quantity)?.clone();
        if let Some((group, _)) = self.ctx.registry.group_of(quantity) {
            return Err(Error::InvalidInput(format!(
                "'{}' belongs to combined group '{}'",
                quantity, group
            )));
        }
        match self.record.columns.get(quantity) {
            Some(column) => {
                column.check_append(value, time)?;
            }
            None => {
                spec.dtype.cast(value)?;
            }
        }

        self.ensure_data_chunk()?;
        let capacity = self.record.slice_capacity;
        let column = self
            .record
            .columns
            .entry(spec.name.clone())
            .or_insert_with(|| Column::new(&spec, None));
        column.append_value(value, time, &mut self.hashes, capacity)
    }

    /// Appends one sample to every member of a combined group.
    ///
    /// `values` has one entry per member in group order. Every value is
    /// validated before any member is touched.
    pub fn append_combined(&mut self, group: &str, values: &[f64], time: f64) -> Result<()> {
        self.check_writable()?;
        check_time(time)?;
        let members = self.ctx.registry.group(group)?.to_vec();
        if values.len() != members.len() {
            return Err(Error::InvalidInput(format!(
                "group '{}' has {} members, got {} values",
                group,
                members.len(),
                values.len()
            )));
        }
        let specs = members
            .iter()
            .map(|m| self.ctx.registry.get(m).cloned())
            .collect::<Result<Vec<_>>>()?;

        let lens: Vec<usize> = members
            .iter()
            .map(|m| self.record.columns.get(m).map_or(0, Column::len))
            .collect();
        if lens.iter().any(|&len| len != lens[0]) {
            return Err(Error::InvalidInput(format!(
                "members of group '{}' have diverging lengths {:?}",
                group, lens
            )));
        }
        for (spec, &value) in specs.iter().zip(values) {
            match self.record.columns.get(&spec.name) {
                Some(column) => {
                    column.check_append(value, time)?;
                }
                None => {
                    spec.dtype.cast(value)?;
                }
            }
        }

        self.ensure_data_chunk()?;
        let capacity = self.record.slice_capacity;
        let owner = members[0].clone();
        for (i, (spec, &value)) in specs.iter().zip(values).enumerate() {
            let time_ref = (i > 0).then_some(owner.as_str());
            let column = self
                .record
                .columns
                .entry(spec.name.clone())
                .or_insert_with(|| Column::new(spec, time_ref));
            column.append_value(value, time, &mut self.hashes, capacity)?;
        }
        if !self.record.combined.contains_key(group) {
            self.record.combined.insert(group.to_string(), members);
            self.save(&[MetaField::Combined])?;
        }
        Ok(())
    }

    /// Appends pre-encoded device samples with one time per sample.
    pub fn append_binary(&mut self, quantity: &str, bytes: &[u8], times: &[f64]) -> Result<usize> {
        self.check_writable()?;
        for &t in times {
            check_time(t)?;
        }
        let spec = self.ctx.registry.get(quantity)?.clone();
        if let Some((group, _)) = self.ctx.registry.group_of(quantity) {
            return Err(Error::InvalidInput(format!(
                "'{}' belongs to combined group '{}'",
                quantity, group
            )));
        }

        self.ensure_data_chunk()?;
        let capacity = self.record.slice_capacity;
        let column = self
            .record
            .columns
            .entry(spec.name.clone())
            .or_insert_with(|| Column::new(&spec, None));
        column.append_binary(bytes, times, &mut self.hashes, capacity)
    }

    /// Writes pending samples of every column and persists the pointers.
    ///
    /// A consistency fault marks the recording inconsistent; later flushes
    /// are refused until it is repaired by hand.
    pub fn flush(&mut self) -> Result<usize> {
        if !self.record.consistent {
            return Err(Error::Inconsistent(format!("recording {}", self.record.id)));
        }
        self.wait_persisted()?;
        let dir = self.dir();
        let io = self.io(&dir);

        let mut written = 0;
        let mut result = Ok(());
        for column in self.record.columns.values_mut() {
            match column.flush(&io) {
                Ok(n) => written += n,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = result {
            if e.is_consistency() {
                return Err(self.record_fault(e));
            }
            if written > 0 {
                self.save(&[MetaField::Columns])?;
            }
            return Err(e);
        }
        if written > 0 {
            self.save(&[MetaField::Columns])?;
            debug!(id = %self.record.id, samples = written, "Flushed recording");
        }
        Ok(written)
    }

    /// End offset for finalizing the current chunk: "now" for live
    /// recordings, the last stored time otherwise.
    fn chunk_end_offset(&self, clock: &RelativeClock) -> f64 {
        let end = if self.ctx.config.storage.live {
            clock.offset(self.ctx.clock.now())
        } else {
            self.last_time().unwrap_or(0.0)
        };
        let open_offset = self.record.data_chunks.last().map_or(0.0, |c| c.offset);
        end.max(open_offset)
    }

    fn drop_empty_chunks(&mut self) {
        let before = self.record.data_chunks.len();
        self.record.data_chunks.retain(|c| !(c.finalized && c.windows.is_empty()));
        if self.record.data_chunks.len() != before {
            for (i, chunk) in self.record.data_chunks.iter_mut().enumerate() {
                chunk.index = i;
            }
        }
    }

    /// Live-finalizes the open data chunk, dropping it if it has no samples.
    fn finalize_open_chunk(&mut self, clock: &RelativeClock, end: f64) -> Result<Option<FinalizeOutcome>> {
        let dir = self.dir();
        let io = self.io(&dir);
        let registry = Arc::clone(&self.ctx.registry);
        let Some(chunk) = self.record.data_chunks.last_mut() else {
            return Ok(None);
        };
        let index = chunk.index;
        let outcome = match chunk.finalize_live(&mut self.record.columns, &io, &registry, clock, end) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.record_fault(e)),
        };
        if outcome == FinalizeOutcome::Empty {
            info!(id = %self.record.id, chunk = index, "Discarding data chunk without samples");
            self.drop_empty_chunks();
        }
        Ok(Some(outcome))
    }

    /// Finalizes open data chunks left behind by an interrupted session.
    fn repair_chunks(&mut self) -> Result<()> {
        let Ok(clock) = self.relative() else {
            return Ok(());
        };
        let dir = self.dir();
        let io = self.io(&dir);
        let registry = Arc::clone(&self.ctx.registry);

        let mut repaired = 0;
        for i in 0..self.record.data_chunks.len().saturating_sub(1) {
            if self.record.data_chunks[i].finalized {
                continue;
            }
            let (head, tail) = self.record.data_chunks.split_at_mut(i + 1);
            match head[i].finalize_retrospective(&mut self.record.columns, &io, &registry, &clock, &tail[0]) {
                Ok(outcome) => {
                    debug!(id = %self.record.id, chunk = i, ?outcome, "Retrospectively finalized data chunk");
                    repaired += 1;
                }
                Err(e) if e.is_consistency() => return Err(self.record_fault(e)),
                Err(e) => warn!(id = %self.record.id, chunk = i, error = %e, "Failed to finalize data chunk"),
            }
        }
        if repaired > 0 {
            self.drop_empty_chunks();
            info!(id = %self.record.id, repaired, "Repaired open data chunks");
            self.save(&[MetaField::DataChunks])?;
        }
        Ok(())
    }

    /// Finalizes the current data chunk and opens the next one; returns the
    /// new chunk's index.
    pub fn start_new_chunk(&mut self) -> Result<usize> {
        if self.record.closed {
            return Err(Error::Closed(self.record.id.clone()));
        }
        let clock = self.relative()?;
        let end = self.chunk_end_offset(&clock);
        self.finalize_open_chunk(&clock, end)?;

        let index = self.record.data_chunks.len();
        self.record
            .data_chunks
            .push(TimeChunk::open_data(index, &clock, end, &self.record.columns));
        self.save(&[MetaField::DataChunks])?;
        info!(id = %self.record.id, chunk = index, offset = end, "Started new data chunk");
        Ok(index)
    }

    /// Stores a finalized labelled window over `[start, end]`.
    ///
    /// The end is clipped to the last stored time. A window without samples
    /// is reported as [`WindowOutcome::Empty`] and not stored.
    pub fn add_labelled_chunk(&mut self, start: WindowBound, end: WindowBound, label: Option<&str>) -> Result<WindowOutcome> {
        let clock = self.relative()?;
        let (from, to) = validate_window(start, end, &clock)?;
        let Some(last) = self.last_time() else {
            info!(id = %self.record.id, from, to, "No values in range for labelled window");
            return Ok(WindowOutcome::Empty);
        };
        let to = to.min(last);
        if from > to {
            info!(id = %self.record.id, from, to, "No values in range for labelled window");
            return Ok(WindowOutcome::Empty);
        }

        let dir = self.dir();
        let io = self.io(&dir);
        let registry = Arc::clone(&self.ctx.registry);
        let windows = match scan_ranges(&mut self.record.columns, &io, from, EndBound::Inclusive(to))
            .and_then(|ranges| collect_windows(&mut self.record.columns, &io, &registry, &ranges))
        {
            Ok(windows) => windows,
            Err(e) => return Err(self.record_fault(e)),
        };
        if windows.is_empty() {
            info!(id = %self.record.id, from, to, "No values in range for labelled window");
            return Ok(WindowOutcome::Empty);
        }

        let index = self.record.labelled_chunks.len();
        self.record
            .labelled_chunks
            .push(TimeChunk::labelled(index, &clock, (from, to), label.map(str::to_string), windows));
        self.save(&[MetaField::LabelledChunks])?;
        Ok(WindowOutcome::Created(index))
    }

    /// Adds a zero-duration marker; returns its index.
    pub fn add_marker(&mut self, at: WindowBound, label: Option<&str>) -> Result<usize> {
        let clock = self.relative()?;
        let offset = at.to_offset(&clock)?;
        let index = self.record.markers.len();
        self.record
            .markers
            .push(TimeChunk::marker(index, &clock, offset, label.map(str::to_string)));
        self.save(&[MetaField::Markers])?;
        Ok(index)
    }

    /// Closes the recording.
    ///
    /// Flushes, finalizes the last data chunk (dropping it if empty),
    /// compresses every slice, recomputes the aggregates and saves. Every
    /// step is idempotent, so closing again resumes an interrupted close.
    pub fn close(&mut self) -> Result<()> {
        let already = self.record.closed;
        if !self.record.consistent {
            return Err(Error::Inconsistent(format!("recording {}", self.record.id)));
        }
        if self.record.start_time.is_some() {
            self.flush()?;
            let clock = self.relative()?;
            let end = self.chunk_end_offset(&clock);
            self.finalize_open_chunk(&clock, end)?;
            if self.record.end_time.is_none() {
                self.record.end_time = Some(clock.absolute(end));
            }
        }
        self.record.closed = true;
        self.save(&[MetaField::Flags, MetaField::Times, MetaField::DataChunks])?;

        let compressed = self.compress_all()?;
        let totals = self.final_analyse()?;
        info!(
            id = %self.record.id,
            already_closed = already,
            compressed = compressed.compressed,
            samples = totals.sample_count,
            "Closed recording"
        );
        Ok(())
    }

    /// Compresses every eligible slice with the configured algorithm.
    pub fn compress_all(&mut self) -> Result<CompressSummary> {
        let algorithm = self.ctx.config.compression.algorithm;
        let level = self.ctx.config.compression.level;
        let dir = self.dir();
        let io = self.io(&dir);

        let mut summary = CompressSummary::default();
        let mut fault = None;
        for column in self.record.columns.values_mut() {
            match column.compress(&io, algorithm, level) {
                Ok(s) => summary.absorb(s),
                Err(e) => {
                    fault = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = fault {
            return Err(self.record_fault(e));
        }
        if summary.compressed > 0 {
            self.save(&[MetaField::Columns])?;
        }
        Ok(summary)
    }

    /// Recomputes column aggregates and the container totals.
    pub fn final_analyse(&mut self) -> Result<Totals> {
        let dir = self.dir();
        let io = self.io(&dir);
        let registry = Arc::clone(&self.ctx.registry);
        let spans: BTreeMap<String, (f64, f64)> = self
            .record
            .columns
            .iter()
            .filter_map(|(name, c)| c.time_span().map(|span| (name.clone(), span)))
            .collect();

        let mut fault = None;
        for (name, column) in self.record.columns.iter_mut() {
            let spec = match registry.get(name) {
                Ok(spec) => spec,
                Err(e) => {
                    warn!(column = %name, error = %e, "Skipping analysis of unregistered column");
                    continue;
                }
            };
            let owner_span = spans.get(column.time_owner()).copied();
            match column.final_analyse(&io, spec, owner_span) {
                Ok(()) => {}
                Err(e) if e.is_consistency() => {
                    fault = Some(e);
                    break;
                }
                Err(e) => warn!(column = %name, error = %e, "Failed to analyse column"),
            }
        }
        if let Some(e) = fault {
            return Err(self.record_fault(e));
        }

        let columns = self.record.columns.values();
        self.record.totals = Totals {
            duration: columns.clone().filter_map(|c| c.stats().duration).reduce(f64::max),
            sample_count: columns.clone().map(|c| c.stats().summary.count).sum(),
            raw_size: columns.clone().map(|c| c.stats().raw_size).sum(),
            compressed_size: columns.map(|c| c.stats().compressed_size).sum(),
        };
        self.save(&[MetaField::Columns, MetaField::Totals])?;
        Ok(self.record.totals.clone())
    }

    /// True when every non-empty slice has been sent.
    ///
    /// With `ignore_missing`, unsent slices whose backing file no longer
    /// exists locally are not counted.
    pub fn check_all_slices_sent(&self, ignore_missing: bool) -> bool {
        let dir = self.dir();
        let mut all_sent = true;
        for slice in self.record.columns.values().flat_map(|c| c.slices()) {
            if slice.is_sent() || slice.is_empty() {
                continue;
            }
            if ignore_missing && !slice.file_exists(&dir) {
                debug!(slice = slice.hash(), "Ignoring unsent slice without a local file");
                continue;
            }
            all_sent = false;
        }
        all_sent
    }

    fn column_mut(&mut self, quantity: &str) -> Result<&mut Column> {
        self.record
            .columns
            .get_mut(quantity)
            .ok_or_else(|| Error::UnknownQuantity(quantity.to_string()))
    }

    /// Every value of `quantity`.
    pub fn values(&mut self, quantity: &str) -> Result<Vec<f64>> {
        let dir = self.dir();
        let io = self.io(&dir);
        let result = self.column_mut(quantity)?.values(&io);
        result.map_err(|e| self.record_fault(e))
    }

    /// Every time of `quantity`, read from its time-axis owner.
    pub fn times(&mut self, quantity: &str) -> Result<Vec<f64>> {
        let dir = self.dir();
        let io = self.io(&dir);
        let owner = self.column_mut(quantity)?.time_owner().to_string();
        let result = self.column_mut(&owner)?.times(&io);
        result.map_err(|e| self.record_fault(e))
    }

    fn chunk(&self, chunk: ChunkRef) -> Result<&TimeChunk> {
        let found = match chunk {
            ChunkRef::Data(i) => self.record.data_chunks.get(i),
            ChunkRef::Labelled(i) => self.record.labelled_chunks.get(i),
        };
        found.ok_or_else(|| Error::NotFound(format!("{:?}", chunk)))
    }

    /// Global `[start, end)` of a chunk's window on `quantity`.
    fn window_span(&self, chunk: ChunkRef, quantity: &str) -> Result<Option<(usize, usize)>> {
        let Some(window) = self.chunk(chunk)?.window(quantity) else {
            return Ok(None);
        };
        let Some(first) = window.ranges.first() else {
            return Ok(None);
        };
        let column = self
            .record
            .columns
            .get(quantity)
            .ok_or_else(|| Error::UnknownQuantity(quantity.to_string()))?;
        let offset = column
            .value_offset(&first.hash)
            .ok_or_else(|| Error::NotFound(format!("slice {}", first.hash)))?;
        let start = offset + first.start;
        Ok(Some((start, start + window.len())))
    }

    /// Values of `quantity` inside a finalized chunk.
    pub fn window_values(&mut self, chunk: ChunkRef, quantity: &str) -> Result<Vec<f64>> {
        let Some((start, end)) = self.window_span(chunk, quantity)? else {
            return Ok(Vec::new());
        };
        let dir = self.dir();
        let io = self.io(&dir);
        let result = self.column_mut(quantity)?.values_between(&io, start, end);
        result.map_err(|e| self.record_fault(e))
    }

    /// Times of `quantity` inside a finalized chunk.
    pub fn window_times(&mut self, chunk: ChunkRef, quantity: &str) -> Result<Vec<f64>> {
        let Some((start, end)) = self.window_span(chunk, quantity)? else {
            return Ok(Vec::new());
        };
        let dir = self.dir();
        let io = self.io(&dir);
        let owner = self.column_mut(quantity)?.time_owner().to_string();
        let result = self.column_mut(&owner)?.times_between(&io, start, end);
        result.map_err(|e| self.record_fault(e))
    }

    /// Live summary of the most recent finalized data chunk.
    pub fn live_summary(&self) -> Option<Value> {
        self.record
            .data_chunks
            .iter()
            .rev()
            .find(|c| c.finalized)
            .map(|c| c.live_summary(&self.ctx.registry))
    }

    /// Slice bytes to transmit in `mode`.
    ///
    /// A slice whose file cannot be read is logged and left out; it is
    /// picked up again by the next sync.
    pub fn payloads(&self, mode: SyncMode) -> Vec<SlicePayload> {
        let dir = self.dir();
        let io = self.io(&dir);
        let mut payloads = Vec::new();
        for slice in self.record.columns.values().flat_map(|c| c.slices()) {
            let payload = match mode {
                SyncMode::Full => slice.full_payload(&io),
                SyncMode::Partial if slice.compression().is_some() => slice.full_payload(&io),
                SyncMode::Partial => slice.partial_payload(&io),
            };
            match payload {
                Ok(Some(payload)) => payloads.push(payload),
                Ok(None) => {}
                Err(e) => warn!(slice = slice.hash(), error = %e, "Failed to read slice for transfer"),
            }
        }
        payloads
    }

    /// Records payloads the peer accepted and persists the pointers.
    pub fn confirm_transfers(&mut self, confirmed: &[SlicePayload]) -> Result<()> {
        if confirmed.is_empty() {
            return Ok(());
        }
        let by_hash: HashMap<&str, &SlicePayload> = confirmed.iter().map(|p| (p.hash.as_str(), p)).collect();
        let closed = self.record.closed;
        for column in self.record.columns.values_mut() {
            for slice in column.slices_mut() {
                if let Some(payload) = by_hash.get(slice.hash()) {
                    slice.confirm_transfer(payload, closed);
                }
            }
        }
        self.save(&[MetaField::Columns])
    }
}
