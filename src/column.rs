//! Columns: one measured quantity's full time series within a recording.
//!
//! A column is an ordered list of value slices plus, unless it borrows the
//! time axis of another column, an ordered list of time slices. Every slice
//! except the last one of each list is full, so a sample's global index
//! determines its slice and in-slice position.

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::codec::{Cast, DType};
use crate::error::{Error, Result};
use crate::registry::QuantitySpec;
use crate::slice::{Axis, CompressOutcome, Compression, Slice, SliceHashes, SliceIo};
use crate::stats::{Running, Summary};

/// Aggregates recomputed by [`Column::final_analyse`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnStats {
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub raw_size: usize,
    pub compressed_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression_ratio: Option<f64>,
}

/// Counts reported by [`Column::compress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressSummary {
    pub compressed: usize,
    pub already: usize,
    pub conflicts: usize,
    pub failed: usize,
}

impl CompressSummary {
    pub fn absorb(&mut self, other: CompressSummary) {
        self.compressed += other.compressed;
        self.already += other.already;
        self.conflicts += other.conflicts;
        self.failed += other.failed;
    }
}

/// A slice position: `(slice index, start, end)`, `end` exclusive.
pub type SliceSpan = (usize, usize, usize);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Column {
    quantity: String,
    dtype: DType,
    time_dtype: DType,
    /// Quantity whose time slices this column shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_slices_ref: Option<String>,
    value_slices: Vec<Slice>,
    #[serde(default)]
    time_slices: Vec<Slice>,
    #[serde(default)]
    stats: ColumnStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_time: Option<f64>,
}

fn log_cast(quantity: &str, input: f64, cast: Cast) {
    if cast.rounded {
        warn!(quantity, input, stored = cast.value, "Rounded fractional value for integral column");
    }
    if cast.clamped {
        warn!(quantity, input, stored = cast.value, "Clamped out-of-range value");
    }
}

/// The slice new samples go to, starting a fresh one when the last is full,
/// compressed, or in the other append mode.
fn writable<'a>(
    slices: &'a mut Vec<Slice>,
    quantity: &str,
    axis: Axis,
    dtype: DType,
    binary: bool,
    hashes: &mut SliceHashes,
    capacity: usize,
) -> &'a mut Slice {
    let start_new = match slices.last() {
        None => true,
        Some(last) => {
            last.is_full() || last.compression().is_some() || (!last.is_empty() && last.is_binary() != binary)
        }
    };
    if start_new {
        slices.push(Slice::new(hashes.generate(), quantity, axis, dtype, capacity));
    }
    let last = slices.len() - 1;
    &mut slices[last]
}

/// Maps the global sample range `[start, end)` onto slices of the given
/// lengths.
///
/// An `end` that falls exactly on a slice boundary closes the previous slice
/// at its full length; it never opens an empty span in the next one.
pub fn map_range(lens: &[usize], start: usize, end: usize) -> Vec<SliceSpan> {
    let mut spans = Vec::new();
    if start >= end {
        return spans;
    }
    let mut offset = 0;
    for (i, &len) in lens.iter().enumerate() {
        let slice_end = offset + len;
        if slice_end > start && offset < end {
            let lo = start.max(offset) - offset;
            let hi = end.min(slice_end) - offset;
            if hi > lo {
                spans.push((i, lo, hi));
            }
        }
        if slice_end >= end {
            break;
        }
        offset = slice_end;
    }
    spans
}

impl Column {
    /// An empty column for `spec`, optionally sharing `time_ref`'s time axis.
    pub fn new(spec: &QuantitySpec, time_ref: Option<&str>) -> Self {
        Self {
            quantity: spec.name.clone(),
            dtype: spec.dtype,
            time_dtype: spec.time_dtype,
            time_slices_ref: time_ref.map(|r| r.to_string()),
            value_slices: Vec::new(),
            time_slices: Vec::new(),
            stats: ColumnStats::default(),
            last_time: None,
        }
    }

    pub fn quantity(&self) -> &str {
        &self.quantity
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn time_dtype(&self) -> DType {
        self.time_dtype
    }

    pub fn time_slices_ref(&self) -> Option<&str> {
        self.time_slices_ref.as_deref()
    }

    pub fn borrows_time_axis(&self) -> bool {
        self.time_slices_ref.is_some()
    }

    /// Quantity whose time slices give this column's times.
    pub fn time_owner(&self) -> &str {
        self.time_slices_ref.as_deref().unwrap_or(&self.quantity)
    }

    pub fn value_slices(&self) -> &[Slice] {
        &self.value_slices
    }

    pub fn time_slices(&self) -> &[Slice] {
        &self.time_slices
    }

    /// Global position of the first sample of value slice `hash`.
    pub fn value_offset(&self, hash: &str) -> Option<usize> {
        let mut offset = 0;
        for slice in &self.value_slices {
            if slice.hash() == hash {
                return Some(offset);
            }
            offset += slice.len();
        }
        None
    }

    pub(crate) fn time_slices_mut(&mut self) -> &mut [Slice] {
        &mut self.time_slices
    }

    pub fn slices(&self) -> impl Iterator<Item = &Slice> {
        self.value_slices.iter().chain(self.time_slices.iter())
    }

    pub(crate) fn slices_mut(&mut self) -> impl Iterator<Item = &mut Slice> {
        self.value_slices.iter_mut().chain(self.time_slices.iter_mut())
    }

    /// Samples appended, flushed or not.
    pub fn len(&self) -> usize {
        self.value_slices.iter().map(Slice::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> &ColumnStats {
        &self.stats
    }

    pub fn last_time(&self) -> Option<f64> {
        self.last_time
    }

    /// First stored time, from the first time slice (or first value slice
    /// for a column borrowing its time axis).
    pub fn first_time(&self) -> Option<f64> {
        match self.time_slices_ref {
            Some(_) => self.value_slices.first().and_then(Slice::time_start),
            None => self.time_slices.first().and_then(Slice::time_start),
        }
    }

    fn cast_time(&self, time: f64, last: Option<f64>) -> Result<f64> {
        let cast = self.time_dtype.cast(time)?;
        log_cast(&self.quantity, time, cast);
        if let Some(last) = last {
            if cast.value < last {
                return Err(Error::InvalidInput(format!(
                    "time {} precedes the last time {} of '{}'",
                    cast.value, last, self.quantity
                )));
            }
        }
        Ok(cast.value)
    }

    /// Validates `value` and `time` without appending anything.
    pub(crate) fn check_append(&self, value: f64, time: f64) -> Result<(f64, f64)> {
        let cast = self.dtype.cast(value)?;
        let time = self.cast_time(time, self.last_time)?;
        Ok((cast.value, time))
    }

    /// Appends one sample at `time`.
    ///
    /// A column that borrows its time axis only uses `time` to keep its own
    /// slice start times and ordering; the owner stores it.
    pub fn append_value(&mut self, value: f64, time: f64, hashes: &mut SliceHashes, capacity: usize) -> Result<()> {
        let cast = self.dtype.cast(value)?;
        let time = self.cast_time(time, self.last_time)?;
        log_cast(&self.quantity, value, cast);

        // Both axes are checked before either grows.
        let vs = writable(&mut self.value_slices, &self.quantity, Axis::Value, self.dtype, false, hashes, capacity);
        vs.check_value_append()?;
        if self.time_slices_ref.is_none() {
            let ts = writable(&mut self.time_slices, &self.quantity, Axis::Time, self.time_dtype, false, hashes, capacity);
            ts.check_value_append()?;
            ts.set_time_start_if_unset(time);
            ts.append(time)?;
        }
        vs.set_time_start_if_unset(time);
        vs.append(cast.value)?;

        self.last_time = Some(time);
        Ok(())
    }

    /// Appends pre-encoded samples and their times; returns the sample count.
    ///
    /// The bytes fill the current binary slice first and are then split over
    /// as many new slices as needed, each starting at its first sample's time.
    pub fn append_binary(
        &mut self,
        bytes: &[u8],
        times: &[f64],
        hashes: &mut SliceHashes,
        capacity: usize,
    ) -> Result<usize> {
        if self.time_slices_ref.is_some() {
            return Err(Error::InvalidInput(format!(
                "'{}' shares a time axis; binary appends need their own times",
                self.quantity
            )));
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
        if times.len() != samples {
            return Err(Error::InvalidInput(format!(
                "{} samples but {} times for '{}'",
                samples,
                times.len(),
                self.quantity
            )));
        }

        let mut casted = Vec::with_capacity(samples);
        let mut last = self.last_time;
        for &t in times {
            let t = self.cast_time(t, last)?;
            last = Some(t);
            casted.push(t);
        }

        let mut offset = 0;
        while offset < samples {
            let vs = writable(&mut self.value_slices, &self.quantity, Axis::Value, self.dtype, true, hashes, capacity);
            let take = vs.remaining().min(samples - offset);
            vs.set_time_start_if_unset(casted[offset]);
            vs.append_raw(&bytes[offset * size..(offset + take) * size])?;
            offset += take;
        }
        for &t in &casted {
            let ts = writable(&mut self.time_slices, &self.quantity, Axis::Time, self.time_dtype, false, hashes, capacity);
            ts.set_time_start_if_unset(t);
            ts.append(t)?;
        }

        self.last_time = last;
        Ok(samples)
    }

    /// Flushes every slice with pending samples.
    pub fn flush(&mut self, io: &SliceIo) -> Result<usize> {
        let mut written = 0;
        for slice in self.slices_mut() {
            if slice.has_pending() {
                written += slice.flush(io)?;
            }
        }
        Ok(written)
    }

    /// Compresses every eligible slice.
    ///
    /// A failure on one slice is logged and counted; only a consistency
    /// fault aborts the pass.
    pub fn compress(&mut self, io: &SliceIo, algorithm: Compression, level: u32) -> Result<CompressSummary> {
        let mut summary = CompressSummary::default();
        for slice in self.slices_mut() {
            match slice.compress(io, algorithm, level) {
                Ok(CompressOutcome::Compressed { .. }) => summary.compressed += 1,
                Ok(CompressOutcome::AlreadyCompressed) => summary.already += 1,
                Ok(CompressOutcome::Conflict { .. }) => summary.conflicts += 1,
                Ok(CompressOutcome::NotEligible) => {}
                Err(e) if e.is_consistency() => return Err(e),
                Err(e) => {
                    error!(slice = %slice.hash(), error = %e, "Failed to compress slice");
                    summary.failed += 1;
                }
            }
        }
        Ok(summary)
    }

    /// Folds new samples of every slice into the slice statistics.
    pub fn analyze(&mut self, io: &SliceIo, keep_values: bool) -> Result<()> {
        for slice in self.slices_mut() {
            slice.analyze(io, keep_values)?;
        }
        Ok(())
    }

    /// Concatenated decoded values.
    pub fn values(&mut self, io: &SliceIo) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(self.len());
        for slice in &mut self.value_slices {
            out.extend_from_slice(slice.load(io)?);
        }
        Ok(out)
    }

    /// Concatenated decoded times of this column's own time axis.
    pub fn times(&mut self, io: &SliceIo) -> Result<Vec<f64>> {
        if let Some(owner) = &self.time_slices_ref {
            return Err(Error::InvalidInput(format!(
                "'{}' shares the time axis of '{}'",
                self.quantity, owner
            )));
        }
        let mut out = Vec::new();
        for slice in &mut self.time_slices {
            out.extend_from_slice(slice.load(io)?);
        }
        Ok(out)
    }

    pub fn value_lens(&self) -> Vec<usize> {
        self.value_slices.iter().map(Slice::len).collect()
    }

    pub fn time_lens(&self) -> Vec<usize> {
        self.time_slices.iter().map(Slice::len).collect()
    }

    /// Values at global positions `[start, end)`.
    pub fn values_between(&mut self, io: &SliceIo, start: usize, end: usize) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(end.saturating_sub(start));
        for (i, lo, hi) in map_range(&self.value_lens(), start, end) {
            out.extend(self.value_slices[i].values_in(io, lo, hi)?);
        }
        Ok(out)
    }

    /// Own times at global positions `[start, end)`.
    pub fn times_between(&mut self, io: &SliceIo, start: usize, end: usize) -> Result<Vec<f64>> {
        let mut out = Vec::with_capacity(end.saturating_sub(start));
        for (i, lo, hi) in map_range(&self.time_lens(), start, end) {
            out.extend(self.time_slices[i].values_in(io, lo, hi)?);
        }
        Ok(out)
    }

    /// Recomputes the column aggregates from the slices.
    ///
    /// Box-plot quantities get median and quartiles over the concatenated
    /// values, with min/max/mean merged from the per-slice statistics
    /// (sample-weighted). Bulk quantities only track the count.
    ///
    /// `owner_span` is the `(first, last)` time of the time-axis owner, used
    /// for the duration of columns that borrow it.
    pub fn final_analyse(&mut self, io: &SliceIo, spec: &QuantitySpec, owner_span: Option<(f64, f64)>) -> Result<()> {
        self.analyze(io, spec.box_plot)?;

        let count = self.len();
        let summary = if spec.box_plot {
            let running = Running::merge(self.value_slices.iter().map(Slice::stats));
            let values = self.values(io)?;
            let mut summary = Summary::box_plot(&values);
            // Deferred binary slices are missing from the running merge.
            if running.count == count {
                summary.min = running.min;
                summary.max = running.max;
                summary.mean = running.mean();
            }
            summary
        } else {
            Summary::count_only(count)
        };

        let span = match self.time_slices_ref {
            Some(_) => owner_span,
            None => self.first_time().zip(self.last_time),
        };

        let raw_size: usize = self.slices().map(Slice::raw_size).sum();
        let compressed_size: usize = self.slices().map(|s| s.compressed_size().unwrap_or(s.raw_size())).sum();

        self.stats = ColumnStats {
            summary,
            duration: span.map(|(first, last)| last - first),
            raw_size,
            compressed_size,
            compression_ratio: (compressed_size > 0).then(|| raw_size as f64 / compressed_size as f64),
        };
        Ok(())
    }

    /// `(first, last)` stored time, for columns owning their time axis.
    pub fn time_span(&self) -> Option<(f64, f64)> {
        self.first_time().zip(self.last_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Role;
    use std::fs::OpenOptions;
    use std::io::Write;

    #[test]
    fn test_map_range_exact_boundary() {
        // End exactly on a multiple of the slice length stays in the previous slice.
        assert_eq!(map_range(&[4, 4, 2], 0, 4), vec![(0, 0, 4)]);
        assert_eq!(map_range(&[4, 4, 2], 2, 8), vec![(0, 2, 4), (1, 0, 4)]);
        assert_eq!(map_range(&[4, 4, 2], 4, 5), vec![(1, 0, 1)]);
        assert_eq!(map_range(&[4, 4, 2], 3, 10), vec![(0, 3, 4), (1, 0, 4), (2, 0, 2)]);
    }

    #[test]
    fn test_map_range_empty() {
        assert!(map_range(&[4, 4], 3, 3).is_empty());
        assert!(map_range(&[], 0, 2).is_empty());
        assert!(map_range(&[4], 5, 9).is_empty());
    }

    #[test]
    fn test_failed_value_append_leaves_time_axis() {
        let dir = tempfile::tempdir().unwrap();
        let io = SliceIo { dir: dir.path(), role: Role::Producer, consistent: true, closed: false, reclaim_memory: false };
        let mut hashes = SliceHashes::default();
        let mut column = Column::new(&QuantitySpec::new("heart_rate", DType::U8), None);
        column.append_value(60.0, 0.0, &mut hashes, 24).unwrap();
        column.append_value(61.0, 1.0, &mut hashes, 24).unwrap();
        column.flush(&io).unwrap();

        // A stray byte in the value file trips the length check on the next flush.
        let path = column.value_slices()[0].path(dir.path());
        OpenOptions::new().append(true).open(path).unwrap().write_all(&[9]).unwrap();
        column.append_value(62.0, 2.0, &mut hashes, 24).unwrap();
        assert!(column.flush(&io).unwrap_err().is_consistency());

        assert!(matches!(column.append_value(63.0, 3.0, &mut hashes, 24), Err(Error::Inconsistent(_))));
        let times: usize = column.time_slices().iter().map(Slice::len).sum();
        assert_eq!(times, 3);
        assert_eq!(column.len(), 3);
        assert_eq!(column.last_time(), Some(2.0));
    }
}
