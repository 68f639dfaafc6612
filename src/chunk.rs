//! Time chunks and the segmentation that maps a time window onto slices.
//!
//! Three kinds of chunk share one type:
//!
//! * data chunks partition the recording into consecutive segments, opened
//!   automatically on the first append and finalized live or on reopen;
//! * labelled chunks are user-requested windows, finalized on creation;
//! * markers are zero-duration labelled instants without windows.
//!
//! A finalized chunk stores, per quantity with samples in its window, a
//! summary and the exact `{hash, start, end}` ranges into that column's
//! value slices, so window reads never rescan the time axis.

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::RelativeClock;
use crate::column::{map_range, Column};
use crate::error::{Error, Result};
use crate::registry::QuantityRegistry;
use crate::slice::{Slice, SliceIo};
use crate::stats::Summary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    Data,
    Labelled,
    Marker,
}

/// `[start, end)` positions inside one value slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SliceRange {
    pub hash: String,
    pub start: usize,
    pub end: usize,
}

/// One quantity's share of a chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuantityWindow {
    pub stats: Summary,
    pub ranges: Vec<SliceRange>,
}

impl QuantityWindow {
    pub fn len(&self) -> usize {
        self.ranges.iter().map(|r| r.end - r.start).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Result of finalizing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Finalized,
    AlreadyFinalized,
    /// No quantity had samples in the window; the chunk should be dropped.
    Empty,
}

/// Result of requesting a labelled window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowOutcome {
    /// Index of the new labelled chunk.
    Created(usize),
    /// No samples in range; nothing was stored.
    Empty,
}

/// A bound of a manually requested window.
///
/// Both bounds of one window must be of the same kind, either seconds from
/// the recording start or timezone-aware instants. Naive timestamps are
/// accepted here only so they can be rejected with a clear error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WindowBound {
    Seconds(f64),
    Aware(DateTime<FixedOffset>),
    Naive(NaiveDateTime),
}

impl WindowBound {
    fn kind(&self) -> &'static str {
        match self {
            WindowBound::Seconds(_) => "seconds",
            WindowBound::Aware(_) => "aware",
            WindowBound::Naive(_) => "naive",
        }
    }

    /// Offset in seconds from the start of `clock`.
    pub fn to_offset(&self, clock: &RelativeClock) -> Result<f64> {
        match *self {
            WindowBound::Seconds(s) => {
                if !s.is_finite() {
                    return Err(Error::TimeRange(format!("non-finite offset {}", s)));
                }
                if s < 0.0 {
                    return Err(Error::TimeRange(format!("negative offset {}", s)));
                }
                Ok(s)
            }
            WindowBound::Aware(at) => {
                let at = at.with_timezone(&Utc);
                if at < clock.base() {
                    return Err(Error::TimeRange(format!(
                        "{} precedes the recording start {}",
                        at.to_rfc3339(),
                        clock.base().to_rfc3339()
                    )));
                }
                Ok(clock.offset(at))
            }
            WindowBound::Naive(at) => Err(Error::TimeRange(format!("timezone-naive time {}", at))),
        }
    }
}

/// Validates a manual window and converts it to start offsets.
pub fn validate_window(start: WindowBound, end: WindowBound, clock: &RelativeClock) -> Result<(f64, f64)> {
    if start.kind() != end.kind() {
        return Err(Error::TimeRange(format!(
            "bounds must be of one kind, got {} and {}",
            start.kind(),
            end.kind()
        )));
    }
    let from = start.to_offset(clock)?;
    let to = end.to_offset(clock)?;
    if from > to {
        return Err(Error::TimeRange(format!("start {} is after end {}", from, to)));
    }
    Ok((from, to))
}

/// Upper bound of a window scan.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EndBound {
    Inclusive(f64),
    Exclusive(f64),
}

impl EndBound {
    fn admits(self, time: f64) -> bool {
        match self {
            EndBound::Inclusive(end) => time <= end,
            EndBound::Exclusive(end) => time < end,
        }
    }
}

/// Global sample range `[start, end)` of the times in `[from, end]`.
///
/// Slices entirely before `from` or entirely inside the window are decided
/// from their highest value, which comes from the running statistics when
/// available; only the boundary slices are decoded.
pub fn locate(slices: &mut [Slice], io: &SliceIo, from: f64, end: EndBound) -> Result<Option<(usize, usize)>> {
    let mut offset = 0;
    let mut start = None;
    let mut stop = None;

    for slice in slices.iter_mut() {
        let len = slice.len();
        let Some(max) = slice.max_value(io)? else {
            offset += len;
            continue;
        };
        match start {
            None => {
                if max < from {
                    offset += len;
                    continue;
                }
                let times = slice.load(io)?;
                let lo = times.partition_point(|&t| t < from);
                let hi = times.partition_point(|&t| end.admits(t));
                start = Some(offset + lo);
                if hi < times.len() {
                    stop = Some(offset + hi.max(lo));
                    break;
                }
            }
            Some(_) => {
                if !end.admits(max) {
                    let times = slice.load(io)?;
                    stop = Some(offset + times.partition_point(|&t| end.admits(t)));
                    break;
                }
            }
        }
        offset += len;
    }

    Ok(match start {
        Some(s) => {
            let e = stop.unwrap_or(offset);
            (e > s).then_some((s, e))
        }
        None => None,
    })
}

/// Per-column global ranges for the times in `[from, end]`, scanning each
/// time axis once and sharing the result with the columns borrowing it.
pub(crate) fn scan_ranges(
    columns: &mut BTreeMap<String, Column>,
    io: &SliceIo,
    from: f64,
    end: EndBound,
) -> Result<BTreeMap<String, (usize, usize)>> {
    let mut by_owner = BTreeMap::new();
    for (name, column) in columns.iter_mut() {
        if column.borrows_time_axis() {
            continue;
        }
        if let Some(range) = locate(column.time_slices_mut(), io, from, end)? {
            by_owner.insert(name.clone(), range);
        }
    }

    let mut ranges = BTreeMap::new();
    for (name, column) in columns.iter() {
        match by_owner.get(column.time_owner()) {
            Some(&range) => {
                ranges.insert(name.clone(), range);
            }
            None if column.borrows_time_axis() && !columns.contains_key(column.time_owner()) => {
                warn!(column = %name, owner = column.time_owner(), "Time axis owner is missing, skipping column");
            }
            None => {}
        }
    }
    Ok(ranges)
}

/// Turns global ranges into per-quantity windows.
///
/// A non-consistency fault on one column is logged and that column left
/// out; a consistency fault aborts.
pub(crate) fn collect_windows(
    columns: &mut BTreeMap<String, Column>,
    io: &SliceIo,
    registry: &QuantityRegistry,
    ranges: &BTreeMap<String, (usize, usize)>,
) -> Result<BTreeMap<String, QuantityWindow>> {
    let mut windows = BTreeMap::new();
    for (name, column) in columns.iter_mut() {
        let Some(&(start, end)) = ranges.get(name) else {
            continue;
        };
        let end = end.min(column.len());
        if end <= start {
            continue;
        }
        match window_for(column, io, registry, start, end) {
            Ok(window) => {
                windows.insert(name.clone(), window);
            }
            Err(e) if e.is_consistency() => return Err(e),
            Err(e) => warn!(column = %name, error = %e, "Failed to build window, skipping column"),
        }
    }
    Ok(windows)
}

fn window_for(
    column: &mut Column,
    io: &SliceIo,
    registry: &QuantityRegistry,
    start: usize,
    end: usize,
) -> Result<QuantityWindow> {
    let ranges = map_range(&column.value_lens(), start, end)
        .into_iter()
        .map(|(i, lo, hi)| SliceRange { hash: column.value_slices()[i].hash().to_string(), start: lo, end: hi })
        .collect();
    let box_plot = registry.get(column.quantity()).map(|s| s.box_plot).unwrap_or(false);
    let stats = if box_plot {
        Summary::box_plot(&column.values_between(io, start, end)?)
    } else {
        Summary::count_only(end - start)
    };
    Ok(QuantityWindow { stats, ranges })
}

/// A data chunk, labelled chunk or marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeChunk {
    pub kind: ChunkKind,
    pub index: usize,
    pub time_start: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_end: Option<DateTime<Utc>>,
    /// Seconds from the recording start.
    pub offset: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub finalized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub windows: BTreeMap<String, QuantityWindow>,
    /// Column lengths when a data chunk was opened. Kept after finalizing
    /// so an earlier chunk can still be repaired against them.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub open_positions: BTreeMap<String, usize>,
}

impl TimeChunk {
    /// An open data chunk starting at `offset`, remembering where each
    /// column currently ends.
    pub fn open_data(index: usize, clock: &RelativeClock, offset: f64, columns: &BTreeMap<String, Column>) -> Self {
        Self {
            kind: ChunkKind::Data,
            index,
            time_start: clock.absolute(offset),
            time_end: None,
            offset,
            duration: None,
            finalized: false,
            label: None,
            windows: BTreeMap::new(),
            open_positions: columns.iter().map(|(name, c)| (name.clone(), c.len())).collect(),
        }
    }

    pub fn marker(index: usize, clock: &RelativeClock, offset: f64, label: Option<String>) -> Self {
        let at = clock.absolute(offset);
        Self {
            kind: ChunkKind::Marker,
            index,
            time_start: at,
            time_end: Some(at),
            offset,
            duration: Some(0.0),
            finalized: true,
            label,
            windows: BTreeMap::new(),
            open_positions: BTreeMap::new(),
        }
    }

    /// Builds a finalized labelled chunk over `[from, to]`.
    pub(crate) fn labelled(
        index: usize,
        clock: &RelativeClock,
        (from, to): (f64, f64),
        label: Option<String>,
        windows: BTreeMap<String, QuantityWindow>,
    ) -> Self {
        Self {
            kind: ChunkKind::Labelled,
            index,
            time_start: clock.absolute(from),
            time_end: Some(clock.absolute(to)),
            offset: from,
            duration: Some(to - from),
            finalized: true,
            label,
            windows,
            open_positions: BTreeMap::new(),
        }
    }

    pub fn window(&self, quantity: &str) -> Option<&QuantityWindow> {
        self.windows.get(quantity)
    }

    fn complete(&mut self, clock: &RelativeClock, end_offset: f64, windows: BTreeMap<String, QuantityWindow>) -> FinalizeOutcome {
        let end_offset = end_offset.max(self.offset);
        self.time_end = Some(clock.absolute(end_offset));
        self.duration = Some(end_offset - self.offset);
        self.windows = windows;
        self.finalized = true;
        if self.windows.is_empty() {
            debug!(chunk = self.index, "No values in range for chunk");
            FinalizeOutcome::Empty
        } else {
            FinalizeOutcome::Finalized
        }
    }

    /// Finalizes an open data chunk at `end_offset`, taking every sample
    /// appended since it was opened.
    pub fn finalize_live(
        &mut self,
        columns: &mut BTreeMap<String, Column>,
        io: &SliceIo,
        registry: &QuantityRegistry,
        clock: &RelativeClock,
        end_offset: f64,
    ) -> Result<FinalizeOutcome> {
        if self.finalized {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        let ranges: BTreeMap<String, (usize, usize)> = columns
            .iter()
            .map(|(name, column)| (name.clone(), (self.open_position(name), column.len())))
            .collect();
        let windows = collect_windows(columns, io, registry, &ranges)?;
        Ok(self.complete(clock, end_offset, windows))
    }

    /// Finalizes an open data chunk that was left behind by `next`, the data
    /// chunk opened after it.
    ///
    /// Each column ends where it stood when `next` was opened, so the two
    /// chunks meet exactly, whatever the sample times around the boundary.
    pub fn finalize_retrospective(
        &mut self,
        columns: &mut BTreeMap<String, Column>,
        io: &SliceIo,
        registry: &QuantityRegistry,
        clock: &RelativeClock,
        next: &TimeChunk,
    ) -> Result<FinalizeOutcome> {
        if self.finalized {
            return Ok(FinalizeOutcome::AlreadyFinalized);
        }
        let ranges: BTreeMap<String, (usize, usize)> = columns
            .keys()
            .map(|name| (name.clone(), (self.open_position(name), next.open_position(name))))
            .collect();
        let windows = collect_windows(columns, io, registry, &ranges)?;
        Ok(self.complete(clock, next.offset, windows))
    }

    /// Length of `quantity` when this data chunk was opened; a column that
    /// did not exist yet starts at zero.
    pub fn open_position(&self, quantity: &str) -> usize {
        self.open_positions.get(quantity).copied().unwrap_or(0)
    }

    /// Summaries of the quantities flagged for the live summary.
    pub fn live_summary(&self, registry: &QuantityRegistry) -> serde_json::Value {
        let stats: serde_json::Map<String, serde_json::Value> = self
            .windows
            .iter()
            .filter(|(name, _)| registry.get(name).map(|s| s.live_summary).unwrap_or(false))
            .filter_map(|(name, w)| serde_json::to_value(&w.stats).ok().map(|v| (name.clone(), v)))
            .collect();
        serde_json::json!({
            "index": self.index,
            "time_start": self.time_start,
            "time_end": self.time_end,
            "duration": self.duration,
            "stats": stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> RelativeClock {
        RelativeClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_validate_seconds() {
        let c = clock();
        assert_eq!(validate_window(WindowBound::Seconds(1.0), WindowBound::Seconds(4.5), &c).unwrap(), (1.0, 4.5));
        assert!(matches!(
            validate_window(WindowBound::Seconds(-1.0), WindowBound::Seconds(4.5), &c),
            Err(Error::TimeRange(_))
        ));
        assert!(matches!(
            validate_window(WindowBound::Seconds(5.0), WindowBound::Seconds(4.5), &c),
            Err(Error::TimeRange(_))
        ));
    }

    #[test]
    fn test_validate_aware_and_mixed() {
        let c = clock();
        let tz = FixedOffset::east_opt(3600).unwrap();
        // 13:00:10 +01:00 is 12:00:10 UTC.
        let start = tz.with_ymd_and_hms(2024, 3, 1, 13, 0, 10).unwrap();
        let end = tz.with_ymd_and_hms(2024, 3, 1, 13, 1, 0).unwrap();
        assert_eq!(validate_window(WindowBound::Aware(start), WindowBound::Aware(end), &c).unwrap(), (10.0, 60.0));

        let before = tz.with_ymd_and_hms(2024, 3, 1, 12, 59, 0).unwrap();
        assert!(validate_window(WindowBound::Aware(before), WindowBound::Aware(end), &c).is_err());
        assert!(validate_window(WindowBound::Seconds(1.0), WindowBound::Aware(end), &c).is_err());

        let naive = start.naive_utc();
        assert!(matches!(
            validate_window(WindowBound::Naive(naive), WindowBound::Naive(naive), &c),
            Err(Error::TimeRange(_))
        ));
    }

    #[test]
    fn test_end_bound_admits() {
        assert!(EndBound::Inclusive(2.0).admits(2.0));
        assert!(!EndBound::Exclusive(2.0).admits(2.0));
    }

    #[test]
    fn test_marker_is_finalized_and_empty() {
        let m = TimeChunk::marker(0, &clock(), 12.0, Some("stand up".into()));
        assert!(m.finalized);
        assert_eq!(m.duration, Some(0.0));
        assert_eq!(m.time_start, m.time_end.unwrap());
        assert!(m.windows.is_empty());
    }
}
