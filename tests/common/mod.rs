#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use slice_recorder::clock::ManualClock;
use slice_recorder::{JsonFileRepository, Recording, RecordingConfig, RecordingContext};

pub struct Fixture {
    pub dir: TempDir,
    pub clock: Arc<ManualClock>,
    pub ctx: RecordingContext,
}

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()
}

/// Offline recording context (chunks end at the last stored time) with the
/// given slice capacity, backed by JSON files in a temporary directory.
pub fn fixture(capacity: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RecordingConfig::with_data_dir(dir.path());
    config.storage.slice_capacity = capacity;
    config.storage.live = false;
    let clock = ManualClock::shared(start());
    let ctx = RecordingContext::new(config, Arc::new(JsonFileRepository::new(dir.path()))).with_clock(clock.clone());
    Fixture { dir, clock, ctx }
}

impl Fixture {
    /// A started producer recording.
    pub fn recording(&self) -> Recording {
        let mut rec = Recording::create(&self.ctx).unwrap();
        rec.set_start_time(start()).unwrap();
        rec
    }
}

/// Appends `value_of(i)` at `i` seconds for every `i` in `times`.
pub fn fill(rec: &mut Recording, quantity: &str, times: std::ops::Range<usize>, value_of: impl Fn(usize) -> f64) {
    for i in times {
        rec.append_value(quantity, value_of(i), i as f64).unwrap();
    }
}
