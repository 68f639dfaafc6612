//! # Slice Recorder
//!
//! Columnar storage for sensor recordings, built from fixed-size binary
//! slices that are written append-only, compressed once closed, and
//! synced to a receiving peer.
//!
//! * **Compact storage**: samples are stored in the narrowest element type
//!   their quantity allows, 24-bit packed where the device delivers it
//! * **Cheap windows**: finalized chunks remember which slice ranges they
//!   cover, so reading a window never rescans the time axis
//! * **Resumable sync**: per-slice send pointers make an interrupted sync
//!   continue where it stopped
//!
//! ## Main Components
//!
//! * [`Recording`]: the container; owns columns, chunks and metadata
//! * [`column::Column`]: one quantity's value and time slices
//! * [`slice::Slice`]: the fixed-capacity storage unit
//! * [`chunk::TimeChunk`]: data chunks, labelled windows and markers
//! * [`sync::Syncer`]: pushes a recording to a peer and pulls it back
//! * [`registry::QuantityRegistry`]: element types and statistics per quantity
//!
//! ## Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use slice_recorder::{Recording, RecordingConfig, RecordingContext, MemoryRepository};
//!
//! let dir = tempfile::tempdir().unwrap();
//! let ctx = RecordingContext::new(
//!     RecordingConfig::with_data_dir(dir.path()),
//!     Arc::new(MemoryRepository::new()),
//! );
//!
//! let mut rec = Recording::create(&ctx).unwrap();
//! rec.set_start_time(chrono::Utc::now()).unwrap();
//! for i in 0..10 {
//!     rec.append_value("heart_rate", 60.0 + i as f64, i as f64).unwrap();
//! }
//! rec.close().unwrap();
//!
//! assert_eq!(rec.values("heart_rate").unwrap().len(), 10);
//! assert_eq!(rec.totals().sample_count, 10);
//! ```

pub mod chunk;
pub mod clock;
pub mod codec;
pub mod column;
pub mod config;
pub mod error;
pub mod logging;
pub mod recording;
pub mod registry;
pub mod repository;
pub mod slice;
pub mod stats;
pub mod sync;

pub use chunk::{ChunkKind, FinalizeOutcome, TimeChunk, WindowBound, WindowOutcome};
pub use codec::DType;
pub use config::{RecordingConfig, Role};
pub use error::{Error, Result, TransferError};
pub use recording::{ChunkRef, Recording, RecordingContext, RecordingRecord};
pub use registry::{QuantityRegistry, QuantitySpec};
pub use repository::{JsonFileRepository, MemoryRepository, Repository};
pub use sync::{SyncMode, SyncReport, Syncer};
