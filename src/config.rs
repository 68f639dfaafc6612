//! Configuration for recordings and sync.
//!
//! A [`RecordingConfig`] value is passed explicitly to every recording; there
//! is no process-wide configuration. All sections default sensibly, so a
//! config file only needs the keys it changes:
//!
//! ```
//! # use slice_recorder::config::RecordingConfig;
//! let config = RecordingConfig::from_json_str(r#"{
//!     "storage": { "data_dir": "/var/lib/recordings", "slice_capacity": 4096 },
//!     "sync": { "target": "https://sync.example.org", "workers": 8 }
//! }"#).unwrap();
//! assert_eq!(config.storage.slice_capacity, 4096);
//! assert_eq!(config.sync.attempts, 3);
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::slice::Compression;

/// Which side of the sync a process plays for a recording.
///
/// Consistency faults are fatal for the producer, which is still writing
/// samples, and only a warning for a consumer reading received data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Producer,
    Consumer,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
    pub persist: PersistConfig,
    pub sync: SyncConfig,
}

/// Where and how slices are stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory; each recording gets a subdirectory named by its id.
    pub data_dir: PathBuf,
    /// Prefix of generated recording ids, identifying the producer.
    pub producer_prefix: String,
    /// Slice capacity in bytes, copied into each new recording.
    pub slice_capacity: usize,
    /// Release decoded buffers of finally-analyzed bulk slices.
    pub reclaim_memory: bool,
    /// Live recordings finalize chunks at "now"; offline imports at the last
    /// observed sample time.
    pub live: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("recordings"),
            producer_prefix: "dev".to_string(),
            slice_capacity: 1 << 20,
            reclaim_memory: true,
            live: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub algorithm: Compression,
    /// Only used by algorithms that take a level.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { algorithm: Compression::Lz4, level: 4 }
    }
}

/// Bounded busy-wait applied while metadata persistence holds the guard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    pub busy_attempts: u32,
    pub busy_backoff_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self { busy_attempts: 50, busy_backoff_ms: 10 }
    }
}

impl PersistConfig {
    pub fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the receiving peer. No sync happens on close without it.
    pub target: Option<String>,
    pub timeout_secs: u64,
    /// Attempts per transfer call, including the first one.
    pub attempts: usize,
    pub initial_backoff_ms: u64,
    /// Concurrent slice uploads.
    pub workers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            target: None,
            timeout_secs: 30,
            attempts: 3,
            initial_backoff_ms: 200,
            workers: 4,
        }
    }
}

impl SyncConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RecordingConfig {
    /// Configuration rooted at `data_dir`, everything else default.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: RecordingConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.storage.slice_capacity == 0 {
            return Err(Error::InvalidInput("slice_capacity must be positive".into()));
        }
        if self.storage.producer_prefix.is_empty()
            || !self.storage.producer_prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::InvalidInput(format!(
                "producer_prefix '{}' must be non-empty ASCII alphanumerics",
                self.storage.producer_prefix
            )));
        }
        if self.sync.attempts == 0 || self.sync.workers == 0 {
            return Err(Error::InvalidInput("sync attempts and workers must be positive".into()));
        }
        Ok(())
    }
}
