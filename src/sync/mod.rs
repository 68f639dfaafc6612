//! Resumable transfer of recordings to a receiving peer.
//!
//! A sync pushes the recording's metadata first and its slice bytes after;
//! if the metadata push fails nothing else is sent. Slices are uploaded by a
//! bounded pool of tasks, each retrying transient faults with backoff. One
//! failed slice does not stop the others, and failures are reported in the
//! [`SyncReport`] rather than raised.
//!
//! Progress lives in the slices' `send_pointer` and `sent` flags, which are
//! persisted after every sync, so running a sync again resumes where an
//! interrupted one stopped.
//!
//! * [`SyncMode::Full`] sends each slice once it can no longer grow (full, or
//!   the recording is closed). Full slices of an open recording are
//!   compressed first, so closing it later does not send them again.
//! * [`SyncMode::Partial`] also sends the unconfirmed tail of every
//!   uncompressed slice, so a peer can follow a recording while it runs.

pub mod peer;
pub mod retry;
pub mod transport;

use std::fs;
use std::io::Write;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Role, SyncConfig};
use crate::error::{Error, Result, TransferError};
use crate::recording::{Recording, RecordingContext, RecordingRecord};
use crate::repository::import_record;
use crate::slice::Compression;

pub use peer::{LocalTransport, PeerStore};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use transport::{HttpTransport, PulledSlice, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Full,
    Partial,
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    pub metadata_pushed: bool,
    /// Payloads the peer accepted.
    pub sent: usize,
    pub bytes: usize,
    /// `(slice hash or "metadata", error)` for every call that failed after
    /// its retries.
    pub failed: Vec<(String, TransferError)>,
    /// Every non-empty slice is now marked sent.
    pub all_sent: bool,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.metadata_pushed && self.failed.is_empty()
    }
}

pub struct Syncer {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    workers: usize,
}

impl Syncer {
    pub fn new(transport: Arc<dyn Transport>, config: &SyncConfig) -> Self {
        Self {
            transport,
            policy: RetryPolicy::from_config(config),
            workers: config.workers.max(1),
        }
    }

    /// An HTTP syncer for the configured target, if there is one.
    pub fn from_config(config: &SyncConfig) -> Result<Option<Self>> {
        let Some(target) = &config.target else {
            return Ok(None);
        };
        let transport = HttpTransport::new(target.as_str(), config.timeout())?;
        Ok(Some(Self::new(Arc::new(transport), config)))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Pushes metadata and every eligible slice of `rec`.
    ///
    /// Only local faults (flushing, persisting pointers) are returned as
    /// errors; transfer failures end up in the report.
    pub async fn sync(&self, rec: &mut Recording, mode: SyncMode) -> Result<SyncReport> {
        if rec.role() == Role::Producer && rec.is_consistent() && !rec.is_closed() {
            rec.flush()?;
            if mode == SyncMode::Full {
                // Full slices go out once, already in their stored form.
                rec.compress_all()?;
            }
        }
        let id = rec.id().to_string();
        let metadata = rec.metadata()?;
        let mut report = SyncReport::default();

        let transport = &self.transport;
        if let Err(e) = retry_with_backoff(&self.policy, "metadata", || transport.push_metadata(&id, &metadata)).await {
            error!(id = %id, error = %e, "Metadata push failed, no slices sent");
            report.failed.push(("metadata".to_string(), e));
            return Ok(report);
        }
        report.metadata_pushed = true;

        let payloads = rec.payloads(mode);
        debug!(id = %id, ?mode, payloads = payloads.len(), "Uploading slices");
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for payload in payloads {
            let transport = Arc::clone(&self.transport);
            let policy = self.policy.clone();
            let semaphore = Arc::clone(&semaphore);
            let id = id.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = retry_with_backoff(&policy, &payload.filename, || transport.push_slice(&id, &payload)).await;
                (payload, result)
            });
        }

        let mut confirmed = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((payload, Ok(()))) => {
                    report.sent += 1;
                    report.bytes += payload.bytes.len();
                    confirmed.push(payload);
                }
                Ok((payload, Err(e))) => report.failed.push((payload.hash, e)),
                Err(e) => {
                    error!(id = %id, error = %e, "Slice upload task failed");
                    report.failed.push(("task".to_string(), TransferError::Network(e.to_string())));
                }
            }
        }

        rec.confirm_transfers(&confirmed)?;
        report.all_sent = rec.check_all_slices_sent(false);
        if report.failed.is_empty() {
            info!(id = %id, sent = report.sent, bytes = report.bytes, all_sent = report.all_sent, "Synced recording");
        } else {
            warn!(id = %id, sent = report.sent, failed = report.failed.len(), "Sync finished with failures");
        }
        Ok(report)
    }

    /// Closes `rec` and runs a full sync.
    pub async fn close(&self, rec: &mut Recording) -> Result<SyncReport> {
        rec.close()?;
        self.sync(rec, SyncMode::Full).await
    }

    /// Fetches recording `id` from the peer into `ctx`'s data directory and
    /// repository, and opens it as a consumer.
    pub async fn pull(&self, id: &str, ctx: &RecordingContext) -> Result<Recording> {
        let transport = &self.transport;
        let metadata = retry_with_backoff(&self.policy, "metadata", || transport.pull_metadata(id)).await?;
        let (mut record, stripped): (RecordingRecord, _) = import_record(metadata)?;
        if !stripped.is_empty() {
            warn!(id, fields = ?stripped, "Pulled metadata from a different schema version");
        }
        if record.id != id {
            return Err(Error::InvalidInput(format!("peer returned recording '{}' for '{}'", record.id, id)));
        }

        let dir = ctx.config.storage.data_dir.join(id);
        fs::create_dir_all(&dir)?;
        let mut pulled = 0;
        for column in record.columns.values_mut() {
            for slice in column.slices_mut() {
                if slice.write_pointer() == 0 {
                    continue;
                }
                let hash = slice.hash().to_string();
                let file = retry_with_backoff(&self.policy, &hash, || transport.pull_slice(id, &hash)).await?;
                let compression = match file.filename.strip_prefix(&format!("{}.bin", hash)) {
                    Some("") => None,
                    Some(ext) => Some(
                        ext.strip_prefix('.')
                            .and_then(Compression::from_extension)
                            .ok_or_else(|| Error::Codec(format!("unexpected slice file '{}'", file.filename)))?,
                    ),
                    None => return Err(Error::Codec(format!("slice {} arrived as '{}'", hash, file.filename))),
                };

                let mut out = fs::File::create(dir.join(&file.filename))?;
                out.write_all(&file.bytes)?;
                out.sync_all()?;
                slice.set_received_form(compression, file.bytes.len());
                pulled += 1;
            }
        }
        info!(id, slices = pulled, "Pulled recording");
        Recording::adopt(ctx, record, Role::Consumer)
    }
}
