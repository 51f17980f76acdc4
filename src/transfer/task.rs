//! Transfer task state
//!
//! A [`TransferTask`] is the shared, observable state of one object's upload
//! or download. Its byte counter only moves forward: every part keeps a
//! high-water mark, and bytes re-sent by a retried attempt are not counted
//! twice.

use crate::core::{CancelFlag, Observable};
use crate::error::{Result, SyncError};
use crate::hash::{Verification, MAX_MULTIPART_COUNT, MAX_PUTOBJECT_SIZE, MIN_MULTIPART_SIZE};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

/// Byte range of one part; part numbers start at 1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    pub number: u32,
    pub offset: u64,
    pub len: u64,
}

/// How an object is moved
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferPlan {
    /// One request carrying the whole object
    Single { size: u64 },
    /// Fixed-size parts; the last may be shorter
    Multipart { part_size: u64, parts: Vec<PartRange> },
}

impl TransferPlan {
    /// Choose the upload strategy for a file of `size` bytes
    ///
    /// Files at or above `threshold` go multipart. If `part_size` would need
    /// more than 10000 parts, the smallest part size that fits is used
    /// instead. Limits are checked here, before any request is made.
    pub fn for_upload(key: &str, size: u64, threshold: u64, part_size: u64) -> Result<Self> {
        if size < threshold {
            if size > MAX_PUTOBJECT_SIZE {
                return Err(SyncError::precondition(
                    key,
                    format!("{} bytes exceeds the maximum single upload size", size),
                ));
            }
            return Ok(Self::Single { size });
        }

        let mut part_size = part_size.max(1);
        if size.div_ceil(part_size) > MAX_MULTIPART_COUNT {
            part_size = smallest_part_size(size);
        }
        if part_size > MAX_PUTOBJECT_SIZE {
            return Err(SyncError::precondition(
                key,
                format!(
                    "{} bytes needs parts of {} bytes, above the maximum part size",
                    size, part_size
                ),
            ));
        }

        let parts = (0..size.div_ceil(part_size).max(1))
            .map(|i| {
                let offset = i * part_size;
                PartRange {
                    number: i as u32 + 1,
                    offset,
                    len: part_size.min(size - offset),
                }
            })
            .collect();
        Ok(Self::Multipart { part_size, parts })
    }

    /// Number of requests carrying data
    pub fn part_count(&self) -> u32 {
        match self {
            Self::Single { .. } => 1,
            Self::Multipart { parts, .. } => parts.len() as u32,
        }
    }

    /// Whether this is a multipart plan
    pub fn is_multipart(&self) -> bool {
        matches!(self, Self::Multipart { .. })
    }
}

/// Smallest part size that fits `size` into the maximum part count
pub fn smallest_part_size(size: u64) -> u64 {
    size.div_ceil(MAX_MULTIPART_COUNT).max(MIN_MULTIPART_SIZE)
}

/// Monotonic byte counter of a transfer
///
/// Optionally forwards every increment to a parent counter, which is how a
/// sync session aggregates bytes across concurrent transfers.
#[derive(Debug, Default)]
pub struct TransferProgress {
    done: AtomicU64,
    total: AtomicU64,
    parent: Option<Arc<AtomicU64>>,
}

impl TransferProgress {
    /// Counter that also feeds `parent`
    pub fn with_parent(parent: Arc<AtomicU64>) -> Self {
        Self {
            parent: Some(parent),
            ..Default::default()
        }
    }

    /// Bytes confirmed so far
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }

    /// Expected total
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Set the expected total
    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::Relaxed);
    }

    /// Report that the current attempt on a part has moved `attempt_bytes`
    ///
    /// Only bytes beyond the part's previous high-water mark are counted.
    pub fn record(&self, part_mark: &AtomicU64, attempt_bytes: u64) {
        let previous = part_mark.fetch_max(attempt_bytes, Ordering::Relaxed);
        if attempt_bytes > previous {
            self.add(attempt_bytes - previous);
        }
    }

    fn add(&self, delta: u64) {
        self.done.fetch_add(delta, Ordering::Relaxed);
        if let Some(parent) = &self.parent {
            parent.fetch_add(delta, Ordering::Relaxed);
        }
    }
}

/// Point-in-time view of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSnapshot {
    pub direction: Direction,
    pub key: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub parts_done: u32,
    pub parts_total: u32,
    pub failed: bool,
}

/// Shared state of one object transfer
#[derive(Debug)]
pub struct TransferTask {
    direction: Direction,
    local_path: PathBuf,
    bucket: String,
    key: String,
    progress: TransferProgress,
    parts_total: AtomicU32,
    parts_done: AtomicU32,
    upload_id: OnceLock<String>,
    failure: OnceLock<String>,
    cancel: CancelFlag,
}

impl TransferTask {
    /// Create the state of a new transfer
    pub fn new(
        direction: Direction,
        local_path: impl Into<PathBuf>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        progress: TransferProgress,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            direction,
            local_path: local_path.into(),
            bucket: bucket.into(),
            key: key.into(),
            progress,
            parts_total: AtomicU32::new(0),
            parts_done: AtomicU32::new(0),
            upload_id: OnceLock::new(),
            failure: OnceLock::new(),
            cancel,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }

    /// Id of the multipart upload this task started, if any
    ///
    /// A failed multipart upload is not aborted automatically; pass this id
    /// to `abort_multipart_upload` to discard the uploaded parts.
    pub fn upload_id(&self) -> Option<&str> {
        self.upload_id.get().map(String::as_str)
    }

    pub(crate) fn set_upload_id(&self, upload_id: String) {
        let _ = self.upload_id.set(upload_id);
    }

    pub(crate) fn set_plan(&self, plan: &TransferPlan) {
        self.parts_total.store(plan.part_count(), Ordering::Relaxed);
    }

    pub(crate) fn part_finished(&self) {
        self.parts_done.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the task fatally failed; only the first call has an effect
    pub fn fail(&self, err: &SyncError) {
        if self.failure.set(err.to_string()).is_ok() {
            tracing::debug!("Transfer of '{}' failed: {}", self.key, err);
        }
    }

    /// First fatal error, if the task has failed
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    /// Stop if the task was cancelled or has already failed
    pub fn check(&self) -> Result<()> {
        self.cancel.check()?;
        match self.failure.get() {
            Some(message) => Err(SyncError::TaskFailed(message.clone())),
            None => Ok(()),
        }
    }

    /// Run `fut` and record its error, if any, as the task's failure
    pub(crate) async fn guard<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        let result = fut.await;
        if let Err(e) = &result {
            self.fail(e);
        }
        result
    }
}

impl Observable for TransferTask {
    type Snapshot = TransferSnapshot;

    fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            direction: self.direction,
            key: self.key.clone(),
            bytes_done: self.progress.done(),
            bytes_total: self.progress.total(),
            parts_done: self.parts_done.load(Ordering::Relaxed),
            parts_total: self.parts_total.load(Ordering::Relaxed),
            failed: self.failure.get().is_some(),
        }
    }

    fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}

/// Result of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub direction: Direction,
    pub key: String,
    pub bytes: u64,
    /// Checksum reported by the store, quotes removed
    pub checksum: Option<String>,
    pub verification: Verification,
    pub parts: u32,
}
