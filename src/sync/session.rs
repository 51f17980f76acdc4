//! Sync session
//!
//! Runs the local tree pipeline and the remote listing side by side and
//! merges their sorted outputs one step at a time. Transfers and deletes are
//! spawned as the cursors advance, so the merge keeps going while they run.
//! The session finishes only when both inputs are drained, the last delete
//! batch is flushed and every spawned task has settled.

use super::comparator::{Advance, SyncComparator, SyncDecision, SyncItem};
use crate::config::{ClientConfig, ObjectParams, SyncOptions};
use crate::core::{CancelFlag, Observable};
use crate::error::{Result, SyncError};
use crate::fs::{
    local_path_for_key, remove_dir_all_if_exists, remove_file_if_exists, LocalFileRecord,
    LocalTreeDigestPipeline, ScanConfig, ScanProgress,
};
use crate::storage::{ListingMode, RemoteListingEnumerator, RemoteObjectRecord};
use crate::transfer::{
    DeleteProgress, Direction, TransferExecutor, TransferOutcome, TransferProgress, TransferTask,
    MAX_DELETE_BATCH,
};
use humansize::{format_size, BINARY};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;

/// Shared counters of a running sync
#[derive(Debug)]
pub struct SyncSession {
    direction: Direction,
    local_root: PathBuf,
    bucket: String,
    prefix: String,
    scan: OnceLock<Arc<ScanProgress>>,
    objects_found: AtomicU64,
    objects_done: AtomicBool,
    files_done: AtomicBool,
    bytes_to_transfer: AtomicU64,
    bytes_transferred: Arc<AtomicU64>,
    active_transfers: AtomicU64,
    uploaded: AtomicU64,
    downloaded: AtomicU64,
    skipped: AtomicU64,
    skipped_by_hook: AtomicU64,
    remote_deletes: DeleteProgress,
    local_deletes_queued: AtomicU64,
    local_deletes_done: AtomicU64,
    failure: OnceLock<String>,
    cancel: CancelFlag,
}

/// Point-in-time view of a sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSnapshot {
    pub direction: Direction,
    pub files_found: u64,
    pub objects_found: u64,
    pub bytes_to_hash: u64,
    pub bytes_hashed: u64,
    pub bytes_to_transfer: u64,
    pub bytes_transferred: u64,
    pub active_transfers: u64,
    pub deletes_pending: u64,
    pub deletes_done: u64,
    pub skipped: u64,
    pub files_done: bool,
    pub objects_done: bool,
    pub hashing_done: bool,
    pub failed: bool,
}

/// Result of a finished sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub direction: Direction,
    pub uploaded: u64,
    pub downloaded: u64,
    /// Identical on both sides
    pub skipped: u64,
    /// Passed over because the params hook said so
    pub skipped_by_hook: u64,
    pub deleted: u64,
    pub bytes_transferred: u64,
    pub elapsed: Duration,
}

enum Settled {
    Transfer(TransferOutcome),
    /// Download of this many bytes passed over: a local file is in the way
    Blocked(u64),
    RemoteDeleted(u64),
    LocalDeleted,
}

/// Merge state owned by the session loop
struct Merge {
    comparator: SyncComparator,
    local_head: Option<LocalFileRecord>,
    local_done: bool,
    remote: VecDeque<RemoteObjectRecord>,
    remote_done: bool,
    pruned_dir: Option<String>,
    delete_batch: Vec<String>,
    /// Local file removals still able to block a later download beneath them
    local_deletes: HashMap<String, watch::Receiver<bool>>,
    finished: bool,
}

impl Merge {
    fn ready(&self) -> bool {
        (self.local_head.is_some() || self.local_done)
            && (!self.remote.is_empty() || self.remote_done)
    }

    /// Drop removals that no key at or after `key` can sit beneath
    fn forget_local_deletes_before(&mut self, key: &str) {
        self.local_deletes.retain(|deleted, _| {
            let dir = format!("{}/", deleted);
            key.starts_with(&dir) || key < dir.as_str()
        });
    }
}

/// Every proper ancestor of `key`: `a/b/c` gives `a` then `a/b`
fn ancestor_keys(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/').map(move |(i, _)| &key[..i])
}

/// First of `ancestors` that exists and is not a directory
async fn blocking_file(ancestors: &[PathBuf]) -> Option<&Path> {
    for path in ancestors {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if !meta.is_dir() {
                return Some(path);
            }
        }
    }
    None
}

impl SyncSession {
    /// Create the state of a sync between `local_root` and `bucket/prefix`
    ///
    /// `prefix` is used as given; callers normally pass it through
    /// [`dir_prefix`](crate::storage::dir_prefix) first.
    pub fn new(
        direction: Direction,
        local_root: impl Into<PathBuf>,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            direction,
            local_root: local_root.into(),
            bucket: bucket.into(),
            prefix: prefix.into(),
            scan: OnceLock::new(),
            objects_found: AtomicU64::new(0),
            objects_done: AtomicBool::new(false),
            files_done: AtomicBool::new(false),
            bytes_to_transfer: AtomicU64::new(0),
            bytes_transferred: Arc::new(AtomicU64::new(0)),
            active_transfers: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
            downloaded: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            skipped_by_hook: AtomicU64::new(0),
            remote_deletes: DeleteProgress::new(cancel.clone()),
            local_deletes_queued: AtomicU64::new(0),
            local_deletes_done: AtomicU64::new(0),
            failure: OnceLock::new(),
            cancel,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// First fatal error, if the session failed
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    fn deleted(&self) -> u64 {
        self.remote_deletes.keys_deleted() + self.local_deletes_done.load(Ordering::Relaxed)
    }

    /// Run the merge to completion
    pub async fn run(
        self: Arc<Self>,
        transfers: TransferExecutor,
        options: SyncOptions,
    ) -> Result<SyncSummary> {
        let started = Instant::now();
        let result = Arc::clone(&self).merge(transfers, options).await;
        match result {
            Ok(()) => {
                let summary = self.summary(started.elapsed());
                tracing::info!(
                    "Sync finished: {} uploaded, {} downloaded, {} unchanged, {} deleted, {} in {}",
                    summary.uploaded,
                    summary.downloaded,
                    summary.skipped,
                    summary.deleted,
                    format_size(summary.bytes_transferred, BINARY),
                    humantime::format_duration(Duration::from_millis(
                        summary.elapsed.as_millis() as u64
                    ))
                );
                Ok(summary)
            }
            Err(e) => {
                let _ = self.failure.set(e.to_string());
                tracing::debug!("Sync of s3://{}/{} failed: {}", self.bucket, self.prefix, e);
                Err(e)
            }
        }
    }

    fn summary(&self, elapsed: Duration) -> SyncSummary {
        SyncSummary {
            direction: self.direction,
            uploaded: self.uploaded.load(Ordering::Relaxed),
            downloaded: self.downloaded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            skipped_by_hook: self.skipped_by_hook.load(Ordering::Relaxed),
            deleted: self.deleted(),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            elapsed,
        }
    }

    async fn merge(self: Arc<Self>, transfers: TransferExecutor, options: SyncOptions) -> Result<()> {
        let config: &ClientConfig = transfers.config();
        let max_inflight = transfers.executor().max_concurrent().max(1) * 2;

        let scan_config = ScanConfig {
            follow_symlinks: options.follow_symlinks,
            track_directories: options.delete_removed && self.direction == Direction::Download,
            hash_concurrency: config.hash_concurrency,
            read_buffer_size: config.read_buffer_size,
            extra_part_sizes: vec![config.multipart_upload_size],
        };
        let mut tree =
            LocalTreeDigestPipeline::new(scan_config).start(&self.local_root, self.cancel.clone());
        let _ = self.scan.set(Arc::clone(tree.progress()));

        let enumerator =
            RemoteListingEnumerator::new(Arc::clone(transfers.store()), transfers.executor().clone());
        let mut listing =
            enumerator.start(&self.bucket, &self.prefix, ListingMode::Flat, self.cancel.clone());

        let mut state = Merge {
            comparator: SyncComparator::new(self.direction, options.delete_removed),
            local_head: None,
            local_done: false,
            remote: VecDeque::new(),
            remote_done: false,
            pruned_dir: None,
            delete_batch: Vec::new(),
            local_deletes: HashMap::new(),
            finished: false,
        };
        let mut tasks: JoinSet<Result<Settled>> = JoinSet::new();
        let mut first_error: Option<SyncError> = None;

        loop {
            while first_error.is_none()
                && !state.finished
                && tasks.len() < max_inflight
                && state.ready()
            {
                let Some(step) = state
                    .comparator
                    .compare(state.local_head.as_ref(), state.remote.front())
                else {
                    state.finished = true;
                    break;
                };
                let local = match step.advance {
                    Advance::Local | Advance::Both => state.local_head.take(),
                    Advance::Remote => None,
                };
                let remote = match step.advance {
                    Advance::Remote | Advance::Both => state.remote.pop_front(),
                    Advance::Local => None,
                };
                if let Err(e) =
                    self.dispatch(step.decision, local, remote, &mut state, &mut tasks, &transfers, &options)
                {
                    first_error = Some(e);
                }
            }

            if first_error.is_none() && state.finished && !state.delete_batch.is_empty() {
                let batch = std::mem::take(&mut state.delete_batch);
                self.spawn_remote_delete(batch, &mut tasks, &transfers);
            }
            if (state.finished || first_error.is_some()) && tasks.is_empty() {
                break;
            }

            tokio::select! {
                record = tree.next(), if state.local_head.is_none() && !state.local_done && first_error.is_none() => {
                    match record {
                        Some(Ok(record)) => {
                            match &state.pruned_dir {
                                Some(dir) if record.key.starts_with(dir.as_str()) => {
                                    tracing::debug!("'{}' goes with its removed directory", record.key);
                                }
                                _ => {
                                    state.pruned_dir = None;
                                    state.local_head = Some(record);
                                }
                            }
                        }
                        Some(Err(e)) => first_error = Some(e.with_context("scanning local tree")),
                        None => {
                            state.local_done = true;
                            self.files_done.store(true, Ordering::Release);
                        }
                    }
                }
                batch = listing.next_batch(), if state.remote.is_empty() && !state.remote_done && first_error.is_none() => {
                    match batch {
                        Some(Ok(batch)) => {
                            self.objects_found.fetch_add(batch.objects.len() as u64, Ordering::Relaxed);
                            let accepted = batch.objects.into_iter().filter(|o| self.accept_remote(o));
                            state.remote.extend(accepted);
                        }
                        Some(Err(e)) => first_error = Some(e.with_context("listing remote objects")),
                        None => {
                            state.remote_done = true;
                            self.objects_done.store(true, Ordering::Release);
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    match joined.map_err(SyncError::from).and_then(|r| r) {
                        Ok(Settled::Transfer(outcome)) => {
                            let counter = match outcome.direction {
                                Direction::Upload => &self.uploaded,
                                Direction::Download => &self.downloaded,
                            };
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Settled::Blocked(bytes)) => {
                            self.bytes_to_transfer.fetch_sub(bytes, Ordering::Relaxed);
                            self.skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Settled::RemoteDeleted(n)) => {
                            tracing::debug!("Delete batch settled: {} object(s)", n);
                        }
                        Ok(Settled::LocalDeleted) => {
                            self.local_deletes_done.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            if first_error.is_none() {
                                tracing::debug!("Halting dispatch after failure: {}", e);
                                first_error = Some(e);
                            }
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Filter remote records that cannot be mirrored locally
    fn accept_remote(&self, record: &RemoteObjectRecord) -> bool {
        if record.key.is_empty() {
            return false;
        }
        if self.direction == Direction::Upload {
            return true;
        }
        if record.key.ends_with('/') {
            tracing::debug!("Skipping directory marker '{}'", record.full_key);
            return false;
        }
        if local_path_for_key(&self.local_root, &record.key).is_none() {
            tracing::warn!(
                "Skipping '{}': key cannot be stored under {}",
                record.full_key,
                self.local_root.display()
            );
            return false;
        }
        true
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        self: &Arc<Self>,
        decision: SyncDecision,
        local: Option<LocalFileRecord>,
        remote: Option<RemoteObjectRecord>,
        state: &mut Merge,
        tasks: &mut JoinSet<Result<Settled>>,
        transfers: &TransferExecutor,
        options: &SyncOptions,
    ) -> Result<()> {
        match (decision, local, remote) {
            (SyncDecision::Upload, Some(local), remote) => {
                let item = SyncItem::Upload {
                    local: &local,
                    remote: remote.as_ref(),
                };
                let Some(params) = self.consult_hook(options, &local.path, item)? else {
                    return Ok(());
                };
                let key = format!("{}{}", self.prefix, local.key);
                tracing::debug!("Upload {} -> {}", local.path.display(), key);
                self.bytes_to_transfer.fetch_add(local.size, Ordering::Relaxed);
                let task = self.transfer_task(Direction::Upload, local.path.clone(), key);
                let digest = local.digest;
                self.spawn_transfer(tasks, transfers, move |transfers| async move {
                    transfers
                        .upload(&task, &params, digest.as_ref())
                        .await
                        .map(Settled::Transfer)
                });
            }
            (SyncDecision::Download, local, Some(remote)) => {
                let Some(dest) = local_path_for_key(&self.local_root, &remote.key) else {
                    return Ok(());
                };
                let item = SyncItem::Download {
                    remote: &remote,
                    local: local.as_ref(),
                };
                if self.consult_hook(options, &dest, item)?.is_none() {
                    return Ok(());
                }
                state.forget_local_deletes_before(&remote.key);
                let pending: Vec<watch::Receiver<bool>> = ancestor_keys(&remote.key)
                    .filter_map(|ancestor| state.local_deletes.get(ancestor).cloned())
                    .collect();
                let ancestors: Vec<PathBuf> = ancestor_keys(&remote.key)
                    .filter_map(|ancestor| local_path_for_key(&self.local_root, ancestor))
                    .collect();

                tracing::debug!("Download {} -> {}", remote.full_key, dest.display());
                self.bytes_to_transfer.fetch_add(remote.size, Ordering::Relaxed);
                let size = remote.size;
                let full_key = remote.full_key.clone();
                let task = self.transfer_task(Direction::Download, dest, remote.full_key);
                self.spawn_transfer(tasks, transfers, move |transfers| async move {
                    for mut removed in pending {
                        // A dropped sender means the removal failed and already ended the sync
                        let _ = removed.wait_for(|done| *done).await;
                    }
                    if let Some(file) = blocking_file(&ancestors).await {
                        tracing::warn!(
                            "Skipping '{}': {} is a file, not a directory",
                            full_key,
                            file.display()
                        );
                        return Ok(Settled::Blocked(size));
                    }
                    transfers.download(&task).await.map(Settled::Transfer)
                });
            }
            (SyncDecision::DeleteRemote, _, Some(remote)) => {
                tracing::debug!("Queue delete of {}", remote.full_key);
                self.remote_deletes.add_found(1);
                state.delete_batch.push(remote.full_key);
                if state.delete_batch.len() >= MAX_DELETE_BATCH {
                    let batch = std::mem::take(&mut state.delete_batch);
                    self.spawn_remote_delete(batch, tasks, transfers);
                }
            }
            (SyncDecision::DeleteLocal, Some(local), _) => {
                tracing::debug!("Delete {}", local.path.display());
                self.local_deletes_queued.fetch_add(1, Ordering::Relaxed);
                state.forget_local_deletes_before(&local.key);
                let (done, removed) = watch::channel(false);
                state.local_deletes.insert(local.key, removed);
                tasks.spawn(async move {
                    remove_file_if_exists(&local.path).await?;
                    let _ = done.send(true);
                    Ok(Settled::LocalDeleted)
                });
            }
            (SyncDecision::RemoveLocalDir, Some(local), _) => {
                tracing::debug!("Remove directory {}", local.path.display());
                self.local_deletes_queued.fetch_add(1, Ordering::Relaxed);
                state.pruned_dir = Some(local.key);
                tasks.spawn(async move {
                    remove_dir_all_if_exists(&local.path).await?;
                    Ok(Settled::LocalDeleted)
                });
            }
            (SyncDecision::Skip, _, _) => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            (SyncDecision::KeepDir | SyncDecision::Ignore, _, _) => {}
            (decision, _, _) => {
                return Err(SyncError::TaskFailed(format!(
                    "merge step {:?} is missing its record",
                    decision
                )));
            }
        }
        Ok(())
    }

    /// Ask the hook about `item`; `None` means skip it
    fn consult_hook(
        &self,
        options: &SyncOptions,
        path: &std::path::Path,
        item: SyncItem<'_>,
    ) -> Result<Option<ObjectParams>> {
        let Some(hook) = &options.params_hook else {
            return Ok(Some(options.default_params.clone()));
        };
        let key = item.key().to_string();
        match hook(path, item).map_err(|e| e.with_context(format!("params hook for '{}'", key)))? {
            Some(overrides) => Ok(Some(options.default_params.merged(&overrides))),
            None => {
                tracing::debug!("Hook skipped '{}'", key);
                self.skipped_by_hook.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    fn transfer_task(&self, direction: Direction, path: PathBuf, key: String) -> Arc<TransferTask> {
        Arc::new(TransferTask::new(
            direction,
            path,
            self.bucket.clone(),
            key,
            TransferProgress::with_parent(Arc::clone(&self.bytes_transferred)),
            self.cancel.clone(),
        ))
    }

    fn spawn_transfer<F, Fut>(
        self: &Arc<Self>,
        tasks: &mut JoinSet<Result<Settled>>,
        transfers: &TransferExecutor,
        run: F,
    ) where
        F: FnOnce(TransferExecutor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<Settled>> + Send + 'static,
    {
        let session = Arc::clone(self);
        let transfers = transfers.clone();
        session.active_transfers.fetch_add(1, Ordering::Relaxed);
        tasks.spawn(async move {
            let result = run(transfers).await;
            session.active_transfers.fetch_sub(1, Ordering::Relaxed);
            result
        });
    }

    fn spawn_remote_delete(
        self: &Arc<Self>,
        batch: Vec<String>,
        tasks: &mut JoinSet<Result<Settled>>,
        transfers: &TransferExecutor,
    ) {
        let session = Arc::clone(self);
        let transfers = transfers.clone();
        tasks.spawn(async move {
            let n = transfers
                .delete_batch(&session.bucket, batch, &session.remote_deletes)
                .await?;
            Ok(Settled::RemoteDeleted(n))
        });
    }
}

impl Observable for SyncSession {
    type Snapshot = SyncSnapshot;

    fn snapshot(&self) -> SyncSnapshot {
        let scan = self.scan.get();
        let queued = self.remote_deletes.keys_found() + self.local_deletes_queued.load(Ordering::Relaxed);
        let deletes_done = self.deleted();
        SyncSnapshot {
            direction: self.direction,
            files_found: scan.map(|s| s.files_found()).unwrap_or(0),
            objects_found: self.objects_found.load(Ordering::Relaxed),
            bytes_to_hash: scan.map(|s| s.bytes_to_hash()).unwrap_or(0),
            bytes_hashed: scan.map(|s| s.bytes_hashed()).unwrap_or(0),
            bytes_to_transfer: self.bytes_to_transfer.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            active_transfers: self.active_transfers.load(Ordering::Relaxed),
            deletes_pending: queued.saturating_sub(deletes_done),
            deletes_done,
            skipped: self.skipped.load(Ordering::Relaxed),
            files_done: self.files_done.load(Ordering::Acquire),
            objects_done: self.objects_done.load(Ordering::Acquire),
            hashing_done: scan.map(|s| s.hashing_done()).unwrap_or(false),
            failed: self.failure.get().is_some(),
        }
    }

    fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}
