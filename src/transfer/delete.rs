//! Batched deletes
//!
//! Keys are removed in batches of at most 1000. Keys the store reports as
//! not deleted stay in the batch and the batch is retried with only those.

use super::executor::TransferExecutor;
use crate::core::{CancelFlag, Observable};
use crate::error::{Result, SyncError};
use crate::storage::{ListingMode, RemoteListingEnumerator};
use futures::stream::{self, FuturesUnordered, StreamExt, TryStreamExt};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Largest number of keys in one delete request
pub const MAX_DELETE_BATCH: usize = 1000;

/// Counters of a running delete
#[derive(Debug, Default)]
pub struct DeleteProgress {
    keys_found: AtomicU64,
    keys_deleted: AtomicU64,
    listing_done: AtomicBool,
    cancel: CancelFlag,
}

impl DeleteProgress {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }

    /// Keys queued for deletion so far
    pub fn keys_found(&self) -> u64 {
        self.keys_found.load(Ordering::Relaxed)
    }

    /// Keys the store confirmed as deleted
    pub fn keys_deleted(&self) -> u64 {
        self.keys_deleted.load(Ordering::Relaxed)
    }

    pub(crate) fn add_found(&self, n: u64) {
        self.keys_found.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn set_listing_done(&self) {
        self.listing_done.store(true, Ordering::Relaxed);
    }
}

/// Point-in-time view of a delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteSnapshot {
    pub keys_found: u64,
    pub keys_deleted: u64,
    pub listing_done: bool,
}

impl Observable for DeleteProgress {
    type Snapshot = DeleteSnapshot;

    fn snapshot(&self) -> DeleteSnapshot {
        DeleteSnapshot {
            keys_found: self.keys_found(),
            keys_deleted: self.keys_deleted(),
            listing_done: self.listing_done.load(Ordering::Relaxed),
        }
    }

    fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }
}

/// Result of a finished delete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeleteSummary {
    pub deleted: u64,
}

impl TransferExecutor {
    /// Delete up to [`MAX_DELETE_BATCH`] keys, retrying keys that failed
    pub async fn delete_batch(
        &self,
        bucket: &str,
        keys: Vec<String>,
        progress: &DeleteProgress,
    ) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let remaining = Mutex::new(keys);
        let remaining = &remaining;
        let deleted = AtomicU64::new(0);
        let deleted = &deleted;

        self.executor
            .run("delete_objects", progress.cancel_flag(), || async move {
                let mut keys = remaining.lock().await;
                let output = self.store.delete_objects(bucket, keys.clone()).await?;
                let n = output.deleted.len() as u64;
                deleted.fetch_add(n, Ordering::Relaxed);
                progress.keys_deleted.fetch_add(n, Ordering::Relaxed);

                let Some(first) = output.errors.first() else {
                    keys.clear();
                    return Ok(());
                };
                let failed: HashSet<&str> = output.errors.iter().map(|e| e.key.as_str()).collect();
                keys.retain(|k| failed.contains(k.as_str()));
                Err(SyncError::transient(
                    "delete_objects",
                    &first.key,
                    format!(
                        "{} key(s) not deleted: {} {}",
                        output.errors.len(),
                        first.code,
                        first.message
                    ),
                ))
            })
            .await?;

        let deleted = deleted.load(Ordering::Relaxed);
        tracing::debug!("Deleted {} object(s) from {}", deleted, bucket);
        Ok(deleted)
    }

    /// Delete any number of keys in concurrent batches
    pub async fn delete_keys(
        &self,
        bucket: &str,
        keys: Vec<String>,
        progress: &DeleteProgress,
    ) -> Result<u64> {
        progress.add_found(keys.len() as u64);
        progress.set_listing_done();
        let batches: Vec<Vec<String>> = keys
            .chunks(MAX_DELETE_BATCH)
            .map(<[String]>::to_vec)
            .collect();

        stream::iter(batches)
            .map(|batch| self.delete_batch(bucket, batch, progress))
            .buffer_unordered(self.executor.max_concurrent())
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await
    }

    /// Delete every object under `prefix`
    ///
    /// The prefix is listed recursively and keys are deleted while the
    /// listing is still running. After the first error no new batches are
    /// issued; batches already in flight are allowed to finish.
    pub async fn delete_tree(
        &self,
        bucket: &str,
        prefix: &str,
        progress: &DeleteProgress,
    ) -> Result<DeleteSummary> {
        let enumerator = RemoteListingEnumerator::new(self.store.clone(), self.executor.clone());
        let mut listing = enumerator.start(
            bucket,
            prefix,
            ListingMode::Recursive,
            progress.cancel_flag().clone(),
        );

        let max_inflight = self.executor.max_concurrent();
        let mut inflight = FuturesUnordered::new();
        let mut pending: Vec<String> = Vec::new();
        let mut listing_open = true;
        let mut deleted = 0u64;
        let mut first_error: Option<SyncError> = None;

        loop {
            if !listing_open && first_error.is_none() && !pending.is_empty() {
                let batch = std::mem::take(&mut pending);
                inflight.push(self.delete_batch(bucket, batch, progress));
            }
            if !listing_open && inflight.is_empty() {
                break;
            }

            tokio::select! {
                batch = listing.next_batch(), if listing_open && inflight.len() < max_inflight => {
                    match batch {
                        Some(Ok(batch)) => {
                            progress.add_found(batch.objects.len() as u64);
                            pending.extend(batch.objects.into_iter().map(|o| o.full_key));
                            while pending.len() >= MAX_DELETE_BATCH {
                                let rest = pending.split_off(MAX_DELETE_BATCH);
                                let batch = std::mem::replace(&mut pending, rest);
                                inflight.push(self.delete_batch(bucket, batch, progress));
                            }
                        }
                        Some(Err(e)) => {
                            first_error.get_or_insert(e);
                            listing_open = false;
                        }
                        None => {
                            listing_open = false;
                            progress.set_listing_done();
                        }
                    }
                }
                Some(result) = inflight.next(), if !inflight.is_empty() => {
                    match result {
                        Ok(n) => deleted += n,
                        Err(e) => {
                            tracing::debug!("Delete batch failed: {}", e);
                            first_error.get_or_insert(e);
                            listing_open = false;
                        }
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!("Deleted {} object(s) under s3://{}/{}", deleted, bucket, prefix);
                Ok(DeleteSummary { deleted })
            }
        }
    }
}
