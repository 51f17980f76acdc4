//! Remote listing enumeration
//!
//! Pages are fetched through the retry executor from a work queue of
//! `(prefix, continuation token)` requests. Each prefix is paged
//! sequentially; in recursive mode the common prefixes of every page are
//! queued as new independent listings, so several prefixes can be in flight
//! at once under the shared concurrency cap.

use super::object_store::{ListObjectsRequest, ListObjectsPage, ObjectStore};
use crate::core::{BoundedRetryExecutor, CancelFlag};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

const BATCH_CHANNEL_SIZE: usize = 16;

/// Object found by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObjectRecord {
    /// Key relative to the listed prefix
    pub key: String,
    /// Full key in the bucket
    pub full_key: String,
    pub size: u64,
    /// Raw checksum as returned by the store
    pub checksum: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// How a prefix is enumerated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListingMode {
    /// No delimiter: every key under the prefix, in strict global key order
    #[default]
    Flat,
    /// One level: objects directly under the prefix plus common prefixes
    Shallow,
    /// Common prefixes are expanded concurrently; order holds within a prefix
    Recursive,
}

/// Objects (and, in shallow mode, sub-prefixes) of one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingBatch {
    /// Prefix whose page this is
    pub prefix: String,
    pub objects: Vec<RemoteObjectRecord>,
    /// Sub-prefixes, reported only in shallow mode
    pub common_prefixes: Vec<String>,
}

/// Starts listings against one store
#[derive(Clone)]
pub struct RemoteListingEnumerator {
    store: Arc<dyn ObjectStore>,
    executor: BoundedRetryExecutor,
}

impl RemoteListingEnumerator {
    /// Create an enumerator that issues pages through `executor`
    pub fn new(store: Arc<dyn ObjectStore>, executor: BoundedRetryExecutor) -> Self {
        Self { store, executor }
    }

    /// Begin listing `prefix`; pages are fetched in the background
    pub fn start(
        &self,
        bucket: &str,
        prefix: &str,
        mode: ListingMode,
        cancel: CancelFlag,
    ) -> RemoteListing {
        let (tx, rx) = mpsc::channel(BATCH_CHANNEL_SIZE);
        let worker = ListingWorker {
            store: Arc::clone(&self.store),
            executor: self.executor.clone(),
            bucket: bucket.to_string(),
            root: prefix.to_string(),
            mode,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run(tx));
        RemoteListing {
            rx,
            cancel,
            task,
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl std::fmt::Debug for RemoteListingEnumerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteListingEnumerator")
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

struct ListingWorker {
    store: Arc<dyn ObjectStore>,
    executor: BoundedRetryExecutor,
    bucket: String,
    root: String,
    mode: ListingMode,
    cancel: CancelFlag,
}

type PageResult = (String, Result<ListObjectsPage>);

impl ListingWorker {
    fn spawn_page(&self, pages: &mut JoinSet<PageResult>, prefix: String, token: Option<String>) {
        let store = Arc::clone(&self.store);
        let executor = self.executor.clone();
        let cancel = self.cancel.clone();
        let request = ListObjectsRequest {
            bucket: self.bucket.clone(),
            prefix: prefix.clone(),
            delimiter: match self.mode {
                ListingMode::Flat => None,
                ListingMode::Shallow | ListingMode::Recursive => Some("/".to_string()),
            },
            continuation_token: token,
        };
        pages.spawn(async move {
            let page = executor
                .run("list_objects", &cancel, || store.list_objects(request.clone()))
                .await;
            (prefix, page)
        });
    }

    async fn run(self, tx: mpsc::Sender<Result<ListingBatch>>) {
        let mut pages = JoinSet::new();
        self.spawn_page(&mut pages, self.root.clone(), None);

        while let Some(joined) = pages.join_next().await {
            let (prefix, page) = match joined {
                Ok(result) => result,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    tracing::debug!("Listing of '{}' failed: {}", prefix, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if self.cancel.is_cancelled() {
                let _ = tx.send(Err(SyncError::Cancelled)).await;
                return;
            }

            if page.is_truncated {
                match page.next_continuation_token.clone() {
                    Some(token) => self.spawn_page(&mut pages, prefix.clone(), Some(token)),
                    None => {
                        let err = SyncError::rejected(
                            "list_objects",
                            &prefix,
                            None,
                            "truncated page without a continuation token",
                        );
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                }
            }

            let mut common_prefixes = page.common_prefixes;
            if self.mode == ListingMode::Recursive {
                for sub in common_prefixes.drain(..) {
                    self.spawn_page(&mut pages, sub, None);
                }
            }

            let objects = page
                .objects
                .into_iter()
                .map(|o| RemoteObjectRecord {
                    key: o.key.strip_prefix(&self.root).unwrap_or(&o.key).to_string(),
                    full_key: o.key,
                    size: o.size,
                    checksum: o.checksum,
                    last_modified: o.last_modified,
                })
                .collect();
            let batch = ListingBatch {
                prefix,
                objects,
                common_prefixes,
            };
            if tx.send(Ok(batch)).await.is_err() {
                // Receiver gone; dropping the set aborts outstanding pages.
                return;
            }
        }
    }
}

/// A running listing
///
/// Dropping the listing aborts its background task; the cancel flag it was
/// started with is left alone.
pub struct RemoteListing {
    rx: mpsc::Receiver<Result<ListingBatch>>,
    cancel: CancelFlag,
    task: JoinHandle<()>,
    pending: VecDeque<RemoteObjectRecord>,
    finished: bool,
}

impl RemoteListing {
    /// Next page of results, or `None` once the listing is exhausted
    pub async fn next_batch(&mut self) -> Option<Result<ListingBatch>> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Ok(batch)) => Some(Ok(batch)),
            Some(Err(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                None
            }
        }
    }

    /// Next object, one at a time
    pub async fn next(&mut self) -> Option<Result<RemoteObjectRecord>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Some(Ok(record));
            }
            match self.next_batch().await? {
                Ok(batch) => self.pending.extend(batch.objects),
                Err(e) => return Some(Err(e)),
            }
        }
    }

    /// Drain every object into a vector
    pub async fn collect(mut self) -> Result<Vec<RemoteObjectRecord>> {
        let mut out = Vec::new();
        while let Some(record) = self.next().await {
            out.push(record?);
        }
        Ok(out)
    }

    /// Stop issuing page requests
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the listing has delivered its last result
    pub fn is_finished(&self) -> bool {
        self.finished && self.pending.is_empty()
    }
}

impl Drop for RemoteListing {
    fn drop(&mut self) {
        if !self.task.is_finished() {
            self.task.abort();
        }
    }
}

impl std::fmt::Debug for RemoteListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteListing")
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}
