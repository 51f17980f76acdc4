//! Client facade
//!
//! [`SyncClient`] owns the store, the settings and the shared request
//! limiter. Long-running operations are spawned and returned as
//! [`TaskHandle`]s that can be polled for progress, cancelled and awaited.

use crate::config::{ClientConfig, ObjectParams, SyncOptions};
use crate::core::{BoundedRetryExecutor, CancelFlag, TaskHandle};
use crate::error::Result;
use crate::storage::{
    dir_prefix, ByteStream, CopyObjectRequest, GetObjectRequest, ListingMode, ObjectStore,
    PutObjectOutput, RemoteListing, RemoteListingEnumerator,
};
use crate::sync::{SyncSession, SyncSummary};
use crate::transfer::{
    DeleteProgress, DeleteSummary, Direction, TransferExecutor, TransferOutcome, TransferProgress,
    TransferTask,
};
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

/// Entry point for syncs, single-object transfers and deletes
///
/// Every operation started from one client shares its concurrency cap.
/// Operations that return a [`TaskHandle`] must be started inside a Tokio
/// runtime.
#[derive(Clone)]
pub struct SyncClient {
    transfers: TransferExecutor,
}

impl SyncClient {
    /// Create a client; fails if `config` violates the store limits
    pub fn new(store: Arc<dyn ObjectStore>, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let executor = BoundedRetryExecutor::from_config(&config);
        Ok(Self {
            transfers: TransferExecutor::new(store, executor, Arc::new(config)),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        self.transfers.config()
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        self.transfers.store()
    }

    /// Mirror `local_dir` to `bucket/prefix`
    pub fn sync_up(
        &self,
        local_dir: impl AsRef<Path>,
        bucket: &str,
        prefix: &str,
        options: SyncOptions,
    ) -> TaskHandle<SyncSession, SyncSummary> {
        self.sync(Direction::Upload, local_dir.as_ref(), bucket, prefix, options)
    }

    /// Mirror `bucket/prefix` to `local_dir`
    pub fn sync_down(
        &self,
        local_dir: impl AsRef<Path>,
        bucket: &str,
        prefix: &str,
        options: SyncOptions,
    ) -> TaskHandle<SyncSession, SyncSummary> {
        self.sync(Direction::Download, local_dir.as_ref(), bucket, prefix, options)
    }

    fn sync(
        &self,
        direction: Direction,
        local_dir: &Path,
        bucket: &str,
        prefix: &str,
        options: SyncOptions,
    ) -> TaskHandle<SyncSession, SyncSummary> {
        let session = Arc::new(SyncSession::new(
            direction,
            local_dir,
            bucket,
            dir_prefix(prefix),
            CancelFlag::new(),
        ));
        tracing::info!(
            "Starting {:?} sync between {} and s3://{}/{}",
            direction,
            local_dir.display(),
            bucket,
            prefix
        );
        TaskHandle::spawn(
            Arc::clone(&session),
            session.run(self.transfers.clone(), options),
        )
    }

    /// Upload one file
    pub fn upload_file(
        &self,
        local_path: impl AsRef<Path>,
        bucket: &str,
        key: &str,
        params: ObjectParams,
    ) -> TaskHandle<TransferTask, TransferOutcome> {
        let task = Arc::new(new_task(Direction::Upload, local_path.as_ref(), bucket, key));
        let transfers = self.transfers.clone();
        let state = Arc::clone(&task);
        TaskHandle::spawn(state, async move {
            transfers.upload(&task, &params, None).await
        })
    }

    /// Download one object, creating parent directories as needed
    pub fn download_file(
        &self,
        bucket: &str,
        key: &str,
        local_path: impl AsRef<Path>,
    ) -> TaskHandle<TransferTask, TransferOutcome> {
        let task = Arc::new(new_task(Direction::Download, local_path.as_ref(), bucket, key));
        let transfers = self.transfers.clone();
        let state = Arc::clone(&task);
        TaskHandle::spawn(state, async move { transfers.download(&task).await })
    }

    /// Download one object into memory, verified like [`download_file`](Self::download_file)
    pub async fn download_buffer(&self, bucket: &str, key: &str) -> Result<Bytes> {
        let task = Arc::new(new_task(Direction::Download, Path::new(""), bucket, key));
        let (_, data) = self.transfers.download_buffer(&task).await?;
        Ok(data)
    }

    /// Open an object as a byte stream
    ///
    /// The request is retried until the body starts; the stream itself is
    /// neither retried nor verified.
    pub async fn download_stream(&self, bucket: &str, key: &str) -> Result<ByteStream> {
        let request = GetObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
        };
        let output = self
            .transfers
            .executor()
            .run("get_object", &CancelFlag::new(), || {
                self.store().get_object(request.clone())
            })
            .await?;
        tracing::debug!(
            "Streaming s3://{}/{} ({} bytes)",
            bucket,
            key,
            output.content_length
        );
        Ok(output.body)
    }

    /// Delete every object under `prefix`
    pub fn delete_tree(&self, bucket: &str, prefix: &str) -> TaskHandle<DeleteProgress, DeleteSummary> {
        let progress = Arc::new(DeleteProgress::new(CancelFlag::new()));
        let transfers = self.transfers.clone();
        let state = Arc::clone(&progress);
        let bucket = bucket.to_string();
        let prefix = prefix.to_string();
        TaskHandle::spawn(state, async move {
            transfers.delete_tree(&bucket, &prefix, &progress).await
        })
    }

    /// Delete the given keys in batches of at most 1000
    pub fn delete_objects(
        &self,
        bucket: &str,
        keys: Vec<String>,
    ) -> TaskHandle<DeleteProgress, DeleteSummary> {
        let progress = Arc::new(DeleteProgress::new(CancelFlag::new()));
        let transfers = self.transfers.clone();
        let state = Arc::clone(&progress);
        let bucket = bucket.to_string();
        TaskHandle::spawn(state, async move {
            let deleted = transfers.delete_keys(&bucket, keys, &progress).await?;
            Ok(DeleteSummary { deleted })
        })
    }

    /// List objects under `prefix`
    ///
    /// Without `recursive` only the first level is listed and sub-prefixes
    /// are reported in each batch's `common_prefixes`.
    pub fn list_objects(&self, bucket: &str, prefix: &str, recursive: bool) -> RemoteListing {
        let mode = if recursive {
            ListingMode::Recursive
        } else {
            ListingMode::Shallow
        };
        RemoteListingEnumerator::new(Arc::clone(self.store()), self.transfers.executor().clone())
            .start(bucket, prefix, mode, CancelFlag::new())
    }

    /// Server-side copy
    pub async fn copy_object(
        &self,
        bucket: &str,
        key: &str,
        source_bucket: &str,
        source_key: &str,
    ) -> Result<PutObjectOutput> {
        let request = CopyObjectRequest {
            bucket: bucket.to_string(),
            key: key.to_string(),
            source_bucket: source_bucket.to_string(),
            source_key: source_key.to_string(),
        };
        let output = self
            .transfers
            .executor()
            .run("copy_object", &CancelFlag::new(), || {
                self.store().copy_object(request.clone())
            })
            .await?;
        tracing::debug!("Copied s3://{}/{} -> s3://{}/{}", source_bucket, source_key, bucket, key);
        Ok(output)
    }

    /// Copy, then delete the source
    pub async fn move_object(
        &self,
        bucket: &str,
        key: &str,
        source_bucket: &str,
        source_key: &str,
    ) -> Result<()> {
        self.copy_object(bucket, key, source_bucket, source_key).await?;
        let progress = DeleteProgress::new(CancelFlag::new());
        self.transfers
            .delete_batch(source_bucket, vec![source_key.to_string()], &progress)
            .await?;
        Ok(())
    }

    /// Discard the parts of an unfinished multipart upload
    pub async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str) -> Result<()> {
        self.transfers
            .executor()
            .run("abort_multipart_upload", &CancelFlag::new(), || {
                self.store().abort_multipart_upload(bucket, key, upload_id)
            })
            .await?;
        tracing::info!("Aborted multipart upload {} of s3://{}/{}", upload_id, bucket, key);
        Ok(())
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("transfers", &self.transfers)
            .finish()
    }
}

fn new_task(direction: Direction, path: &Path, bucket: &str, key: &str) -> TransferTask {
    TransferTask::new(
        direction,
        path,
        bucket,
        key,
        TransferProgress::default(),
        CancelFlag::new(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Observable;
    use crate::hash::{MultipartDigest, Verification};
    use crate::storage::{MemoryStore, StoreOp};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    const MIB: u64 = 1024 * 1024;

    fn client(store: &Arc<MemoryStore>) -> SyncClient {
        let config = ClientConfig {
            max_concurrent_requests: 4,
            retry_delay: Duration::from_millis(1),
            ..Default::default()
        };
        SyncClient::new(store.clone(), config).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
        let config = ClientConfig {
            multipart_upload_size: MIB,
            ..Default::default()
        };
        assert_err!(SyncClient::new(store, config));
    }

    #[test]
    fn test_buffer_download_outside_async_test() {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("b", "k", &b"value"[..]);
        let client = client(&store);
        let data = tokio_test::block_on(client.download_buffer("b", "k"));
        assert_eq!(&assert_ok!(data)[..], b"value");
    }

    #[tokio::test]
    async fn test_download_stream_retries_open() {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("b", "logs/day.log", &b"line one\nline two\n"[..]);
        store.fail_next(StoreOp::GetObject, 1);
        let client = client(&store);

        let body = assert_ok!(client.download_stream("b", "logs/day.log").await);
        let data = assert_ok!(crate::storage::collect_body(body).await);
        assert_eq!(&data[..], b"line one\nline two\n");
        assert_eq!(store.calls(StoreOp::GetObject).len(), 1);

        assert!(client.download_stream("b", "logs/missing.log").await.is_err());
    }

    #[tokio::test]
    async fn test_upload_file_just_above_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("video.bin");
        let size = 21 * MIB;
        let data: Vec<u8> = (0..size).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let store = Arc::new(MemoryStore::new());
        let client = SyncClient::new(
            store.clone(),
            ClientConfig {
                multipart_upload_threshold: 20 * MIB,
                multipart_upload_size: 5 * MIB,
                retry_delay: Duration::from_millis(1),
                ..Default::default()
            },
        )
        .unwrap();

        let handle = client.upload_file(&path, "b", "media/video.bin", ObjectParams::default());
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.parts, 5);
        assert_eq!(outcome.bytes, size);
        assert_eq!(outcome.verification, Verification::Matched);

        let completes = store.calls(StoreOp::CompleteMultipartUpload);
        assert_eq!(completes[0].parts, [1, 2, 3, 4, 5]);
        let mut local = MultipartDigest::new();
        local.update(&data);
        local.finish();
        assert!(local.matches(store.object_checksum("b", "media/video.bin").as_deref()));
    }

    #[tokio::test]
    async fn test_download_file_reports_progress() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert_object("b", "docs/readme.md", &b"# readme"[..]);
        let client = client(&store);

        let handle = client.download_file("b", "docs/readme.md", dir.path().join("out/readme.md"));
        let state = Arc::clone(handle.state());
        let outcome = handle.wait().await.unwrap();

        assert_eq!(outcome.bytes, 8);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.bytes_done, snapshot.bytes_total);
        assert_eq!(std::fs::read(dir.path().join("out/readme.md")).unwrap(), b"# readme");
    }

    #[tokio::test]
    async fn test_sync_round_trip() {
        let src = TempDir::new().unwrap();
        std::fs::create_dir_all(src.path().join("a/b")).unwrap();
        std::fs::write(src.path().join("a/b/one.txt"), b"one").unwrap();
        std::fs::write(src.path().join("two.txt"), b"two").unwrap();
        let store = Arc::new(MemoryStore::new().with_page_size(1));
        let client = client(&store);

        let up = client
            .sync_up(src.path(), "b", "backup", SyncOptions::new())
            .wait()
            .await
            .unwrap();
        assert_eq!(up.uploaded, 2);
        assert_eq!(store.keys("b"), ["backup/a/b/one.txt", "backup/two.txt"]);

        // A second run finds nothing to do.
        let again = client
            .sync_up(src.path(), "b", "backup/", SyncOptions::new())
            .wait()
            .await
            .unwrap();
        assert_eq!((again.uploaded, again.skipped), (0, 2));

        let dest = TempDir::new().unwrap();
        let down = client
            .sync_down(dest.path(), "b", "backup", SyncOptions::new())
            .wait()
            .await
            .unwrap();
        assert_eq!(down.downloaded, 2);
        assert_eq!(std::fs::read(dest.path().join("a/b/one.txt")).unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_delete_tree_and_objects() {
        let store = Arc::new(MemoryStore::new());
        for key in ["logs/1", "logs/2", "logs/old/3", "data/x", "data/y"] {
            store.insert_object("b", key, &b"x"[..]);
        }
        let client = client(&store);

        let summary = client.delete_tree("b", "logs/").wait().await.unwrap();
        assert_eq!(summary.deleted, 3);

        let handle = client.delete_objects("b", vec!["data/x".to_string()]);
        assert_eq!(handle.wait().await.unwrap().deleted, 1);
        assert_eq!(store.keys("b"), ["data/y"]);
    }

    #[tokio::test]
    async fn test_shallow_listing_reports_prefixes() {
        let store = Arc::new(MemoryStore::new());
        for key in ["root/a.txt", "root/sub/b.txt", "root/sub/c.txt", "root/z.txt"] {
            store.insert_object("b", key, &b"x"[..]);
        }
        let client = client(&store);

        let mut listing = client.list_objects("b", "root/", false);
        let mut keys = Vec::new();
        let mut prefixes = Vec::new();
        while let Some(batch) = listing.next_batch().await {
            let batch = batch.unwrap();
            keys.extend(batch.objects.into_iter().map(|o| o.key));
            prefixes.extend(batch.common_prefixes);
        }
        assert_eq!(keys, ["a.txt", "z.txt"]);
        assert_eq!(prefixes, ["root/sub/"]);

        let all = client.list_objects("b", "root/", true).collect().await.unwrap();
        assert_eq!(all.len(), 4);
    }

    #[tokio::test]
    async fn test_copy_and_move() {
        let store = Arc::new(MemoryStore::new());
        store.insert_object("src", "a", &b"payload"[..]);
        store.fail_next(StoreOp::CopyObject, 1);
        let client = client(&store);

        assert_ok!(client.copy_object("dst", "copy", "src", "a").await);
        assert_ok!(client.move_object("dst", "moved", "src", "a").await);
        assert_eq!(&store.object("dst", "moved").unwrap()[..], b"payload");
        assert!(store.object("src", "a").is_none());
        assert_eq!(store.keys("dst"), ["copy", "moved"]);
    }

    #[tokio::test]
    async fn test_failed_multipart_upload_can_be_aborted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![1u8; (20 * MIB) as usize]).unwrap();
        let store = Arc::new(MemoryStore::new());
        store.fail_next(StoreOp::CompleteMultipartUpload, 3);
        let client = client(&store);

        let handle = client.upload_file(&path, "b", "big", ObjectParams::default());
        let task = Arc::clone(handle.state());
        assert_err!(handle.wait().await);
        assert!(task.snapshot().failed);

        let upload_id = task.upload_id().unwrap().to_string();
        assert_eq!(store.pending_uploads(), 1);
        assert_ok!(client.abort_multipart_upload("b", "big", &upload_id).await);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_handle_fails_with_cancelled() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f"), b"data").unwrap();
        let store = Arc::new(MemoryStore::new());
        store.set_delay(StoreOp::ListObjects, Duration::from_millis(100));
        let client = client(&store);

        let handle = client.sync_up(dir.path(), "b", "p", SyncOptions::new());
        handle.cancel();
        let err = handle.wait().await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(store.keys("b").is_empty());
    }
}
