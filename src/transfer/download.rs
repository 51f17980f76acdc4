//! Downloads
//!
//! The response body is streamed straight into its destination while a
//! digest is computed alongside. File downloads are staged next to the
//! destination and renamed into place only after the byte count and
//! checksum check out.

use super::executor::TransferExecutor;
use super::task::{TransferOutcome, TransferPlan, TransferTask};
use crate::core::Observable;
use crate::error::{IoResultExt, Result, SyncError};
use crate::fs::{create_parent_dirs, partial_path, remove_file_if_exists};
use crate::hash::{
    checksum_part_count, clean_checksum, guess_part_size, MultipartDigest, Verification,
};
use crate::storage::GetObjectRequest;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use humansize::{format_size, BINARY};
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Where downloaded bytes go
enum Sink {
    File {
        path: PathBuf,
        file: Option<tokio::fs::File>,
    },
    Memory(BytesMut),
}

impl Sink {
    /// Start over for a new attempt
    async fn reset(&mut self) -> Result<()> {
        match self {
            Sink::File { path, file } => {
                *file = Some(tokio::fs::File::create(&*path).await.with_path(&*path)?);
            }
            Sink::Memory(buf) => buf.clear(),
        }
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        match self {
            Sink::File {
                path,
                file: Some(file),
            } => file.write_all(chunk).await.with_path(&*path),
            Sink::File { path, file: None } => Err(SyncError::io(
                &*path,
                std::io::Error::other("write before the file was opened"),
            )),
            Sink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
        }
    }

    async fn finish(&mut self) -> Result<()> {
        if let Sink::File { path, file } = self {
            if let Some(mut f) = file.take() {
                f.flush().await.with_path(&*path)?;
                f.sync_all().await.with_path(&*path)?;
            }
        }
        Ok(())
    }
}

struct Fetched {
    content_length: u64,
    checksum: Option<String>,
    digest: MultipartDigest,
}

/// Digest candidates for verifying an object of `len` bytes against `checksum`
///
/// A `-N` suffix adds the part size that splits the object into N parts, plus
/// the configured upload part size.
fn digest_for(len: u64, checksum: Option<&str>, configured_part_size: u64) -> MultipartDigest {
    match checksum.map(clean_checksum).and_then(checksum_part_count) {
        Some(parts) if parts > 1 => MultipartDigest::with_extra_part_sizes(&[
            guess_part_size(len, parts),
            configured_part_size,
        ]),
        _ => MultipartDigest::single_part(),
    }
}

impl TransferExecutor {
    /// Download `task.key()` to `task.local_path()`
    ///
    /// Parent directories are created first. The destination is replaced
    /// only after verification; on failure the staged file is removed.
    pub async fn download(&self, task: &Arc<TransferTask>) -> Result<TransferOutcome> {
        task.guard(async {
            let dest = task.local_path();
            create_parent_dirs(dest).await?;
            let staged = partial_path(dest);
            let sink = Mutex::new(Sink::File {
                path: staged.clone(),
                file: None,
            });

            let outcome = match self.fetch(task, &sink).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    drop(sink);
                    if let Err(cleanup) = remove_file_if_exists(&staged).await {
                        tracing::warn!("Could not remove {}: {}", staged.display(), cleanup);
                    }
                    return Err(e);
                }
            };
            tokio::fs::rename(&staged, dest).await.with_path(dest)?;
            tracing::info!(
                "Downloaded {} -> {} ({})",
                task.key(),
                dest.display(),
                format_size(outcome.bytes, BINARY)
            );
            Ok(outcome)
        })
        .await
    }

    /// Download `task.key()` into memory
    ///
    /// Verification is the same as for [`download`](Self::download);
    /// `task.local_path()` is not used.
    pub async fn download_buffer(&self, task: &Arc<TransferTask>) -> Result<(TransferOutcome, Bytes)> {
        task.guard(async {
            let sink = Mutex::new(Sink::Memory(BytesMut::new()));
            let outcome = self.fetch(task, &sink).await?;
            let data = match sink.into_inner() {
                Sink::Memory(buf) => buf.freeze(),
                Sink::File { .. } => Bytes::new(),
            };
            tracing::debug!(
                "Downloaded {} into memory ({})",
                task.key(),
                format_size(outcome.bytes, BINARY)
            );
            Ok((outcome, data))
        })
        .await
    }

    async fn fetch(&self, task: &Arc<TransferTask>, sink: &Mutex<Sink>) -> Result<TransferOutcome> {
        task.check()?;
        let key = task.key();
        let mark = AtomicU64::new(0);
        let mark = &mark;

        let fetched = self
            .executor
            .run("get_object", task.cancel_flag(), || async move {
                let output = self
                    .store
                    .get_object(GetObjectRequest {
                        bucket: task.bucket().to_string(),
                        key: key.to_string(),
                    })
                    .await?;
                let len = output.content_length;
                task.progress().set_total(len);
                task.set_plan(&TransferPlan::Single { size: len });

                let mut sink = sink.lock().await;
                sink.reset().await?;
                let mut digest = digest_for(
                    len,
                    output.checksum.as_deref(),
                    self.config.multipart_upload_size,
                );
                let mut body = output.body;
                let mut seen = 0u64;
                while let Some(chunk) = body.next().await {
                    let chunk = chunk.map_err(|e| {
                        SyncError::transient("get_object", key, format!("body stream failed: {}", e))
                    })?;
                    task.check()?;
                    sink.write(&chunk).await?;
                    digest.update(&chunk);
                    seen += chunk.len() as u64;
                    task.progress().record(mark, seen);
                }
                sink.finish().await?;
                digest.finish();
                Ok(Fetched {
                    content_length: len,
                    checksum: output.checksum,
                    digest,
                })
            })
            .await?;

        let received = fetched.digest.bytes();
        if received != fetched.content_length {
            return Err(SyncError::integrity_mismatch(
                key,
                format!("{} bytes", fetched.content_length),
                format!("{} bytes received", received),
            ));
        }

        let checksum = fetched.checksum.as_deref();
        let verification = fetched.digest.verify(checksum);
        match verification {
            Verification::Matched => {}
            Verification::Mismatched => {
                return Err(SyncError::integrity_mismatch(
                    key,
                    checksum.map(clean_checksum).unwrap_or_default(),
                    fetched.digest.content_md5_hex().unwrap_or_default(),
                ));
            }
            Verification::Unverifiable => {
                tracing::warn!(
                    "Could not verify '{}' against checksum {:?}; part layout unknown",
                    key,
                    checksum
                );
            }
        }
        task.part_finished();

        Ok(TransferOutcome {
            direction: task.direction(),
            key: key.to_string(),
            bytes: received,
            checksum: checksum.map(|c| clean_checksum(c).to_string()),
            verification,
            parts: 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::core::{BoundedRetryExecutor, CancelFlag, RetryPolicy};
    use crate::hash::{md5_digest, multipart_checksum};
    use crate::storage::{MemoryStore, StoreOp};
    use crate::transfer::{Direction, TransferProgress};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    const MIB: usize = 1024 * 1024;

    fn setup() -> (Arc<MemoryStore>, TransferExecutor) {
        let store = Arc::new(MemoryStore::new());
        let executor = BoundedRetryExecutor::new(4, RetryPolicy::new(3, Duration::from_millis(1)));
        let transfers =
            TransferExecutor::new(store.clone(), executor, Arc::new(ClientConfig::default()));
        (store, transfers)
    }

    fn task_for(path: &Path, key: &str) -> Arc<TransferTask> {
        Arc::new(TransferTask::new(
            Direction::Download,
            path,
            "b",
            key,
            TransferProgress::default(),
            CancelFlag::new(),
        ))
    }

    #[tokio::test]
    async fn test_download_creates_parents_and_verifies() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested/deeper/file.txt");
        let (store, transfers) = setup();
        store.insert_object("b", "file.txt", &b"downloaded content"[..]);

        let task = task_for(&dest, "file.txt");
        let outcome = transfers.download(&task).await.unwrap();

        assert_eq!(outcome.verification, Verification::Matched);
        assert_eq!(std::fs::read(&dest).unwrap(), b"downloaded content");
        assert!(!partial_path(&dest).exists());
        assert_eq!(task.snapshot().bytes_done, 18);
    }

    #[tokio::test]
    async fn test_multipart_checksum_uses_part_count_hint() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(9 * MIB - 1)).map(|i| (i % 199) as u8).collect();
        // Uploaded elsewhere with 3 MiB parts, which is not a default candidate.
        let parts: Vec<[u8; 16]> = data.chunks(3 * MIB).map(md5_digest).collect();
        let etag = format!("\"{}\"", multipart_checksum(&parts));
        let (store, transfers) = setup();
        store.insert_object_with_checksum("b", "big.bin", data.clone(), &etag);

        let task = task_for(&dest, "big.bin");
        let outcome = transfers.download(&task).await.unwrap();
        assert_eq!(outcome.verification, Verification::Matched);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[tokio::test]
    async fn test_unknown_multipart_layout_is_unverifiable() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("odd.bin");
        let data = vec![7u8; 2 * MIB];
        let (store, transfers) = setup();
        store.insert_object_with_checksum("b", "odd.bin", data, "\"0123456789abcdef0123456789abcdef-5\"");

        let task = task_for(&dest, "odd.bin");
        let outcome = transfers.download(&task).await.unwrap();
        assert_eq!(outcome.verification, Verification::Unverifiable);
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn test_corrupted_checksum_removes_staged_file() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("f.txt");
        let (store, transfers) = setup();
        store.insert_object("b", "f.txt", &b"payload"[..]);
        store.corrupt_next_checksum(StoreOp::GetObject, 1);

        let task = task_for(&dest, "f.txt");
        let err = transfers.download(&task).await.unwrap_err();
        assert!(matches!(err, SyncError::IntegrityMismatch { .. }));
        assert!(!dest.exists());
        assert!(!partial_path(&dest).exists());
        assert!(task.failure().is_some());
    }

    #[tokio::test]
    async fn test_truncated_body_fails_size_check() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("f.txt");
        let (store, transfers) = setup();
        store.insert_object("b", "f.txt", &b"0123456789"[..]);
        store.truncate_next_get(4);

        let task = task_for(&dest, "f.txt");
        let err = transfers.download(&task).await.unwrap_err();
        assert!(err.to_string().contains("10 bytes"));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_transient_get_is_retried() {
        let (store, transfers) = setup();
        store.insert_object("b", "k", &b"retry me"[..]);
        store.fail_next(StoreOp::GetObject, 2);

        let task = task_for(Path::new(""), "k");
        let (outcome, data) = transfers.download_buffer(&task).await.unwrap();
        assert_eq!(&data[..], b"retry me");
        assert_eq!(outcome.bytes, 8);
        assert_eq!(task.progress().done(), 8);
    }

    #[tokio::test]
    async fn test_missing_object_is_rejected() {
        let (_store, transfers) = setup();
        let task = task_for(Path::new(""), "absent");
        let err = transfers.download_buffer(&task).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Rejected);
    }
}
