//! Uploads
//!
//! Small files go up in one request. Files at or above the multipart
//! threshold are split into parts uploaded concurrently, each retried on its
//! own; the completion call lists them in part-number order. Every body is
//! hashed while it is sent and checked against the checksum the store
//! returns.

use super::executor::{digesting_body, TransferExecutor};
use super::task::{PartRange, TransferOutcome, TransferPlan, TransferTask};
use crate::config::ObjectParams;
use crate::core::Observable;
use crate::error::{IoResultExt, Result, SyncError};
use crate::fs::read_range;
use crate::hash::{clean_checksum, multipart_checksum, MultipartDigest, Verification};
use crate::storage::{
    CompleteMultipartRequest, CompletedPart, PutObjectRequest, UploadPartRequest,
};
use futures::stream::{self, StreamExt, TryStreamExt};
use humansize::{format_size, BINARY};
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

struct UploadedPart {
    number: u32,
    md5: [u8; 16],
    checksum: String,
}

impl TransferExecutor {
    /// Upload `task.local_path()` to `task.key()`
    ///
    /// `local_digest`, when the file was already hashed, supplies the
    /// Content-MD5 of single-request uploads.
    pub async fn upload(
        &self,
        task: &Arc<TransferTask>,
        params: &ObjectParams,
        local_digest: Option<&MultipartDigest>,
    ) -> Result<TransferOutcome> {
        task.guard(self.upload_inner(task, params, local_digest))
            .await
    }

    async fn upload_inner(
        &self,
        task: &Arc<TransferTask>,
        params: &ObjectParams,
        local_digest: Option<&MultipartDigest>,
    ) -> Result<TransferOutcome> {
        task.check()?;
        let path = task.local_path();
        let size = tokio::fs::metadata(path).await.with_path(path)?.len();
        let plan = TransferPlan::for_upload(
            task.key(),
            size,
            self.config.multipart_upload_threshold,
            self.config.multipart_upload_size,
        )?;
        task.set_plan(&plan);
        task.progress().set_total(size);
        tracing::debug!(
            "Uploading {} -> {} ({}, {} part(s))",
            path.display(),
            task.key(),
            format_size(size, BINARY),
            plan.part_count()
        );

        let params = &ObjectParams {
            content_type: Some(params.content_type_for(path)),
            ..params.clone()
        };
        let outcome = match plan {
            TransferPlan::Single { size } => {
                let content_md5 = local_digest
                    .filter(|d| d.bytes() == size)
                    .and_then(MultipartDigest::content_md5);
                self.put_single(task, size, params, content_md5).await?
            }
            TransferPlan::Multipart { parts, .. } => self.put_multipart(task, parts, params).await?,
        };
        tracing::info!(
            "Uploaded {} ({})",
            task.key(),
            format_size(outcome.bytes, BINARY)
        );
        Ok(outcome)
    }

    async fn put_single(
        &self,
        task: &Arc<TransferTask>,
        size: u64,
        params: &ObjectParams,
        content_md5: Option<[u8; 16]>,
    ) -> Result<TransferOutcome> {
        let key = task.key();
        let buffer_size = self.config.read_buffer_size;
        let mark = Arc::new(AtomicU64::new(0));

        let (output, digest) = self
            .executor
            .run("put_object", task.cancel_flag(), || {
                let mark = Arc::clone(&mark);
                let progress_task = Arc::clone(task);
                async move {
                    let body = read_range(task.local_path(), 0, size, buffer_size).await?;
                    let (body, digest_rx) =
                        digesting_body(body, MultipartDigest::single_part(), move |n| {
                            progress_task.progress().record(&mark, n)
                        });
                    let output = self
                        .store
                        .put_object(PutObjectRequest {
                            bucket: task.bucket().to_string(),
                            key: key.to_string(),
                            body,
                            content_length: size,
                            content_md5,
                            params: params.clone(),
                        })
                        .await?;
                    let digest = digest_rx.await.map_err(|_| {
                        SyncError::transient("put_object", key, "request body was not fully sent")
                    })?;
                    Ok((output, digest))
                }
            })
            .await?;

        if digest.bytes() != size {
            return Err(SyncError::integrity_mismatch(
                key,
                format!("{} bytes", size),
                format!("{} bytes read", digest.bytes()),
            ));
        }
        let verification = match output.checksum.as_deref() {
            None => {
                tracing::warn!("Store returned no checksum for '{}'; not verified", key);
                Verification::Unverifiable
            }
            Some(remote) if digest.matches(Some(remote)) => Verification::Matched,
            Some(remote) => {
                return Err(SyncError::integrity_mismatch(
                    key,
                    digest.content_md5_hex().unwrap_or_default(),
                    clean_checksum(remote),
                ));
            }
        };
        task.part_finished();

        Ok(TransferOutcome {
            direction: task.direction(),
            key: key.to_string(),
            bytes: size,
            checksum: output.checksum.as_deref().map(|c| clean_checksum(c).to_string()),
            verification,
            parts: 1,
        })
    }

    async fn put_multipart(
        &self,
        task: &Arc<TransferTask>,
        parts: Vec<PartRange>,
        params: &ObjectParams,
    ) -> Result<TransferOutcome> {
        let key = task.key();
        let upload_id = self
            .executor
            .run("create_multipart_upload", task.cancel_flag(), || {
                self.store
                    .create_multipart_upload(task.bucket(), key, params)
            })
            .await?;
        task.set_upload_id(upload_id.clone());
        tracing::debug!("Started multipart upload {} for '{}'", upload_id, key);

        let total: u64 = parts.iter().map(|p| p.len).sum();
        let uploaded = stream::iter(parts)
            .map(|range| self.put_part(task, &upload_id, range))
            .buffer_unordered(self.executor.max_concurrent())
            .try_collect::<Vec<_>>()
            .await;
        let mut uploaded = match uploaded {
            Ok(uploaded) => uploaded,
            Err(e) => {
                tracing::warn!(
                    "Multipart upload {} of '{}' failed and was left open: {}",
                    upload_id,
                    key,
                    e
                );
                return Err(e);
            }
        };
        uploaded.sort_by_key(|p| p.number);

        let digests: Vec<[u8; 16]> = uploaded.iter().map(|p| p.md5).collect();
        let expected = multipart_checksum(&digests);
        let request = CompleteMultipartRequest {
            bucket: task.bucket().to_string(),
            key: key.to_string(),
            upload_id: upload_id.clone(),
            parts: uploaded
                .iter()
                .map(|p| CompletedPart {
                    part_number: p.number,
                    checksum: p.checksum.clone(),
                })
                .collect(),
        };
        let output = self
            .executor
            .run("complete_multipart_upload", task.cancel_flag(), || {
                self.store.complete_multipart_upload(request.clone())
            })
            .await?;

        let verification = match output.checksum.as_deref().map(clean_checksum) {
            None => {
                tracing::warn!("Store returned no checksum for '{}'; not verified", key);
                Verification::Unverifiable
            }
            Some(remote) if remote.eq_ignore_ascii_case(&expected) => Verification::Matched,
            Some(remote) => {
                return Err(SyncError::integrity_mismatch(key, expected, remote));
            }
        };

        Ok(TransferOutcome {
            direction: task.direction(),
            key: key.to_string(),
            bytes: total,
            checksum: Some(expected),
            verification,
            parts: uploaded.len() as u32,
        })
    }

    async fn put_part(
        &self,
        task: &Arc<TransferTask>,
        upload_id: &str,
        range: PartRange,
    ) -> Result<UploadedPart> {
        task.check()?;
        let key = task.key();
        let buffer_size = self.config.read_buffer_size;
        let mark = Arc::new(AtomicU64::new(0));

        let (output, digest) = self
            .executor
            .run("upload_part", task.cancel_flag(), || {
                let mark = Arc::clone(&mark);
                let progress_task = Arc::clone(task);
                async move {
                    let body =
                        read_range(task.local_path(), range.offset, range.len, buffer_size).await?;
                    let (body, digest_rx) =
                        digesting_body(body, MultipartDigest::single_part(), move |n| {
                            progress_task.progress().record(&mark, n)
                        });
                    let output = self
                        .store
                        .upload_part(UploadPartRequest {
                            bucket: task.bucket().to_string(),
                            key: key.to_string(),
                            upload_id: upload_id.to_string(),
                            part_number: range.number,
                            body,
                            content_length: range.len,
                        })
                        .await?;
                    let digest = digest_rx.await.map_err(|_| {
                        SyncError::transient("upload_part", key, "part body was not fully sent")
                    })?;
                    Ok((output, digest))
                }
            })
            .await?;

        let md5 = match digest.content_md5() {
            Some(md5) if digest.bytes() == range.len => md5,
            _ => {
                return Err(SyncError::integrity_mismatch(
                    key,
                    format!("part {} of {} bytes", range.number, range.len),
                    format!("{} bytes read", digest.bytes()),
                ));
            }
        };
        let checksum = output.checksum.ok_or_else(|| {
            SyncError::rejected("upload_part", key, None, "store returned no part checksum")
        })?;
        if !digest.matches(Some(&checksum)) {
            return Err(SyncError::integrity_mismatch(
                key,
                hex::encode(md5),
                clean_checksum(&checksum),
            )
            .with_context(format!("part {}", range.number)));
        }
        task.part_finished();

        Ok(UploadedPart {
            number: range.number,
            md5,
            checksum,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::core::{BoundedRetryExecutor, CancelFlag, RetryPolicy};
    use crate::hash::md5_hex;
    use crate::storage::{MemoryStore, ObjectStore, StoreOp};
    use crate::transfer::{Direction, TransferProgress};
    use std::time::Duration;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn setup(config: ClientConfig) -> (Arc<MemoryStore>, TransferExecutor) {
        let store = Arc::new(MemoryStore::new());
        let executor = BoundedRetryExecutor::new(4, RetryPolicy::new(3, Duration::from_millis(1)));
        let transfers = TransferExecutor::new(store.clone(), executor, Arc::new(config));
        (store, transfers)
    }

    fn task_for(path: &std::path::Path, key: &str) -> Arc<TransferTask> {
        Arc::new(TransferTask::new(
            Direction::Upload,
            path,
            "b",
            key,
            TransferProgress::default(),
            CancelFlag::new(),
        ))
    }

    fn pattern(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_single_put_verifies_checksum() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let (store, transfers) = setup(ClientConfig::default());

        let task = task_for(&path, "small.txt");
        let outcome = transfers
            .upload(&task, &ObjectParams::default(), None)
            .await
            .unwrap();

        assert_eq!(outcome.verification, Verification::Matched);
        assert_eq!(outcome.checksum.as_deref(), Some(md5_hex(b"hello world").as_str()));
        assert_eq!(store.object("b", "small.txt").unwrap().as_ref(), b"hello world");
        assert_eq!(task.progress().done(), 11);
    }

    #[tokio::test]
    async fn test_content_type_guessed_from_extension() {
        let dir = TempDir::new().unwrap();
        let text = dir.path().join("x.txt");
        let blob = dir.path().join("x.zzunknown");
        let big = dir.path().join("big.json");
        std::fs::write(&text, b"hi").unwrap();
        std::fs::write(&blob, b"hi").unwrap();
        std::fs::write(&big, pattern(12 * MIB)).unwrap();
        let config = ClientConfig {
            multipart_upload_threshold: 5 * MIB,
            multipart_upload_size: 5 * MIB,
            ..Default::default()
        };
        let (store, transfers) = setup(config);
        let params = ObjectParams {
            default_content_type: Some("application/x-fallback".into()),
            ..Default::default()
        };

        for (path, key) in [(&text, "x.txt"), (&blob, "x.bin"), (&big, "big.json")] {
            transfers.upload(&task_for(path, key), &params, None).await.unwrap();
        }

        let stored = |key: &str| store.object_params("b", key).unwrap().content_type;
        assert_eq!(stored("x.txt").as_deref(), Some("text/plain"));
        assert_eq!(stored("x.bin").as_deref(), Some("application/x-fallback"));
        assert_eq!(stored("big.json").as_deref(), Some("application/json"));

        transfers
            .upload(&task_for(&blob, "plain.bin"), &ObjectParams::default(), None)
            .await
            .unwrap();
        assert_eq!(stored("plain.bin").as_deref(), Some("application/octet-stream"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"content").unwrap();
        let (store, transfers) = setup(ClientConfig::default());
        store.corrupt_next_checksum(StoreOp::PutObject, 1);

        let task = task_for(&path, "f");
        let err = transfers
            .upload(&task, &ObjectParams::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::IntegrityMismatch { .. }));
        assert!(task.failure().is_some());
        // Not retried.
        assert_eq!(store.calls(StoreOp::PutObject).len(), 1);
    }

    #[tokio::test]
    async fn test_multipart_upload_just_above_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let data = pattern(11 * MIB + 123);
        std::fs::write(&path, &data).unwrap();
        let (store, transfers) = setup(ClientConfig {
            multipart_upload_threshold: 11 * MIB,
            multipart_upload_size: 5 * MIB,
            ..Default::default()
        });

        let task = task_for(&path, "big.bin");
        let outcome = transfers
            .upload(&task, &ObjectParams::default(), None)
            .await
            .unwrap();

        assert_eq!(outcome.parts, 3);
        assert_eq!(outcome.verification, Verification::Matched);
        let completes = store.calls(StoreOp::CompleteMultipartUpload);
        assert_eq!(completes.len(), 1);
        assert_eq!(completes[0].parts, [1, 2, 3]);

        let stored = store.object_checksum("b", "big.bin").unwrap();
        let mut local = MultipartDigest::new();
        local.update(&data);
        local.finish();
        assert!(local.matches(Some(&stored)));
        assert_eq!(task.snapshot().parts_done, 3);
        assert!(task.upload_id().is_some());
    }

    #[tokio::test]
    async fn test_retried_part_progress_is_monotonic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let size = 10 * MIB + 1;
        std::fs::write(&path, pattern(size)).unwrap();
        let (store, transfers) = setup(ClientConfig {
            multipart_upload_threshold: 10 * MIB,
            multipart_upload_size: 5 * MIB,
            read_buffer_size: 64 * 1024,
            ..Default::default()
        });
        store.fail_next(StoreOp::UploadPart, 1);

        let task = task_for(&path, "big.bin");
        let poller = {
            let task = Arc::clone(&task);
            tokio::spawn(async move {
                let mut last = 0;
                let mut samples = Vec::new();
                while task.snapshot().bytes_done < size && task.failure().is_none() {
                    let now = task.snapshot().bytes_done;
                    samples.push(now >= last);
                    last = now;
                    tokio::task::yield_now().await;
                }
                samples
            })
        };

        transfers
            .upload(&task, &ObjectParams::default(), None)
            .await
            .unwrap();
        let samples = poller.await.unwrap();
        assert!(samples.iter().all(|ok| *ok));
        assert_eq!(task.progress().done(), size);
        assert_eq!(store.calls(StoreOp::UploadPart).len(), 3);
    }

    #[tokio::test]
    async fn test_corrupted_part_leaves_upload_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        std::fs::write(&path, pattern(10 * MIB)).unwrap();
        let (store, transfers) = setup(ClientConfig {
            multipart_upload_threshold: 10 * MIB,
            multipart_upload_size: 5 * MIB,
            ..Default::default()
        });
        store.corrupt_next_checksum(StoreOp::UploadPart, 1);

        let task = task_for(&path, "big.bin");
        let err = transfers
            .upload(&task, &ObjectParams::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IntegrityMismatch);
        assert!(store.calls(StoreOp::CompleteMultipartUpload).is_empty());
        assert_eq!(store.pending_uploads(), 1);

        let upload_id = task.upload_id().unwrap();
        store
            .abort_multipart_upload("b", "big.bin", upload_id)
            .await
            .unwrap();
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"x").unwrap();
        let (store, transfers) = setup(ClientConfig::default());

        let task = task_for(&path, "f");
        task.cancel_flag().cancel();
        let err = transfers
            .upload(&task, &ObjectParams::default(), None)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(task.snapshot().failed);
        assert!(store.calls(StoreOp::PutObject).is_empty());
    }
}
