//! In-process object store
//!
//! Keeps objects in byte-ordered maps and reproduces the parts of S3
//! behavior the sync engine depends on: paginated listings with delimiter
//! grouping, quoted MD5 ETags, `md5-of-md5s-N` multipart ETags, 1000-key
//! batch deletes and per-part size limits. Faults can be injected per
//! operation for testing retry, verification and cancellation paths.

use super::object_store::*;
use crate::config::ObjectParams;
use crate::error::{Result, SyncError};
use crate::hash::{
    clean_checksum, md5_digest, md5_hex, multipart_checksum, MAX_MULTIPART_COUNT,
    MIN_MULTIPART_SIZE,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const DEFAULT_PAGE_SIZE: usize = 1000;
const BODY_CHUNK_SIZE: usize = 64 * 1024;
const MAX_DELETE_KEYS: usize = 1000;

/// Operations of the [`ObjectStore`] trait, for fault injection and the call log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    ListObjects,
    PutObject,
    GetObject,
    DeleteObjects,
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    CopyObject,
}

/// A completed call, as recorded in the call log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub key: String,
    /// Part number for `UploadPart`, part list for `CompleteMultipartUpload`
    pub parts: Vec<u32>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
    last_modified: DateTime<Utc>,
    params: ObjectParams,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    params: ObjectParams,
    parts: BTreeMap<u32, (Bytes, [u8; 16])>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    uploads: HashMap<String, PendingUpload>,
    next_upload_id: u64,
    failures: HashMap<StoreOp, u32>,
    delete_key_failures: HashMap<String, u32>,
    delays: HashMap<StoreOp, Duration>,
    corrupt: HashMap<StoreOp, u32>,
    truncate_next_get: Option<usize>,
    calls: Vec<StoreCall>,
}

/// Object store held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    page_size: usize,
    min_part_size: u64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store with S3 page size and part limits
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            page_size: DEFAULT_PAGE_SIZE,
            min_part_size: MIN_MULTIPART_SIZE,
        }
    }

    /// Return at most `page_size` entries per listing page
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Smallest size accepted for every part but the last
    pub fn with_min_part_size(mut self, size: u64) -> Self {
        self.min_part_size = size;
        self
    }

    fn state(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store an object directly, bypassing fault injection
    pub fn insert_object(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let data = data.into();
        let etag = format!("\"{}\"", md5_hex(&data));
        self.insert_object_with_checksum(bucket, key, data, &etag);
    }

    /// Store an object with an explicit ETag, e.g. a multipart one
    pub fn insert_object_with_checksum(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        etag: &str,
    ) {
        let object = StoredObject {
            data: data.into(),
            etag: etag.to_string(),
            last_modified: Utc::now(),
            params: ObjectParams::default(),
        };
        self.state()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    /// Contents of an object
    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.data.clone())
    }

    /// Stored ETag of an object, quotes included
    pub fn object_checksum(&self, bucket: &str, key: &str) -> Option<String> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.etag.clone())
    }

    /// Parameters an object was uploaded with
    pub fn object_params(&self, bucket: &str, key: &str) -> Option<ObjectParams> {
        self.state()
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|o| o.params.clone())
    }

    /// All keys of a bucket in listing order
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        self.state()
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Multipart uploads started but neither completed nor aborted
    pub fn pending_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    /// Fail the next `count` calls of `op` with a transient error
    pub fn fail_next(&self, op: StoreOp, count: u32) {
        *self.state().failures.entry(op).or_default() += count;
    }

    /// Report `key` as failed in the next `count` batch deletes that include it
    pub fn fail_delete_key(&self, key: &str, count: u32) {
        *self.state().delete_key_failures.entry(key.to_string()).or_default() += count;
    }

    /// Delay every call of `op`
    pub fn set_delay(&self, op: StoreOp, delay: Duration) {
        self.state().delays.insert(op, delay);
    }

    /// Return a wrong checksum from the next `count` calls of `op`
    pub fn corrupt_next_checksum(&self, op: StoreOp, count: u32) {
        *self.state().corrupt.entry(op).or_default() += count;
    }

    /// Cut the body of the next download after `len` bytes
    pub fn truncate_next_get(&self, len: usize) {
        self.state().truncate_next_get = Some(len);
    }

    /// Completed calls of `op`, in completion order
    pub fn calls(&self, op: StoreOp) -> Vec<StoreCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    async fn enter(&self, op: StoreOp, key: &str) -> Result<()> {
        let delay = self.state().delays.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SyncError::transient(
                    op_name(op),
                    key,
                    "injected failure: connection reset",
                ));
            }
        }
        Ok(())
    }

    fn take_corruption(state: &mut Inner, op: StoreOp) -> bool {
        match state.corrupt.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn record(state: &mut Inner, op: StoreOp, key: &str, parts: Vec<u32>) {
        state.calls.push(StoreCall {
            op,
            key: key.to_string(),
            parts,
        });
    }
}

fn op_name(op: StoreOp) -> &'static str {
    match op {
        StoreOp::ListObjects => "list_objects",
        StoreOp::PutObject => "put_object",
        StoreOp::GetObject => "get_object",
        StoreOp::DeleteObjects => "delete_objects",
        StoreOp::CreateMultipartUpload => "create_multipart_upload",
        StoreOp::UploadPart => "upload_part",
        StoreOp::CompleteMultipartUpload => "complete_multipart_upload",
        StoreOp::AbortMultipartUpload => "abort_multipart_upload",
        StoreOp::CopyObject => "copy_object",
    }
}

fn quoted(hex: &str) -> String {
    format!("\"{}\"", hex)
}

const CORRUPT_ETAG: &str = "\"00000000000000000000000000000000\"";

enum Entry {
    Object(ObjectSummary),
    Prefix(String),
}

impl Entry {
    fn name(&self) -> &str {
        match self {
            Entry::Object(o) => &o.key,
            Entry::Prefix(p) => p,
        }
    }
}

async fn read_body(
    op: StoreOp,
    key: &str,
    body: ByteStream,
    content_length: u64,
) -> Result<Bytes> {
    let data = collect_body(body)
        .await
        .map_err(|e| SyncError::transient(op_name(op), key, format!("body stream failed: {}", e)))?;
    if data.len() as u64 != content_length {
        return Err(SyncError::rejected(
            op_name(op),
            key,
            Some(400),
            format!(
                "IncompleteBody: declared {} bytes, received {}",
                content_length,
                data.len()
            ),
        ));
    }
    Ok(data)
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, request: ListObjectsRequest) -> Result<ListObjectsPage> {
        self.enter(StoreOp::ListObjects, &request.prefix).await?;
        let mut state = self.state();

        let mut entries: Vec<Entry> = Vec::new();
        if let Some(objects) = state.buckets.get(&request.bucket) {
            for (key, object) in objects.range(request.prefix.clone()..) {
                let Some(rest) = key.strip_prefix(&request.prefix) else {
                    break;
                };
                let group = request
                    .delimiter
                    .as_deref()
                    .filter(|d| !d.is_empty())
                    .and_then(|d| rest.find(d).map(|i| i + d.len()))
                    .map(|end| format!("{}{}", request.prefix, &rest[..end]));
                match group {
                    Some(prefix) => {
                        let seen = matches!(entries.last(), Some(Entry::Prefix(p)) if *p == prefix);
                        if !seen {
                            entries.push(Entry::Prefix(prefix));
                        }
                    }
                    None => entries.push(Entry::Object(ObjectSummary {
                        key: key.clone(),
                        size: object.data.len() as u64,
                        checksum: Some(object.etag.clone()),
                        last_modified: Some(object.last_modified),
                    })),
                }
            }
        }

        if let Some(token) = &request.continuation_token {
            entries.retain(|e| e.name() > token.as_str());
        }

        let is_truncated = entries.len() > self.page_size;
        entries.truncate(self.page_size);
        let next_continuation_token = if is_truncated {
            entries.last().map(|e| e.name().to_string())
        } else {
            None
        };

        let mut page = ListObjectsPage {
            is_truncated,
            next_continuation_token,
            ..Default::default()
        };
        for entry in entries {
            match entry {
                Entry::Object(o) => page.objects.push(o),
                Entry::Prefix(p) => page.common_prefixes.push(p),
            }
        }
        Self::record(&mut state, StoreOp::ListObjects, &request.prefix, Vec::new());
        Ok(page)
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput> {
        let op = StoreOp::PutObject;
        let data = read_body(op, &request.key, request.body, request.content_length).await?;
        self.enter(op, &request.key).await?;

        let digest = md5_digest(&data);
        if let Some(expected) = request.content_md5 {
            if expected != digest {
                return Err(SyncError::rejected(
                    op_name(op),
                    &request.key,
                    Some(400),
                    "BadDigest: Content-MD5 does not match the body",
                ));
            }
        }

        let mut state = self.state();
        let etag = quoted(&hex::encode(digest));
        let returned = if Self::take_corruption(&mut state, op) {
            CORRUPT_ETAG.to_string()
        } else {
            etag.clone()
        };
        state.buckets.entry(request.bucket).or_default().insert(
            request.key.clone(),
            StoredObject {
                data,
                etag,
                last_modified: Utc::now(),
                params: request.params,
            },
        );
        Self::record(&mut state, op, &request.key, Vec::new());
        Ok(PutObjectOutput {
            checksum: Some(returned),
        })
    }

    async fn get_object(&self, request: GetObjectRequest) -> Result<GetObjectOutput> {
        let op = StoreOp::GetObject;
        self.enter(op, &request.key).await?;
        let mut state = self.state();

        let object = state
            .buckets
            .get(&request.bucket)
            .and_then(|objects| objects.get(&request.key))
            .cloned()
            .ok_or_else(|| {
                SyncError::rejected(op_name(op), &request.key, Some(404), "NoSuchKey")
            })?;

        let content_length = object.data.len() as u64;
        let mut data = object.data;
        if let Some(len) = state.truncate_next_get.take() {
            data.truncate(len);
        }
        let checksum = if Self::take_corruption(&mut state, op) {
            CORRUPT_ETAG.to_string()
        } else {
            object.etag
        };
        Self::record(&mut state, op, &request.key, Vec::new());

        let chunks: Vec<std::io::Result<Bytes>> = (0..data.len())
            .step_by(BODY_CHUNK_SIZE)
            .map(|start| Ok(data.slice(start..(start + BODY_CHUNK_SIZE).min(data.len()))))
            .collect();
        Ok(GetObjectOutput {
            content_length,
            checksum: Some(checksum),
            last_modified: Some(object.last_modified),
            body: stream::iter(chunks).boxed(),
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<DeleteObjectsOutput> {
        let op = StoreOp::DeleteObjects;
        let first = keys.first().cloned().unwrap_or_default();
        self.enter(op, &first).await?;
        if keys.len() > MAX_DELETE_KEYS {
            return Err(SyncError::rejected(
                op_name(op),
                first,
                Some(400),
                format!("MalformedXML: {} keys exceeds the limit of 1000", keys.len()),
            ));
        }

        let mut state = self.state();
        let mut output = DeleteObjectsOutput::default();
        for key in keys {
            if let Some(remaining) = state.delete_key_failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    output.errors.push(DeleteError {
                        key,
                        code: "InternalError".to_string(),
                        message: "injected failure".to_string(),
                    });
                    continue;
                }
            }
            if let Some(objects) = state.buckets.get_mut(bucket) {
                objects.remove(&key);
            }
            output.deleted.push(key);
        }
        Self::record(&mut state, op, &first, Vec::new());
        Ok(output)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &ObjectParams,
    ) -> Result<String> {
        let op = StoreOp::CreateMultipartUpload;
        self.enter(op, key).await?;
        let mut state = self.state();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                params: params.clone(),
                parts: BTreeMap::new(),
            },
        );
        Self::record(&mut state, op, key, Vec::new());
        Ok(upload_id)
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<UploadPartOutput> {
        let op = StoreOp::UploadPart;
        if request.part_number == 0 || u64::from(request.part_number) > MAX_MULTIPART_COUNT {
            return Err(SyncError::rejected(
                op_name(op),
                &request.key,
                Some(400),
                format!("InvalidArgument: part number {}", request.part_number),
            ));
        }
        let data = read_body(op, &request.key, request.body, request.content_length).await?;
        self.enter(op, &request.key).await?;

        let digest = md5_digest(&data);
        let mut state = self.state();
        let corrupt = Self::take_corruption(&mut state, op);
        let upload = state.uploads.get_mut(&request.upload_id).ok_or_else(|| {
            SyncError::rejected(op_name(op), &request.key, Some(404), "NoSuchUpload")
        })?;
        upload.parts.insert(request.part_number, (data, digest));
        Self::record(&mut state, op, &request.key, vec![request.part_number]);

        let checksum = if corrupt {
            CORRUPT_ETAG.to_string()
        } else {
            quoted(&hex::encode(digest))
        };
        Ok(UploadPartOutput {
            checksum: Some(checksum),
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartRequest,
    ) -> Result<PutObjectOutput> {
        let op = StoreOp::CompleteMultipartUpload;
        self.enter(op, &request.key).await?;
        let mut state = self.state();
        let invalid = |message: String| {
            SyncError::rejected(op_name(op), &request.key, Some(400), message)
        };

        let upload = state.uploads.get(&request.upload_id).ok_or_else(|| {
            SyncError::rejected(op_name(op), &request.key, Some(404), "NoSuchUpload")
        })?;
        if request.parts.is_empty() {
            return Err(invalid("MalformedXML: no parts".to_string()));
        }
        if request
            .parts
            .windows(2)
            .any(|w| w[0].part_number >= w[1].part_number)
        {
            return Err(invalid("InvalidPartOrder".to_string()));
        }

        let mut data = Vec::new();
        let mut digests = Vec::with_capacity(request.parts.len());
        for (i, part) in request.parts.iter().enumerate() {
            let (bytes, digest) = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| invalid(format!("InvalidPart: {} not uploaded", part.part_number)))?;
            if clean_checksum(&part.checksum) != hex::encode(digest) {
                return Err(invalid(format!("InvalidPart: ETag of part {}", part.part_number)));
            }
            let is_last = i + 1 == request.parts.len();
            if !is_last && (bytes.len() as u64) < self.min_part_size {
                return Err(invalid(format!("EntityTooSmall: part {}", part.part_number)));
            }
            data.extend_from_slice(bytes);
            digests.push(*digest);
        }

        let etag = quoted(&multipart_checksum(&digests));
        let bucket = upload.bucket.clone();
        let key = upload.key.clone();
        let params = upload.params.clone();
        state.uploads.remove(&request.upload_id);

        let returned = if Self::take_corruption(&mut state, op) {
            CORRUPT_ETAG.to_string()
        } else {
            etag.clone()
        };
        state.buckets.entry(bucket).or_default().insert(
            key.clone(),
            StoredObject {
                data: Bytes::from(data),
                etag,
                last_modified: Utc::now(),
                params,
            },
        );
        let numbers = request.parts.iter().map(|p| p.part_number).collect();
        Self::record(&mut state, op, &key, numbers);
        Ok(PutObjectOutput {
            checksum: Some(returned),
        })
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        let op = StoreOp::AbortMultipartUpload;
        self.enter(op, key).await?;
        let mut state = self.state();
        if state.uploads.remove(upload_id).is_none() {
            return Err(SyncError::rejected(op_name(op), key, Some(404), "NoSuchUpload"));
        }
        Self::record(&mut state, op, key, Vec::new());
        Ok(())
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<PutObjectOutput> {
        let op = StoreOp::CopyObject;
        self.enter(op, &request.key).await?;
        let mut state = self.state();
        let mut object = state
            .buckets
            .get(&request.source_bucket)
            .and_then(|objects| objects.get(&request.source_key))
            .cloned()
            .ok_or_else(|| {
                SyncError::rejected(op_name(op), &request.source_key, Some(404), "NoSuchKey")
            })?;
        object.last_modified = Utc::now();
        let etag = object.etag.clone();
        state
            .buckets
            .entry(request.bucket)
            .or_default()
            .insert(request.key.clone(), object);
        Self::record(&mut state, op, &request.key, Vec::new());
        Ok(PutObjectOutput {
            checksum: Some(etag),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(prefix: &str, delimiter: Option<&str>, token: Option<String>) -> ListObjectsRequest {
        ListObjectsRequest {
            bucket: "b".to_string(),
            prefix: prefix.to_string(),
            delimiter: delimiter.map(str::to_string),
            continuation_token: token,
        }
    }

    #[tokio::test]
    async fn test_listing_pages_in_key_order() {
        let store = MemoryStore::new().with_page_size(2);
        for key in ["p/c", "p/a", "p/b", "q/x"] {
            store.insert_object("b", key, Bytes::from_static(b"data"));
        }

        let first = store.list_objects(list("p/", None, None)).await.unwrap();
        let keys: Vec<_> = first.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["p/a", "p/b"]);
        assert!(first.is_truncated);

        let second = store
            .list_objects(list("p/", None, first.next_continuation_token))
            .await
            .unwrap();
        let keys: Vec<_> = second.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, ["p/c"]);
        assert!(!second.is_truncated);
    }

    #[tokio::test]
    async fn test_listing_groups_common_prefixes() {
        let store = MemoryStore::new();
        for key in ["root.txt", "dir/a", "dir/b", "dir/sub/c", "other/d"] {
            store.insert_object("b", key, Bytes::from_static(b"x"));
        }

        let page = store.list_objects(list("", Some("/"), None)).await.unwrap();
        assert_eq!(page.common_prefixes, ["dir/", "other/"]);
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "root.txt");
    }

    #[tokio::test]
    async fn test_put_get_roundtrip_with_quoted_etag() {
        let store = MemoryStore::new();
        let out = store
            .put_object(PutObjectRequest {
                bucket: "b".into(),
                key: "k".into(),
                body: body_from_bytes(Bytes::from_static(b"hello")),
                content_length: 5,
                content_md5: None,
                params: ObjectParams::default(),
            })
            .await
            .unwrap();
        assert_eq!(out.checksum, Some(quoted(&md5_hex(b"hello"))));

        let got = store
            .get_object(GetObjectRequest {
                bucket: "b".into(),
                key: "k".into(),
            })
            .await
            .unwrap();
        assert_eq!(got.content_length, 5);
        assert_eq!(collect_body(got.body).await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_missing_key_is_rejected() {
        let store = MemoryStore::new();
        let err = store
            .get_object(GetObjectRequest {
                bucket: "b".into(),
                key: "nope".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Rejected { status: Some(404), .. }));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let store = MemoryStore::new();
        store.insert_object("b", "k", Bytes::from_static(b"x"));
        store.fail_next(StoreOp::GetObject, 1);

        let req = GetObjectRequest {
            bucket: "b".into(),
            key: "k".into(),
        };
        assert!(store.get_object(req.clone()).await.unwrap_err().is_recoverable());
        assert!(store.get_object(req).await.is_ok());
    }

    #[tokio::test]
    async fn test_multipart_completion_checks_order() {
        let store = MemoryStore::new().with_min_part_size(1);
        let id = store
            .create_multipart_upload("b", "big", &ObjectParams::default())
            .await
            .unwrap();
        let mut parts = Vec::new();
        for (n, chunk) in [(1u32, &b"aaaa"[..]), (2, &b"bb"[..])] {
            let out = store
                .upload_part(UploadPartRequest {
                    bucket: "b".into(),
                    key: "big".into(),
                    upload_id: id.clone(),
                    part_number: n,
                    body: body_from_bytes(Bytes::copy_from_slice(chunk)),
                    content_length: chunk.len() as u64,
                })
                .await
                .unwrap();
            parts.push(CompletedPart {
                part_number: n,
                checksum: out.checksum.unwrap(),
            });
        }

        let reversed = CompleteMultipartRequest {
            bucket: "b".into(),
            key: "big".into(),
            upload_id: id.clone(),
            parts: parts.iter().rev().cloned().collect(),
        };
        assert!(store.complete_multipart_upload(reversed).await.is_err());

        let out = store
            .complete_multipart_upload(CompleteMultipartRequest {
                bucket: "b".into(),
                key: "big".into(),
                upload_id: id,
                parts,
            })
            .await
            .unwrap();
        assert!(out.checksum.unwrap().ends_with("-2\""));
        assert_eq!(store.object("b", "big").unwrap(), Bytes::from_static(b"aaaabb"));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_delete_limit_and_key_failures() {
        let store = MemoryStore::new();
        store.insert_object("b", "a", Bytes::from_static(b"1"));
        store.insert_object("b", "c", Bytes::from_static(b"2"));
        store.fail_delete_key("c", 1);

        let out = store
            .delete_objects("b", vec!["a".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(out.deleted, ["a"]);
        assert_eq!(out.errors.len(), 1);
        assert_eq!(store.keys("b"), ["c"]);

        let too_many: Vec<String> = (0..1001).map(|i| format!("k{}", i)).collect();
        assert!(store.delete_objects("b", too_many).await.is_err());
    }
}
