//! Object store abstraction
//!
//! The sync engine talks to the remote side only through [`ObjectStore`].
//! Request signing, transport and the pagination wire format belong to the
//! implementation; failures come back as `SyncError::Transient` when a retry
//! may help and `SyncError::Rejected` otherwise.

use crate::config::ObjectParams;
use crate::error::Result;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::io;

/// Streaming object body
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Wrap an in-memory buffer as a single-chunk body
pub fn body_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    stream::once(async move { Ok(data) }).boxed()
}

/// Collect a body into one contiguous buffer
pub async fn collect_body(body: ByteStream) -> io::Result<Bytes> {
    let buf = body
        .try_fold(BytesMut::new(), |mut buf, chunk| async move {
            buf.extend_from_slice(&chunk);
            Ok(buf)
        })
        .await?;
    Ok(buf.freeze())
}

/// One page request of a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: String,
    /// Group keys sharing a prefix up to this separator into common prefixes
    pub delimiter: Option<String>,
    pub continuation_token: Option<String>,
}

/// Object entry in a listing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    /// ETag-equivalent, possibly quoted and possibly carrying a `-N` suffix
    pub checksum: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// One page of a listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListObjectsPage {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_continuation_token: Option<String>,
}

/// Single-request upload
pub struct PutObjectRequest {
    pub bucket: String,
    pub key: String,
    pub body: ByteStream,
    pub content_length: u64,
    /// Content MD5 when known before the upload starts
    pub content_md5: Option<[u8; 16]>,
    pub params: ObjectParams,
}

/// Response of a completed upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObjectOutput {
    pub checksum: Option<String>,
}

/// Download request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetObjectRequest {
    pub bucket: String,
    pub key: String,
}

/// Download response: headers plus a streaming body
pub struct GetObjectOutput {
    pub content_length: u64,
    pub checksum: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub body: ByteStream,
}

impl std::fmt::Debug for GetObjectOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetObjectOutput")
            .field("content_length", &self.content_length)
            .field("checksum", &self.checksum)
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// Per-key failure reported by a batch delete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteError {
    pub key: String,
    pub code: String,
    pub message: String,
}

/// Response of a batch delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteObjectsOutput {
    pub deleted: Vec<String>,
    pub errors: Vec<DeleteError>,
}

/// One part of a multipart upload
pub struct UploadPartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// 1-based
    pub part_number: u32,
    pub body: ByteStream,
    pub content_length: u64,
}

/// Part acknowledgement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPartOutput {
    pub checksum: Option<String>,
}

/// Reference to an uploaded part, sent on completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub checksum: String,
}

/// Completion call of a multipart upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMultipartRequest {
    pub bucket: String,
    pub key: String,
    pub upload_id: String,
    /// Ascending part-number order
    pub parts: Vec<CompletedPart>,
}

/// Server-side copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyObjectRequest {
    pub bucket: String,
    pub key: String,
    pub source_bucket: String,
    pub source_key: String,
}

/// Remote object store
#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    /// Fetch one listing page
    async fn list_objects(&self, request: ListObjectsRequest) -> Result<ListObjectsPage>;

    /// Upload an object in one request
    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput>;

    /// Download an object
    async fn get_object(&self, request: GetObjectRequest) -> Result<GetObjectOutput>;

    /// Delete up to 1000 keys in one call
    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<DeleteObjectsOutput>;

    /// Start a multipart upload and return its upload id
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &ObjectParams,
    ) -> Result<String>;

    /// Upload one part
    async fn upload_part(&self, request: UploadPartRequest) -> Result<UploadPartOutput>;

    /// Assemble the uploaded parts into the final object
    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartRequest,
    ) -> Result<PutObjectOutput>;

    /// Discard an unfinished multipart upload
    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
        -> Result<()>;

    /// Copy an object server-side
    async fn copy_object(&self, request: CopyObjectRequest) -> Result<PutObjectOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_body_concatenates_chunks() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let body: ByteStream = stream::iter(chunks).boxed();
        assert_eq!(collect_body(body).await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn test_collect_body_propagates_error() {
        let chunks: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(io::Error::new(io::ErrorKind::UnexpectedEof, "cut")),
        ];
        let body: ByteStream = stream::iter(chunks).boxed();
        assert!(collect_body(body).await.is_err());
    }
}
