//! Native AWS S3 SDK integration
//!
//! Implements [`ObjectStore`] over `aws-sdk-s3`. Supports S3-compatible
//! endpoints (MinIO, Wasabi, etc.). The SDK's own retry layer is disabled:
//! every call already goes through the client's retry executor.

use super::object_store::*;
use crate::config::ObjectParams;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart as S3CompletedPart, Delete, ObjectIdentifier,
    StorageClass,
};
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left unescaped in a copy source
const COPY_SOURCE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Configuration for the native S3 store.
#[derive(Debug, Clone)]
pub struct NativeS3Config {
    /// AWS region (e.g., "us-east-1")
    pub region: String,
    /// Custom endpoint URL for S3-compatible services (MinIO, Wasabi)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for some S3-compatible services)
    pub force_path_style: bool,
    /// Access key ID (optional, falls back to AWS credential chain)
    pub access_key_id: Option<String>,
    /// Secret access key (optional, falls back to AWS credential chain)
    pub secret_access_key: Option<String>,
}

impl Default for NativeS3Config {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

/// S3 store backed by the AWS SDK
#[derive(Debug, Clone)]
pub struct NativeS3Store {
    client: aws_sdk_s3::Client,
}

impl NativeS3Store {
    /// Create a new store from configuration.
    pub async fn new(config: NativeS3Config) -> Result<Self> {
        let mut aws_config_builder = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .retry_config(aws_config::retry::RetryConfig::disabled());

        // Set custom endpoint for S3-compatible services
        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        // Set explicit credentials if provided
        if let (Some(ref key_id), Some(ref secret)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let creds = aws_credential_types::Credentials::new(
                key_id,
                secret,
                None, // session token
                None, // expiry
                "bucketsync-static",
            );
            aws_config_builder = aws_config_builder.credentials_provider(creds);
        }

        let aws_config = aws_config_builder.load().await;

        let mut s3_config = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config = s3_config.force_path_style(true);
        }

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(s3_config.build()),
        })
    }
}

/// Classify an SDK failure: 4xx responses other than 408/429 are final
fn map_sdk_error<E>(operation: &'static str, key: &str, err: SdkError<E>) -> SyncError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let status = err.raw_response().map(|r| r.status().as_u16());
    let message = DisplayErrorContext(&err).to_string();
    match status {
        Some(code) if (400..500).contains(&code) && code != 408 && code != 429 => {
            SyncError::rejected(operation, key, Some(code), message)
        }
        _ => SyncError::transient(operation, key, message),
    }
}

fn to_chrono(time: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.secs(), time.subsec_nanos())
}

async fn into_sdk_body(
    operation: &'static str,
    key: &str,
    body: ByteStream,
) -> Result<aws_sdk_s3::primitives::ByteStream> {
    let data: Bytes = collect_body(body)
        .await
        .map_err(|e| SyncError::transient(operation, key, format!("body stream failed: {}", e)))?;
    Ok(aws_sdk_s3::primitives::ByteStream::from(data))
}

fn from_sdk_body(body: aws_sdk_s3::primitives::ByteStream) -> ByteStream {
    stream::unfold(Some(body), |state| async move {
        let mut body = state?;
        match body.try_next().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(body))),
            Ok(None) => None,
            Err(e) => Some((Err(std::io::Error::new(std::io::ErrorKind::Other, e)), None)),
        }
    })
    .boxed()
}

#[async_trait]
impl ObjectStore for NativeS3Store {
    async fn list_objects(&self, request: ListObjectsRequest) -> Result<ListObjectsPage> {
        let resp = self
            .client
            .list_objects_v2()
            .bucket(&request.bucket)
            .prefix(&request.prefix)
            .set_delimiter(request.delimiter.clone())
            .set_continuation_token(request.continuation_token.clone())
            .send()
            .await
            .map_err(|e| map_sdk_error("list_objects", &request.prefix, e))?;

        let objects = resp
            .contents()
            .iter()
            .filter_map(|o| {
                Some(ObjectSummary {
                    key: o.key()?.to_string(),
                    size: o.size().unwrap_or(0).max(0) as u64,
                    checksum: o.e_tag().map(str::to_string),
                    last_modified: o.last_modified().and_then(to_chrono),
                })
            })
            .collect();
        let common_prefixes = resp
            .common_prefixes()
            .iter()
            .filter_map(|p| p.prefix().map(str::to_string))
            .collect();

        Ok(ListObjectsPage {
            objects,
            common_prefixes,
            is_truncated: resp.is_truncated().unwrap_or(false),
            next_continuation_token: resp.next_continuation_token().map(str::to_string),
        })
    }

    async fn put_object(&self, request: PutObjectRequest) -> Result<PutObjectOutput> {
        let body = into_sdk_body("put_object", &request.key, request.body).await?;
        let params = request.params;
        let resp = self
            .client
            .put_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .content_length(request.content_length as i64)
            .set_content_md5(
                request
                    .content_md5
                    .map(|md5| base64::engine::general_purpose::STANDARD.encode(md5)),
            )
            .set_content_type(params.content_type)
            .set_cache_control(params.cache_control)
            .set_storage_class(params.storage_class.as_deref().map(StorageClass::from))
            .set_metadata((!params.metadata.is_empty()).then(|| params.metadata.into_iter().collect()))
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error("put_object", &request.key, e))?;

        Ok(PutObjectOutput {
            checksum: resp.e_tag().map(str::to_string),
        })
    }

    async fn get_object(&self, request: GetObjectRequest) -> Result<GetObjectOutput> {
        let resp = self
            .client
            .get_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .send()
            .await
            .map_err(|e| map_sdk_error("get_object", &request.key, e))?;

        Ok(GetObjectOutput {
            content_length: resp.content_length().unwrap_or(0).max(0) as u64,
            checksum: resp.e_tag().map(str::to_string),
            last_modified: resp.last_modified().and_then(to_chrono),
            body: from_sdk_body(resp.body),
        })
    }

    async fn delete_objects(&self, bucket: &str, keys: Vec<String>) -> Result<DeleteObjectsOutput> {
        let first = keys.first().cloned().unwrap_or_default();
        let identifiers = keys
            .iter()
            .map(|key| ObjectIdentifier::builder().key(key).build())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| SyncError::rejected("delete_objects", &first, None, e.to_string()))?;
        let delete = Delete::builder()
            .set_objects(Some(identifiers))
            .quiet(true)
            .build()
            .map_err(|e| SyncError::rejected("delete_objects", &first, None, e.to_string()))?;

        let resp = self
            .client
            .delete_objects()
            .bucket(bucket)
            .delete(delete)
            .send()
            .await
            .map_err(|e| map_sdk_error("delete_objects", &first, e))?;

        let errors: Vec<DeleteError> = resp
            .errors()
            .iter()
            .map(|e| DeleteError {
                key: e.key().unwrap_or_default().to_string(),
                code: e.code().unwrap_or_default().to_string(),
                message: e.message().unwrap_or_default().to_string(),
            })
            .collect();
        // Quiet mode only reports failures.
        let deleted = keys
            .into_iter()
            .filter(|k| !errors.iter().any(|e| &e.key == k))
            .collect();
        Ok(DeleteObjectsOutput { deleted, errors })
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &ObjectParams,
    ) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(params.content_type.clone())
            .set_cache_control(params.cache_control.clone())
            .set_storage_class(params.storage_class.as_deref().map(StorageClass::from))
            .set_metadata(
                (!params.metadata.is_empty())
                    .then(|| params.metadata.clone().into_iter().collect()),
            )
            .send()
            .await
            .map_err(|e| map_sdk_error("create_multipart_upload", key, e))?;

        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| SyncError::transient("create_multipart_upload", key, "missing upload id"))
    }

    async fn upload_part(&self, request: UploadPartRequest) -> Result<UploadPartOutput> {
        let body = into_sdk_body("upload_part", &request.key, request.body).await?;
        let resp = self
            .client
            .upload_part()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .part_number(request.part_number as i32)
            .content_length(request.content_length as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| map_sdk_error("upload_part", &request.key, e))?;

        Ok(UploadPartOutput {
            checksum: resp.e_tag().map(str::to_string),
        })
    }

    async fn complete_multipart_upload(
        &self,
        request: CompleteMultipartRequest,
    ) -> Result<PutObjectOutput> {
        let parts = request
            .parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.checksum)
                    .build()
            })
            .collect();
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(&request.bucket)
            .key(&request.key)
            .upload_id(&request.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| map_sdk_error("complete_multipart_upload", &request.key, e))?;

        Ok(PutObjectOutput {
            checksum: resp.e_tag().map(str::to_string),
        })
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| map_sdk_error("abort_multipart_upload", key, e))?;
        Ok(())
    }

    async fn copy_object(&self, request: CopyObjectRequest) -> Result<PutObjectOutput> {
        let source = format!(
            "{}/{}",
            request.source_bucket,
            utf8_percent_encode(&request.source_key, COPY_SOURCE_SET)
        );
        let resp = self
            .client
            .copy_object()
            .bucket(&request.bucket)
            .key(&request.key)
            .copy_source(source)
            .send()
            .await
            .map_err(|e| map_sdk_error("copy_object", &request.key, e))?;

        Ok(PutObjectOutput {
            checksum: resp
                .copy_object_result()
                .and_then(|r| r.e_tag())
                .map(str::to_string),
        })
    }
}
