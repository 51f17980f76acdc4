//! Configuration settings for BucketSync
//!
//! Defines the client-wide settings, per-operation options, CLI arguments,
//! and defaults.

use crate::error::{IoResultExt, Result, SyncError};
use crate::hash::{MAX_PUTOBJECT_SIZE, MIN_MULTIPART_SIZE};
use crate::sync::SyncItem;
use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// BucketSync - synchronize directories with object-storage buckets
#[derive(Parser, Debug, Clone)]
#[command(name = "bucketsync")]
#[command(author = "BucketSync Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Synchronize local directories with S3-compatible buckets")]
#[command(long_about = r#"
BucketSync uploads, downloads and deletes objects so that a local directory
and a bucket prefix hold the same content. Files are compared by content
checksum, including multipart checksums.

Examples:
  bucketsync up ./site s3://my-bucket/site --delete-removed
  bucketsync down s3://my-bucket/backups ./backups
  bucketsync put ./disk.img s3://my-bucket/images/disk.img --part-size 64M
  bucketsync ls s3://my-bucket/logs/ --recursive
"#)]
pub struct CliArgs {
    /// Operation to run
    #[command(subcommand)]
    pub command: Commands,

    /// JSON configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Maximum concurrent requests to the object store
    #[arg(short = 'j', long, global = true, value_name = "NUM")]
    pub max_concurrent: Option<usize>,

    /// Attempts per request, including the first
    #[arg(long, global = true, value_name = "NUM")]
    pub retries: Option<u32>,

    /// Delay between attempts (e.g., 500ms, 2s)
    #[arg(long, global = true, value_name = "DURATION")]
    pub retry_delay: Option<String>,

    /// Files at or above this size are uploaded in parts (e.g., 20M)
    #[arg(long, global = true, value_name = "SIZE")]
    pub multipart_threshold: Option<String>,

    /// Part size for multipart uploads (e.g., 15M)
    #[arg(long, global = true, value_name = "SIZE")]
    pub part_size: Option<String>,

    /// Files hashed concurrently (0 = auto-detect)
    #[arg(long, global = true, value_name = "NUM")]
    pub hash_threads: Option<usize>,

    /// Region of the bucket
    #[arg(long, global = true, env = "AWS_REGION", default_value = "us-east-1")]
    pub region: String,

    /// Custom endpoint URL (MinIO, Ceph, ...)
    #[arg(long, global = true, env = "AWS_ENDPOINT_URL", value_name = "URL")]
    pub endpoint: Option<String>,

    /// Use path-style bucket addressing
    #[arg(long, global = true)]
    pub path_style: bool,

    /// Show a progress bar
    #[arg(short = 'p', long, global = true)]
    pub progress: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Output format for the final summary
    #[arg(long, global = true, value_enum, default_value = "text")]
    pub output_format: OutputFormat,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Make a bucket prefix match a local directory
    #[command(name = "up")]
    Up {
        /// Local directory to read
        local_dir: PathBuf,
        /// Destination (s3://bucket/prefix)
        remote: String,
        /// Delete remote objects that have no local file
        #[arg(long)]
        delete_removed: bool,
        /// Do not follow symbolic links
        #[arg(long)]
        no_follow_symlinks: bool,
        /// Content type for files whose extension is not recognized
        #[arg(long, value_name = "MIME")]
        default_content_type: Option<String>,
    },

    /// Make a local directory match a bucket prefix
    #[command(name = "down")]
    Down {
        /// Source (s3://bucket/prefix)
        remote: String,
        /// Local directory to write
        local_dir: PathBuf,
        /// Delete local files that have no remote object
        #[arg(long)]
        delete_removed: bool,
        /// Do not follow symbolic links
        #[arg(long)]
        no_follow_symlinks: bool,
    },

    /// Upload one file
    #[command(name = "put")]
    Put {
        /// File to upload
        local_file: PathBuf,
        /// Destination (s3://bucket/key)
        remote: String,
        /// Content type stored with the object
        #[arg(long, value_name = "MIME")]
        content_type: Option<String>,
    },

    /// Download one object
    #[command(name = "get")]
    Get {
        /// Source (s3://bucket/key)
        remote: String,
        /// Destination file
        local_file: PathBuf,
    },

    /// List objects under a prefix
    #[command(name = "ls")]
    Ls {
        /// Location (s3://bucket/prefix)
        remote: String,
        /// Descend into sub-prefixes
        #[arg(short, long)]
        recursive: bool,
    },

    /// Delete every object under a prefix
    #[command(name = "rm")]
    Rm {
        /// Location (s3://bucket/prefix)
        remote: String,
    },
}

/// Output format for reports
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format
    Json,
}

/// Client-wide settings shared by every operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Requests allowed in flight at once, across all operations
    pub max_concurrent_requests: usize,
    /// Attempts per request, including the first
    pub retry_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
    /// Files at or above this size are uploaded in parts
    pub multipart_upload_threshold: u64,
    /// Part size for multipart uploads
    pub multipart_upload_size: u64,
    /// Files hashed concurrently during a sync
    pub hash_concurrency: usize,
    /// Read buffer size for local files
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 20,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            multipart_upload_threshold: 20 * 1024 * 1024, // 20MB
            multipart_upload_size: 15 * 1024 * 1024,      // 15MB
            hash_concurrency: num_cpus::get(),
            read_buffer_size: 256 * 1024,
        }
    }
}

impl ClientConfig {
    /// Validate against the object store's limits
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_requests == 0 {
            return Err(SyncError::config("max_concurrent_requests must be at least 1"));
        }
        if self.retry_attempts == 0 {
            return Err(SyncError::config("retry_attempts must be at least 1"));
        }
        if self.hash_concurrency == 0 {
            return Err(SyncError::config("hash_concurrency must be at least 1"));
        }
        if self.read_buffer_size == 0 {
            return Err(SyncError::config("read_buffer_size must be at least 1"));
        }
        check_part_limit("multipart_upload_threshold", self.multipart_upload_threshold)?;
        check_part_limit("multipart_upload_size", self.multipart_upload_size)?;
        Ok(())
    }

    /// Load settings from a JSON file; missing fields keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).with_path(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// Build settings from CLI arguments, on top of an optional config file
    pub fn from_cli(args: &CliArgs) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };

        if let Some(n) = args.max_concurrent {
            config.max_concurrent_requests = n;
        }
        if let Some(n) = args.retries {
            config.retry_attempts = n;
        }
        if let Some(delay) = &args.retry_delay {
            config.retry_delay = humantime::parse_duration(delay)
                .map_err(|e| SyncError::config(format!("Invalid retry delay: {}", e)))?;
        }
        if let Some(size) = &args.multipart_threshold {
            config.multipart_upload_threshold = parse_size(size)
                .map_err(|e| SyncError::config(format!("Invalid multipart threshold: {}", e)))?;
        }
        if let Some(size) = &args.part_size {
            config.multipart_upload_size = parse_size(size)
                .map_err(|e| SyncError::config(format!("Invalid part size: {}", e)))?;
        }
        match args.hash_threads {
            Some(0) => config.hash_concurrency = num_cpus::get(),
            Some(n) => config.hash_concurrency = n,
            None => {}
        }

        config.validate()?;
        Ok(config)
    }
}

fn check_part_limit(name: &str, value: u64) -> Result<()> {
    if value < MIN_MULTIPART_SIZE {
        return Err(SyncError::config(format!("Minimum {} is 5MB", name)));
    }
    if value > MAX_PUTOBJECT_SIZE {
        return Err(SyncError::config(format!("Maximum {} is 5GB", name)));
    }
    Ok(())
}

/// Per-object parameters sent with uploads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectParams {
    /// MIME type; guessed from the file extension when unset
    pub content_type: Option<String>,
    /// MIME type used when the extension gives no guess
    pub default_content_type: Option<String>,
    /// Cache-Control header
    pub cache_control: Option<String>,
    /// Storage class (STANDARD, GLACIER, ...)
    pub storage_class: Option<String>,
    /// User metadata
    pub metadata: BTreeMap<String, String>,
}

impl ObjectParams {
    /// Fields set in `overrides` replace ours; metadata maps are merged
    pub fn merged(&self, overrides: &ObjectParams) -> ObjectParams {
        let mut metadata = self.metadata.clone();
        metadata.extend(overrides.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        ObjectParams {
            content_type: overrides.content_type.clone().or_else(|| self.content_type.clone()),
            default_content_type: overrides
                .default_content_type
                .clone()
                .or_else(|| self.default_content_type.clone()),
            cache_control: overrides.cache_control.clone().or_else(|| self.cache_control.clone()),
            storage_class: overrides.storage_class.clone().or_else(|| self.storage_class.clone()),
            metadata,
        }
    }

    /// Content type to store for `path`: explicit, guessed, default, then
    /// `application/octet-stream`
    pub fn content_type_for(&self, path: &Path) -> String {
        self.content_type
            .clone()
            .or_else(|| mime_guess::from_path(path).first_raw().map(str::to_string))
            .or_else(|| self.default_content_type.clone())
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
    }
}

/// Content type of uploads with no explicit, guessed or default type
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Per-file decision hook for sync sessions
///
/// Called with the full local path and the item about to be transferred.
/// `Ok(Some(params))` proceeds with those parameters merged over the
/// defaults, `Ok(None)` skips the item, and an error fails the session.
pub type ParamsHook =
    Arc<dyn Fn(&Path, SyncItem<'_>) -> Result<Option<ObjectParams>> + Send + Sync>;

/// Options for a directory sync
#[derive(Clone)]
pub struct SyncOptions {
    /// Delete objects (or files) that have no counterpart on the source side
    pub delete_removed: bool,
    /// Follow symbolic links while walking the local tree
    pub follow_symlinks: bool,
    /// Parameters applied to every upload
    pub default_params: ObjectParams,
    /// Optional per-file override
    pub params_hook: Option<ParamsHook>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete_removed: false,
            follow_symlinks: true,
            default_params: ObjectParams::default(),
            params_hook: None,
        }
    }
}

impl SyncOptions {
    /// Options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable deletion of removed files
    pub fn delete_removed(mut self, enable: bool) -> Self {
        self.delete_removed = enable;
        self
    }

    /// Enable or disable following symbolic links
    pub fn follow_symlinks(mut self, enable: bool) -> Self {
        self.follow_symlinks = enable;
        self
    }

    /// Set the parameters applied to every upload
    pub fn default_params(mut self, params: ObjectParams) -> Self {
        self.default_params = params;
        self
    }

    /// Content type for uploads whose extension gives no guess
    pub fn default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_params.default_content_type = Some(content_type.into());
        self
    }

    /// Install a per-file hook
    pub fn params_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Path, SyncItem<'_>) -> Result<Option<ObjectParams>> + Send + Sync + 'static,
    {
        self.params_hook = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("delete_removed", &self.delete_removed)
            .field("follow_symlinks", &self.follow_symlinks)
            .field("default_params", &self.default_params)
            .field("params_hook", &self.params_hook.is_some())
            .finish()
    }
}

/// Parse human-readable size string to bytes
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("Empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("TB") || size.ends_with('T') {
        (size.trim_end_matches(['T', 'B']), 1024u64 * 1024 * 1024 * 1024)
    } else if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(['G', 'B']), 1024u64 * 1024 * 1024)
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(['M', 'B']), 1024u64 * 1024)
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(['K', 'B']), 1024u64)
    } else if size.ends_with('B') {
        (size.trim_end_matches('B'), 1u64)
    } else {
        // Assume bytes if no suffix
        (size.as_str(), 1u64)
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("Invalid number: {}", num_str))?;

    Ok((num * multiplier as f64) as u64)
}
