//! Local tree digest pipeline
//!
//! Walks a directory, sorts the entries by sync key and hashes file contents
//! with bounded parallelism. Records come out in key order, each carrying a
//! finished [`MultipartDigest`].

use super::operations::sync_key;
use crate::core::CancelFlag;
use crate::error::{IoResultExt, Result, SyncError};
use crate::hash::MultipartDigest;
use futures::stream::{self, StreamExt};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use walkdir::WalkDir;

/// A local file or tracked directory
#[derive(Debug, Clone)]
pub struct LocalFileRecord {
    /// Sync key; directories end in `/`
    pub key: String,
    /// Absolute path
    pub path: PathBuf,
    /// Bytes hashed (files) or 0 (directories)
    pub size: u64,
    /// Modification time
    pub modified: SystemTime,
    /// Is this a directory?
    pub is_dir: bool,
    /// Finished digest; `None` for directories
    pub digest: Option<MultipartDigest>,
}

impl LocalFileRecord {
    /// Whether the remote checksum matches this file's content
    pub fn matches(&self, remote_checksum: Option<&str>) -> bool {
        self.digest
            .as_ref()
            .map(|d| d.matches(remote_checksum))
            .unwrap_or(false)
    }
}

/// Configuration for the local tree walk
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Follow symbolic links
    pub follow_symlinks: bool,
    /// Emit directory records (needed to prune removed directories)
    pub track_directories: bool,
    /// Files hashed concurrently
    pub hash_concurrency: usize,
    /// Read buffer size
    pub read_buffer_size: usize,
    /// Part sizes tried in addition to the default candidates
    pub extra_part_sizes: Vec<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            follow_symlinks: true,
            track_directories: false,
            hash_concurrency: num_cpus::get(),
            read_buffer_size: 256 * 1024,
            extra_part_sizes: Vec::new(),
        }
    }
}

/// Live counters of a scan
#[derive(Debug, Default)]
pub struct ScanProgress {
    files_found: AtomicU64,
    bytes_to_hash: AtomicU64,
    bytes_hashed: AtomicU64,
    walk_done: AtomicBool,
    hashing_done: AtomicBool,
}

impl ScanProgress {
    /// Regular files discovered
    pub fn files_found(&self) -> u64 {
        self.files_found.load(Ordering::Relaxed)
    }

    /// Total size of the files discovered
    pub fn bytes_to_hash(&self) -> u64 {
        self.bytes_to_hash.load(Ordering::Relaxed)
    }

    /// Bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes_hashed.load(Ordering::Relaxed)
    }

    /// Directory walk has finished
    pub fn walk_done(&self) -> bool {
        self.walk_done.load(Ordering::Acquire)
    }

    /// Every file has been hashed
    pub fn hashing_done(&self) -> bool {
        self.hashing_done.load(Ordering::Acquire)
    }
}

/// Produces digested records for a local tree
#[derive(Debug, Clone, Default)]
pub struct LocalTreeDigestPipeline {
    config: ScanConfig,
}

impl LocalTreeDigestPipeline {
    /// Create a pipeline with the given configuration
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Start walking and hashing `root` in the background
    pub fn start(&self, root: &Path, cancel: CancelFlag) -> LocalTree {
        let hash_concurrency = self.config.hash_concurrency.max(1);
        let (tx, rx) = mpsc::channel(hash_concurrency * 2);
        let progress = Arc::new(ScanProgress::default());
        tokio::spawn(run(
            self.config.clone(),
            root.to_path_buf(),
            cancel,
            Arc::clone(&progress),
            tx,
        ));
        LocalTree { rx, progress }
    }

    /// Walk, hash and collect everything under `root`
    pub async fn scan(&self, root: &Path) -> Result<Vec<LocalFileRecord>> {
        let mut tree = self.start(root, CancelFlag::new());
        let mut records = Vec::new();
        while let Some(record) = tree.next().await {
            records.push(record?);
        }
        Ok(records)
    }
}

/// A running scan; yields records in key order
#[derive(Debug)]
pub struct LocalTree {
    rx: mpsc::Receiver<Result<LocalFileRecord>>,
    progress: Arc<ScanProgress>,
}

impl LocalTree {
    /// Next record, or `None` when the tree is exhausted
    pub async fn next(&mut self) -> Option<Result<LocalFileRecord>> {
        self.rx.recv().await
    }

    /// Live counters
    pub fn progress(&self) -> &Arc<ScanProgress> {
        &self.progress
    }
}

struct WalkedEntry {
    key: String,
    path: PathBuf,
    size: u64,
    modified: SystemTime,
    is_dir: bool,
}

async fn run(
    config: ScanConfig,
    root: PathBuf,
    cancel: CancelFlag,
    progress: Arc<ScanProgress>,
    tx: mpsc::Sender<Result<LocalFileRecord>>,
) {
    let walk_config = config.clone();
    let walk_root = root.clone();
    let walked = tokio::task::spawn_blocking(move || walk(&walk_root, &walk_config)).await;
    let entries = match walked {
        Ok(Ok(entries)) => entries,
        Ok(Err(e)) => {
            let _ = tx.send(Err(e)).await;
            return;
        }
        Err(e) => {
            let _ = tx.send(Err(e.into())).await;
            return;
        }
    };

    let files = entries.iter().filter(|e| !e.is_dir);
    progress
        .files_found
        .store(files.clone().count() as u64, Ordering::Relaxed);
    progress
        .bytes_to_hash
        .store(files.map(|e| e.size).sum(), Ordering::Relaxed);
    progress.walk_done.store(true, Ordering::Release);
    tracing::debug!(
        "Found {} local files under {}",
        progress.files_found(),
        root.display()
    );

    let hashed = stream::iter(entries)
        .map(|entry| {
            let config = config.clone();
            let cancel = cancel.clone();
            let progress = Arc::clone(&progress);
            async move { digest_entry(entry, &config, &cancel, &progress).await }
        })
        .buffered(config.hash_concurrency.max(1));
    futures::pin_mut!(hashed);

    while let Some(record) = hashed.next().await {
        let failed = record.is_err();
        if tx.send(record).await.is_err() || failed {
            return;
        }
    }
    progress.hashing_done.store(true, Ordering::Release);
}

fn walk(root: &Path, config: &ScanConfig) -> Result<Vec<WalkedEntry>> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(config.follow_symlinks)
        .min_depth(1);

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                let path = err.path().unwrap_or(root).to_path_buf();
                let not_found = err
                    .io_error()
                    .map(|e| e.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false);
                // A missing root is an empty tree.
                if not_found && err.depth() == 0 {
                    tracing::debug!("{} does not exist; treating as empty", root.display());
                    return Ok(Vec::new());
                }
                let source = err
                    .into_io_error()
                    .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "filesystem loop"));
                return Err(SyncError::io(path, source));
            }
        };

        let file_type = entry.file_type();
        if !file_type.is_file() && !file_type.is_dir() {
            continue;
        }
        if file_type.is_dir() && !config.track_directories {
            continue;
        }

        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let Some(mut key) = sync_key(relative) else {
            tracing::warn!("Skipping {}: name is not valid UTF-8", entry.path().display());
            continue;
        };
        let metadata = entry.metadata().map_err(|e| {
            let source = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "metadata"));
            SyncError::io(entry.path(), source)
        })?;
        if file_type.is_dir() {
            key.push('/');
        }

        entries.push(WalkedEntry {
            key,
            path: entry.into_path(),
            size: if file_type.is_dir() { 0 } else { metadata.len() },
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            is_dir: file_type.is_dir(),
        });
    }

    // Byte-wise order, the same order the remote store lists keys in
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(entries)
}

async fn digest_entry(
    entry: WalkedEntry,
    config: &ScanConfig,
    cancel: &CancelFlag,
    progress: &Arc<ScanProgress>,
) -> Result<LocalFileRecord> {
    cancel.check()?;
    if entry.is_dir {
        return Ok(LocalFileRecord {
            key: entry.key,
            path: entry.path,
            size: 0,
            modified: entry.modified,
            is_dir: true,
            digest: None,
        });
    }

    let path = entry.path.clone();
    let digest = MultipartDigest::with_extra_part_sizes(&config.extra_part_sizes);
    let buffer_size = config.read_buffer_size;
    let cancel = cancel.clone();
    let progress = Arc::clone(progress);
    let digest = tokio::task::spawn_blocking(move || {
        hash_file(&path, digest, buffer_size, &cancel, |n| {
            progress.bytes_hashed.fetch_add(n, Ordering::Relaxed);
        })
    })
    .await??;

    Ok(LocalFileRecord {
        key: entry.key,
        path: entry.path,
        size: digest.bytes(),
        modified: entry.modified,
        is_dir: false,
        digest: Some(digest),
    })
}

/// Feed a whole file through `digest` in one sequential pass
pub fn hash_file(
    path: &Path,
    mut digest: MultipartDigest,
    buffer_size: usize,
    cancel: &CancelFlag,
    mut on_progress: impl FnMut(u64),
) -> Result<MultipartDigest> {
    let mut file = std::fs::File::open(path).with_path(path)?;
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        cancel.check()?;
        let n = file.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
        on_progress(n as u64);
    }
    digest.finish();
    Ok(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::md5_hex;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[tokio::test]
    async fn test_records_are_key_ordered_and_hashed() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "b.txt", b"bbb");
        write(dir.path(), "a/z.txt", b"zz");
        write(dir.path(), "a-b.txt", b"dash");
        write(dir.path(), "A.txt", b"upper");

        let pipeline = LocalTreeDigestPipeline::new(ScanConfig {
            hash_concurrency: 2,
            ..Default::default()
        });
        let records = pipeline.scan(dir.path()).await.unwrap();
        let keys: Vec<_> = records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["A.txt", "a-b.txt", "a/z.txt", "b.txt"]);

        let b = &records[3];
        assert_eq!(b.size, 3);
        assert!(b.matches(Some(&format!("\"{}\"", md5_hex(b"bbb")))));
        assert!(!b.matches(Some("\"deadbeef\"")));
    }

    #[tokio::test]
    async fn test_directories_tracked_on_request() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "docs/readme.md", b"hi");
        std::fs::create_dir_all(dir.path().join("empty")).unwrap();

        let untracked = LocalTreeDigestPipeline::default()
            .scan(dir.path())
            .await
            .unwrap();
        assert!(untracked.iter().all(|r| !r.is_dir));

        let tracked = LocalTreeDigestPipeline::new(ScanConfig {
            track_directories: true,
            ..Default::default()
        })
        .scan(dir.path())
        .await
        .unwrap();
        let keys: Vec<_> = tracked.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["docs/", "docs/readme.md", "empty/"]);
        assert!(tracked[0].digest.is_none());
    }

    #[tokio::test]
    async fn test_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let records = LocalTreeDigestPipeline::default()
            .scan(&dir.path().join("not-there"))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_progress_counts_bytes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "one", &[1u8; 1000]);
        write(dir.path(), "two", &[2u8; 500]);

        let mut tree = LocalTreeDigestPipeline::default().start(dir.path(), CancelFlag::new());
        while let Some(record) = tree.next().await {
            record.unwrap();
        }
        let progress = tree.progress();
        assert_eq!(progress.files_found(), 2);
        assert_eq!(progress.bytes_to_hash(), 1500);
        assert_eq!(progress.bytes_hashed(), 1500);
        assert!(progress.walk_done());
        assert!(progress.hashing_done());
    }

    #[test]
    fn test_hash_file_cancelled() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "f", b"data");
        let cancel = CancelFlag::new();
        cancel.cancel();
        let result = hash_file(
            &dir.path().join("f"),
            MultipartDigest::new(),
            4,
            &cancel,
            |_| {},
        );
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
