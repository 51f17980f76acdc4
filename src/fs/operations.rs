//! Filesystem helpers
//!
//! Key/path mapping between sync keys and local paths, ranged reads for
//! part uploads, and removal helpers that treat absence as success.

use crate::error::{IoResultExt, Result, SyncError};
use crate::storage::ByteStream;
use bytes::BytesMut;
use futures::stream::{self, StreamExt};
use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Suffix of the temporary file a download is written to before it is verified
const PARTIAL_SUFFIX: &str = ".bucketsync-partial";

/// Slash-separated sync key for a path relative to the sync root
///
/// Returns `None` for paths with non-UTF-8 names or with components other
/// than plain names.
pub fn sync_key(relative: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Local path a remote key maps to under `root`
///
/// Keys that are empty, absolute, end in `/`, or contain empty, `.` or `..`
/// segments cannot be stored safely and map to `None`.
pub fn local_path_for_key(root: &Path, key: &str) -> Option<PathBuf> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') || key.contains('\\') {
        return None;
    }
    let mut path = root.to_path_buf();
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        path.push(segment);
    }
    Some(path)
}

/// Temporary sibling a download is staged in
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    dest.with_file_name(name)
}

/// Create the parent directories of `path`
pub async fn create_parent_dirs(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.with_path(parent)?;
        }
    }
    Ok(())
}

/// Remove a file; returns whether it existed
pub async fn remove_file_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Remove a directory tree; returns whether it existed
pub async fn remove_dir_all_if_exists(path: &Path) -> Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(SyncError::io(path, e)),
    }
}

/// Stream `len` bytes of a file starting at `offset`, in chunks of `chunk_size`
///
/// The stream ends early if the file is shorter than expected; callers
/// compare the bytes seen with what they asked for.
pub async fn read_range(path: &Path, offset: u64, len: u64, chunk_size: usize) -> Result<ByteStream> {
    let mut file = tokio::fs::File::open(path).await.with_path(path)?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset)).await.with_path(path)?;
    }
    let reader = file.take(len);
    let chunk_size = chunk_size.max(1);

    let body = stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = BytesMut::with_capacity(chunk_size);
        match reader.read_buf(&mut buf).await {
            Ok(0) => None,
            Ok(_) => Some((Ok(buf.freeze()), Some(reader))),
            Err(e) => Some((Err(e), None)),
        }
    });
    Ok(body.boxed())
}
