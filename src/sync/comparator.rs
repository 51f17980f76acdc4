//! Merge-diff decisions
//!
//! Given the records under the local and remote cursors, decides what to do
//! and which cursor(s) to advance. Both sequences are sorted byte-wise by
//! sync key, so a smaller key on one side means the other side has no
//! counterpart for it.

use crate::fs::LocalFileRecord;
use crate::storage::RemoteObjectRecord;
use crate::transfer::Direction;
use std::cmp::Ordering;

/// An item about to be transferred, as shown to a [`ParamsHook`](crate::config::ParamsHook)
#[derive(Debug, Clone, Copy)]
pub enum SyncItem<'a> {
    /// Local file going up; `remote` is the object it replaces, if any
    Upload {
        local: &'a LocalFileRecord,
        remote: Option<&'a RemoteObjectRecord>,
    },
    /// Remote object coming down; `local` is the file it replaces, if any
    Download {
        remote: &'a RemoteObjectRecord,
        local: Option<&'a LocalFileRecord>,
    },
}

impl SyncItem<'_> {
    /// Sync key of the item
    pub fn key(&self) -> &str {
        match self {
            SyncItem::Upload { local, .. } => &local.key,
            SyncItem::Download { remote, .. } => &remote.key,
        }
    }

    /// Size of the bytes that would be transferred
    pub fn size(&self) -> u64 {
        match self {
            SyncItem::Upload { local, .. } => local.size,
            SyncItem::Download { remote, .. } => remote.size,
        }
    }
}

/// What one merge step does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Upload the local file
    Upload,
    /// Download the remote object
    Download,
    /// Queue the remote object for batched deletion
    DeleteRemote,
    /// Remove the local file
    DeleteLocal,
    /// Remove a local directory that has nothing left remotely
    RemoveLocalDir,
    /// Local directory still has remote content
    KeepDir,
    /// Both sides hold the same content
    Skip,
    /// One-sided entry that this direction leaves alone
    Ignore,
}

/// Which cursor(s) a step consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Local,
    Remote,
    Both,
}

/// One merge step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub decision: SyncDecision,
    pub advance: Advance,
}

impl Step {
    fn new(decision: SyncDecision, advance: Advance) -> Self {
        Self { decision, advance }
    }
}

/// Decision table for one sync direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncComparator {
    direction: Direction,
    delete_removed: bool,
}

impl SyncComparator {
    pub fn new(direction: Direction, delete_removed: bool) -> Self {
        Self {
            direction,
            delete_removed,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Decide the next step; `None` once both cursors are exhausted
    pub fn compare(
        &self,
        local: Option<&LocalFileRecord>,
        remote: Option<&RemoteObjectRecord>,
    ) -> Option<Step> {
        match (local, remote) {
            (None, None) => None,
            (Some(local), _) if local.is_dir => Some(self.compare_dir(local, remote)),
            (Some(_), None) => Some(self.local_only()),
            (None, Some(_)) => Some(self.remote_only()),
            (Some(local), Some(remote)) => Some(match local.key.as_str().cmp(&remote.key) {
                Ordering::Less => self.local_only(),
                Ordering::Greater => self.remote_only(),
                Ordering::Equal if local.matches(remote.checksum.as_deref()) => {
                    Step::new(SyncDecision::Skip, Advance::Both)
                }
                Ordering::Equal => {
                    let decision = match self.direction {
                        Direction::Upload => SyncDecision::Upload,
                        Direction::Download => SyncDecision::Download,
                    };
                    Step::new(decision, Advance::Both)
                }
            }),
        }
    }

    fn local_only(&self) -> Step {
        let decision = match self.direction {
            Direction::Upload => SyncDecision::Upload,
            Direction::Download if self.delete_removed => SyncDecision::DeleteLocal,
            Direction::Download => SyncDecision::Ignore,
        };
        Step::new(decision, Advance::Local)
    }

    fn remote_only(&self) -> Step {
        let decision = match self.direction {
            Direction::Download => SyncDecision::Download,
            Direction::Upload if self.delete_removed => SyncDecision::DeleteRemote,
            Direction::Upload => SyncDecision::Ignore,
        };
        Step::new(decision, Advance::Remote)
    }

    // Directory keys end in '/', so every key inside the directory sorts
    // at or after it. A remote key below it is unrelated and goes first.
    fn compare_dir(&self, dir: &LocalFileRecord, remote: Option<&RemoteObjectRecord>) -> Step {
        match remote {
            Some(remote) if remote.key.starts_with(&dir.key) => {
                Step::new(SyncDecision::KeepDir, Advance::Local)
            }
            Some(remote) if remote.key.as_str() < dir.key.as_str() => self.remote_only(),
            _ => {
                let decision = if self.direction == Direction::Download && self.delete_removed {
                    SyncDecision::RemoveLocalDir
                } else {
                    SyncDecision::Ignore
                };
                Step::new(decision, Advance::Local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{md5_hex, MultipartDigest};
    use std::path::PathBuf;
    use std::time::SystemTime;

    fn local(key: &str, content: &[u8]) -> LocalFileRecord {
        let mut digest = MultipartDigest::new();
        digest.update(content);
        digest.finish();
        LocalFileRecord {
            key: key.to_string(),
            path: PathBuf::from("/local").join(key),
            size: content.len() as u64,
            modified: SystemTime::UNIX_EPOCH,
            is_dir: false,
            digest: Some(digest),
        }
    }

    fn dir(key: &str) -> LocalFileRecord {
        LocalFileRecord {
            key: key.to_string(),
            path: PathBuf::from("/local").join(key),
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
            is_dir: true,
            digest: None,
        }
    }

    fn remote(key: &str, content: &[u8]) -> RemoteObjectRecord {
        RemoteObjectRecord {
            key: key.to_string(),
            full_key: format!("prefix/{}", key),
            size: content.len() as u64,
            checksum: Some(format!("\"{}\"", md5_hex(content))),
            last_modified: None,
        }
    }

    fn step(decision: SyncDecision, advance: Advance) -> Option<Step> {
        Some(Step::new(decision, advance))
    }

    #[test]
    fn test_upload_table() {
        let up = SyncComparator::new(Direction::Upload, false);
        let a = local("a", b"1");
        let b = remote("b", b"2");

        assert_eq!(up.compare(None, None), None);
        assert_eq!(up.compare(None, Some(&b)), step(SyncDecision::Ignore, Advance::Remote));
        assert_eq!(up.compare(Some(&a), None), step(SyncDecision::Upload, Advance::Local));
        assert_eq!(up.compare(Some(&a), Some(&b)), step(SyncDecision::Upload, Advance::Local));
        assert_eq!(
            up.compare(Some(&local("c", b"3")), Some(&b)),
            step(SyncDecision::Ignore, Advance::Remote)
        );
        assert_eq!(
            up.compare(Some(&local("b", b"2")), Some(&b)),
            step(SyncDecision::Skip, Advance::Both)
        );
        assert_eq!(
            up.compare(Some(&local("b", b"changed")), Some(&b)),
            step(SyncDecision::Upload, Advance::Both)
        );

        let up_delete = SyncComparator::new(Direction::Upload, true);
        assert_eq!(
            up_delete.compare(None, Some(&b)),
            step(SyncDecision::DeleteRemote, Advance::Remote)
        );
    }

    #[test]
    fn test_download_table() {
        let down = SyncComparator::new(Direction::Download, false);
        let a = local("a", b"1");
        let b = remote("b", b"2");

        assert_eq!(down.compare(None, Some(&b)), step(SyncDecision::Download, Advance::Remote));
        assert_eq!(down.compare(Some(&a), None), step(SyncDecision::Ignore, Advance::Local));
        assert_eq!(down.compare(Some(&a), Some(&b)), step(SyncDecision::Ignore, Advance::Local));
        assert_eq!(
            down.compare(Some(&local("c", b"3")), Some(&b)),
            step(SyncDecision::Download, Advance::Remote)
        );
        assert_eq!(
            down.compare(Some(&local("b", b"x")), Some(&b)),
            step(SyncDecision::Download, Advance::Both)
        );

        let down_delete = SyncComparator::new(Direction::Download, true);
        assert_eq!(
            down_delete.compare(Some(&a), Some(&b)),
            step(SyncDecision::DeleteLocal, Advance::Local)
        );
    }

    #[test]
    fn test_missing_remote_checksum_is_a_difference() {
        let up = SyncComparator::new(Direction::Upload, false);
        let mut r = remote("k", b"same");
        r.checksum = None;
        assert_eq!(
            up.compare(Some(&local("k", b"same")), Some(&r)),
            step(SyncDecision::Upload, Advance::Both)
        );
    }

    #[test]
    fn test_directories() {
        let down = SyncComparator::new(Direction::Download, true);
        let d = dir("photos/");

        assert_eq!(
            down.compare(Some(&d), Some(&remote("photos/cat.jpg", b"x"))),
            step(SyncDecision::KeepDir, Advance::Local)
        );
        // "photos-old" sorts before "photos/" and is handled first.
        assert_eq!(
            down.compare(Some(&d), Some(&remote("photos-old", b"x"))),
            step(SyncDecision::Download, Advance::Remote)
        );
        assert_eq!(
            down.compare(Some(&d), Some(&remote("zebra", b"x"))),
            step(SyncDecision::RemoveLocalDir, Advance::Local)
        );
        assert_eq!(
            down.compare(Some(&d), None),
            step(SyncDecision::RemoveLocalDir, Advance::Local)
        );

        let keep = SyncComparator::new(Direction::Download, false);
        assert_eq!(keep.compare(Some(&d), None), step(SyncDecision::Ignore, Advance::Local));
    }

    #[test]
    fn test_sync_item_accessors() {
        let l = local("dir/file", b"12345");
        let item = SyncItem::Upload { local: &l, remote: None };
        assert_eq!(item.key(), "dir/file");
        assert_eq!(item.size(), 5);
    }
}
