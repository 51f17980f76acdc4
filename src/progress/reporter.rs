//! Progress reporter implementation
//!
//! Polls the snapshot of a running operation and draws it with indicatif:
//! - A status line with the operation's counters
//! - A byte (or key) bar with throughput and ETA

use crate::core::{Observable, TaskHandle};
use crate::error::Result;
use crate::sync::SyncSnapshot;
use crate::transfer::{DeleteSnapshot, TransferSnapshot};
use humansize::{format_size, BINARY};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Arc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the main bar counts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Bytes,
    Keys,
}

/// One frame of progress, derived from a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub message: String,
    pub position: u64,
    pub length: u64,
}

/// Snapshots that can be drawn by [`ProgressReporter`]
pub trait ProgressView {
    /// Unit of [`ProgressLine::position`]
    fn unit(&self) -> Unit;

    fn line(&self) -> ProgressLine;
}

impl ProgressView for SyncSnapshot {
    fn unit(&self) -> Unit {
        Unit::Bytes
    }

    fn line(&self) -> ProgressLine {
        let mut message = format!(
            "{} files, {} objects",
            self.files_found, self.objects_found
        );
        if !self.hashing_done {
            message.push_str(&format!(
                ", hashed {}/{}",
                format_size(self.bytes_hashed, BINARY),
                format_size(self.bytes_to_hash, BINARY)
            ));
        }
        if self.active_transfers > 0 {
            message.push_str(&format!(", {} transferring", self.active_transfers));
        }
        if self.deletes_done + self.deletes_pending > 0 {
            message.push_str(&format!(
                ", {}/{} deleted",
                self.deletes_done,
                self.deletes_done + self.deletes_pending
            ));
        }
        if self.skipped > 0 {
            message.push_str(&format!(", {} unchanged", self.skipped));
        }
        ProgressLine {
            message,
            position: self.bytes_transferred,
            length: self.bytes_to_transfer,
        }
    }
}

impl ProgressView for TransferSnapshot {
    fn unit(&self) -> Unit {
        Unit::Bytes
    }

    fn line(&self) -> ProgressLine {
        let message = if self.parts_total > 1 {
            format!("{} (part {}/{})", self.key, self.parts_done, self.parts_total)
        } else {
            self.key.clone()
        };
        ProgressLine {
            message,
            position: self.bytes_done,
            length: self.bytes_total,
        }
    }
}

impl ProgressView for DeleteSnapshot {
    fn unit(&self) -> Unit {
        Unit::Keys
    }

    fn line(&self) -> ProgressLine {
        let message = if self.listing_done {
            format!("{} keys found", self.keys_found)
        } else {
            format!("{} keys found, listing", self.keys_found)
        };
        ProgressLine {
            message,
            position: self.keys_deleted,
            length: self.keys_found,
        }
    }
}

fn bar_style(unit: Unit) -> ProgressStyle {
    let template = match unit {
        Unit::Bytes => {
            "{prefix:.bold.dim} [{bar:40.green/white}] {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})"
        }
        Unit::Keys => "{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos}/{len} keys ({percent}%)",
    };
    ProgressStyle::default_bar()
        .template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ")
}

/// Terminal progress for one operation
pub struct ProgressReporter {
    multi: MultiProgress,
    status: ProgressBar,
    bar: ProgressBar,
    start_time: Instant,
    enabled: bool,
}

impl ProgressReporter {
    /// Create a reporter drawing to stderr
    pub fn new(unit: Unit) -> Self {
        let multi = MultiProgress::new();

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );

        let bar = multi.add(ProgressBar::new(0));
        bar.set_style(bar_style(unit));
        bar.set_prefix(match unit {
            Unit::Bytes => "Data",
            Unit::Keys => "Keys",
        });

        Self {
            multi,
            status,
            bar,
            start_time: Instant::now(),
            enabled: true,
        }
    }

    /// Create a reporter that draws nothing (quiet mode, non-TTY output)
    pub fn disabled(unit: Unit) -> Self {
        let mut reporter = Self::new(unit);
        reporter.enabled = false;
        reporter.multi.set_draw_target(ProgressDrawTarget::hidden());
        reporter
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Draw one frame
    pub fn update(&self, line: &ProgressLine) {
        self.status.set_message(line.message.clone());
        self.status.tick();
        self.bar.set_length(line.length);
        self.bar.set_position(line.position.min(line.length));
    }

    pub fn position(&self) -> u64 {
        self.bar.position()
    }

    pub fn finish_success(&self, message: &str) {
        self.status.finish_with_message(format!("✓ {}", message));
        self.bar.finish();
    }

    pub fn finish_error(&self, message: &str) {
        self.status.finish_with_message(format!("✗ {}", message));
        self.bar.abandon();
    }

    /// Draw `handle`'s progress until it finishes, then return its outcome
    pub async fn track<S, T>(&self, handle: TaskHandle<S, T>) -> Result<T>
    where
        S: Observable,
        S::Snapshot: ProgressView,
        T: Send + 'static,
    {
        let state: Arc<S> = Arc::clone(handle.state());
        let outcome = handle.wait();
        tokio::pin!(outcome);
        let mut ticker = tokio::time::interval(POLL_INTERVAL);

        loop {
            tokio::select! {
                result = &mut outcome => {
                    self.update(&state.snapshot().line());
                    match &result {
                        Ok(_) => self.finish_success("Done"),
                        Err(e) => self.finish_error(&e.to_string()),
                    }
                    return result;
                }
                _ = ticker.tick() => self.update(&state.snapshot().line()),
            }
        }
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("enabled", &self.enabled)
            .field("position", &self.bar.position())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CancelFlag;
    use crate::transfer::Direction;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Default)]
    struct Counter {
        done: AtomicU64,
        cancel: CancelFlag,
    }

    impl Observable for Counter {
        type Snapshot = DeleteSnapshot;

        fn snapshot(&self) -> DeleteSnapshot {
            DeleteSnapshot {
                keys_found: 10,
                keys_deleted: self.done.load(Ordering::Relaxed),
                listing_done: true,
            }
        }

        fn cancel_flag(&self) -> &CancelFlag {
            &self.cancel
        }
    }

    fn sync_snapshot() -> SyncSnapshot {
        SyncSnapshot {
            direction: Direction::Upload,
            files_found: 12,
            objects_found: 7,
            bytes_to_hash: 4096,
            bytes_hashed: 1024,
            bytes_to_transfer: 2048,
            bytes_transferred: 512,
            active_transfers: 2,
            deletes_pending: 1,
            deletes_done: 3,
            skipped: 0,
            files_done: true,
            objects_done: true,
            hashing_done: false,
            failed: false,
        }
    }

    #[test]
    fn test_sync_line() {
        let line = sync_snapshot().line();
        assert_eq!((line.position, line.length), (512, 2048));
        assert!(line.message.starts_with("12 files, 7 objects"));
        assert!(line.message.contains("2 transferring"));
        assert!(line.message.contains("3/4 deleted"));
        assert!(!line.message.contains("unchanged"));

        let mut done = sync_snapshot();
        done.hashing_done = true;
        assert!(!done.line().message.contains("hashed"));
    }

    #[test]
    fn test_transfer_line_shows_parts() {
        let snapshot = TransferSnapshot {
            direction: Direction::Download,
            key: "big.iso".to_string(),
            bytes_done: 10,
            bytes_total: 30,
            parts_done: 1,
            parts_total: 3,
            failed: false,
        };
        assert_eq!(snapshot.line().message, "big.iso (part 1/3)");
        assert_eq!(snapshot.unit(), Unit::Bytes);
    }

    #[test]
    fn test_disabled_reporter_clamps_position() {
        let reporter = ProgressReporter::disabled(Unit::Keys);
        assert!(!reporter.is_enabled());
        reporter.update(&ProgressLine {
            message: "x".to_string(),
            position: 15,
            length: 10,
        });
        assert_eq!(reporter.position(), 10);
    }

    #[tokio::test]
    async fn test_track_returns_outcome() {
        let state = Arc::new(Counter::default());
        let worker = Arc::clone(&state);
        let handle = TaskHandle::spawn(Arc::clone(&state), async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.done.store(10, Ordering::Relaxed);
            Ok(42u32)
        });

        let reporter = ProgressReporter::disabled(Unit::Keys);
        assert_eq!(reporter.track(handle).await.unwrap(), 42);
        assert_eq!(reporter.position(), 10);
    }
}
