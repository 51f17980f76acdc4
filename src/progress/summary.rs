//! Final reports
//!
//! Human-readable text for the outcome of each operation. The JSON form is
//! the outcome's `Serialize` impl.

use crate::sync::SyncSummary;
use crate::transfer::{DeleteSummary, Direction, TransferOutcome};
use humansize::{format_size, BINARY};
use std::time::Duration;

/// Outcome that can be printed as a text report
pub trait Report {
    fn render_text(&self) -> String;
}

fn rounded(elapsed: Duration) -> Duration {
    Duration::from_millis(elapsed.as_millis() as u64)
}

impl Report for SyncSummary {
    fn render_text(&self) -> String {
        let secs = self.elapsed.as_secs_f64();
        let rate = if secs > 0.0 {
            (self.bytes_transferred as f64 / secs) as u64
        } else {
            0
        };
        let moved = match self.direction {
            Direction::Upload => format!("Uploaded:    {}", self.uploaded),
            Direction::Download => format!("Downloaded:  {}", self.downloaded),
        };

        let mut lines = vec![
            moved,
            format!("Unchanged:   {}", self.skipped),
            format!("Deleted:     {}", self.deleted),
        ];
        if self.skipped_by_hook > 0 {
            lines.push(format!("Hook skips:  {}", self.skipped_by_hook));
        }
        lines.push(format!(
            "Transferred: {} ({}/s)",
            format_size(self.bytes_transferred, BINARY),
            format_size(rate, BINARY)
        ));
        lines.push(format!(
            "Elapsed:     {}",
            humantime::format_duration(rounded(self.elapsed))
        ));
        lines.join("\n")
    }
}

impl Report for TransferOutcome {
    fn render_text(&self) -> String {
        let verb = match self.direction {
            Direction::Upload => "Uploaded",
            Direction::Download => "Downloaded",
        };
        let mut text = format!("{} {} ({})", verb, self.key, format_size(self.bytes, BINARY));
        if self.parts > 1 {
            text.push_str(&format!(" in {} parts", self.parts));
        }
        text.push_str(&format!(", checksum {:?}", self.verification).to_lowercase());
        text
    }
}

impl Report for DeleteSummary {
    fn render_text(&self) -> String {
        format!("Deleted {} object(s)", self.deleted)
    }
}
