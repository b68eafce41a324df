//! Transfer progress display with a progress bar.

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use wdt_core::{ProgressReporter, TransferReport};

/// Progress reporter drawing an indicatif bar from report snapshots
pub struct ProgressBarReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl ProgressBarReporter {
    /// Create a reporter; the bar appears on the first snapshot
    #[must_use]
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn make_bar(total_bytes: u64) -> ProgressBar {
        let bar = ProgressBar::new(total_bytes);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] \
                     {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
                )
                .expect("invalid progress bar template")
                .progress_chars("#>-"),
        );
        bar
    }
}

impl Default for ProgressBarReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ProgressBarReporter {
    fn progress(&self, report: &TransferReport) {
        let mut guard = self.bar.lock().unwrap();
        let bar = guard.get_or_insert_with(|| Self::make_bar(report.total_file_size));
        // Discovery may still be growing the total.
        bar.set_length(report.total_file_size);
        bar.set_position(report.summary.data_bytes());
    }

    fn done(&self, report: &TransferReport) {
        let guard = self.bar.lock().unwrap();
        if let Some(bar) = guard.as_ref() {
            bar.finish_with_message(format!("transfer {}", report.error_code()));
        }
    }
}

/// Format bytes in human-readable form
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;
    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }
    if unit_idx == 0 {
        format!("{bytes} B")
    } else {
        format!("{size:.2} {}", UNITS[unit_idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}
