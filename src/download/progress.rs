// LoanFetch - Library Loan Downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Download progress reporting
//!
//! The manager reports a [`DownloadProgress`] snapshot per manifest item.
//! Snapshots are throttled so a fast stream does not flood the callback.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle of a single item download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Queued,
    Downloading,
    /// Retrying after a failed attempt
    Retrying,
    Completed,
    /// A verified file was already on disk
    Skipped,
    Failed,
}

/// Progress snapshot for one item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub file_name: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub bytes_downloaded: u64,
    /// Total bytes to download (0 if unknown)
    pub total_bytes: u64,
    /// Percentage complete (0.0 - 100.0)
    pub percent_complete: f64,
    /// Bytes per second since the attempt started
    pub download_speed: f64,
    pub state: DownloadState,
    pub error_message: Option<String>,
}

impl DownloadProgress {
    pub fn new(file_name: String, total_bytes: u64) -> Self {
        Self {
            file_name,
            attempt: 1,
            bytes_downloaded: 0,
            total_bytes,
            percent_complete: 0.0,
            download_speed: 0.0,
            state: DownloadState::Queued,
            error_message: None,
        }
    }

    pub fn calculate_percentage(&mut self) {
        if self.total_bytes > 0 {
            self.percent_complete = (self.bytes_downloaded as f64 / self.total_bytes as f64) * 100.0;
        } else {
            self.percent_complete = 0.0;
        }
    }

    /// Format bytes as human-readable string (e.g., "45.2 MB")
    pub fn bytes_string(bytes: u64) -> String {
        let mb = bytes as f64 / 1_000_000.0;
        format!("{:.1} MB", mb)
    }

    pub fn display_string(&self) -> String {
        match self.state {
            DownloadState::Queued => format!("{}: Queued", self.file_name),
            DownloadState::Downloading if self.total_bytes > 0 => format!(
                "{}: {:.1}% ({} / {})",
                self.file_name,
                self.percent_complete,
                Self::bytes_string(self.bytes_downloaded),
                Self::bytes_string(self.total_bytes),
            ),
            DownloadState::Downloading => format!(
                "{}: {}",
                self.file_name,
                Self::bytes_string(self.bytes_downloaded)
            ),
            DownloadState::Retrying => format!("{}: Retrying (attempt {})", self.file_name, self.attempt),
            DownloadState::Completed => format!("{}: Completed", self.file_name),
            DownloadState::Skipped => format!("{}: Already downloaded", self.file_name),
            DownloadState::Failed => format!(
                "{}: Failed - {}",
                self.file_name,
                self.error_message.as_deref().unwrap_or("Unknown error")
            ),
        }
    }
}

/// Callback type for progress updates
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Progress state for one attempt, with callback throttling
#[derive(Debug)]
pub struct ProgressTracker {
    progress: DownloadProgress,
    start_time: Instant,
    last_update: Instant,
    update_interval: Duration,
}

impl ProgressTracker {
    pub fn new(file_name: String, total_bytes: u64, attempt: u32) -> Self {
        let mut progress = DownloadProgress::new(file_name, total_bytes);
        progress.attempt = attempt;
        progress.state = DownloadState::Downloading;
        Self {
            progress,
            start_time: Instant::now(),
            last_update: Instant::now(),
            update_interval: Duration::from_millis(200),
        }
    }

    /// Record the new position. Returns true when a callback is due.
    pub fn update(&mut self, bytes_downloaded: u64) -> bool {
        self.progress.bytes_downloaded = bytes_downloaded;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.progress.download_speed = bytes_downloaded as f64 / elapsed;
        }
        self.progress.calculate_percentage();

        let now = Instant::now();
        if now.duration_since(self.last_update) >= self.update_interval {
            self.last_update = now;
            true
        } else {
            false
        }
    }

    pub fn set_total(&mut self, total_bytes: u64) {
        self.progress.total_bytes = total_bytes;
    }

    pub fn set_state(&mut self, state: DownloadState) {
        self.progress.state = state;
    }

    pub fn clone_progress(&self) -> DownloadProgress {
        self.progress.clone()
    }
}
