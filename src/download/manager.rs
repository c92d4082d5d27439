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

//! Download manager
//!
//! Fetches manifest items to disk with:
//! - A per-attempt timeout and exponential backoff with jitter between attempts
//! - Size and SHA-256 checks against what the manifest declared
//! - Temp-file-then-rename, so a destination path only ever holds a complete file
//! - Idempotence: a destination recorded as complete (see [`DownloadLedger`]),
//!   or one that verifies against the manifest, is not fetched again
//!
//! Non-transient failures (4xx responses other than 408/429) are not retried.
//! A transfer that gives up comes back as a [`TaskState::Failed`] task; only
//! local file system problems are returned as errors.

use crate::api::manifest::ManifestItem;
use crate::download::ledger::{CompletedFile, DownloadLedger};
use crate::download::progress::{DownloadProgress, DownloadState, ProgressCallback};
use crate::download::stream::{stream_to_file, StreamOutcome};
use crate::error::{LoanError, Result};
use crate::file::manager::FileManager;
use futures_util::stream::{self, StreamExt};
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Upper bound for a single backoff delay
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Retry configuration for item downloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Wall-clock limit for one attempt
    pub attempt_timeout_secs: u64,
    /// First backoff delay; doubled per failed attempt
    pub backoff_base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            attempt_timeout_secs: 300,
            backoff_base_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, attempt_timeout: Duration) -> Self {
        Self {
            max_retries,
            attempt_timeout_secs: attempt_timeout.as_secs().max(1),
            ..Self::default()
        }
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base_ms = base.as_millis() as u64;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_base_ms
            .saturating_mul(2_u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if self.backoff_base_ms > 0 {
            rand::thread_rng().gen_range(0..=self.backoff_base_ms / 4)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter)).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Pending,
    InProgress,
    Succeeded,
    Failed,
}

/// Record of one item download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadTask {
    pub file_name: String,
    pub destination: PathBuf,
    /// Attempts made, 0 when an existing file was reused
    pub attempts: u32,
    pub state: TaskState,
    pub last_error: Option<String>,
    /// `LoanError::category` of the last error
    pub error_category: Option<&'static str>,
    pub bytes: u64,
    pub reused_existing: bool,
}

impl DownloadTask {
    fn new(item: &ManifestItem, destination: PathBuf) -> Self {
        Self {
            file_name: item.file_name.clone(),
            destination,
            attempts: 0,
            state: TaskState::Pending,
            last_error: None,
            error_category: None,
            bytes: 0,
            reused_existing: false,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }
}

/// Fetches manifest items with retry and integrity checks
#[derive(Clone)]
pub struct DownloadManager {
    client: Client,
    progress: Option<ProgressCallback>,
    /// Serializes completion record updates
    ledger_lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("has_progress_callback", &self.progress.is_some())
            .finish()
    }
}

impl DownloadManager {
    pub fn new() -> Result<Self> {
        let client = Client::builder().user_agent("Mozilla/5.0").build()?;
        Ok(Self::with_client(client))
    }

    /// Share cookies with the session client (direct-mode content needs them)
    pub fn with_cookie_jar(jar: Arc<Jar>) -> Result<Self> {
        let client = Client::builder()
            .user_agent("Mozilla/5.0")
            .cookie_provider(jar)
            .build()?;
        Ok(Self::with_client(client))
    }

    fn with_client(client: Client) -> Self {
        Self {
            client,
            progress: None,
            ledger_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Fetch `item` to `destination`
    ///
    /// Once attempts are exhausted, or on a non-retryable failure, the task
    /// comes back in [`TaskState::Failed`] with its last error. Nothing is
    /// left at `destination` or its temp path in that case. `Err` is only
    /// returned for local file system failures.
    pub async fn fetch(&self, item: &ManifestItem, destination: &Path, policy: &RetryPolicy) -> Result<DownloadTask> {
        let mut task = DownloadTask::new(item, destination.to_path_buf());
        let folder = destination.parent().map(Path::to_path_buf).unwrap_or_default();
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| item.file_name.clone());

        if self.completed_on_disk(item, destination, &folder, &name).await? {
            debug!(file = %item.file_name, "already downloaded, skipping");
            task.state = TaskState::Succeeded;
            task.reused_existing = true;
            task.bytes = FileManager::get_file_size(destination).await?;
            self.report(item, 0, task.bytes, DownloadState::Skipped, None);
            return Ok(task);
        }

        FileManager::ensure_directory_exists(&folder).await?;
        let temp_path = FileManager::partial_path(destination);

        loop {
            task.attempts += 1;
            task.state = TaskState::InProgress;

            let result = self.attempt(item, &temp_path, task.attempts, policy).await;
            match result {
                Ok(outcome) => {
                    tokio::fs::rename(&temp_path, destination).await.map_err(|e| {
                        LoanError::FileIoError(format!("Failed to move {} into place: {}", destination.display(), e))
                    })?;
                    self.record_completed(&folder, name.clone(), CompletedFile::new(outcome.bytes, outcome.sha256))
                        .await;
                    task.state = TaskState::Succeeded;
                    task.bytes = outcome.bytes;
                    task.last_error = None;
                    task.error_category = None;
                    self.report(item, task.attempts, outcome.bytes, DownloadState::Completed, None);
                    info!(file = %item.file_name, bytes = outcome.bytes, attempts = task.attempts, "downloaded");
                    return Ok(task);
                }
                Err(e) => {
                    if let Err(cleanup) = FileManager::safe_delete(&temp_path).await {
                        warn!(error = %cleanup, "could not remove partial download");
                    }
                    task.last_error = Some(e.to_string());
                    task.error_category = Some(e.category());

                    if !e.is_retryable() || task.attempts >= policy.max_attempts() {
                        task.state = TaskState::Failed;
                        self.report(item, task.attempts, 0, DownloadState::Failed, Some(e.to_string()));
                        warn!(file = %item.file_name, attempts = task.attempts, error = %e, "download failed");
                        return Ok(task);
                    }

                    let delay = policy.backoff(task.attempts);
                    warn!(
                        file = %item.file_name,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "download attempt failed, retrying"
                    );
                    self.report(item, task.attempts + 1, 0, DownloadState::Retrying, Some(e.to_string()));
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Whether `destination` already holds the finished download
    ///
    /// A completion record wins over the file's current bytes. Without one,
    /// the file must verify against the manifest and is recorded then.
    async fn completed_on_disk(
        &self,
        item: &ManifestItem,
        destination: &Path,
        folder: &Path,
        name: &str,
    ) -> Result<bool> {
        if !FileManager::file_exists(destination).await {
            return Ok(false);
        }

        let expected_sha = item.expected_sha256.as_deref();
        if let Some(entry) = DownloadLedger::load(folder).await.get(name) {
            if entry.matches(item.expected_size, expected_sha) {
                return Ok(true);
            }
            debug!(file = %name, "completion record no longer matches the manifest");
            return Ok(false);
        }

        if !FileManager::verify_file(destination, item.expected_size, expected_sha).await? {
            return Ok(false);
        }
        let entry = CompletedFile::new(
            FileManager::get_file_size(destination).await?,
            FileManager::sha256_file(destination).await?,
        );
        self.record_completed(folder, name.to_string(), entry).await;
        Ok(true)
    }

    async fn record_completed(&self, folder: &Path, name: String, entry: CompletedFile) {
        let _guard = self.ledger_lock.lock().await;
        let mut ledger = DownloadLedger::load(folder).await;
        ledger.insert(name, entry);
        if let Err(e) = ledger.save(folder).await {
            warn!(folder = %folder.display(), error = %e, "could not save download record");
        }
    }

    /// One timed attempt, verified against the manifest's declarations
    async fn attempt(
        &self,
        item: &ManifestItem,
        temp_path: &Path,
        attempt: u32,
        policy: &RetryPolicy,
    ) -> Result<StreamOutcome> {
        let outcome = tokio::time::timeout(
            policy.attempt_timeout(),
            stream_to_file(&self.client, item, temp_path, attempt, self.progress.as_ref()),
        )
        .await
        .map_err(|_| LoanError::Timeout(policy.attempt_timeout_secs))??;

        if let Some(expected) = item.expected_size {
            if outcome.bytes != expected {
                return Err(LoanError::FileSizeMismatch {
                    expected,
                    actual: outcome.bytes,
                });
            }
        }
        if let Some(ref expected) = item.expected_sha256 {
            if !outcome.sha256.eq_ignore_ascii_case(expected) {
                return Err(LoanError::ChecksumMismatch {
                    expected: expected.clone(),
                    actual: outcome.sha256,
                });
            }
        }
        Ok(outcome)
    }

    /// Fetch items into `directory`, up to `concurrency` at a time
    ///
    /// Results are returned in manifest order; `Err` entries are local
    /// file system failures.
    pub async fn fetch_all(
        &self,
        items: &[ManifestItem],
        directory: &Path,
        policy: &RetryPolicy,
        concurrency: usize,
    ) -> Vec<Result<DownloadTask>> {
        stream::iter(items.iter())
            .map(|item| {
                let destination = directory.join(&item.file_name);
                async move { self.fetch(item, &destination, policy).await }
            })
            .buffered(concurrency.max(1))
            .collect()
            .await
    }

    fn report(&self, item: &ManifestItem, attempt: u32, bytes: u64, state: DownloadState, error: Option<String>) {
        if let Some(ref cb) = self.progress {
            let mut progress = DownloadProgress::new(item.file_name.clone(), item.expected_size.unwrap_or(bytes));
            progress.attempt = attempt;
            progress.bytes_downloaded = bytes;
            progress.state = state;
            progress.error_message = error;
            progress.calculate_percentage();
            cb(progress);
        }
    }
}
