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

//! Per-loan state machine and batch driver

use crate::api::manifest::{ManifestResolver, ResourceManifest, ReturnOutcome};
use crate::audio::assembler::{
    MediaArtifact, MediaAssembler, MediaTools, PackageStage, SidecarStage, Stage, WorkingSet,
};
use crate::config::PipelineConfig;
use crate::download::manager::{DownloadManager, DownloadTask};
use crate::error::{LoanError, Result};
use crate::file::manager::FileManager;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Where a loan is in the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LoanState {
    Resolving,
    Downloading,
    Processing,
    Done,
    /// Absorbing; carries the reason
    Failed(String),
}

impl LoanState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoanState::Resolving => "resolving",
            LoanState::Downloading => "downloading",
            LoanState::Processing => "processing",
            LoanState::Done => "done",
            LoanState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, LoanState::Done | LoanState::Failed(_))
    }
}

/// Result of running one loan
#[derive(Debug, Clone, Serialize)]
pub struct LoanOutcome {
    pub loan_id: String,
    pub label: String,
    /// Every state entered, in order
    pub transitions: Vec<LoanState>,
    pub artifact: Option<MediaArtifact>,
    pub downloads: Vec<DownloadTask>,
    pub warnings: Vec<String>,
    pub returned: Option<ReturnOutcome>,
    /// `LoanError::category` of the failure
    pub error_category: Option<&'static str>,
    /// The failure ends the whole run, not only this loan
    #[serde(skip)]
    pub run_fatal: bool,
}

impl LoanOutcome {
    fn new(loan_id: String, label: String) -> Self {
        Self {
            loan_id,
            label,
            transitions: Vec::new(),
            artifact: None,
            downloads: Vec::new(),
            warnings: Vec::new(),
            returned: None,
            error_category: None,
            run_fatal: false,
        }
    }

    /// Current state; `Resolving` before anything ran
    pub fn state(&self) -> &LoanState {
        self.transitions.last().unwrap_or(&LoanState::Resolving)
    }

    pub fn is_done(&self) -> bool {
        *self.state() == LoanState::Done
    }

    fn enter(&mut self, state: LoanState) {
        if self.state().is_terminal() {
            return;
        }
        debug!(loan_id = %self.loan_id, state = state.as_str(), "loan state");
        self.transitions.push(state);
    }

    fn warn(&mut self, message: String) {
        warn!(loan_id = %self.loan_id, warning = %message, "loan warning");
        self.warnings.push(message);
    }

    fn fail(&mut self, err: &LoanError) {
        error!(loan_id = %self.loan_id, error = %err, category = err.category(), "loan failed");
        self.error_category = Some(err.category());
        self.run_fatal = err.is_auth_error();
        self.enter(LoanState::Failed(err.user_message()));
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<LoanOutcome>,
    /// Selection entries that matched no loan
    pub not_found: Vec<String>,
    /// Set when a run-fatal error stopped the batch
    pub aborted: Option<String>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.succeeded()
    }

    /// 0 only if the run finished and every selected loan is done
    pub fn exit_code(&self) -> i32 {
        if self.aborted.is_none() && self.outcomes.iter().all(|o| o.is_done()) {
            0
        } else {
            1
        }
    }
}

/// One loan to run
#[derive(Clone)]
pub struct LoanJob {
    pub resolver: Arc<dyn ManifestResolver>,
    /// Return the loan once it is done
    pub return_after: bool,
}

impl LoanJob {
    pub fn new(resolver: Arc<dyn ManifestResolver>) -> Self {
        Self {
            resolver,
            return_after: false,
        }
    }

    pub fn return_after(mut self, enabled: bool) -> Self {
        self.return_after = enabled;
        self
    }
}

impl std::fmt::Debug for LoanJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoanJob")
            .field("loan_id", &self.resolver.loan_id())
            .field("return_after", &self.return_after)
            .finish()
    }
}

/// Drives loans through resolve, download and assembly
pub struct Orchestrator {
    downloads: DownloadManager,
    tools: MediaTools,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(downloads: DownloadManager, tools: MediaTools, config: PipelineConfig) -> Self {
        Self {
            downloads,
            tools,
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one loan to a terminal state. Never returns an error: failures are
    /// recorded in the outcome.
    #[instrument(skip(self, job), fields(loan_id = %job.resolver.loan_id()))]
    pub async fn run_loan(&self, job: LoanJob) -> LoanOutcome {
        let mut outcome = LoanOutcome::new(job.resolver.loan_id(), job.resolver.label());
        info!(label = %outcome.label, "processing loan");

        if let Err(e) = self.process(&job, &mut outcome).await {
            outcome.fail(&e);
            return outcome;
        }

        if job.return_after && outcome.is_done() {
            match job.resolver.return_loan().await {
                Ok(returned) => {
                    info!(outcome = ?returned, "loan returned");
                    outcome.returned = Some(returned);
                }
                Err(e) => {
                    outcome.run_fatal = e.is_auth_error();
                    outcome.warn(format!("could not return loan: {}", e));
                }
            }
        }
        outcome
    }

    async fn process(&self, job: &LoanJob, outcome: &mut LoanOutcome) -> Result<()> {
        outcome.enter(LoanState::Resolving);
        FileManager::ensure_directory_exists(&self.config.output_dir).await?;
        let manifest = job.resolver.resolve(&self.config.output_dir).await?;

        if manifest.is_empty() {
            info!("nothing to download");
            outcome.enter(LoanState::Done);
            return Ok(());
        }

        let paths = self.config.path_builder();
        let folder = paths.book_folder(&manifest.metadata)?;
        FileManager::ensure_directory_exists(&folder).await?;
        let has_audio = manifest.audio_parts().next().is_some();
        let packaged = !has_audio && manifest.archive_items().next().is_some();
        let extension = if packaged {
            "epub"
        } else {
            self.config.assembly.merge_format.extension()
        };
        let merged_target = paths.book_file(&folder, &manifest.metadata, extension)?;

        let single_file = packaged || (has_audio && self.config.assembly.merge);
        if single_file && FileManager::file_exists(&merged_target).await {
            info!(path = %merged_target.display(), "finished file already present, skipping");
            outcome.artifact = Some(MediaArtifact {
                files: vec![merged_target.clone()],
                merged: Some(merged_target),
                ..Default::default()
            });
            outcome.enter(LoanState::Done);
            return Ok(());
        }

        outcome.enter(LoanState::Downloading);
        let cover = self.download(&manifest, &folder, outcome).await?;

        outcome.enter(LoanState::Processing);
        let set = WorkingSet::new(manifest, folder, merged_target, cover);
        let assembler = if has_audio {
            MediaAssembler::new(&self.config.assembly, &self.tools)
        } else {
            self.document_assembler()
        };
        let artifact = assembler.assemble(set).await?;
        for warning in &artifact.warnings {
            outcome.warnings.push(warning.clone());
        }
        outcome.artifact = Some(artifact);
        outcome.enter(LoanState::Done);
        info!(warnings = outcome.warnings.len(), "loan done");
        Ok(())
    }

    /// Fetch every item; returns the cover path when it arrived
    async fn download(
        &self,
        manifest: &ResourceManifest,
        folder: &std::path::Path,
        outcome: &mut LoanOutcome,
    ) -> Result<Option<PathBuf>> {
        let results = self
            .downloads
            .fetch_all(&manifest.items, folder, &self.config.retry, self.config.part_concurrency)
            .await;

        let mut cover = None;
        let mut first_error = None;
        for (item, result) in manifest.items.iter().zip(results) {
            let task = match result {
                Ok(task) => task,
                Err(e) => {
                    error!(file = %item.file_name, error = %e, "could not store item");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };

            if task.is_failed() {
                let reason = task.last_error.clone().unwrap_or_else(|| "unknown error".to_string());
                if item.is_skippable() {
                    outcome.warn(format!("{} not downloaded: {}", item.file_name, reason));
                } else {
                    error!(file = %item.file_name, attempts = task.attempts, error = %reason, "required item failed");
                    if first_error.is_none() {
                        first_error = Some(LoanError::DownloadFailed(format!("{}: {}", item.file_name, reason)));
                    }
                }
            } else if item.is_skippable() {
                cover = Some(task.destination.clone());
            }
            outcome.downloads.push(task);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(cover),
        }
    }

    /// Ebooks and magazines: EPUB packaging of web-reader content, then sidecars
    fn document_assembler(&self) -> MediaAssembler {
        let options = &self.config.assembly;
        let mut stages: Vec<Box<dyn Stage>> = vec![Box::new(PackageStage::new())];
        if options.export_opf || options.export_debug_json {
            stages.push(Box::new(SidecarStage::new(options.export_opf, options.export_debug_json)));
        }
        MediaAssembler::with_stages(stages)
    }

    /// Run `jobs`, at most `max_concurrent_loans` at a time
    ///
    /// A loan failure is recorded and the batch goes on; an auth failure
    /// stops the batch and leaves the remaining loans unprocessed.
    pub async fn run_batch(&self, jobs: Vec<LoanJob>, not_found: Vec<String>) -> BatchReport {
        for entry in &not_found {
            warn!(entry = %entry, "not found");
        }
        let mut report = BatchReport {
            not_found,
            ..Default::default()
        };

        let total = jobs.len();
        let mut runs = stream::iter(jobs)
            .map(|job| self.run_loan(job))
            .buffered(self.config.max_concurrent_loans.max(1));

        while let Some(outcome) = runs.next().await {
            let fatal = outcome.run_fatal;
            let reason = match outcome.state() {
                LoanState::Failed(reason) => reason.clone(),
                _ => "authentication lost".to_string(),
            };
            report.outcomes.push(outcome);
            if fatal {
                error!(reason = %reason, "authentication failed, stopping");
                report.aborted = Some(reason);
                break;
            }
        }

        info!(
            total,
            succeeded = report.succeeded(),
            failed = report.failed(),
            not_found = report.not_found.len(),
            "batch finished"
        );
        report
    }
}
