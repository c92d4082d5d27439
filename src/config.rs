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

//! Pipeline configuration
//!
//! Every field has a default, so a JSON file only needs the keys it changes:
//!
//! ```json
//! { "output_dir": "/media/books", "assembly": { "merge": true, "merge_format": "m4b" } }
//! ```

use crate::api::manifest::ResolveMode;
use crate::audio::assembler::AssemblyOptions;
use crate::audio::tool::DEFAULT_TOOL_TIMEOUT;
use crate::download::manager::RetryPolicy;
use crate::error::{LoanError, Result};
use crate::file::paths::{PathBuilder, PathTemplate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root for book folders
    pub output_dir: PathBuf,
    /// Holds `identity.json`
    pub settings_dir: PathBuf,
    pub book_folder_template: String,
    pub book_file_template: String,
    pub retry: RetryPolicy,
    /// Parts of one loan fetched at the same time
    pub part_concurrency: usize,
    /// Loans processed at the same time
    pub max_concurrent_loans: usize,
    pub assembly: AssemblyOptions,
    /// Limit for a single ffmpeg / ffprobe run
    pub tool_timeout_secs: u64,
    /// Return each loan once it finished successfully
    pub return_after_download: bool,
    pub resolve_mode: ResolveMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            settings_dir: PathBuf::from("loanfetch_settings"),
            book_folder_template: PathTemplate::default_folder().as_str().to_string(),
            book_file_template: PathTemplate::default_file().as_str().to_string(),
            retry: RetryPolicy::default(),
            part_concurrency: 1,
            max_concurrent_loans: 1,
            assembly: AssemblyOptions::default(),
            tool_timeout_secs: DEFAULT_TOOL_TIMEOUT.as_secs(),
            return_after_download: false,
            resolve_mode: ResolveMode::default(),
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoanError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            LoanError::ConfigurationError(format!("invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.book_folder_template.trim().is_empty() {
            return Err(LoanError::ConfigurationError("book_folder_template is empty".into()));
        }
        if self.book_file_template.trim().is_empty() {
            return Err(LoanError::ConfigurationError("book_file_template is empty".into()));
        }
        if self.tool_timeout_secs == 0 {
            return Err(LoanError::ConfigurationError("tool_timeout_secs must be positive".into()));
        }
        if self.assembly.tag_delimiter.is_empty() {
            return Err(LoanError::ConfigurationError("tag_delimiter is empty".into()));
        }
        Ok(())
    }

    pub fn output_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn settings_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.settings_dir = dir.into();
        self
    }

    pub fn book_folder_template<S: Into<String>>(mut self, template: S) -> Self {
        self.book_folder_template = template.into();
        self
    }

    pub fn book_file_template<S: Into<String>>(mut self, template: S) -> Self {
        self.book_file_template = template.into();
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn part_concurrency(mut self, concurrency: usize) -> Self {
        self.part_concurrency = concurrency.max(1);
        self
    }

    pub fn max_concurrent_loans(mut self, concurrency: usize) -> Self {
        self.max_concurrent_loans = concurrency.max(1);
        self
    }

    pub fn assembly(mut self, options: AssemblyOptions) -> Self {
        self.assembly = options;
        self
    }

    pub fn tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn return_after_download(mut self, enabled: bool) -> Self {
        self.return_after_download = enabled;
        self
    }

    pub fn resolve_mode(mut self, mode: ResolveMode) -> Self {
        self.resolve_mode = mode;
        self
    }

    pub fn tool_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    pub fn path_builder(&self) -> PathBuilder {
        PathBuilder::new(
            self.output_dir.clone(),
            PathTemplate::new(self.book_folder_template.clone()),
            PathTemplate::new(self.book_file_template.clone()),
        )
    }
}
