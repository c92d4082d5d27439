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

//! Completion records for downloaded files
//!
//! Tagging and chapter embedding rewrite parts in place, so a finished part
//! stops matching the size and checksum its manifest declared. Each folder
//! keeps a small JSON record of the files that reached their final name,
//! written right after the rename; a recorded file is complete whatever its
//! bytes look like now.

use crate::error::Result;
use crate::file::manager::FileManager;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Hidden record file inside each book folder
pub const LEDGER_FILE_NAME: &str = ".loanfetch-downloads.json";

/// What was verified when a file reached its final name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedFile {
    pub bytes: u64,
    /// Hex SHA-256 of the bytes as downloaded
    pub sha256: String,
    pub completed_at: DateTime<Utc>,
}

impl CompletedFile {
    pub fn new(bytes: u64, sha256: String) -> Self {
        Self {
            bytes,
            sha256,
            completed_at: Utc::now(),
        }
    }

    /// Still consistent with what the manifest declares now
    pub fn matches(&self, expected_size: Option<u64>, expected_sha256: Option<&str>) -> bool {
        expected_size.map_or(true, |size| size == self.bytes)
            && expected_sha256.map_or(true, |sha| sha.eq_ignore_ascii_case(&self.sha256))
    }
}

/// Completed files of one folder, keyed by file name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadLedger {
    files: BTreeMap<String, CompletedFile>,
}

impl DownloadLedger {
    pub fn path_in(folder: &Path) -> PathBuf {
        folder.join(LEDGER_FILE_NAME)
    }

    /// Load the folder's record; a missing or unreadable one is empty
    pub async fn load(folder: &Path) -> Self {
        let path = Self::path_in(folder);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        serde_json::from_slice(&raw).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "ignoring unreadable download record");
            Self::default()
        })
    }

    pub fn get(&self, file_name: &str) -> Option<&CompletedFile> {
        self.files.get(file_name)
    }

    pub fn insert(&mut self, file_name: String, entry: CompletedFile) {
        self.files.insert(file_name, entry);
    }

    pub fn remove(&mut self, file_name: &str) -> Option<CompletedFile> {
        self.files.remove(file_name)
    }

    pub async fn save(&self, folder: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        FileManager::atomic_write(&Self::path_in(folder), &json).await
    }
}
