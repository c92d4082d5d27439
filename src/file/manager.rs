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


//! File operations and management
//!
//! # Key Operations
//! - Atomic writes (temp file in the same directory, fsync, rename)
//! - Integrity checks against a declared size and SHA-256
//! - Deletes that tolerate missing files and retry transient failures
//! - Directory creation

use crate::error::{LoanError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::time::sleep;

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Read buffer used when hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// File manager for safe file operations below one output root
#[derive(Debug, Clone)]
pub struct FileManager {
    output_root: PathBuf,
}

impl FileManager {
    pub fn new(output_root: PathBuf) -> Self {
        Self { output_root }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Safe delete operation with retry
    pub async fn safe_delete(path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::safe_delete_once(path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(LoanError::FileIoError(format!(
                        "Failed to delete file after {} attempts: {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        path.display(),
                        e
                    )));
                }
                Err(_) => {
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn safe_delete_once(path: &Path) -> Result<()> {
        if !Self::file_exists(path).await {
            return Ok(());
        }

        fs::remove_file(path).await.map_err(|e| {
            LoanError::FileIoError(format!("Delete failed: {}: {}", path.display(), e))
        })
    }

    /// Ensure directory exists, creating parent directories as needed
    pub async fn ensure_directory_exists(path: &Path) -> Result<()> {
        if Self::file_exists(path).await {
            return Ok(());
        }

        fs::create_dir_all(path).await.map_err(|e| {
            LoanError::FileIoError(format!("Failed to create directory {}: {}", path.display(), e))
        })
    }

    pub async fn file_exists(path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    pub async fn get_file_size(path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path).await.map_err(|e| {
            LoanError::FileIoError(format!("Failed to get file size {}: {}", path.display(), e))
        })?;

        Ok(metadata.len())
    }

    /// Hex encoded SHA-256 of a file's contents
    pub async fn sha256_file(path: &Path) -> Result<String> {
        let mut file = fs::File::open(path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hex::encode(hasher.finalize()))
    }

    /// Check an existing file against whatever the manifest declared
    ///
    /// With neither a size nor a checksum declared, an existing non-empty
    /// file is accepted: it only ever appears through an atomic rename.
    pub async fn verify_file(
        path: &Path,
        expected_size: Option<u64>,
        expected_sha256: Option<&str>,
    ) -> Result<bool> {
        if !Self::file_exists(path).await {
            return Ok(false);
        }

        let actual_size = Self::get_file_size(path).await?;
        if let Some(size) = expected_size {
            if actual_size != size {
                return Ok(false);
            }
        } else if actual_size == 0 {
            return Ok(false);
        }

        if let Some(expected) = expected_sha256 {
            let actual = Self::sha256_file(path).await?;
            return Ok(actual.eq_ignore_ascii_case(expected));
        }

        Ok(true)
    }

    /// Temporary sibling used while a file is being produced
    pub fn partial_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        path.with_file_name(format!("{}.part", name))
    }

    /// Atomic write: write to temp file, then rename
    pub async fn atomic_write(path: &Path, contents: &[u8]) -> Result<()> {
        let name = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
        let temp_path = path.with_file_name(format!(".{}.tmp", name));

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                Self::ensure_directory_exists(parent).await?;
            }
        }

        fs::write(&temp_path, contents).await.map_err(|e| {
            LoanError::FileIoError(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        let file = fs::OpenOptions::new()
            .write(true)
            .open(&temp_path)
            .await
            .map_err(|e| {
                LoanError::FileIoError(format!(
                    "Failed to open temp file for sync {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;

        file.sync_all().await.map_err(|e| {
            LoanError::FileIoError(format!("Failed to sync temp file {}: {}", temp_path.display(), e))
        })?;

        drop(file);

        fs::rename(&temp_path, path).await.map_err(|e| {
            LoanError::FileIoError(format!(
                "Failed to rename temp file {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })
    }
}
