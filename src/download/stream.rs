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

//! Single-attempt streaming of one manifest item
//!
//! The body is streamed through a `BufWriter` into a temporary file next to
//! the destination while a SHA-256 digest is computed on the fly. The
//! caller decides whether the result is accepted and renamed into place.

use crate::api::manifest::ManifestItem;
use crate::download::progress::{ProgressCallback, ProgressTracker};
use crate::error::{LoanError, Result};
use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

const DOWNLOAD_BUFF_SZ: usize = 64 * 1024;

/// What one attempt wrote to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    pub bytes: u64,
    /// Hex SHA-256 of the written bytes
    pub sha256: String,
}

/// Stream `item` into `temp_path`, truncating anything already there
pub async fn stream_to_file(
    client: &Client,
    item: &ManifestItem,
    temp_path: &Path,
    attempt: u32,
    callback: Option<&ProgressCallback>,
) -> Result<StreamOutcome> {
    let mut request = client.get(&item.url);
    for (key, value) in &item.headers {
        request = request.header(key.as_str(), value.as_str());
    }

    let response = request.send().await.map_err(|e| {
        let transient = e.is_timeout() || e.is_connect() || e.is_request();
        LoanError::network_error(format!("{}: {}", item.file_name, e), transient)
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(LoanError::UnexpectedStatusCode {
            status_code: status.as_u16(),
            url: item.url.clone(),
        });
    }

    let total = item.expected_size.or(response.content_length()).unwrap_or(0);
    let mut tracker = ProgressTracker::new(item.file_name.clone(), total, attempt);

    let file = File::create(temp_path).await?;
    let mut writer = BufWriter::with_capacity(DOWNLOAD_BUFF_SZ, file);
    let mut hasher = Sha256::new();
    let mut written = 0u64;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| {
            LoanError::network_error(format!("{}: stream interrupted: {}", item.file_name, e), true)
        })?;
        writer.write_all(&chunk).await?;
        hasher.update(&chunk);
        written += chunk.len() as u64;

        if tracker.update(written) {
            if let Some(cb) = callback {
                cb(tracker.clone_progress());
            }
        }
    }

    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    tracker.set_total(total.max(written));
    tracker.update(written);
    if let Some(cb) = callback {
        cb(tracker.clone_progress());
    }

    Ok(StreamOutcome {
        bytes: written,
        sha256: hex::encode(hasher.finalize()),
    })
}
