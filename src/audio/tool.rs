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

//! External media tool invocation
//!
//! Every ffmpeg / ffprobe call goes through [`run_tool`], which applies the
//! configured timeout and maps failures onto the tool error variants.

use crate::error::{LoanError, Result};
use std::ffi::OsString;
use std::path::Path;
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default limit for one tool invocation
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Run `program` with `args`, failing on a non-zero exit
pub async fn run_tool(program: &str, args: &[OsString], timeout: Duration) -> Result<Output> {
    debug!(program, args = ?args, "running media tool");

    let child = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| LoanError::Timeout(timeout.as_secs()))?
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LoanError::FfmpegNotFound
            } else {
                LoanError::FfmpegError(format!("Failed to execute {}: {}", program, e))
            }
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(LoanError::FfmpegError(format!(
            "{} exited with {}: {}",
            program, output.status, tail
        )));
    }

    Ok(output)
}

/// Sibling path ffmpeg writes to before the result replaces `file`
///
/// The extension is kept last so ffmpeg picks the same muxer.
pub fn tool_temp_path(file: &Path) -> std::path::PathBuf {
    let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("media");
    match file.extension().and_then(|s| s.to_str()) {
        Some(ext) => file.with_file_name(format!(".{}.tmp.{}", stem, ext)),
        None => file.with_file_name(format!(".{}.tmp", stem)),
    }
}

/// Replace `file` with the tool output at `temp`
pub async fn replace_with(temp: &Path, file: &Path) -> Result<()> {
    tokio::fs::rename(temp, file).await.map_err(|e| {
        LoanError::FileIoError(format!("rename: {} - {}", file.display(), e))
    })
}

/// Common ffmpeg prefix: quiet, non-interactive
pub fn ffmpeg_args() -> Vec<OsString> {
    ["-hide_banner", "-nostdin", "-loglevel", "error"]
        .iter()
        .map(OsString::from)
        .collect()
}
