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

//! Merging parts into one audiobook file
//!
//! Parts are joined with ffmpeg's concat demuxer (stream copy, no
//! re-encode). An `.m4b` is produced from the merged mp3 by re-encoding to
//! AAC, with the cover attached when one is available.

use crate::audio::tool::{ffmpeg_args, replace_with, run_tool, tool_temp_path, DEFAULT_TOOL_TIMEOUT};
use crate::error::{LoanError, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default AAC bitrate for `.m4b` output
pub const DEFAULT_M4B_BITRATE: &str = "64k";

/// Joins and converts audio files
#[async_trait]
pub trait MediaMerger: Send + Sync {
    /// Concatenate `parts` in order into `output`
    async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<()>;

    /// Convert `input` to an `.m4b` at `output`
    async fn to_m4b(&self, input: &Path, output: &Path, cover: Option<&Path>, bitrate: &str) -> Result<()>;
}

/// ffmpeg backed [`MediaMerger`]
#[derive(Debug, Clone)]
pub struct FfmpegMerger {
    timeout: Duration,
}

impl Default for FfmpegMerger {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl FfmpegMerger {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

/// Concat demuxer list; single quotes are escaped as `'\''`
pub fn concat_list(parts: &[PathBuf]) -> String {
    parts
        .iter()
        .map(|p| format!("file '{}'\n", p.to_string_lossy().replace('\'', "'\\''")))
        .collect()
}

#[async_trait]
impl MediaMerger for FfmpegMerger {
    async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<()> {
        if parts.is_empty() {
            return Err(LoanError::invalid_input("nothing to merge"));
        }

        let list_file = output.with_extension("concat.txt");
        tokio::fs::write(&list_file, concat_list(parts)).await?;

        let temp = tool_temp_path(output);
        let mut args = ffmpeg_args();
        args.extend(["-f", "concat", "-safe", "0", "-i"].iter().map(OsString::from));
        args.push(list_file.as_os_str().to_owned());
        args.extend(["-map", "0:a", "-map_metadata", "0", "-c", "copy", "-y"].iter().map(OsString::from));
        args.push(temp.as_os_str().to_owned());

        let result = run_tool("ffmpeg", &args, self.timeout).await;
        let _ = tokio::fs::remove_file(&list_file).await;
        result?;
        replace_with(&temp, output).await
    }

    async fn to_m4b(&self, input: &Path, output: &Path, cover: Option<&Path>, bitrate: &str) -> Result<()> {
        let temp = tool_temp_path(output);
        let mut args = ffmpeg_args();
        args.extend(["-i".into(), input.as_os_str().to_owned()]);

        match cover {
            Some(cover) => {
                args.extend(["-i".into(), cover.as_os_str().to_owned()]);
                args.extend(
                    ["-map", "0:a", "-map", "1:v", "-c:v", "copy", "-disposition:v:0", "attached_pic"]
                        .iter()
                        .map(OsString::from),
                );
            }
            None => args.extend(["-map", "0:a"].iter().map(OsString::from)),
        }
        args.extend(["-map_metadata", "0", "-map_chapters", "0", "-c:a", "aac", "-b:a"].iter().map(OsString::from));
        args.push(bitrate.into());
        args.extend(["-f", "mp4", "-y"].iter().map(OsString::from));
        args.push(temp.as_os_str().to_owned());

        run_tool("ffmpeg", &args, self.timeout).await?;
        replace_with(&temp, output).await
    }
}
