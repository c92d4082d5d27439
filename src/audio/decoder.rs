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

//! Audio inspection

use crate::audio::tool::{run_tool, DEFAULT_TOOL_TIMEOUT};
use crate::error::{LoanError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

/// Container formats the assembler produces or consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    Mp3,
    M4b,
    M4a,
    Unknown,
}

impl AudioFormat {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "mp3" => AudioFormat::Mp3,
            "m4b" => AudioFormat::M4b,
            "m4a" => AudioFormat::M4a,
            _ => AudioFormat::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(AudioFormat::Unknown, Self::from_extension)
    }

    pub fn to_extension(&self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::M4b => "m4b",
            AudioFormat::M4a => "m4a",
            AudioFormat::Unknown => "bin",
        }
    }
}

/// Measures playback duration
#[async_trait]
pub trait DurationProbe: Send + Sync {
    async fn duration_ms(&self, path: &Path) -> Result<u64>;
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// ffprobe backed [`DurationProbe`]
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    timeout: Duration,
}

impl Default for FfprobeProbe {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl FfprobeProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl DurationProbe for FfprobeProbe {
    async fn duration_ms(&self, path: &Path) -> Result<u64> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            path.as_os_str().to_owned(),
        ];
        let output = run_tool("ffprobe", &args, self.timeout).await?;

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| LoanError::InvalidAudioFile(format!("Failed to parse output: {}", e)))?;

        parse_duration_ms(probe.format.duration.as_deref()).ok_or_else(|| {
            LoanError::InvalidAudioFile(format!("No duration found in {}", path.display()))
        })
    }
}

/// ffprobe reports seconds as a decimal string
fn parse_duration_ms(value: Option<&str>) -> Option<u64> {
    let seconds = value?.trim().parse::<f64>().ok()?;
    if seconds.is_finite() && seconds > 0.0 {
        Some((seconds * 1000.0).round() as u64)
    } else {
        None
    }
}
