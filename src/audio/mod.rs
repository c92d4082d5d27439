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

//! Audio post-processing
//!
//! # Module Organization
//!
//! ## tool
//! Timed ffmpeg / ffprobe invocation shared by the collaborators below.
//!
//! ## metadata
//! - `TagWriter` / `FfmpegTagWriter` - read and write tags and chapters
//! - `build_tags`, `merge_non_destructive` - tag sets for a book
//! - `build_chapters` - cumulative chapter list across parts
//!
//! ## decoder
//! - `DurationProbe` / `FfprobeProbe` - playback duration of a part
//!
//! ## converter
//! - `MediaMerger` / `FfmpegMerger` - concat parts, convert to `.m4b`
//!
//! ## assembler
//! - `MediaAssembler` - tag, chapter, merge and export-sidecar stages
//!
//! # FFmpeg Integration
//!
//! The ffmpeg backed collaborators require FFmpeg and FFprobe in `PATH`.
//! Tests substitute in-memory implementations of the traits.

pub mod assembler;
pub mod converter;
pub mod decoder;
pub mod metadata;
pub mod tool;

pub use assembler::{AssemblyOptions, MediaArtifact, MediaAssembler, MediaTools, MergeFormat, StageKind, WorkingSet};
pub use converter::{FfmpegMerger, MediaMerger};
pub use decoder::{AudioFormat, DurationProbe, FfprobeProbe};
pub use metadata::{Chapter, FfmpegTagWriter, TagSet, TagWriter};
