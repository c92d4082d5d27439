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

//! Tags and chapters
//!
//! Tag values are kept as ffmpeg metadata keys so the same set can be read
//! back from ffprobe and written with `-metadata key=value`. A cover image
//! travels with the tags as an attached picture stream.

use crate::api::manifest::{BookMetadata, ChapterMarker};
use crate::audio::tool::{ffmpeg_args, replace_with, run_tool, tool_temp_path, DEFAULT_TOOL_TIMEOUT};
use crate::error::{LoanError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

/// Tag set keyed by ffmpeg metadata key
pub type TagSet = BTreeMap<String, String>;

/// Fields written by the tag stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagField {
    Title,
    Subtitle,
    Album,
    Artist,
    AlbumArtist,
    /// Narrators
    Performer,
    Publisher,
    Description,
    Genre,
    Language,
    Track,
    Series,
    Date,
    MediaId,
}

impl TagField {
    pub fn key(&self) -> &'static str {
        match self {
            TagField::Title => "title",
            TagField::Subtitle => "subtitle",
            TagField::Album => "album",
            TagField::Artist => "artist",
            TagField::AlbumArtist => "album_artist",
            TagField::Performer => "performer",
            TagField::Publisher => "publisher",
            TagField::Description => "comment",
            TagField::Genre => "genre",
            TagField::Language => "language",
            TagField::Track => "track",
            TagField::Series => "series",
            TagField::Date => "date",
            TagField::MediaId => "media_id",
        }
    }
}

fn set(tags: &mut TagSet, field: TagField, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
        tags.insert(field.key().to_string(), value);
    }
}

fn joined(values: &[String], delimiter: &str) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        Some(values.join(delimiter))
    }
}

/// Desired tags for one audio file
///
/// `track` is `(number, total)`; pass `None` for a merged file.
pub fn build_tags(metadata: &BookMetadata, track: Option<(u32, u32)>, delimiter: &str) -> TagSet {
    let mut tags = TagSet::new();
    set(&mut tags, TagField::Title, Some(metadata.title.clone()));
    set(&mut tags, TagField::Subtitle, metadata.subtitle.clone());
    set(&mut tags, TagField::Album, Some(metadata.title.clone()));
    set(&mut tags, TagField::Artist, joined(&metadata.authors, delimiter));
    set(&mut tags, TagField::AlbumArtist, joined(&metadata.authors, delimiter));
    set(&mut tags, TagField::Performer, joined(&metadata.narrators, delimiter));
    set(&mut tags, TagField::Publisher, metadata.publisher.clone());
    set(&mut tags, TagField::Description, metadata.description.clone());
    set(&mut tags, TagField::Genre, joined(&metadata.subjects, delimiter));
    set(&mut tags, TagField::Language, metadata.language.clone());
    set(
        &mut tags,
        TagField::Track,
        track.map(|(number, total)| format!("{:02}/{:02}", number, total)),
    );
    let series = metadata.series.as_ref().map(|name| match metadata.reading_order {
        Some(ref order) => format!("{} #{}", name, order),
        None => name.clone(),
    });
    set(&mut tags, TagField::Series, series);
    set(&mut tags, TagField::Date, metadata.published.clone());
    set(&mut tags, TagField::MediaId, Some(metadata.id.clone()));
    tags
}

/// Merge desired tags over existing ones
///
/// Existing non-empty values win unless `overwrite` is set; existing keys
/// the desired set does not mention are always kept.
pub fn merge_non_destructive(existing: &TagSet, desired: &TagSet, overwrite: bool) -> TagSet {
    let mut merged = existing.clone();
    for (key, value) in desired {
        let keep_existing = !overwrite
            && existing
                .get(key)
                .map_or(false, |current| !current.trim().is_empty());
        if !keep_existing {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Chapter with absolute offsets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Chapter {
    pub fn duration_ms(&self) -> u64 {
        self.end_ms.saturating_sub(self.start_ms)
    }
}

/// Timing of one part, input to chapter building
#[derive(Debug, Clone, PartialEq)]
pub struct PartTiming {
    pub duration_ms: u64,
    /// Markers relative to the part start
    pub markers: Vec<ChapterMarker>,
    /// Chapter title used when the part has no markers
    pub fallback_title: String,
}

/// Cumulative chapter list across parts
///
/// First chapter starts at 0, starts strictly increase, and every chapter
/// ends inside the total duration. A part without markers contributes one
/// chapter; consecutive chapters with the same title are collapsed.
pub fn build_chapters(parts: &[PartTiming]) -> Vec<Chapter> {
    let mut chapters: Vec<Chapter> = Vec::new();
    let mut offset = 0u64;

    for part in parts {
        let fallback = [ChapterMarker {
            title: part.fallback_title.clone(),
            offset_ms: 0,
        }];
        let markers: &[ChapterMarker] = if part.markers.is_empty() {
            &fallback
        } else {
            &part.markers
        };

        for marker in markers {
            let start = if chapters.is_empty() {
                0
            } else {
                offset + marker.offset_ms.min(part.duration_ms.saturating_sub(1))
            };
            if let Some(last) = chapters.last() {
                if last.title == marker.title || start <= last.start_ms {
                    continue;
                }
            }
            chapters.push(Chapter {
                title: marker.title.clone(),
                start_ms: start,
                end_ms: 0,
            });
        }
        offset += part.duration_ms;
    }

    for i in 0..chapters.len() {
        let end = chapters.get(i + 1).map_or(offset, |next| next.start_ms);
        chapters[i].end_ms = end.max(chapters[i].start_ms);
    }
    chapters
}

/// Generate an ffmetadata document holding `chapters`
pub fn generate_ffmetadata(chapters: &[Chapter]) -> String {
    let mut content = String::from(";FFMETADATA1\n");
    for chapter in chapters {
        content.push_str("\n[CHAPTER]\n");
        content.push_str("TIMEBASE=1/1000\n");
        content.push_str(&format!("START={}\n", chapter.start_ms));
        content.push_str(&format!("END={}\n", chapter.end_ms));
        content.push_str(&format!("title={}\n", escape_ffmetadata(&chapter.title)));
    }
    content
}

/// Escape `=`, `;`, `#`, `\` and newlines as ffmetadata requires
fn escape_ffmetadata(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '=' | ';' | '#' | '\\' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Reads and writes tags and chapters on audio files
#[async_trait]
pub trait TagWriter: Send + Sync {
    async fn read_tags(&self, file: &Path) -> Result<TagSet>;

    /// Write the complete tag set, embedding `cover` as the front cover when given
    async fn write_tags(&self, file: &Path, tags: &TagSet, cover: Option<&Path>) -> Result<()>;

    async fn write_chapters(&self, file: &Path, chapters: &[Chapter]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct MetadataProbe {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    tags: Option<HashMap<String, String>>,
}

/// ffprobe / ffmpeg backed [`TagWriter`]
#[derive(Debug, Clone)]
pub struct FfmpegTagWriter {
    timeout: Duration,
}

impl Default for FfmpegTagWriter {
    fn default() -> Self {
        Self::new(DEFAULT_TOOL_TIMEOUT)
    }
}

impl FfmpegTagWriter {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn is_mp3(file: &Path) -> bool {
        file.extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| e.eq_ignore_ascii_case("mp3"))
    }
}

/// ffmpeg arguments rewriting `file` into `temp` with `tags` and an optional cover
///
/// With a cover, any existing picture stream is replaced by it.
pub fn tag_args(file: &Path, temp: &Path, tags: &TagSet, cover: Option<&Path>) -> Vec<OsString> {
    let mut args = ffmpeg_args();
    args.extend(["-i".into(), file.as_os_str().to_owned()]);
    match cover {
        Some(cover) => {
            args.extend(["-i".into(), cover.as_os_str().to_owned()]);
            args.extend(["-map", "0:a", "-map", "1:0"].iter().map(OsString::from));
        }
        None => args.extend(["-map", "0"].iter().map(OsString::from)),
    }
    args.extend(["-map_metadata", "0", "-codec", "copy"].iter().map(OsString::from));
    if FfmpegTagWriter::is_mp3(file) {
        args.extend(["-id3v2_version", "3"].iter().map(OsString::from));
    }
    if cover.is_some() {
        args.extend(
            [
                "-metadata:s:v",
                "title=Album cover",
                "-metadata:s:v",
                "comment=Cover (front)",
                "-disposition:v:0",
                "attached_pic",
            ]
            .iter()
            .map(OsString::from),
        );
    }
    for (key, value) in tags {
        args.push("-metadata".into());
        args.push(format!("{}={}", key, value).into());
    }
    args.extend(["-y".into(), temp.as_os_str().to_owned()]);
    args
}

#[async_trait]
impl TagWriter for FfmpegTagWriter {
    async fn read_tags(&self, file: &Path) -> Result<TagSet> {
        let args: Vec<OsString> = vec![
            "-v".into(),
            "quiet".into(),
            "-print_format".into(),
            "json".into(),
            "-show_format".into(),
            file.as_os_str().to_owned(),
        ];
        let output = run_tool("ffprobe", &args, self.timeout).await?;

        let probe: MetadataProbe = serde_json::from_slice(&output.stdout)
            .map_err(|e| LoanError::InvalidAudioFile(format!("Failed to parse metadata: {}", e)))?;

        // ffprobe key case differs between containers
        Ok(probe
            .format
            .tags
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (if k.starts_with("OverDrive") { k } else { k.to_lowercase() }, v))
            .collect())
    }

    async fn write_tags(&self, file: &Path, tags: &TagSet, cover: Option<&Path>) -> Result<()> {
        let temp = tool_temp_path(file);
        let args = tag_args(file, &temp, tags, cover);
        run_tool("ffmpeg", &args, self.timeout).await?;
        replace_with(&temp, file).await
    }

    async fn write_chapters(&self, file: &Path, chapters: &[Chapter]) -> Result<()> {
        let metadata_file = file.with_extension("ffmetadata.txt");
        tokio::fs::write(&metadata_file, generate_ffmetadata(chapters)).await?;

        let temp = tool_temp_path(file);
        let mut args = ffmpeg_args();
        args.extend(["-i".into(), file.as_os_str().to_owned()]);
        args.extend(["-i".into(), metadata_file.as_os_str().to_owned()]);
        args.extend(
            ["-map", "0", "-map_metadata", "0", "-map_chapters", "1", "-codec", "copy"]
                .iter()
                .map(OsString::from),
        );
        if Self::is_mp3(file) {
            args.extend(["-id3v2_version", "3"].iter().map(OsString::from));
        }
        args.extend(["-y".into(), temp.as_os_str().to_owned()]);

        let result = run_tool("ffmpeg", &args, self.timeout).await;
        let _ = tokio::fs::remove_file(&metadata_file).await;
        result?;
        replace_with(&temp, file).await
    }
}
