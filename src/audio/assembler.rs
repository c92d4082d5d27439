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

//! Media assembly
//!
//! Post-processing of downloaded parts runs as an ordered list of stages:
//!
//! 1. **Tag**: merge book tags into each part without clobbering existing
//!    values; the downloaded cover is embedded with them
//! 2. **Chapter**: build a cumulative chapter list from part durations and markers
//! 3. **Merge**: join parts into one `.mp3` (optionally `.m4b`), tag it, embed
//!    chapters. All of it happens under a hidden staging name; the merged file
//!    only appears at its final name once it is complete.
//! 4. **Package**: web-reader ebook and magazine files become one EPUB
//! 5. **Export sidecar**: OPF package document and `debug.json`
//!
//! Stages are sorted by [`StageKind`], so the order never depends on how the
//! assembler was configured. Tool failures inside a stage become warnings on
//! the [`MediaArtifact`]; the parts on disk are always left usable.

use crate::api::legacy::{parse_media_markers, MEDIA_MARKERS_TAG};
use crate::api::manifest::{ChapterMarker, ItemKind, ResourceManifest};
use crate::audio::converter::{FfmpegMerger, MediaMerger, DEFAULT_M4B_BITRATE};
use crate::audio::decoder::{DurationProbe, FfprobeProbe};
use crate::audio::metadata::{
    build_chapters, build_tags, merge_non_destructive, Chapter, FfmpegTagWriter, PartTiming, TagField, TagSet,
    TagWriter,
};
use crate::audio::tool::replace_with;
use crate::error::Result;
use crate::file::epub::{write_epub, EpubBook, EpubEntry};
use crate::file::manager::FileManager;
use crate::file::paths::slugify;
use crate::file::sidecar::{write_debug_json, write_opf, OpfFile, DEBUG_FILE_NAME};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Container of the merged file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeFormat {
    #[default]
    Mp3,
    M4b,
}

impl MergeFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            MergeFormat::Mp3 => "mp3",
            MergeFormat::M4b => "m4b",
        }
    }
}

/// Which stages run and how
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyOptions {
    pub tag: bool,
    pub chapters: bool,
    pub merge: bool,
    pub merge_format: MergeFormat,
    pub delete_parts_after_merge: bool,
    /// Replace existing non-empty tag values
    pub overwrite_tags: bool,
    /// Joins multi-valued fields such as authors
    pub tag_delimiter: String,
    pub export_opf: bool,
    pub export_debug_json: bool,
    pub m4b_bitrate: String,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            tag: true,
            chapters: true,
            merge: false,
            merge_format: MergeFormat::Mp3,
            delete_parts_after_merge: false,
            overwrite_tags: false,
            tag_delimiter: ";".to_string(),
            export_opf: false,
            export_debug_json: false,
            m4b_bitrate: DEFAULT_M4B_BITRATE.to_string(),
        }
    }
}

/// External tool collaborators
#[derive(Clone)]
pub struct MediaTools {
    pub tags: Arc<dyn TagWriter>,
    pub probe: Arc<dyn DurationProbe>,
    pub merger: Arc<dyn MediaMerger>,
}

impl MediaTools {
    /// ffmpeg / ffprobe from `PATH`
    pub fn ffmpeg(timeout: Duration) -> Self {
        Self {
            tags: Arc::new(FfmpegTagWriter::new(timeout)),
            probe: Arc::new(FfprobeProbe::new(timeout)),
            merger: Arc::new(FfmpegMerger::new(timeout)),
        }
    }
}

impl std::fmt::Debug for MediaTools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTools").finish_non_exhaustive()
    }
}

/// Result of assembling one loan
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MediaArtifact {
    /// Part files in playback order, or the single merged file
    pub files: Vec<PathBuf>,
    pub merged: Option<PathBuf>,
    pub cover: Option<PathBuf>,
    /// Book-level tags written
    pub tags: TagSet,
    pub chapters: Vec<Chapter>,
    pub sidecars: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

impl MediaArtifact {
    fn warn(&mut self, message: String) {
        warn!(warning = %message, "assembly warning");
        self.warnings.push(message);
    }
}

/// One downloaded audio part
#[derive(Debug, Clone, PartialEq)]
pub struct PartFile {
    pub number: u32,
    pub path: PathBuf,
    pub declared_duration_ms: Option<u64>,
    pub markers: Vec<ChapterMarker>,
}

/// State threaded through the stages
#[derive(Debug, Clone)]
pub struct WorkingSet {
    pub manifest: ResourceManifest,
    pub folder: PathBuf,
    pub parts: Vec<PartFile>,
    /// Filled by the chapter stage
    pub timings: Vec<PartTiming>,
    /// Single-file output path: the merged audio or the packaged EPUB.
    /// Stages set the extension they produce.
    pub merged_target: PathBuf,
    pub artifact: MediaArtifact,
}

impl WorkingSet {
    /// Working set for items of `manifest` downloaded into `folder`
    pub fn new(manifest: ResourceManifest, folder: PathBuf, merged_target: PathBuf, cover: Option<PathBuf>) -> Self {
        let mut parts: Vec<PartFile> = manifest
            .items
            .iter()
            .filter_map(|item| match item.kind {
                ItemKind::AudioPart { number } => Some(PartFile {
                    number,
                    path: folder.join(&item.file_name),
                    declared_duration_ms: item.duration_ms,
                    markers: item.markers.clone(),
                }),
                _ => None,
            })
            .collect();
        parts.sort_by_key(|p| p.number);

        let files = manifest
            .items
            .iter()
            .filter(|item| !item.is_skippable())
            .map(|item| folder.join(&item.file_name))
            .collect();

        Self {
            manifest,
            folder,
            parts,
            timings: Vec::new(),
            merged_target,
            artifact: MediaArtifact {
                files,
                cover,
                ..Default::default()
            },
        }
    }
}

/// Stage identity; the derived order is the execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Tag,
    Chapter,
    Merge,
    Package,
    ExportSidecar,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn apply(&self, set: &mut WorkingSet) -> Result<()>;
}

/// Writes book tags into every part
pub struct TagStage {
    tags: Arc<dyn TagWriter>,
    overwrite: bool,
    delimiter: String,
}

impl TagStage {
    pub fn new(tags: Arc<dyn TagWriter>, overwrite: bool, delimiter: String) -> Self {
        Self {
            tags,
            overwrite,
            delimiter,
        }
    }
}

#[async_trait]
impl Stage for TagStage {
    fn kind(&self) -> StageKind {
        StageKind::Tag
    }

    async fn apply(&self, set: &mut WorkingSet) -> Result<()> {
        let total = set.parts.len() as u32;
        set.artifact.tags = build_tags(&set.manifest.metadata, None, &self.delimiter);

        let cover = set.artifact.cover.clone();
        for part in &set.parts {
            let desired = build_tags(&set.manifest.metadata, Some((part.number, total)), &self.delimiter);
            let existing = match self.tags.read_tags(&part.path).await {
                Ok(existing) => existing,
                Err(e) => {
                    set.artifact
                        .warn(format!("could not read tags of {}: {}", part.path.display(), e));
                    continue;
                }
            };
            let merged = merge_non_destructive(&existing, &desired, self.overwrite);
            if merged == existing {
                debug!(part = part.number, "tags already up to date");
                continue;
            }
            if let Err(e) = self.tags.write_tags(&part.path, &merged, cover.as_deref()).await {
                set.artifact
                    .warn(format!("could not tag {}: {}", part.path.display(), e));
            }
        }
        Ok(())
    }
}

/// Builds the chapter list; embeds per-part chapters when not merging
pub struct ChapterStage {
    tags: Arc<dyn TagWriter>,
    probe: Arc<dyn DurationProbe>,
    embed_in_parts: bool,
}

impl ChapterStage {
    pub fn new(tags: Arc<dyn TagWriter>, probe: Arc<dyn DurationProbe>, embed_in_parts: bool) -> Self {
        Self {
            tags,
            probe,
            embed_in_parts,
        }
    }

    async fn markers_for(&self, part: &PartFile, artifact: &mut MediaArtifact) -> Vec<ChapterMarker> {
        if !part.markers.is_empty() {
            return part.markers.clone();
        }
        let tags = match self.tags.read_tags(&part.path).await {
            Ok(tags) => tags,
            Err(_) => return Vec::new(),
        };
        match tags.get(MEDIA_MARKERS_TAG) {
            Some(xml) => parse_media_markers(xml).unwrap_or_else(|e| {
                artifact.warn(format!("unreadable chapter markers in {}: {}", part.path.display(), e));
                Vec::new()
            }),
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl Stage for ChapterStage {
    fn kind(&self) -> StageKind {
        StageKind::Chapter
    }

    async fn apply(&self, set: &mut WorkingSet) -> Result<()> {
        let mut timings = Vec::with_capacity(set.parts.len());

        for part in &set.parts {
            let duration_ms = match self.probe.duration_ms(&part.path).await {
                Ok(ms) => ms,
                Err(e) => {
                    let declared = part.declared_duration_ms.unwrap_or(0);
                    debug!(part = part.number, error = %e, declared, "probe failed, using declared duration");
                    declared
                }
            };
            if duration_ms == 0 {
                set.artifact
                    .warn(format!("unknown duration for {}", part.path.display()));
            }
            let markers = self.markers_for(part, &mut set.artifact).await;
            timings.push(PartTiming {
                duration_ms,
                markers,
                fallback_title: format!("Part {:02}", part.number),
            });
        }

        set.artifact.chapters = build_chapters(&timings);
        info!(chapters = set.artifact.chapters.len(), "built chapter list");

        if self.embed_in_parts {
            for (part, timing) in set.parts.iter().zip(&timings) {
                let chapters = build_chapters(std::slice::from_ref(timing));
                if let Err(e) = self.tags.write_chapters(&part.path, &chapters).await {
                    set.artifact
                        .warn(format!("could not embed chapters in {}: {}", part.path.display(), e));
                }
            }
        }

        set.timings = timings;
        Ok(())
    }
}

/// Joins parts into one file
pub struct MergeStage {
    tools: MediaTools,
    format: MergeFormat,
    delete_parts: bool,
    delimiter: String,
    bitrate: String,
}

impl MergeStage {
    pub fn new(tools: MediaTools, options: &AssemblyOptions) -> Self {
        Self {
            tools,
            format: options.merge_format,
            delete_parts: options.delete_parts_after_merge,
            delimiter: options.tag_delimiter.clone(),
            bitrate: options.m4b_bitrate.clone(),
        }
    }

    async fn merge(&self, set: &WorkingSet, target: &Path) -> Result<TagSet> {
        let parts: Vec<PathBuf> = set.parts.iter().map(|p| p.path.clone()).collect();

        match self.format {
            MergeFormat::Mp3 => self.tools.merger.concat(&parts, target).await?,
            MergeFormat::M4b => {
                let intermediate = target.with_extension("merge.mp3");
                self.tools.merger.concat(&parts, &intermediate).await?;
                let converted = self
                    .tools
                    .merger
                    .to_m4b(&intermediate, target, set.artifact.cover.as_deref(), &self.bitrate)
                    .await;
                FileManager::safe_delete(&intermediate).await?;
                converted?;
            }
        }

        let existing = self.tools.tags.read_tags(target).await.unwrap_or_default();
        let desired = build_tags(&set.manifest.metadata, None, &self.delimiter);
        let mut tags = merge_non_destructive(&existing, &desired, false);
        tags.insert(TagField::Title.key().to_string(), set.manifest.metadata.title.clone());
        tags.remove(TagField::Track.key());
        // the m4b conversion already attached the cover
        let cover = match self.format {
            MergeFormat::Mp3 => set.artifact.cover.as_deref(),
            MergeFormat::M4b => None,
        };
        self.tools.tags.write_tags(target, &tags, cover).await?;

        if !set.artifact.chapters.is_empty() {
            self.tools.tags.write_chapters(target, &set.artifact.chapters).await?;
        }
        Ok(tags)
    }
}

#[async_trait]
impl Stage for MergeStage {
    fn kind(&self) -> StageKind {
        StageKind::Merge
    }

    async fn apply(&self, set: &mut WorkingSet) -> Result<()> {
        if set.parts.is_empty() {
            return Ok(());
        }
        let target = set.merged_target.with_extension(self.format.extension());
        let staging = staging_path(&target);

        let merged = match self.merge(set, &staging).await {
            Ok(tags) => replace_with(&staging, &target).await.map(|()| tags),
            Err(e) => Err(e),
        };
        let tags = match merged {
            Ok(tags) => tags,
            Err(e) => {
                if let Err(cleanup) = FileManager::safe_delete(&staging).await {
                    warn!(error = %cleanup, "could not remove unfinished merge");
                }
                set.artifact
                    .warn(format!("merge failed, keeping parts: {}", e));
                return Ok(());
            }
        };

        info!(path = %target.display(), parts = set.parts.len(), "merged parts");
        if self.delete_parts {
            for part in &set.parts {
                if let Err(e) = FileManager::safe_delete(&part.path).await {
                    set.artifact
                        .warn(format!("could not delete {}: {}", part.path.display(), e));
                }
            }
        }
        set.artifact.tags = tags;
        set.artifact.files = vec![target.clone()];
        set.artifact.merged = Some(target);
        Ok(())
    }
}

/// Hidden name the merged file is built under, extension kept for ffmpeg
pub fn staging_path(target: &Path) -> PathBuf {
    let stem = target.file_stem().and_then(|s| s.to_str()).unwrap_or("merged");
    let ext = target.extension().and_then(|s| s.to_str()).unwrap_or("mp3");
    target.with_file_name(format!(".{}.merging.{}", stem, ext))
}

/// Packs web-reader content files into one EPUB
///
/// Only items with an archive path take part; a loan delivered as a finished
/// epub or pdf passes through untouched. The loose files are removed once
/// the archive sits at its final name.
#[derive(Debug, Default)]
pub struct PackageStage;

impl PackageStage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Stage for PackageStage {
    fn kind(&self) -> StageKind {
        StageKind::Package
    }

    async fn apply(&self, set: &mut WorkingSet) -> Result<()> {
        let entries: Vec<EpubEntry> = set
            .manifest
            .archive_items()
            .filter_map(|item| {
                let archive_path = item.archive_path.as_deref()?;
                Some(EpubEntry::new(
                    set.folder.join(&item.file_name),
                    archive_path,
                    item.content_type.as_deref(),
                ))
            })
            .collect();
        if entries.is_empty() {
            return Ok(());
        }

        let target = set.merged_target.with_extension("epub");
        let staging = staging_path(&target);
        let sources: Vec<PathBuf> = entries.iter().map(|e| e.source.clone()).collect();
        let book = EpubBook {
            metadata: &set.manifest.metadata,
            entries,
            toc: &set.manifest.toc,
            cover: set.artifact.cover.clone(),
        };

        let packed = match write_epub(&staging, &book).await {
            Ok(()) => replace_with(&staging, &target).await,
            Err(e) => Err(e),
        };
        if let Err(e) = packed {
            if let Err(cleanup) = FileManager::safe_delete(&staging).await {
                warn!(error = %cleanup, "could not remove unfinished EPUB");
            }
            set.artifact
                .warn(format!("could not package EPUB, keeping files: {}", e));
            return Ok(());
        }

        info!(path = %target.display(), files = sources.len(), "packaged EPUB");
        for source in &sources {
            if let Err(e) = FileManager::safe_delete(source).await {
                set.artifact
                    .warn(format!("could not delete {}: {}", source.display(), e));
            }
        }
        set.artifact.files = vec![target.clone()];
        set.artifact.merged = Some(target);
        Ok(())
    }
}

/// Writes the OPF package document and the debug dump
pub struct SidecarStage {
    opf: bool,
    debug_json: bool,
}

impl SidecarStage {
    pub fn new(opf: bool, debug_json: bool) -> Self {
        Self { opf, debug_json }
    }
}

#[derive(Serialize)]
struct DebugDump<'a> {
    manifest: &'a ResourceManifest,
    artifact: &'a MediaArtifact,
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}

#[async_trait]
impl Stage for SidecarStage {
    fn kind(&self) -> StageKind {
        StageKind::ExportSidecar
    }

    async fn apply(&self, set: &mut WorkingSet) -> Result<()> {
        if self.opf {
            let path = set
                .folder
                .join(format!("{}.opf", slugify(&set.manifest.metadata.title)));
            let files: Vec<OpfFile> = set
                .artifact
                .files
                .iter()
                .filter_map(|p| file_name(p))
                .map(OpfFile::new)
                .collect();
            let cover = set.artifact.cover.as_deref().and_then(file_name);

            match write_opf(&path, &set.manifest.metadata, cover.as_deref(), &files).await {
                Ok(()) => set.artifact.sidecars.push(path),
                Err(e) => set.artifact.warn(format!("could not write OPF: {}", e)),
            }
        }

        if self.debug_json {
            let path = set.folder.join(DEBUG_FILE_NAME);
            let dump = DebugDump {
                manifest: &set.manifest,
                artifact: &set.artifact,
            };
            match write_debug_json(&path, &dump).await {
                Ok(()) => set.artifact.sidecars.push(path),
                Err(e) => set.artifact.warn(format!("could not write {}: {}", DEBUG_FILE_NAME, e)),
            }
        }
        Ok(())
    }
}

/// Runs the enabled stages in their fixed order
pub struct MediaAssembler {
    stages: Vec<Box<dyn Stage>>,
}

impl MediaAssembler {
    pub fn new(options: &AssemblyOptions, tools: &MediaTools) -> Self {
        let mut stages: Vec<Box<dyn Stage>> = Vec::new();
        if options.tag {
            stages.push(Box::new(TagStage::new(
                tools.tags.clone(),
                options.overwrite_tags,
                options.tag_delimiter.clone(),
            )));
        }
        if options.merge {
            stages.push(Box::new(MergeStage::new(tools.clone(), options)));
        }
        if options.chapters {
            stages.push(Box::new(ChapterStage::new(
                tools.tags.clone(),
                tools.probe.clone(),
                !options.merge,
            )));
        }
        if options.export_opf || options.export_debug_json {
            stages.push(Box::new(SidecarStage::new(options.export_opf, options.export_debug_json)));
        }
        Self::with_stages(stages)
    }

    /// Assembler over explicit stages, sorted into execution order
    pub fn with_stages(mut stages: Vec<Box<dyn Stage>>) -> Self {
        stages.sort_by_key(|s| s.kind());
        Self { stages }
    }

    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    pub async fn assemble(&self, mut set: WorkingSet) -> Result<MediaArtifact> {
        for stage in &self.stages {
            debug!(stage = ?stage.kind(), "running assembly stage");
            stage.apply(&mut set).await?;
        }
        Ok(set.artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stages_run_in_fixed_order() {
        let tools = MediaTools::ffmpeg(Duration::from_secs(1));
        let options = AssemblyOptions {
            merge: true,
            export_opf: true,
            ..Default::default()
        };
        let assembler = MediaAssembler::new(&options, &tools);
        assert_eq!(
            assembler.stage_kinds(),
            vec![StageKind::Tag, StageKind::Chapter, StageKind::Merge, StageKind::ExportSidecar]
        );
    }

    #[test]
    fn test_staging_path_is_hidden_and_keeps_extension() {
        assert_eq!(
            staging_path(Path::new("/out/Book/Sample Book.m4b")),
            PathBuf::from("/out/Book/.Sample Book.merging.m4b")
        );
    }

    #[test]
    fn test_disabled_stages_are_skipped() {
        let tools = MediaTools::ffmpeg(Duration::from_secs(1));
        let options = AssemblyOptions {
            tag: false,
            chapters: false,
            ..Default::default()
        };
        assert!(MediaAssembler::new(&options, &tools).stage_kinds().is_empty());
    }
}
