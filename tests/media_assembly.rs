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

mod common;

use async_trait::async_trait;
use common::{body_of, fake_tools, ByteMerger, FakeTags};
use loanfetch::api::legacy::MEDIA_MARKERS_TAG;
use loanfetch::api::manifest::{BookMetadata, ItemKind, ManifestItem, ResourceManifest};
use loanfetch::audio::metadata::{Chapter, TagSet, TagWriter};
use loanfetch::audio::{AssemblyOptions, DurationProbe, MediaAssembler, MediaMerger, MediaTools, WorkingSet};
use loanfetch::error::{LoanError, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn metadata() -> BookMetadata {
    BookMetadata {
        id: "m-1".to_string(),
        title: "Sample Book".to_string(),
        authors: vec!["Author A".to_string(), "Author B".to_string()],
        narrators: vec!["Reader R".to_string()],
        series: Some("Saga".to_string()),
        reading_order: Some("2".to_string()),
        ..Default::default()
    }
}

/// Parts written to `dir` unless already there, each declared 10 minutes long
async fn working_set(dir: &Path, parts: u32) -> WorkingSet {
    let mut manifest = ResourceManifest::new("m-1".to_string(), metadata());
    for n in 1..=parts {
        let name = format!("sample-book-part-{:02}.mp3", n);
        if !dir.join(&name).exists() {
            tokio::fs::write(dir.join(&name), format!("part {}", n)).await.unwrap();
        }
        manifest.items.push(
            ManifestItem::new(ItemKind::AudioPart { number: n }, "http://unused", name).with_duration_ms(Some(600_000)),
        );
    }
    WorkingSet::new(manifest, dir.to_path_buf(), dir.join("Sample Book.mp3"), None)
}

fn part_path(dir: &Path, n: u32) -> PathBuf {
    dir.join(format!("sample-book-part-{:02}.mp3", n))
}

fn tags(pairs: &[(&str, &str)]) -> TagSet {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn tag_only(overwrite: bool) -> AssemblyOptions {
    AssemblyOptions {
        chapters: false,
        overwrite_tags: overwrite,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_tagging_keeps_existing_values() {
    let dir = TempDir::new().unwrap();
    let set = working_set(dir.path(), 2).await;
    let (tools, fake) = fake_tools();
    fake.preset(
        &part_path(dir.path(), 1),
        tags(&[("title", "Custom Title"), ("encoder", "LAME"), ("artist", "")]),
    );

    let artifact = MediaAssembler::new(&tag_only(false), &tools).assemble(set).await.unwrap();
    assert!(artifact.warnings.is_empty());

    let first = fake.tags_of(&part_path(dir.path(), 1));
    assert_eq!(first["title"], "Custom Title");
    assert_eq!(first["encoder"], "LAME");
    // empty values count as missing
    assert_eq!(first["artist"], "Author A;Author B");
    assert_eq!(first["track"], "01/02");
    assert_eq!(first["series"], "Saga #2");

    let second = fake.tags_of(&part_path(dir.path(), 2));
    assert_eq!(second["title"], "Sample Book");
    assert_eq!(second["performer"], "Reader R");
}

#[tokio::test]
async fn test_overwrite_replaces_only_managed_fields() {
    let dir = TempDir::new().unwrap();
    let set = working_set(dir.path(), 1).await;
    let (tools, fake) = fake_tools();
    fake.preset(&part_path(dir.path(), 1), tags(&[("title", "Custom Title"), ("encoder", "LAME")]));

    MediaAssembler::new(&tag_only(true), &tools).assemble(set).await.unwrap();

    let first = fake.tags_of(&part_path(dir.path(), 1));
    assert_eq!(first["title"], "Sample Book");
    assert_eq!(first["encoder"], "LAME");
}

#[tokio::test]
async fn test_retagging_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let (tools, fake) = fake_tools();

    let assembler = MediaAssembler::new(&tag_only(false), &tools);
    assembler.assemble(working_set(dir.path(), 2).await).await.unwrap();
    let writes = fake.write_count();
    assembler.assemble(working_set(dir.path(), 2).await).await.unwrap();
    assert_eq!(fake.write_count(), writes);
}

struct FixedProbe(HashMap<PathBuf, u64>);

#[async_trait]
impl DurationProbe for FixedProbe {
    async fn duration_ms(&self, path: &Path) -> Result<u64> {
        self.0
            .get(path)
            .copied()
            .ok_or_else(|| LoanError::InvalidAudioFile(path.display().to_string()))
    }
}

#[tokio::test]
async fn test_chapters_cover_every_part_in_order() {
    let dir = TempDir::new().unwrap();
    let parts = 5;
    let set = working_set(dir.path(), parts).await;
    let (mut tools, fake) = fake_tools();
    // probed durations win; part 5 falls back to its declared length
    let probed: HashMap<PathBuf, u64> = (1..parts)
        .map(|n| (part_path(dir.path(), n), 1_000 * n as u64 + 1))
        .collect();
    tools.probe = Arc::new(FixedProbe(probed));

    let options = AssemblyOptions {
        tag: false,
        ..Default::default()
    };
    let artifact = MediaAssembler::new(&options, &tools).assemble(set).await.unwrap();

    let chapters = &artifact.chapters;
    assert_eq!(chapters.len(), parts as usize);
    assert_eq!(chapters[0].start_ms, 0);
    for pair in chapters.windows(2) {
        assert!(pair[1].start_ms > pair[0].start_ms);
        assert_eq!(pair[0].end_ms, pair[1].start_ms);
    }
    assert_eq!(chapters.last().unwrap().end_ms, 1_001 + 2_001 + 3_001 + 4_001 + 600_000);

    // without merging every part carries its own chapter
    for n in 1..=parts {
        assert_eq!(fake.chapters_of(&part_path(dir.path(), n)).len(), 1);
    }
}

#[tokio::test]
async fn test_embedded_markers_become_chapters() {
    let dir = TempDir::new().unwrap();
    let set = working_set(dir.path(), 2).await;
    let (tools, fake) = fake_tools();
    let markers = "<Markers><Marker><Name>Prologue</Name><Time>0:00.000</Time></Marker>\
                   <Marker><Name>Chapter 1</Name><Time>5:00.000</Time></Marker></Markers>";
    fake.preset(&part_path(dir.path(), 1), tags(&[(MEDIA_MARKERS_TAG, markers)]));
    fake.preset(
        &part_path(dir.path(), 2),
        tags(&[(
            MEDIA_MARKERS_TAG,
            "<Markers><Marker><Name>Chapter 1</Name><Time>0:00.000</Time></Marker>\
             <Marker><Name>Chapter 2</Name><Time>2:00.000</Time></Marker></Markers>",
        )]),
    );

    let artifact = MediaAssembler::new(&AssemblyOptions::default(), &tools)
        .assemble(set)
        .await
        .unwrap();

    let titles: Vec<&str> = artifact.chapters.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(titles, vec!["Prologue", "Chapter 1", "Chapter 2"]);
    let starts: Vec<u64> = artifact.chapters.iter().map(|c| c.start_ms).collect();
    assert_eq!(starts, vec![0, 300_000, 720_000]);
}

struct BrokenMerger;

#[async_trait]
impl MediaMerger for BrokenMerger {
    async fn concat(&self, _parts: &[PathBuf], output: &Path) -> Result<()> {
        tokio::fs::write(output, b"half").await?;
        Err(LoanError::FfmpegError("concat failed".to_string()))
    }

    async fn to_m4b(&self, _input: &Path, _output: &Path, _cover: Option<&Path>, _bitrate: &str) -> Result<()> {
        Err(LoanError::FfmpegNotFound)
    }
}

#[tokio::test]
async fn test_failed_merge_keeps_parts() {
    let dir = TempDir::new().unwrap();
    let set = working_set(dir.path(), 3).await;
    let fake = Arc::new(FakeTags::default());
    let tools = MediaTools {
        tags: fake.clone(),
        probe: Arc::new(common::UnknownDuration),
        merger: Arc::new(BrokenMerger),
    };
    let options = AssemblyOptions {
        merge: true,
        delete_parts_after_merge: true,
        ..Default::default()
    };

    let artifact = MediaAssembler::new(&options, &tools).assemble(set).await.unwrap();
    assert!(artifact.merged.is_none());
    assert_eq!(artifact.files.len(), 3);
    assert!(artifact.files.iter().all(|f| f.exists()));
    assert!(!dir.path().join("Sample Book.mp3").exists());
    assert!(artifact.warnings.iter().any(|w| w.contains("merge failed")));
}

/// Tags like [`FakeTags`] but cannot embed chapters
struct NoChapters(Arc<FakeTags>);

#[async_trait]
impl TagWriter for NoChapters {
    async fn read_tags(&self, file: &Path) -> Result<TagSet> {
        self.0.read_tags(file).await
    }

    async fn write_tags(&self, file: &Path, tags: &TagSet, cover: Option<&Path>) -> Result<()> {
        self.0.write_tags(file, tags, cover).await
    }

    async fn write_chapters(&self, _file: &Path, _chapters: &[Chapter]) -> Result<()> {
        Err(LoanError::FfmpegError("chapters rejected".to_string()))
    }
}

#[tokio::test]
async fn test_unfinished_merge_never_reaches_final_name() {
    let dir = TempDir::new().unwrap();
    let set = working_set(dir.path(), 3).await;
    let tools = MediaTools {
        tags: Arc::new(NoChapters(Arc::new(FakeTags::default()))),
        probe: Arc::new(common::UnknownDuration),
        merger: Arc::new(ByteMerger),
    };
    let options = AssemblyOptions {
        merge: true,
        ..Default::default()
    };

    let artifact = MediaAssembler::new(&options, &tools).assemble(set).await.unwrap();
    assert!(artifact.merged.is_none());
    assert_eq!(artifact.files.len(), 3);
    assert!(!dir.path().join("Sample Book.mp3").exists());
    assert!(!dir.path().join(".Sample Book.merging.mp3").exists());
    assert!(artifact.warnings.iter().any(|w| w.contains("chapters rejected")));
}

/// Concatenates, then leaves the last part undeletable
struct StickyPartMerger;

#[async_trait]
impl MediaMerger for StickyPartMerger {
    async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<()> {
        ByteMerger.concat(parts, output).await?;
        if let Some(last) = parts.last() {
            tokio::fs::remove_file(last).await?;
            tokio::fs::create_dir(last).await?;
        }
        Ok(())
    }

    async fn to_m4b(&self, input: &Path, output: &Path, cover: Option<&Path>, bitrate: &str) -> Result<()> {
        ByteMerger.to_m4b(input, output, cover, bitrate).await
    }
}

#[tokio::test]
async fn test_undeletable_part_after_merge_is_a_warning() {
    let dir = TempDir::new().unwrap();
    let set = working_set(dir.path(), 2).await;
    let (mut tools, fake) = fake_tools();
    tools.merger = Arc::new(StickyPartMerger);
    let options = AssemblyOptions {
        merge: true,
        delete_parts_after_merge: true,
        ..Default::default()
    };

    let artifact = MediaAssembler::new(&options, &tools).assemble(set).await.unwrap();
    let merged = artifact.merged.clone().unwrap();
    assert_eq!(merged, dir.path().join("Sample Book.mp3"));
    assert_eq!(fake.chapters_of(&merged).len(), 2);
    assert_eq!(body_of(&merged), b"part 1part 2".to_vec());
    assert!(!part_path(dir.path(), 1).exists());
    assert!(artifact.warnings.iter().any(|w| w.contains("could not delete")));
}

#[tokio::test]
async fn test_merged_mp3_carries_cover() {
    let dir = TempDir::new().unwrap();
    let cover = dir.path().join("cover.jpg");
    tokio::fs::write(&cover, b"JFIF").await.unwrap();
    let mut set = working_set(dir.path(), 2).await;
    set.artifact.cover = Some(cover);
    let (tools, fake) = fake_tools();
    let options = AssemblyOptions {
        merge: true,
        ..Default::default()
    };

    let artifact = MediaAssembler::new(&options, &tools).assemble(set).await.unwrap();
    let merged = artifact.merged.unwrap();
    assert_eq!(fake.cover_of(&merged).as_deref(), Some("cover.jpg"));
    assert_eq!(fake.cover_of(&part_path(dir.path(), 1)).as_deref(), Some("cover.jpg"));
}
