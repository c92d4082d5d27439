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

//! Direct ("openbook") loan resolution
//!
//! Opening a loan yields a web base URL and an openbook document. The
//! openbook `spine` lists the files in reading/playback order; `nav.toc`
//! holds chapter entries whose paths point into spine files, e.g.
//! `{AAAAAAAA-BBBB-CCCC-9999-ABCDEF123456}Fmt425-Part03.mp3#3000` for a
//! chapter starting 3000 seconds into part 3.

use crate::api::loans::Loan;
use crate::api::manifest::{BookMetadata, ChapterMarker, ItemKind, ManifestItem, ResourceManifest, TocLink};
use crate::error::{LoanError, Result};
use crate::file::paths::{part_file_name, sanitize_filename};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;
use url::Url;

lazy_static! {
    static ref FILE_PART: Regex =
        Regex::new(r"^(?P<part_name>\{[A-F0-9\-]{36}\}[^#]+)(#(?P<second_stamp>\d+))?$")
            .expect("valid part path regex");
}

/// Body of `GET /open/{type}/card/{card}/title/{title}`
#[derive(Debug, Clone, Deserialize)]
pub struct OpenLoan {
    pub urls: OpenLoanUrls,
    /// Query string that sets the content session cookie
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenLoanUrls {
    pub web: String,
    pub openbook: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Openbook {
    pub title: Option<OpenbookTitle>,
    pub creator: Vec<Creator>,
    pub description: Option<OpenbookDescription>,
    pub language: Option<String>,
    pub nav: Nav,
    pub spine: Vec<SpineEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenbookTitle {
    pub main: Option<String>,
    pub subtitle: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Creator {
    pub name: String,
    pub role: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenbookDescription {
    pub full: Option<String>,
    pub short: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Nav {
    pub toc: Vec<TocEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TocEntry {
    pub title: String,
    pub path: String,
    pub contents: Vec<TocEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SpineEntry {
    pub path: String,
    #[serde(rename = "-odread-original-path")]
    pub original_path: String,
    #[serde(rename = "audio-duration")]
    pub audio_duration: Option<f64>,
    #[serde(rename = "-odread-file-bytes")]
    pub file_bytes: Option<u64>,
    #[serde(rename = "-odread-spine-position")]
    pub spine_position: Option<u32>,
    #[serde(rename = "media-type")]
    pub media_type: Option<String>,
}

/// One audio part of a direct loan
#[derive(Debug, Clone, PartialEq)]
pub struct OpenbookPart {
    pub original_path: String,
    pub url: String,
    pub duration_ms: Option<u64>,
    pub file_bytes: Option<u64>,
    pub markers: Vec<ChapterMarker>,
}

impl Openbook {
    /// Authors by role preference: author, then editor, then every creator
    pub fn authors(&self) -> Vec<String> {
        for role in ["author", "editor"] {
            let names = self.names_with_role(role);
            if !names.is_empty() {
                return names;
            }
        }
        self.creator.iter().map(|c| c.name.clone()).collect()
    }

    pub fn narrators(&self) -> Vec<String> {
        self.names_with_role("narrator")
    }

    fn names_with_role(&self, role: &str) -> Vec<String> {
        self.creator
            .iter()
            .filter(|c| c.role.eq_ignore_ascii_case(role))
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn description(&self) -> Option<String> {
        self.description
            .as_ref()
            .and_then(|d| d.full.clone().filter(|s| !s.is_empty()).or_else(|| d.short.clone()))
            .filter(|s| !s.is_empty())
    }
}

/// Split a toc path into its part name and in-part offset (seconds)
fn parse_part_path(path: &str) -> Result<(String, u64)> {
    let caps = FILE_PART
        .captures(path)
        .ok_or_else(|| LoanError::InvalidApiResponse {
            message: format!("Unexpected toc path format: {}", path),
            response_body: None,
        })?;
    let part_name = caps["part_name"].to_string();
    let seconds = caps
        .name("second_stamp")
        .map(|m| m.as_str().parse::<u64>())
        .transpose()?
        .unwrap_or(0);
    Ok((part_name, seconds))
}

/// Turn the openbook toc and spine into ordered parts with chapter markers
///
/// Consecutive toc entries with the same title inside one part are collapsed;
/// nested `contents` inherit the parent title for that purpose.
pub fn parse_toc(base_url: &str, openbook: &Openbook) -> Result<Vec<OpenbookPart>> {
    let base = Url::parse(base_url).map_err(|e| LoanError::InvalidDownloadUrl(format!("{}: {}", base_url, e)))?;

    let mut markers: HashMap<String, Vec<ChapterMarker>> = HashMap::new();
    for entry in &openbook.nav.toc {
        let paths = std::iter::once(&entry.path).chain(entry.contents.iter().map(|c| &c.path));
        for path in paths {
            let (part_name, seconds) = parse_part_path(path)?;
            let part_markers = markers.entry(part_name).or_default();
            if part_markers.last().map_or(false, |m| m.title == entry.title) {
                continue;
            }
            part_markers.push(ChapterMarker {
                title: entry.title.clone(),
                offset_ms: seconds * 1000,
            });
        }
    }

    let mut spine: Vec<&SpineEntry> = openbook.spine.iter().collect();
    spine.sort_by_key(|s| s.spine_position.unwrap_or(u32::MAX));

    spine
        .into_iter()
        .map(|entry| {
            let url = base
                .join(&entry.path)
                .map_err(|e| LoanError::InvalidDownloadUrl(format!("{}: {}", entry.path, e)))?;
            Ok(OpenbookPart {
                original_path: entry.original_path.clone(),
                url: url.to_string(),
                duration_ms: entry.audio_duration.map(|d| (d * 1000.0).round() as u64),
                file_bytes: entry.file_bytes,
                markers: markers.remove(&entry.original_path).unwrap_or_default(),
            })
        })
        .collect()
}

/// Metadata for a direct loan, from the loan listing and its openbook
pub fn metadata_for(loan: &Loan, openbook: &Openbook) -> BookMetadata {
    let authors = {
        let from_openbook = openbook.authors();
        if from_openbook.is_empty() {
            loan.authors.clone()
        } else {
            from_openbook
        }
    };

    BookMetadata {
        id: loan.id.clone(),
        title: loan.title.clone(),
        subtitle: loan
            .subtitle
            .clone()
            .or_else(|| openbook.title.as_ref().and_then(|t| t.subtitle.clone())),
        authors,
        narrators: openbook.narrators(),
        publisher: loan.publisher.clone(),
        description: openbook.description(),
        series: loan.series.clone(),
        reading_order: loan.reading_order.clone(),
        edition: loan.edition.clone(),
        language: openbook.language.clone(),
        subjects: loan.subjects.clone(),
        published: loan.published.clone(),
        cover_url: loan.cover_url.clone(),
        format: loan.format,
    }
}

/// Audiobook manifest: one part per spine entry
pub fn audiobook_manifest(loan: &Loan, openbook: &Openbook, parts: Vec<OpenbookPart>) -> ResourceManifest {
    let metadata = metadata_for(loan, openbook);
    let mut manifest = ResourceManifest::new(loan.id.clone(), metadata);

    for (index, part) in parts.into_iter().enumerate() {
        let number = index as u32 + 1;
        let item = ManifestItem::new(
            ItemKind::AudioPart { number },
            part.url,
            part_file_name(&loan.title, number, "mp3"),
        )
        .with_size(part.file_bytes)
        .with_duration_ms(part.duration_ms)
        .with_markers(part.markers);
        manifest.items.push(item);
    }

    push_cover(&mut manifest);
    manifest
}

/// Ebook / magazine manifest: one content file per spine entry
///
/// Each item keeps its path below the web base so the files can be packaged
/// with their relative links intact. Top-level toc entries become
/// [`TocLink`]s into those paths.
pub fn content_manifest(loan: &Loan, openbook: &Openbook, base_url: &str) -> Result<ResourceManifest> {
    let base = Url::parse(base_url).map_err(|e| LoanError::InvalidDownloadUrl(format!("{}: {}", base_url, e)))?;
    let metadata = metadata_for(loan, openbook);
    let mut manifest = ResourceManifest::new(loan.id.clone(), metadata);

    for (index, entry) in openbook.spine.iter().enumerate() {
        let url = base
            .join(&entry.path)
            .map_err(|e| LoanError::InvalidDownloadUrl(format!("{}: {}", entry.path, e)))?;
        let archive_path = path_below(&base, &url);
        let leaf = archive_path.rsplit('/').next().filter(|l| !l.is_empty()).unwrap_or("content");
        let mut item = ManifestItem::new(
            ItemKind::Content,
            url.to_string(),
            format!("{:03}-{}", index + 1, sanitize_filename(leaf)),
        )
        .with_size(entry.file_bytes)
        .with_archive_path(archive_path);
        item.content_type = entry.media_type.clone();
        manifest.items.push(item);
    }

    for entry in &openbook.nav.toc {
        match base.join(&entry.path) {
            Ok(url) => {
                let mut target = path_below(&base, &url);
                if let Some(fragment) = url.fragment() {
                    target = format!("{}#{}", target, fragment);
                }
                manifest.toc.push(TocLink {
                    title: entry.title.clone(),
                    target,
                });
            }
            Err(e) => debug!(path = %entry.path, error = %e, "skipping toc entry"),
        }
    }

    push_cover(&mut manifest);
    Ok(manifest)
}

/// Path of `url` relative to `base`, without query or fragment
fn path_below(base: &Url, url: &Url) -> String {
    let path = url.path();
    path.strip_prefix(base.path())
        .unwrap_or(path)
        .trim_start_matches('/')
        .to_string()
}

fn push_cover(manifest: &mut ResourceManifest) {
    if let Some(cover) = manifest.metadata.cover_url.clone() {
        manifest.items.push(ManifestItem::new(ItemKind::Cover, cover, "cover.jpg"));
    }
}
