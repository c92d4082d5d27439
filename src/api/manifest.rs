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

//! Resource manifests
//!
//! A manifest is the resolved list of everything that has to be fetched for
//! one loan. Both acquisition paths (legacy license file and direct session
//! API) produce the same shape, so the downloader and the assembler never
//! know which path a loan took.

use crate::api::loans::LoanFormat;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Descriptive metadata shared by both acquisition paths
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Title id on the lending service (the `.odm` media id on the legacy path)
    pub id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub authors: Vec<String>,
    pub narrators: Vec<String>,
    pub publisher: Option<String>,
    pub description: Option<String>,
    pub series: Option<String>,
    pub reading_order: Option<String>,
    pub edition: Option<String>,
    /// ISO language code
    pub language: Option<String>,
    pub subjects: Vec<String>,
    pub published: Option<String>,
    pub cover_url: Option<String>,
    pub format: LoanFormat,
}

/// What a manifest item is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemKind {
    /// Audio part in playback order (1-based)
    AudioPart { number: u32 },
    Cover,
    /// Ebook / magazine content file
    Content,
    /// DRM wrapper (e.g. `.acsm`) handed to the user's reader software
    DrmWrapper,
}

/// Chapter marker relative to the start of its own part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterMarker {
    pub title: String,
    pub offset_ms: u64,
}

/// One fetchable resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestItem {
    #[serde(flatten)]
    pub kind: ItemKind,
    pub url: String,
    /// Request headers. Never serialized: they carry license material.
    #[serde(skip)]
    pub headers: Vec<(String, String)>,
    /// Local file name inside the book folder
    pub file_name: String,
    pub expected_size: Option<u64>,
    /// Hex SHA-256
    pub expected_sha256: Option<String>,
    pub content_type: Option<String>,
    /// Declared playback duration
    pub duration_ms: Option<u64>,
    pub markers: Vec<ChapterMarker>,
    /// Path inside a packaged EPUB; set for web-reader content files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_path: Option<String>,
}

impl ManifestItem {
    pub fn new<U: Into<String>, F: Into<String>>(kind: ItemKind, url: U, file_name: F) -> Self {
        Self {
            kind,
            url: url.into(),
            headers: Vec::new(),
            file_name: file_name.into(),
            expected_size: None,
            expected_sha256: None,
            content_type: None,
            duration_ms: None,
            markers: Vec::new(),
            archive_path: None,
        }
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.expected_size = size;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: Option<u64>) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_markers(mut self, markers: Vec<ChapterMarker>) -> Self {
        self.markers = markers;
        self
    }

    pub fn with_archive_path<P: Into<String>>(mut self, path: P) -> Self {
        self.archive_path = Some(path.into());
        self
    }

    /// Items whose failure must not fail the loan
    pub fn is_skippable(&self) -> bool {
        matches!(self.kind, ItemKind::Cover)
    }

    pub fn part_number(&self) -> Option<u32> {
        match self.kind {
            ItemKind::AudioPart { number } => Some(number),
            _ => None,
        }
    }
}

/// Table of contents entry of web-reader content, pointing into an archive path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocLink {
    pub title: String,
    /// Archive path, optionally with a `#fragment`
    pub target: String,
}

/// Ordered list of resources for one loan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceManifest {
    pub loan_id: String,
    pub metadata: BookMetadata,
    pub items: Vec<ManifestItem>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub toc: Vec<TocLink>,
}

impl ResourceManifest {
    pub fn new(loan_id: String, metadata: BookMetadata) -> Self {
        Self {
            loan_id,
            metadata,
            items: Vec::new(),
            toc: Vec::new(),
        }
    }

    /// Nothing required to fetch. A cover alone does not make a loan worth processing.
    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|item| item.is_skippable())
    }

    /// Audio parts in playback order
    pub fn audio_parts(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items.iter().filter(|item| item.part_number().is_some())
    }

    pub fn cover(&self) -> Option<&ManifestItem> {
        self.items.iter().find(|item| item.kind == ItemKind::Cover)
    }

    /// Content files that belong inside a packaged EPUB
    pub fn archive_items(&self) -> impl Iterator<Item = &ManifestItem> {
        self.items
            .iter()
            .filter(|item| item.kind == ItemKind::Content && item.archive_path.is_some())
    }
}

/// Which acquisition path resolves a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveMode {
    /// Fulfill a license file and run the legacy handshake
    #[default]
    ViaLicenseFile,
    /// Read the open-loan manifest straight from the session API
    Direct,
}

/// Result of returning a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnOutcome {
    Returned,
    /// The service already considered it returned; treated as success
    AlreadyReturned,
}

/// Capability shared by both acquisition paths
///
/// The orchestrator drives loans only through this trait, so a loan can come
/// from a linked session or from a bare `.odm` file.
#[async_trait]
pub trait ManifestResolver: Send + Sync {
    /// Loan identifier used in reports
    fn loan_id(&self) -> String;

    /// Human readable label (usually the title)
    fn label(&self) -> String;

    /// Resolve the loan into a manifest. `work_dir` receives intermediate
    /// files such as fulfilled `.odm` and `.license` documents.
    async fn resolve(&self, work_dir: &Path) -> Result<ResourceManifest>;

    /// Return the loan to the library
    async fn return_loan(&self) -> Result<ReturnOutcome>;
}
