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

//! Loan model
//!
//! Loans arrive as part of the `/chip/sync` payload. The raw JSON is parsed
//! into [`RawLoan`] (lenient, every field optional) and converted into the
//! typed [`Loan`] the rest of the crate works with.
//!
//! # Format identifiers
//! | id | meaning |
//! |----|---------|
//! | `audiobook-mp3` | legacy `.odm` audiobook |
//! | `audiobook-overdrive` | streamed audiobook (direct) |
//! | `ebook-epub-adobe`, `ebook-pdf-adobe` | DRM protected ebook |
//! | `ebook-epub-open`, `ebook-pdf-open` | open ebook file |
//! | `ebook-overdrive`, `magazine-overdrive` | web reader content (direct) |

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const FORMAT_AUDIOBOOK_MP3: &str = "audiobook-mp3";
pub const FORMAT_AUDIOBOOK_OVERDRIVE: &str = "audiobook-overdrive";
pub const FORMAT_EBOOK_EPUB_ADOBE: &str = "ebook-epub-adobe";
pub const FORMAT_EBOOK_PDF_ADOBE: &str = "ebook-pdf-adobe";
pub const FORMAT_EBOOK_EPUB_OPEN: &str = "ebook-epub-open";
pub const FORMAT_EBOOK_PDF_OPEN: &str = "ebook-pdf-open";
pub const FORMAT_EBOOK_OVERDRIVE: &str = "ebook-overdrive";
pub const FORMAT_MAGAZINE_OVERDRIVE: &str = "magazine-overdrive";

/// Media type of a loan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanFormat {
    #[default]
    Audiobook,
    Ebook,
    Magazine,
}

impl LoanFormat {
    fn from_type_id(type_id: &str) -> Self {
        match type_id {
            "ebook" => Self::Ebook,
            "magazine" => Self::Magazine,
            _ => Self::Audiobook,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audiobook => "audiobook",
            Self::Ebook => "ebook",
            Self::Magazine => "magazine",
        }
    }
}

/// Whether the offered files carry a DRM wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrmKind {
    Protected,
    #[default]
    Open,
}

/// A loan as listed by the session API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Loan {
    pub id: String,
    pub card_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub authors: Vec<String>,
    pub series: Option<String>,
    pub reading_order: Option<String>,
    pub edition: Option<String>,
    pub format: LoanFormat,
    pub drm: DrmKind,
    pub format_ids: Vec<String>,
    pub checkout_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub cover_url: Option<String>,
    pub publisher: Option<String>,
    pub subjects: Vec<String>,
    pub published: Option<String>,
}

impl Loan {
    pub fn has_format(&self, format_id: &str) -> bool {
        self.format_ids.iter().any(|f| f == format_id)
    }

    /// First of `candidates` the loan offers
    pub fn first_format<'a>(&self, candidates: &[&'a str]) -> Option<&'a str> {
        candidates.iter().copied().find(|c| self.has_format(c))
    }

    /// Short label for logs and reports
    pub fn label(&self) -> String {
        match self.authors.first() {
            Some(author) => format!("{} by {}", self.title, author),
            None => self.title.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawLoan {
    pub id: String,
    pub card_id: String,
    pub title: String,
    pub subtitle: Option<String>,
    pub first_creator_name: Option<String>,
    #[serde(rename = "type")]
    pub media_type: Option<RawType>,
    pub formats: Vec<RawType>,
    pub checkout_date: Option<DateTime<Utc>>,
    pub expire_date: Option<DateTime<Utc>>,
    pub series: Option<String>,
    pub detailed_series: Option<RawSeries>,
    pub edition: Option<String>,
    pub covers: HashMap<String, RawCover>,
    pub publisher_account: Option<RawNamed>,
    pub subjects: Vec<RawNamed>,
    pub publish_date: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawType {
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawSeries {
    pub series_name: Option<String>,
    pub reading_order: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCover {
    pub href: String,
    pub width: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawNamed {
    pub name: Option<String>,
}

impl From<RawLoan> for Loan {
    fn from(raw: RawLoan) -> Self {
        let format_ids: Vec<String> = raw.formats.into_iter().map(|f| f.id).collect();
        let format = LoanFormat::from_type_id(
            raw.media_type.as_ref().map(|t| t.id.as_str()).unwrap_or("audiobook"),
        );
        let drm = classify_drm(format, &format_ids);

        let cover_url = raw
            .covers
            .into_values()
            .filter(|c| !c.href.is_empty())
            .max_by_key(|c| c.width)
            .map(|c| c.href);

        let series = raw
            .series
            .filter(|s| !s.is_empty())
            .or_else(|| raw.detailed_series.as_ref().and_then(|d| d.series_name.clone()));
        let reading_order = raw.detailed_series.and_then(|d| d.reading_order);

        Loan {
            id: raw.id,
            card_id: raw.card_id,
            title: raw.title,
            subtitle: raw.subtitle.filter(|s| !s.is_empty()),
            authors: raw.first_creator_name.into_iter().filter(|a| !a.is_empty()).collect(),
            series,
            reading_order,
            edition: raw.edition.filter(|e| !e.is_empty()),
            format,
            drm,
            format_ids,
            checkout_at: raw.checkout_date,
            expires_at: raw.expire_date,
            cover_url,
            publisher: raw.publisher_account.and_then(|p| p.name).filter(|p| !p.is_empty()),
            subjects: raw.subjects.into_iter().filter_map(|s| s.name).collect(),
            published: raw.publish_date,
        }
    }
}

/// Protected unless an open format exists for the loan's media type
fn classify_drm(format: LoanFormat, format_ids: &[String]) -> DrmKind {
    let has = |id: &str| format_ids.iter().any(|f| f == id);
    let open = match format {
        LoanFormat::Audiobook => has(FORMAT_AUDIOBOOK_OVERDRIVE) || has(FORMAT_AUDIOBOOK_MP3),
        LoanFormat::Ebook => {
            has(FORMAT_EBOOK_EPUB_OPEN) || has(FORMAT_EBOOK_PDF_OPEN) || has(FORMAT_EBOOK_OVERDRIVE)
        }
        LoanFormat::Magazine => has(FORMAT_MAGAZINE_OVERDRIVE),
    };
    if open {
        DrmKind::Open
    } else {
        DrmKind::Protected
    }
}

/// Which media types a listing includes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanFilter {
    pub audiobooks: bool,
    pub ebooks: bool,
    pub magazines: bool,
}

impl Default for LoanFilter {
    fn default() -> Self {
        Self {
            audiobooks: true,
            ebooks: false,
            magazines: false,
        }
    }
}

impl LoanFilter {
    pub fn all() -> Self {
        Self {
            audiobooks: true,
            ebooks: true,
            magazines: true,
        }
    }

    pub fn matches(&self, loan: &Loan) -> bool {
        match loan.format {
            LoanFormat::Audiobook => self.audiobooks,
            LoanFormat::Ebook => self.ebooks,
            LoanFormat::Magazine => self.magazines,
        }
    }
}

/// Filter and order loans by checkout time, oldest first
///
/// Loans without a checkout date sort first; ties keep service order. The
/// result's 1-based positions are the indices used for selection.
pub fn filter_and_sort(loans: Vec<Loan>, filter: &LoanFilter) -> Vec<Loan> {
    let mut selected: Vec<Loan> = loans.into_iter().filter(|l| filter.matches(l)).collect();
    selected.sort_by_key(|l| l.checkout_at);
    selected
}
