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

//! Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use loanfetch::audio::metadata::{Chapter, TagSet, TagWriter};
use loanfetch::audio::{DurationProbe, MediaMerger, MediaTools};
use loanfetch::download::RetryPolicy;
use loanfetch::error::{LoanError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const LICENSE_XML: &str = r#"<License xmlns="http://license.overdrive.com/2008/03/License.xsd"><SignedInfo><ContentID>X</ContentID><ClientID>TEST-CLIENT</ClientID></SignedInfo><Signature>sig</Signature></License>"#;

/// Serve `app` on an ephemeral local port, returning its base URL
pub async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Body of audio part `number`
pub fn part_body(number: u32) -> Vec<u8> {
    format!("ID3-part-{:02}-", number).repeat(64).into_bytes()
}

/// `.odm` document for "Sample Book" with `parts` parts of 30 minutes each
pub fn odm_xml(base: &str, parts: u32, cover: bool) -> String {
    let part_list: String = (1..=parts)
        .map(|n| {
            format!(
                r#"<Part number="{n}" filename="Part{n:02}.mp3" filesize="{}" duration="30:00"/>"#,
                part_body(n).len()
            )
        })
        .collect();
    let cover_url = if cover {
        format!("<CoverUrl>{}/cover.jpg</CoverUrl>", base)
    } else {
        String::new()
    };
    format!(
        r#"<?xml version="1.0" encoding="utf-8" ?>
<OverDriveMedia id="0AB1C2D3-0000-4000-8000-000000000042" ODMVersion="1.2">
<License><AcquisitionUrl>{base}/license</AcquisitionUrl></License>
<![CDATA[<Metadata><Title>Sample Book</Title><Publisher>Pub & Co</Publisher><Creators><Creator role="Author">Author A</Creator><Creator role="Author">Author B</Creator><Creator role="Narrator">Reader R</Creator></Creators>{cover_url}</Metadata>]]>
<Formats><Format name="MP3 Audiobook"><Protocols><Protocol method="download" baseurl="{base}/dl"/></Protocols>
<Parts count="{parts}">{part_list}</Parts></Format></Formats>
<EarlyReturnURL>{base}/return</EarlyReturnURL>
</OverDriveMedia>"#
    )
}

/// Retry policy with millisecond backoff
pub fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_secs(5)).with_backoff_base(Duration::from_millis(10))
}

/// What [`FakeTags`] stores inside a media file
#[derive(Debug, Default, Serialize, Deserialize)]
struct EmbeddedTags {
    tags: TagSet,
    chapters: Vec<Chapter>,
    cover: Option<String>,
}

const TAG_TRAILER: &[u8] = b"\n#fake-tags#";

fn split_trailer(bytes: &[u8]) -> (&[u8], EmbeddedTags) {
    let found = bytes
        .windows(TAG_TRAILER.len())
        .rposition(|w| w == TAG_TRAILER);
    match found {
        Some(at) => {
            let embedded = serde_json::from_slice(&bytes[at + TAG_TRAILER.len()..]).unwrap_or_default();
            (&bytes[..at], embedded)
        }
        None => (bytes, EmbeddedTags::default()),
    }
}

/// Audio bytes of `file` without the embedded tags
pub fn body_of(file: &Path) -> Vec<u8> {
    let bytes = std::fs::read(file).unwrap();
    split_trailer(&bytes).0.to_vec()
}

/// Tag writer standing in for ffmpeg
///
/// Like a real tagger it rewrites the file: tags, chapters and the cover
/// name are appended as a JSON trailer, so they follow the file through a
/// rename and change its size and checksum.
#[derive(Default)]
pub struct FakeTags {
    pub writes: Mutex<u32>,
}

impl FakeTags {
    fn load(file: &Path) -> EmbeddedTags {
        std::fs::read(file).map(|b| split_trailer(&b).1).unwrap_or_default()
    }

    fn store(file: &Path, update: impl FnOnce(&mut EmbeddedTags)) -> Result<()> {
        let bytes = std::fs::read(file)?;
        let (body, mut embedded) = split_trailer(&bytes);
        update(&mut embedded);
        let mut out = body.to_vec();
        out.extend_from_slice(TAG_TRAILER);
        out.extend(serde_json::to_vec(&embedded)?);
        std::fs::write(file, out)?;
        Ok(())
    }

    pub fn preset(&self, file: &Path, tags: TagSet) {
        Self::store(file, |e| e.tags = tags).unwrap();
    }

    pub fn tags_of(&self, file: &Path) -> TagSet {
        Self::load(file).tags
    }

    pub fn chapters_of(&self, file: &Path) -> Vec<Chapter> {
        Self::load(file).chapters
    }

    /// File name of the embedded cover
    pub fn cover_of(&self, file: &Path) -> Option<String> {
        Self::load(file).cover
    }

    pub fn write_count(&self) -> u32 {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl TagWriter for FakeTags {
    async fn read_tags(&self, file: &Path) -> Result<TagSet> {
        if !file.exists() {
            return Err(LoanError::FileNotFound(file.display().to_string()));
        }
        Ok(self.tags_of(file))
    }

    async fn write_tags(&self, file: &Path, tags: &TagSet, cover: Option<&Path>) -> Result<()> {
        *self.writes.lock().unwrap() += 1;
        let cover = cover.and_then(|c| c.file_name()).map(|n| n.to_string_lossy().into_owned());
        Self::store(file, |e| {
            e.tags = tags.clone();
            if cover.is_some() {
                e.cover = cover;
            }
        })
    }

    async fn write_chapters(&self, file: &Path, chapters: &[Chapter]) -> Result<()> {
        Self::store(file, |e| e.chapters = chapters.to_vec())
    }
}

/// Probe that never knows, so declared durations are used
pub struct UnknownDuration;

#[async_trait]
impl DurationProbe for UnknownDuration {
    async fn duration_ms(&self, path: &Path) -> Result<u64> {
        Err(LoanError::InvalidAudioFile(path.display().to_string()))
    }
}

/// Merger that concatenates audio bytes; per-part tags are not carried over
pub struct ByteMerger;

#[async_trait]
impl MediaMerger for ByteMerger {
    async fn concat(&self, parts: &[PathBuf], output: &Path) -> Result<()> {
        let mut joined = Vec::new();
        for part in parts {
            joined.extend(body_of(part));
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }

    async fn to_m4b(&self, input: &Path, output: &Path, _cover: Option<&Path>, _bitrate: &str) -> Result<()> {
        tokio::fs::copy(input, output).await?;
        Ok(())
    }
}

pub fn fake_tools() -> (MediaTools, Arc<FakeTags>) {
    let tags = Arc::new(FakeTags::default());
    let tools = MediaTools {
        tags: tags.clone(),
        probe: Arc::new(UnknownDuration),
        merger: Arc::new(ByteMerger),
    };
    (tools, tags)
}
