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

//! Sidecar documents written next to a finished book
//!
//! - OPF 2.0 package document (metadata, cover and audio file manifest)
//! - `debug.json` dump of the resolved manifest and assembly result

use crate::api::manifest::BookMetadata;
use crate::error::Result;
use crate::file::manager::FileManager;
use crate::file::paths::slugify;
use serde::Serialize;
use std::path::Path;

pub const DEBUG_FILE_NAME: &str = "debug.json";

/// A file listed in the OPF manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpfFile {
    pub href: String,
    pub media_type: String,
}

impl OpfFile {
    pub fn new<H: Into<String>>(href: H) -> Self {
        let href = href.into();
        let media_type = media_type_for(&href).to_string();
        Self { href, media_type }
    }
}

/// Media type guessed from the file extension
pub fn media_type_for(href: &str) -> &'static str {
    let path = href.split(['?', '#']).next().unwrap_or(href);
    let ext = path.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4b" | "m4a" => "audio/mp4",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "epub" => "application/epub+zip",
        "pdf" => "application/pdf",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "xhtml" | "html" | "htm" => "application/xhtml+xml",
        "css" => "text/css",
        "ncx" => "application/x-dtbncx+xml",
        "xml" => "application/xml",
        "js" => "application/javascript",
        "otf" => "font/otf",
        "ttf" => "font/ttf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        _ => "application/octet-stream",
    }
}

/// Escape text for XML element content and attribute values
pub fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn element(out: &mut String, name: &str, attrs: &[(&str, &str)], text: &str) {
    out.push_str("    <");
    out.push_str(name);
    for (key, value) in attrs {
        out.push_str(&format!(" {}=\"{}\"", key, escape_xml(value)));
    }
    out.push('>');
    out.push_str(&escape_xml(text));
    out.push_str(&format!("</{}>\n", name));
}

/// Dublin Core `<metadata>` block of an OPF 2.0 package
pub(crate) fn push_metadata(out: &mut String, metadata: &BookMetadata, extra_meta: &[(&str, &str)]) {
    out.push_str(
        "  <metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">\n",
    );

    element(out, "dc:title", &[], &metadata.title);
    if let Some(ref subtitle) = metadata.subtitle {
        element(out, "dc:subtitle", &[], subtitle);
    }
    if let Some(ref language) = metadata.language {
        element(out, "dc:language", &[], language);
    }
    element(
        out,
        "dc:identifier",
        &[("id", "publication-id"), ("opf:scheme", "OverDriveId")],
        &metadata.id,
    );
    for author in &metadata.authors {
        element(out, "dc:creator", &[("opf:role", "aut")], author);
    }
    for narrator in &metadata.narrators {
        element(out, "dc:creator", &[("opf:role", "nrt")], narrator);
    }
    if let Some(ref publisher) = metadata.publisher {
        element(out, "dc:publisher", &[], publisher);
    }
    if let Some(ref description) = metadata.description {
        element(out, "dc:description", &[], description);
    }
    for subject in &metadata.subjects {
        element(out, "dc:subject", &[], subject);
    }
    if let Some(ref published) = metadata.published {
        element(out, "dc:date", &[("opf:event", "publication")], published);
    }
    if let Some(ref series) = metadata.series {
        out.push_str(&format!(
            "    <meta name=\"calibre:series\" content=\"{}\"/>\n",
            escape_xml(series)
        ));
        if let Some(ref order) = metadata.reading_order {
            out.push_str(&format!(
                "    <meta name=\"calibre:series_index\" content=\"{}\"/>\n",
                escape_xml(order)
            ));
        }
    }
    for (name, content) in extra_meta {
        out.push_str(&format!(
            "    <meta name=\"{}\" content=\"{}\"/>\n",
            escape_xml(name),
            escape_xml(content)
        ));
    }
    out.push_str("  </metadata>\n");
}

/// Build an OPF 2.0 package document
pub fn build_opf(metadata: &BookMetadata, cover: Option<&str>, files: &[OpfFile]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version='1.0' encoding='utf-8'?>\n");
    out.push_str(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"2.0\" unique-identifier=\"publication-id\">\n",
    );
    push_metadata(&mut out, metadata, &[]);

    out.push_str("  <manifest>\n");
    if let Some(cover) = cover {
        out.push_str(&format!(
            "    <item id=\"cover\" href=\"{}\" media-type=\"{}\"/>\n",
            escape_xml(cover),
            media_type_for(cover)
        ));
    }
    let ids: Vec<String> = files
        .iter()
        .map(|f| slugify(f.href.rsplit_once('.').map_or(f.href.as_str(), |(stem, _)| stem)))
        .collect();
    for (file, id) in files.iter().zip(&ids) {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n",
            id,
            escape_xml(&file.href),
            file.media_type
        ));
    }
    out.push_str("  </manifest>\n");

    out.push_str("  <spine>\n");
    for id in &ids {
        out.push_str(&format!("    <itemref idref=\"{}\"/>\n", id));
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

pub async fn write_opf(path: &Path, metadata: &BookMetadata, cover: Option<&str>, files: &[OpfFile]) -> Result<()> {
    FileManager::atomic_write(path, build_opf(metadata, cover, files).as_bytes()).await
}

/// Pretty JSON dump of `value`
pub async fn write_debug_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    FileManager::atomic_write(path, &json).await
}
