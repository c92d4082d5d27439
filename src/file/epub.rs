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


//! EPUB packaging of web-reader content
//!
//! Ebooks and magazines read through the web reader arrive as loose spine
//! files. They are packed into an EPUB 2 container:
//!
//! - `mimetype` first and stored, as readers sniff it at a fixed offset
//! - `META-INF/container.xml` pointing at `OEBPS/package.opf`
//! - `OEBPS/package.opf` with manifest, spine and the cover
//! - `OEBPS/toc_<id>.ncx` generated from the toc unless the content ships one
//! - the content files at their paths below `OEBPS/`

use crate::api::manifest::{BookMetadata, TocLink};
use crate::error::{LoanError, Result};
use crate::file::paths::slugify;
use crate::file::sidecar::{escape_xml, media_type_for, push_metadata};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const CONTENT_DIR: &str = "OEBPS";
pub const PACKAGE_FILE: &str = "package.opf";

const MIMETYPE: &str = "application/epub+zip";
const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";
const COVER_ID: &str = "coverimage";

/// One file going into the archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpubEntry {
    pub source: PathBuf,
    /// Path below [`CONTENT_DIR`]
    pub archive_path: String,
    pub media_type: String,
}

impl EpubEntry {
    pub fn new<P: Into<PathBuf>, A: Into<String>>(source: P, archive_path: A, media_type: Option<&str>) -> Self {
        let archive_path = archive_path.into();
        let media_type = media_type
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| media_type_for(&archive_path))
            .to_string();
        Self {
            source: source.into(),
            archive_path,
            media_type,
        }
    }

    fn is_document(&self) -> bool {
        self.media_type.contains("html")
    }

    fn is_ncx(&self) -> bool {
        self.media_type == NCX_MEDIA_TYPE
    }
}

/// Everything that goes into one EPUB
#[derive(Debug, Clone)]
pub struct EpubBook<'a> {
    pub metadata: &'a BookMetadata,
    /// Content in reading order
    pub entries: Vec<EpubEntry>,
    pub toc: &'a [TocLink],
    pub cover: Option<PathBuf>,
}

impl EpubBook<'_> {
    fn ncx_name(&self) -> String {
        format!("toc_{}.ncx", slugify(&self.metadata.id))
    }

    fn cover_name(&self) -> Option<String> {
        let cover = self.cover.as_ref()?;
        let ext = cover.extension().and_then(|e| e.to_str()).unwrap_or("jpg");
        Some(format!("cover_{}.{}", slugify(&self.metadata.id), ext))
    }

    fn ships_ncx(&self) -> bool {
        self.entries.iter().any(EpubEntry::is_ncx)
    }
}

/// Manifest id for an archive path; ids may not start with a digit
pub fn opf_id(path: &str) -> String {
    let slug = slugify(path);
    if slug.starts_with(|c: char| c.is_ascii_digit()) {
        format!("id_{}", slug)
    } else {
        slug
    }
}

/// Unique ids, in entry order
fn entry_ids(entries: &[EpubEntry]) -> Vec<String> {
    let mut seen = HashSet::new();
    entries
        .iter()
        .map(|entry| {
            if entry.is_ncx() && seen.insert("ncx".to_string()) {
                return "ncx".to_string();
            }
            let base = opf_id(&entry.archive_path);
            let mut id = base.clone();
            let mut n = 1;
            while !seen.insert(id.clone()) {
                n += 1;
                id = format!("{}-{}", base, n);
            }
            id
        })
        .collect()
}

pub fn build_container_xml() -> String {
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\n\
         <container xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\" version=\"1.0\">\n  \
         <rootfiles>\n    \
         <rootfile full-path=\"{}/{}\" media-type=\"application/oebps-package+xml\"/>\n  \
         </rootfiles>\n\
         </container>\n",
        CONTENT_DIR, PACKAGE_FILE
    )
}

/// NCX navigation document from the toc
pub fn build_ncx(metadata: &BookMetadata, toc: &[TocLink]) -> String {
    let mut out = String::new();
    out.push_str("<?xml version='1.0' encoding='utf-8'?>\n");
    out.push_str("<ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\" xml:lang=\"en\">\n");
    out.push_str(&format!(
        "  <head>\n    <meta name=\"dtb:uid\" content=\"{}\"/>\n  </head>\n",
        escape_xml(&metadata.id)
    ));
    out.push_str(&format!(
        "  <docTitle>\n    <text>{}</text>\n  </docTitle>\n",
        escape_xml(&metadata.title)
    ));
    if let Some(author) = metadata.authors.first() {
        out.push_str(&format!(
            "  <docAuthor>\n    <text>{}</text>\n  </docAuthor>\n",
            escape_xml(author)
        ));
    }
    out.push_str("  <navMap>\n");
    for (index, link) in toc.iter().enumerate() {
        let n = index + 1;
        out.push_str(&format!(
            "    <navPoint id=\"navPoint{n}\" playOrder=\"{n}\">\n      \
             <navLabel>\n        <text>{}</text>\n      </navLabel>\n      \
             <content src=\"{}\"/>\n    </navPoint>\n",
            escape_xml(&link.title),
            escape_xml(&link.target)
        ));
    }
    out.push_str("  </navMap>\n</ncx>\n");
    out
}

/// OPF package document; hrefs are relative to [`CONTENT_DIR`]
pub fn build_package_opf(book: &EpubBook<'_>) -> String {
    let cover_name = book.cover_name();
    let generated_ncx = if book.ships_ncx() { None } else { Some(book.ncx_name()) };
    let extra: Vec<(&str, &str)> = match cover_name {
        Some(_) => vec![("cover", COVER_ID)],
        None => Vec::new(),
    };

    let mut out = String::new();
    out.push_str("<?xml version='1.0' encoding='utf-8'?>\n");
    out.push_str(
        "<package xmlns=\"http://www.idpf.org/2007/opf\" version=\"2.0\" unique-identifier=\"publication-id\">\n",
    );
    push_metadata(&mut out, book.metadata, &extra);

    out.push_str("  <manifest>\n");
    let ids = entry_ids(&book.entries);
    for (entry, id) in book.entries.iter().zip(&ids) {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n",
            id,
            escape_xml(&entry.archive_path),
            escape_xml(&entry.media_type)
        ));
    }
    if let Some(ref ncx) = generated_ncx {
        out.push_str(&format!(
            "    <item id=\"ncx\" href=\"{}\" media-type=\"{}\"/>\n",
            escape_xml(ncx),
            NCX_MEDIA_TYPE
        ));
    }
    if let Some(ref cover) = cover_name {
        out.push_str(&format!(
            "    <item id=\"{}\" href=\"{}\" media-type=\"{}\"/>\n",
            COVER_ID,
            escape_xml(cover),
            media_type_for(cover)
        ));
    }
    out.push_str("  </manifest>\n");

    out.push_str("  <spine toc=\"ncx\">\n");
    for (entry, id) in book.entries.iter().zip(&ids) {
        if entry.is_document() {
            out.push_str(&format!("    <itemref idref=\"{}\"/>\n", id));
        }
    }
    out.push_str("  </spine>\n");
    out.push_str("</package>\n");
    out
}

fn zip_error(e: zip::result::ZipError) -> LoanError {
    LoanError::FileIoError(format!("EPUB archive: {}", e))
}

/// Write the archive to `target`
///
/// Blocking; callers on the runtime go through [`write_epub`].
pub fn write_epub_blocking(target: &Path, book: &EpubBook<'_>) -> Result<()> {
    let file = File::create(target)?;
    let mut zip = ZipWriter::new(file);
    let stored = FileOptions::default().compression_method(CompressionMethod::Stored);
    let deflated = FileOptions::default().compression_method(CompressionMethod::Deflated);

    zip.start_file("mimetype", stored).map_err(zip_error)?;
    zip.write_all(MIMETYPE.as_bytes())?;

    zip.start_file("META-INF/container.xml", deflated).map_err(zip_error)?;
    zip.write_all(build_container_xml().as_bytes())?;

    zip.start_file(format!("{}/{}", CONTENT_DIR, PACKAGE_FILE), deflated)
        .map_err(zip_error)?;
    zip.write_all(build_package_opf(book).as_bytes())?;

    if !book.ships_ncx() {
        zip.start_file(format!("{}/{}", CONTENT_DIR, book.ncx_name()), deflated)
            .map_err(zip_error)?;
        zip.write_all(build_ncx(book.metadata, book.toc).as_bytes())?;
    }

    if let (Some(cover), Some(name)) = (book.cover.as_ref(), book.cover_name()) {
        zip.start_file(format!("{}/{}", CONTENT_DIR, name), deflated)
            .map_err(zip_error)?;
        io::copy(&mut File::open(cover)?, &mut zip)?;
    }

    for entry in &book.entries {
        zip.start_file(format!("{}/{}", CONTENT_DIR, entry.archive_path), deflated)
            .map_err(zip_error)?;
        io::copy(&mut File::open(&entry.source)?, &mut zip)?;
    }

    zip.finish().map_err(zip_error)?.sync_all()?;
    Ok(())
}

/// Write the archive to `target` off the async runtime
pub async fn write_epub(target: &Path, book: &EpubBook<'_>) -> Result<()> {
    let target = target.to_path_buf();
    let metadata = book.metadata.clone();
    let toc = book.toc.to_vec();
    let entries = book.entries.clone();
    let cover = book.cover.clone();

    tokio::task::spawn_blocking(move || {
        let book = EpubBook {
            metadata: &metadata,
            entries,
            toc: &toc,
            cover,
        };
        write_epub_blocking(&target, &book)
    })
    .await
    .map_err(|e| LoanError::internal(format!("EPUB writer stopped: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::TempDir;
    use zip::ZipArchive;

    fn metadata() -> BookMetadata {
        BookMetadata {
            id: "4021".into(),
            title: "Tom & Jerry".into(),
            authors: vec!["Ann Author".into()],
            ..Default::default()
        }
    }

    fn toc() -> Vec<TocLink> {
        vec![
            TocLink {
                title: "Start".into(),
                target: "OEBPS/cover.xhtml".into(),
            },
            TocLink {
                title: "Chapter <1>".into(),
                target: "OEBPS/text/ch1.xhtml#c1".into(),
            },
        ]
    }

    fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> String {
        let mut text = String::new();
        archive.by_name(name).unwrap().read_to_string(&mut text).unwrap();
        text
    }

    #[test]
    fn test_opf_ids_never_start_with_digit() {
        assert_eq!(opf_id("001-intro.xhtml"), "id_001-introxhtml");
        let entries = vec![
            EpubEntry::new("/a", "a/b.xhtml", None),
            EpubEntry::new("/b", "ab.xhtml", None),
            EpubEntry::new("/c", "toc.ncx", None),
        ];
        assert_eq!(entry_ids(&entries), vec!["abxhtml", "abxhtml-2", "ncx"]);
    }

    #[test]
    fn test_package_lists_spine_cover_and_generated_ncx() {
        let metadata = metadata();
        let toc = toc();
        let book = EpubBook {
            metadata: &metadata,
            entries: vec![
                EpubEntry::new("/x/1", "OEBPS/cover.xhtml", None),
                EpubEntry::new("/x/2", "OEBPS/style.css", None),
                EpubEntry::new("/x/3", "OEBPS/text/ch1.xhtml", Some("application/xhtml+xml")),
            ],
            toc: &toc,
            cover: Some(PathBuf::from("/x/cover.jpg")),
        };

        let opf = build_package_opf(&book);
        assert!(opf.contains("<dc:title>Tom &amp; Jerry</dc:title>"));
        assert!(opf.contains("<meta name=\"cover\" content=\"coverimage\"/>"));
        assert!(opf.contains("href=\"toc_4021.ncx\" media-type=\"application/x-dtbncx+xml\""));
        assert!(opf.contains("href=\"cover_4021.jpg\" media-type=\"image/jpeg\""));
        assert!(opf.contains("<spine toc=\"ncx\">"));
        // stylesheets are in the manifest but not in reading order
        assert!(opf.contains("href=\"OEBPS/style.css\" media-type=\"text/css\""));
        assert_eq!(opf.matches("<itemref").count(), 2);

        let ncx = build_ncx(&metadata, &toc);
        assert!(ncx.contains("<text>Chapter &lt;1&gt;</text>"));
        assert!(ncx.contains("<content src=\"OEBPS/text/ch1.xhtml#c1\"/>"));
        assert!(ncx.contains("<meta name=\"dtb:uid\" content=\"4021\"/>"));
    }

    #[tokio::test]
    async fn test_archive_starts_with_stored_mimetype() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001-cover.xhtml");
        let cover = dir.path().join("cover.jpg");
        std::fs::write(&page, "<html>cover</html>").unwrap();
        std::fs::write(&cover, b"jpeg").unwrap();

        let metadata = metadata();
        let toc = toc();
        let book = EpubBook {
            metadata: &metadata,
            entries: vec![EpubEntry::new(&page, "OEBPS/cover.xhtml", None)],
            toc: &toc,
            cover: Some(cover),
        };
        let target = dir.path().join("Tom & Jerry.epub");
        write_epub(&target, &book).await.unwrap();

        let mut archive = ZipArchive::new(File::open(&target).unwrap()).unwrap();
        {
            let first = archive.by_index(0).unwrap();
            assert_eq!(first.name(), "mimetype");
            assert_eq!(first.compression(), CompressionMethod::Stored);
        }
        assert_eq!(read_entry(&mut archive, "mimetype"), MIMETYPE);
        assert!(read_entry(&mut archive, "META-INF/container.xml").contains("full-path=\"OEBPS/package.opf\""));
        assert!(read_entry(&mut archive, "OEBPS/package.opf").contains("toc_4021.ncx"));
        assert!(read_entry(&mut archive, "OEBPS/toc_4021.ncx").contains("navPoint2"));
        assert_eq!(read_entry(&mut archive, "OEBPS/OEBPS/cover.xhtml"), "<html>cover</html>");
        assert!(archive.by_name("OEBPS/cover_4021.jpg").is_ok());
    }

    #[test]
    fn test_shipped_ncx_is_not_generated() {
        let metadata = metadata();
        let book = EpubBook {
            metadata: &metadata,
            entries: vec![EpubEntry::new("/x/toc", "toc.ncx", None)],
            toc: &[],
            cover: None,
        };
        let opf = build_package_opf(&book);
        assert!(!opf.contains("toc_4021.ncx"));
        assert!(opf.contains("<item id=\"ncx\" href=\"toc.ncx\""));
    }
}
