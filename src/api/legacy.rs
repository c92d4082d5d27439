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

//! Legacy license file (`.odm`) acquisition
//!
//! An `.odm` file is an XML loan document. It names the media id, the
//! download base URL, the audio parts and a license acquisition URL. The
//! license itself is obtained with a challenge/response handshake:
//!
//! 1. Generate a fresh client id (upper-case UUID).
//! 2. Hash `"{client_id}|{OMC}|{OS}|{salt}"` encoded as UTF-16LE with SHA-1,
//!    then base64 the digest.
//! 3. `GET AcquisitionUrl?MediaID&ClientID&OMC&OS&Hash`.
//!
//! The returned license document carries the `ClientID` that, together with
//! the license text itself, authorizes every part download. A license can
//! only be acquired once per loan file, so it is saved next to the `.odm`
//! and reused on later runs.

use crate::api::loans::LoanFormat;
use crate::api::manifest::{
    BookMetadata, ChapterMarker, ItemKind, ManifestItem, ManifestResolver, ResourceManifest,
    ReturnOutcome,
};
use crate::error::{LoanError, Result};
use crate::file::manager::FileManager;
use crate::file::paths::part_file_name;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use reqwest::header::USER_AGENT;
use reqwest::{Client, StatusCode};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

pub const OMC_VERSION: &str = "1.2.0";
pub const OS_VERSION: &str = "10.11.6";
const LICENSE_SALT: &str = "ELOSNOC*AIDEM*EVIRDREVO";

/// User agent expected by the license and part endpoints
pub const CONSOLE_USER_AGENT: &str = "OverDrive Media Console";
/// User agent expected by the early return endpoint
pub const CONSOLE_USER_AGENT_LONG: &str = "OverDrive Media Console/3.7.0.28 iOS/10.3.3";

const LICENSE_NAMESPACE: &str = "http://license.overdrive.com/2008/03/License.xsd";

/// ID3 user text frame carrying in-part chapter markers
pub const MEDIA_MARKERS_TAG: &str = "OverDrive MediaMarkers";

lazy_static! {
    static ref LONE_AMPERSAND: Regex = Regex::new(r"\s&\s").expect("valid ampersand regex");
    static ref NAMED_ENTITY: Regex = Regex::new(r"&([A-Za-z]+[0-9]*);").expect("valid entity regex");
}

/// One audio part listed in the `.odm`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OdmPart {
    pub number: u32,
    /// Remote file name, appended to the download base URL
    pub filename: String,
    pub filesize: Option<u64>,
    pub duration_ms: Option<u64>,
}

/// Parsed `.odm` loan document
#[derive(Debug, Clone, PartialEq)]
pub struct OdmFile {
    pub media_id: String,
    pub metadata: BookMetadata,
    pub download_base_url: String,
    pub parts: Vec<OdmPart>,
    pub acquisition_url: String,
    pub early_return_url: Option<String>,
}

impl OdmFile {
    pub async fn load(path: &Path) -> Result<Self> {
        let raw = tokio::fs::read(path).await.map_err(|e| {
            LoanError::FileNotFound(format!("{}: {}", path.display(), e))
        })?;
        let text = String::from_utf8_lossy(&raw);
        Self::parse(&text)
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(xml)?;
        let root = doc.root_element();

        let media_id = root
            .attribute("id")
            .map(str::to_string)
            .ok_or_else(|| LoanError::malformed("missing media id"))?;

        let metadata_xml = root
            .descendants()
            .filter(|n| n.is_text())
            .filter_map(|n| n.text())
            .map(str::trim)
            .find(|t| t.starts_with("<Metadata>"))
            .ok_or_else(|| LoanError::malformed("unable to find Metadata"))?;
        let mut metadata = parse_metadata(metadata_xml)?;
        metadata.id = media_id.clone();

        let mut download_base_url = None;
        let mut parts = Vec::new();
        for format in root.descendants().filter(|n| n.has_tag_name("Format")) {
            if download_base_url.is_none() {
                download_base_url = format
                    .descendants()
                    .filter(|n| n.has_tag_name("Protocol"))
                    .find(|p| p.attribute("method") == Some("download"))
                    .and_then(|p| p.attribute("baseurl"))
                    .map(str::to_string);
            }
            for part in format.descendants().filter(|n| n.has_tag_name("Part")) {
                parts.push(parse_part(part)?);
            }
        }
        parts.sort_by_key(|p| p.number);

        let download_base_url =
            download_base_url.ok_or_else(|| LoanError::malformed("no download protocol"))?;

        let acquisition_url = root
            .children()
            .find(|n| n.has_tag_name("License"))
            .and_then(|l| child_text(l, "AcquisitionUrl"))
            .ok_or_else(|| LoanError::malformed("unable to find License AcquisitionUrl"))?;

        let early_return_url = child_text(root, "EarlyReturnURL");

        Ok(Self {
            media_id,
            metadata,
            download_base_url,
            parts,
            acquisition_url,
            early_return_url,
        })
    }

    /// Total declared duration of all parts
    pub fn total_duration_ms(&self) -> u64 {
        self.parts.iter().filter_map(|p| p.duration_ms).sum()
    }
}

fn parse_part(node: roxmltree::Node<'_, '_>) -> Result<OdmPart> {
    let number = node
        .attribute("number")
        .ok_or_else(|| LoanError::malformed("part without number"))?
        .trim()
        .parse::<u32>()
        .map_err(|e| LoanError::malformed(format!("bad part number: {}", e)))?;
    let filename = node
        .attribute("filename")
        .map(str::to_string)
        .ok_or_else(|| LoanError::malformed(format!("part {} without filename", number)))?;

    Ok(OdmPart {
        number,
        filename,
        filesize: node.attribute("filesize").and_then(|s| s.trim().parse().ok()),
        duration_ms: node.attribute("duration").and_then(parse_timestamp_ms),
    })
}

fn child_text(node: roxmltree::Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.has_tag_name(name))
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Repair the embedded metadata so a strict XML parser accepts it
fn patch_metadata_xml(text: &str) -> String {
    let text = LONE_AMPERSAND.replace_all(text, " &amp; ");
    NAMED_ENTITY
        .replace_all(&text, |caps: &Captures<'_>| match &caps[1] {
            "amp" | "lt" | "gt" | "quot" | "apos" => caps[0].to_string(),
            name => html_entity(name)
                .map(str::to_string)
                .unwrap_or_else(|| format!("&amp;{};", name)),
        })
        .into_owned()
}

fn html_entity(name: &str) -> Option<&'static str> {
    let value = match name {
        "nbsp" => "\u{a0}",
        "copy" => "©",
        "reg" => "®",
        "trade" => "™",
        "hellip" => "…",
        "mdash" => "—",
        "ndash" => "–",
        "lsquo" => "‘",
        "rsquo" => "’",
        "ldquo" => "“",
        "rdquo" => "”",
        "laquo" => "«",
        "raquo" => "»",
        "Agrave" => "À",
        "Aacute" => "Á",
        "Acirc" => "Â",
        "Atilde" => "Ã",
        "Auml" => "Ä",
        "Aring" => "Å",
        "AElig" => "Æ",
        "Ccedil" => "Ç",
        "Egrave" => "È",
        "Eacute" => "É",
        "Ecirc" => "Ê",
        "Euml" => "Ë",
        "Iacute" => "Í",
        "Ntilde" => "Ñ",
        "Oacute" => "Ó",
        "Ouml" => "Ö",
        "Oslash" => "Ø",
        "Uacute" => "Ú",
        "Uuml" => "Ü",
        "szlig" => "ß",
        "agrave" => "à",
        "aacute" => "á",
        "acirc" => "â",
        "atilde" => "ã",
        "auml" => "ä",
        "aring" => "å",
        "aelig" => "æ",
        "ccedil" => "ç",
        "egrave" => "è",
        "eacute" => "é",
        "ecirc" => "ê",
        "euml" => "ë",
        "igrave" => "ì",
        "iacute" => "í",
        "icirc" => "î",
        "iuml" => "ï",
        "ntilde" => "ñ",
        "ograve" => "ò",
        "oacute" => "ó",
        "ocirc" => "ô",
        "otilde" => "õ",
        "ouml" => "ö",
        "oslash" => "ø",
        "ugrave" => "ù",
        "uacute" => "ú",
        "ucirc" => "û",
        "uuml" => "ü",
        "yacute" => "ý",
        "yuml" => "ÿ",
        _ => return None,
    };
    Some(value)
}

fn parse_metadata(text: &str) -> Result<BookMetadata> {
    let patched = patch_metadata_xml(text);
    let doc = roxmltree::Document::parse(&patched)?;
    let root = doc.root_element();

    let creators: Vec<(String, String)> = root
        .children()
        .find(|n| n.has_tag_name("Creators"))
        .map(|c| {
            c.children()
                .filter(|n| n.is_element())
                .filter_map(|n| {
                    let name = n.text()?.trim().to_string();
                    let role = n.attribute("role").unwrap_or_default().to_string();
                    (!name.is_empty()).then_some((role, name))
                })
                .collect()
        })
        .unwrap_or_default();

    let by_role = |role: &str| -> Vec<String> {
        creators
            .iter()
            .filter(|(r, _)| r.contains(role))
            .map(|(_, n)| n.clone())
            .collect()
    };
    let mut authors = by_role("Author");
    if authors.is_empty() {
        authors = by_role("Editor");
    }
    if authors.is_empty() {
        authors = creators.iter().map(|(_, n)| n.clone()).collect();
    }

    let language = root
        .children()
        .find(|n| n.has_tag_name("Languages"))
        .and_then(|l| l.children().find_map(|n| n.attribute("code")))
        .map(str::to_string);

    let subjects = root
        .children()
        .find(|n| n.has_tag_name("Subjects"))
        .map(|s| {
            s.children()
                .filter_map(|n| n.text())
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let title = child_text(root, "Title").ok_or_else(|| LoanError::malformed("metadata without Title"))?;

    Ok(BookMetadata {
        id: String::new(),
        title,
        subtitle: child_text(root, "SubTitle"),
        authors,
        narrators: by_role("Narrator"),
        publisher: child_text(root, "Publisher"),
        description: child_text(root, "Description"),
        series: child_text(root, "Series"),
        reading_order: None,
        edition: None,
        language,
        subjects,
        published: None,
        cover_url: child_text(root, "CoverUrl"),
        format: LoanFormat::Audiobook,
    })
}

/// Parse `SS`, `MM:SS(.fff)` or `HH:MM:SS(.fff)` into milliseconds
pub fn parse_timestamp_ms(value: &str) -> Option<u64> {
    let fields: Vec<&str> = value.trim().split(':').collect();
    if fields.is_empty() || fields.len() > 3 {
        return None;
    }

    let seconds: f64 = fields.last()?.parse().ok()?;
    let mut whole: u64 = 0;
    for field in &fields[..fields.len() - 1] {
        whole = whole * 60 + field.parse::<u64>().ok()?;
    }

    if seconds < 0.0 {
        return None;
    }
    Some(whole * 60_000 + (seconds * 1000.0).round() as u64)
}

/// Parse the `OverDrive MediaMarkers` document embedded in a part's tags
pub fn parse_media_markers(xml: &str) -> Result<Vec<ChapterMarker>> {
    let patched = patch_metadata_xml(xml);
    let doc = roxmltree::Document::parse(&patched)?;

    Ok(doc
        .descendants()
        .filter(|n| n.has_tag_name("Marker"))
        .filter_map(|marker| {
            let title = child_text(marker, "Name")?;
            let offset_ms = child_text(marker, "Time").as_deref().and_then(parse_timestamp_ms)?;
            Some(ChapterMarker { title, offset_ms })
        })
        .collect())
}

/// Acquired license document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct License {
    /// License text, sent verbatim (minus line breaks) with every part request
    pub raw: String,
    /// `SignedInfo/ClientID`
    pub client_id: String,
}

impl License {
    pub fn parse(raw: &str) -> Result<Self> {
        let doc = roxmltree::Document::parse(raw)?;
        let client_id = doc
            .descendants()
            .find(|n| n.has_tag_name((LICENSE_NAMESPACE, "SignedInfo")) || n.has_tag_name("SignedInfo"))
            .and_then(|s| {
                s.children()
                    .find(|n| n.tag_name().name() == "ClientID")
                    .and_then(|n| n.text())
            })
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| LoanError::malformed("unable to find ClientID in License SignedInfo"))?;

        Ok(Self {
            raw: raw.replace(|c: char| c == '\r' || c == '\n', ""),
            client_id,
        })
    }
}

/// Challenge hash for a license request
pub fn license_hash(client_id: &str) -> String {
    let raw = format!("{}|{}|{}|{}", client_id, OMC_VERSION, OS_VERSION, LICENSE_SALT);
    let utf16: Vec<u8> = raw.encode_utf16().flat_map(|u| u.to_le_bytes()).collect();
    STANDARD.encode(Sha1::digest(&utf16))
}

/// Build the manifest for a parsed loan file and its license
pub fn manifest_from_odm(odm: &OdmFile, license: &License) -> ResourceManifest {
    let mut manifest = ResourceManifest::new(odm.media_id.clone(), odm.metadata.clone());
    let base = odm.download_base_url.trim_end_matches('/');

    for part in &odm.parts {
        // the raw file name; URL parsing percent-encodes what the path needs
        let url = format!("{}/{}", base, part.filename);
        let item = ManifestItem::new(
            ItemKind::AudioPart { number: part.number },
            url,
            part_file_name(&odm.metadata.title, part.number, "mp3"),
        )
        .with_header(USER_AGENT.as_str(), CONSOLE_USER_AGENT)
        .with_header("ClientID", license.client_id.clone())
        .with_header("License", license.raw.clone())
        .with_size(part.filesize)
        .with_duration_ms(part.duration_ms);
        manifest.items.push(item);
    }

    if let Some(ref cover) = odm.metadata.cover_url {
        manifest.items.push(ManifestItem::new(ItemKind::Cover, cover.clone(), "cover.jpg"));
    }

    manifest
}

/// Client for the legacy license endpoints
#[derive(Debug, Clone)]
pub struct LegacyLicenseClient {
    client: Client,
}

impl LegacyLicenseClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Acquire the license for `odm`, reusing `license_path` if it exists
    #[instrument(skip(self, odm), fields(media_id = %odm.media_id))]
    pub async fn acquire_license(&self, odm: &OdmFile, license_path: &Path) -> Result<License> {
        if FileManager::file_exists(license_path).await {
            warn!(path = %license_path.display(), "reusing previously acquired license");
            let raw = tokio::fs::read_to_string(license_path).await?;
            return License::parse(&raw);
        }

        let client_id = uuid::Uuid::new_v4().to_string().to_uppercase();
        let hash = license_hash(&client_id);

        let response = self
            .client
            .get(&odm.acquisition_url)
            .query(&[
                ("MediaID", odm.media_id.as_str()),
                ("ClientID", client_id.as_str()),
                ("OMC", OMC_VERSION),
                ("OS", OS_VERSION),
                ("Hash", hash.as_str()),
            ])
            .header(USER_AGENT, CONSOLE_USER_AGENT)
            .send()
            .await
            .map_err(|e| LoanError::network_error(format!("License request failed: {}", e), true))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(LoanError::LicenseDenied(format!(
                "loan file for '{}' has expired or was returned",
                odm.metadata.title
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoanError::api_failed(
                format!("License request rejected: {}", body),
                Some(status.as_u16()),
                Some(odm.acquisition_url.clone()),
            ));
        }

        let raw = response.text().await?;
        let license = License::parse(&raw)?;
        FileManager::atomic_write(license_path, raw.as_bytes()).await?;
        debug!(path = %license_path.display(), "saved license file");

        Ok(license)
    }

    /// Parse `odm_path`, acquire its license and build the manifest
    pub async fn resolve_manifest(&self, odm_path: &Path) -> Result<ResourceManifest> {
        let odm = OdmFile::load(odm_path).await?;
        let license = self.acquire_license(&odm, &odm_path.with_extension("license")).await?;
        let manifest = manifest_from_odm(&odm, &license);

        info!(
            title = %odm.metadata.title,
            parts = odm.parts.len(),
            "resolved loan file"
        );
        Ok(manifest)
    }

    /// Return the loan early through its `EarlyReturnURL`
    pub async fn return_loan(&self, odm: &OdmFile) -> Result<ReturnOutcome> {
        let url = odm
            .early_return_url
            .as_deref()
            .ok_or_else(|| LoanError::malformed("unable to find EarlyReturnURL"))?;

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, CONSOLE_USER_AGENT_LONG)
            .send()
            .await
            .map_err(|e| LoanError::network_error(format!("Return request failed: {}", e), true))?;

        match response.status() {
            s if s.is_success() => {
                info!(title = %odm.metadata.title, "loan returned");
                Ok(ReturnOutcome::Returned)
            }
            StatusCode::FORBIDDEN => {
                warn!(title = %odm.metadata.title, "loan was already returned");
                Ok(ReturnOutcome::AlreadyReturned)
            }
            s => Err(LoanError::api_failed(
                "Early return failed",
                Some(s.as_u16()),
                Some(url.to_string()),
            )),
        }
    }
}

/// Resolves a loan from a `.odm` file on disk
#[derive(Debug, Clone)]
pub struct LicenseFileResolver {
    client: Arc<LegacyLicenseClient>,
    odm_path: PathBuf,
}

impl LicenseFileResolver {
    pub fn new(client: Arc<LegacyLicenseClient>, odm_path: PathBuf) -> Self {
        Self { client, odm_path }
    }
}

#[async_trait]
impl ManifestResolver for LicenseFileResolver {
    fn loan_id(&self) -> String {
        self.odm_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("loan")
            .to_string()
    }

    fn label(&self) -> String {
        self.odm_path.display().to_string()
    }

    async fn resolve(&self, _work_dir: &Path) -> Result<ResourceManifest> {
        self.client.resolve_manifest(&self.odm_path).await
    }

    async fn return_loan(&self) -> Result<ReturnOutcome> {
        let odm = OdmFile::load(&self.odm_path).await?;
        self.client.return_loan(&odm).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const SAMPLE_ODM: &str = r#"<?xml version="1.0" encoding="utf-8" ?>
<OverDriveMedia id="0AB1C2D3-0000-4000-8000-000000000001" ODMVersion="1.2">
<License><AcquisitionUrl>https://license.example.com/Acquire</AcquisitionUrl></License>
<![CDATA[<Metadata><Title>Sample Book</Title><Publisher>Pub & Co</Publisher><Creators><Creator role="Author">Author A</Creator><Creator role="Author">Author B</Creator><Creator role="Narrator">Reader R&eacute;</Creator></Creators><Languages><Language code="en">English</Language></Languages><Subjects><Subject>Fiction</Subject></Subjects><CoverUrl>https://img.example.com/cover.jpg</CoverUrl></Metadata>]]>
<Formats><Format name="MP3 Audiobook"><Protocols><Protocol method="download" baseurl="https://parts.example.com/dl"/></Protocols>
<Parts count="2"><Part number="2" filename="{A}Fmt425-Part02.mp3" filesize="200" duration="01:00:00.5"/><Part number="1" filename="{A}Fmt425-Part01.mp3" filesize="100" duration="30:00"/></Parts></Format></Formats>
<EarlyReturnURL>https://return.example.com/r?id=1</EarlyReturnURL>
</OverDriveMedia>"#;

    const SAMPLE_LICENSE: &str = r#"<License xmlns="http://license.overdrive.com/2008/03/License.xsd">
<SignedInfo><ContentID>X</ContentID><ClientID>CLIENT-123</ClientID></SignedInfo><Signature>sig</Signature></License>"#;

    #[test]
    fn test_parse_odm() {
        let odm = OdmFile::parse(SAMPLE_ODM).unwrap();
        assert_eq!(odm.media_id, "0AB1C2D3-0000-4000-8000-000000000001");
        assert_eq!(odm.metadata.title, "Sample Book");
        assert_eq!(odm.metadata.publisher.as_deref(), Some("Pub & Co"));
        assert_eq!(odm.metadata.authors, vec!["Author A", "Author B"]);
        assert_eq!(odm.metadata.narrators, vec!["Reader Ré"]);
        assert_eq!(odm.metadata.language.as_deref(), Some("en"));
        assert_eq!(odm.download_base_url, "https://parts.example.com/dl");
        assert_eq!(odm.parts.iter().map(|p| p.number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(odm.parts[0].duration_ms, Some(1_800_000));
        assert_eq!(odm.parts[1].duration_ms, Some(3_600_500));
        assert_eq!(odm.early_return_url.as_deref(), Some("https://return.example.com/r?id=1"));
    }

    #[test]
    fn test_malformed_odm() {
        assert!(matches!(OdmFile::parse("<nope"), Err(LoanError::MalformedLicenseFile(_))));
        let no_metadata = r#"<OverDriveMedia id="x"><License><AcquisitionUrl>u</AcquisitionUrl></License></OverDriveMedia>"#;
        assert!(matches!(OdmFile::parse(no_metadata), Err(LoanError::MalformedLicenseFile(_))));
    }

    #[test]
    fn test_license_parse_and_manifest_headers() {
        let license = License::parse(SAMPLE_LICENSE).unwrap();
        assert_eq!(license.client_id, "CLIENT-123");
        assert!(!license.raw.contains('\n'));

        let odm = OdmFile::parse(SAMPLE_ODM).unwrap();
        let manifest = manifest_from_odm(&odm, &license);
        let parts: Vec<&ManifestItem> = manifest.audio_parts().collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].file_name, "sample-book-part-01.mp3");
        assert_eq!(parts[0].url, "https://parts.example.com/dl/{A}Fmt425-Part01.mp3");
        let parsed = url::Url::parse(&parts[0].url).unwrap();
        assert_eq!(parsed.path(), "/dl/%7BA%7DFmt425-Part01.mp3");
        assert_eq!(parts[0].expected_size, Some(100));
        assert!(parts[0].headers.iter().any(|(k, v)| k == "ClientID" && v == "CLIENT-123"));
        assert!(manifest.cover().is_some());
    }

    #[test]
    fn test_license_hash_is_deterministic_base64_sha1() {
        let hash = license_hash("ABC");
        assert_eq!(hash, license_hash("ABC"));
        assert_ne!(hash, license_hash("ABD"));
        assert_eq!(STANDARD.decode(&hash).unwrap().len(), 20);
    }

    #[test]
    fn test_parse_timestamps() {
        assert_eq!(parse_timestamp_ms("05:21"), Some(321_000));
        assert_eq!(parse_timestamp_ms("1:02:03.250"), Some(3_723_250));
        assert_eq!(parse_timestamp_ms("12.5"), Some(12_500));
        assert_eq!(parse_timestamp_ms("x:10"), None);
    }

    #[test]
    fn test_parse_media_markers() {
        let xml = "<Markers><Marker><Name>Chapter 1</Name><Time>0:00.000</Time></Marker>\
                   <Marker><Name>Tom & Jerry</Name><Time>12:30.500</Time></Marker></Markers>";
        let markers = parse_media_markers(xml).unwrap();
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[1].title, "Tom & Jerry");
        assert_eq!(markers[1].offset_ms, 750_500);
    }
}
