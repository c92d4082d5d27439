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


//! Path generation and naming templates
//!
//! # Template System
//! - Templates use placeholders: `{title}`, `{author}`, `{series}`,
//!   `{reading_order}`, `{edition}`, `{id}`
//! - Unknown or empty placeholders are removed
//! - Every component is sanitized and truncated to the filesystem limit
//! - Part files use a lowercase slug so re-runs produce identical names

use crate::api::manifest::BookMetadata;
use crate::error::{LoanError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[cfg(target_os = "windows")]
const MAX_PATH_LENGTH: usize = 260;
#[cfg(not(target_os = "windows"))]
const MAX_PATH_LENGTH: usize = 4096;

const MAX_COMPONENT_LENGTH: usize = 255;

lazy_static! {
    static ref PLACEHOLDER: Regex = Regex::new(r"\{[a-z_]+\}").expect("valid placeholder regex");
    static ref SLASHES: Regex = Regex::new(r"/+").expect("valid slash regex");
    static ref SLUG_STRIP: Regex = Regex::new(r"[^\w\s-]").expect("valid slug regex");
    static ref SLUG_DASHES: Regex = Regex::new(r"[-\s]+").expect("valid slug regex");
}

/// Path template for generating folder and file names from book metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTemplate {
    template: String,
}

impl PathTemplate {
    pub fn new<S: Into<String>>(template: S) -> Self {
        Self { template: template.into() }
    }

    /// Default folder template: `{title} - {author}`
    pub fn default_folder() -> Self {
        Self::new("{title} - {author}")
    }

    /// Default file template: `{title}`
    pub fn default_file() -> Self {
        Self::new("{title}")
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Render template with metadata
    pub fn render(&self, metadata: &BookMetadata) -> String {
        let tags = Self::extract_tags(metadata);
        let mut result = self.template.clone();

        for (tag, value) in tags.iter() {
            let placeholder = format!("{{{}}}", tag);
            result = result.replace(&placeholder, value);
        }

        let result = PLACEHOLDER.replace_all(&result, "").to_string();
        Self::clean_path_string(&result)
    }

    /// Placeholder values, each sanitized so it cannot add a path separator
    fn extract_tags(metadata: &BookMetadata) -> HashMap<&'static str, String> {
        let mut tags = HashMap::new();

        tags.insert("title", sanitize_filename(&metadata.title));
        tags.insert("id", sanitize_filename(&metadata.id));

        let author = if metadata.authors.is_empty() {
            "Unknown Author".to_string()
        } else {
            metadata.authors.join(", ")
        };
        tags.insert("author", sanitize_filename(&author));

        if let Some(ref series) = metadata.series {
            tags.insert("series", sanitize_filename(series));
        }
        if let Some(ref order) = metadata.reading_order {
            tags.insert("reading_order", sanitize_filename(order));
        }
        if let Some(ref edition) = metadata.edition {
            tags.insert("edition", sanitize_filename(edition));
        }

        tags
    }

    /// Collapse repeated slashes and drop empty components left by missing tags
    fn clean_path_string(path: &str) -> String {
        let result = SLASHES.replace_all(path, "/");

        result
            .split('/')
            .map(|s| s.trim().trim_matches('-').trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<&str>>()
            .join("/")
    }
}

/// Builds the output folder and file paths for one book
#[derive(Debug, Clone)]
pub struct PathBuilder {
    base_directory: PathBuf,
    folder_template: PathTemplate,
    file_template: PathTemplate,
}

impl PathBuilder {
    pub fn new(base_directory: PathBuf, folder_template: PathTemplate, file_template: PathTemplate) -> Self {
        Self {
            base_directory,
            folder_template,
            file_template,
        }
    }

    /// Folder holding every file of the book
    pub fn book_folder(&self, metadata: &BookMetadata) -> Result<PathBuf> {
        let relative = self.folder_template.render(metadata);
        let mut path = self.base_directory.clone();

        for part in relative.split('/') {
            let sanitized = sanitize_path_component(part);
            path.push(truncate_component(&sanitized, MAX_COMPONENT_LENGTH));
        }

        check_length(path)
    }

    /// Path of the merged output file inside `folder`
    pub fn book_file(&self, folder: &Path, metadata: &BookMetadata, extension: &str) -> Result<PathBuf> {
        let rendered = self.file_template.render(metadata);
        let name = if rendered.is_empty() {
            metadata.id.clone()
        } else {
            rendered.replace('/', " ")
        };

        let ext = if extension.starts_with('.') {
            extension.to_string()
        } else {
            format!(".{}", extension)
        };

        let max_filename_len = MAX_COMPONENT_LENGTH - ext.len();
        let filename = truncate_component(&sanitize_filename(&name), max_filename_len);

        check_length(folder.join(format!("{}{}", filename, ext)))
    }
}

fn check_length(path: PathBuf) -> Result<PathBuf> {
    let len = path.to_string_lossy().as_bytes().len();
    if len > MAX_PATH_LENGTH {
        return Err(LoanError::InvalidPath(format!(
            "Path too long ({} bytes): {}",
            len,
            path.display()
        )));
    }
    Ok(path)
}

/// Lowercase slug used for part and sidecar file names
///
/// `"Sample Book - Part 01"` becomes `"sample-book-part-01"`.
pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = SLUG_STRIP.replace_all(&lowered, "");
    let dashed = SLUG_DASHES.replace_all(&stripped, "-");
    let slug = dashed.trim_matches(|c| c == '-' || c == '_').to_string();

    if slug.is_empty() {
        "untitled".to_string()
    } else {
        truncate_component(&slug, MAX_COMPONENT_LENGTH - 16)
    }
}

/// File name of an audio part, stable across runs
pub fn part_file_name(title: &str, number: u32, extension: &str) -> String {
    format!("{}.{}", slugify(&format!("{} - Part {:02}", title, number)), extension)
}

/// Sanitize filename (removes/replaces invalid characters for filenames)
pub fn sanitize_filename(name: &str) -> String {
    let result = sanitize_chars(name, true);

    if result.is_empty() {
        "file".to_string()
    } else {
        result
    }
}

/// Sanitize path component (directory name)
pub fn sanitize_path_component(name: &str) -> String {
    let result = sanitize_chars(name, false);

    if result.is_empty() {
        "folder".to_string()
    } else {
        result
    }
}

fn sanitize_chars(name: &str, is_filename: bool) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut result = String::with_capacity(name.len());

    for (i, &c) in chars.iter().enumerate() {
        if !is_filename && (c == '/' || c == '\\') {
            continue;
        }
        let prev_char = if i > 0 { chars.get(i - 1).copied() } else { None };
        let next_char = chars.get(i + 1).copied();

        result.push(replace_char(c, prev_char, next_char, is_filename));
    }

    let mut result = result.trim().trim_end_matches('.').trim().to_string();

    if cfg!(target_os = "windows") {
        result = handle_windows_reserved_names(&result);
    }

    result
}

/// Replace invalid character with safe alternative
fn replace_char(c: char, prev_char: Option<char>, next_char: Option<char>, is_filename: bool) -> char {
    if c == '"' {
        let opening = prev_char.is_none()
            || (prev_char.map_or(false, |p| !p.is_alphanumeric())
                && next_char.map_or(false, |n| n.is_alphanumeric()));
        if opening {
            return '\u{201C}';
        }
        let closing = next_char.is_none()
            || (next_char.map_or(false, |n| !n.is_alphanumeric())
                && prev_char.map_or(false, |p| p.is_alphanumeric()));
        if closing {
            return '\u{201D}';
        }
        return '＂';
    }

    match c {
        '<' => '＜',
        '>' => '＞',
        ':' => '_',
        '|' => '⏐',
        '?' => '？',
        '*' => '✱',
        '/' if is_filename => '∕',
        '\\' if is_filename => '_',
        c if c.is_control() => '_',
        c => c,
    }
}

fn handle_windows_reserved_names(name: &str) -> String {
    let upper = name.to_uppercase();
    let reserved = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];

    for reserved_name in &reserved {
        if upper == *reserved_name || upper.starts_with(&format!("{}.", reserved_name)) {
            return format!("_{}", name);
        }
    }

    name.to_string()
}

/// Truncate path component to fit within byte limit
pub fn truncate_component(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut index = max_bytes;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }

    text[..index].trim_end().to_string()
}
