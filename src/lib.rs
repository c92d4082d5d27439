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

//! Library loan downloader
//!
//! Resolves audiobook, ebook and magazine loans from a library lending
//! service into local files. Loans come either from a linked companion-app
//! session ([`api::client::LibbyClient`]) or from a legacy `.odm` license
//! file ([`api::legacy::LegacyLicenseClient`]); both are driven through
//! [`pipeline::Orchestrator`], which downloads every part with
//! [`download::DownloadManager`] and post-processes audio with
//! [`audio::MediaAssembler`].

pub mod api;
pub mod audio;
pub mod config;
pub mod download;
pub mod error;
pub mod file;
pub mod pipeline;

pub use config::PipelineConfig;
pub use error::{LoanError, Result};
pub use pipeline::{BatchReport, LoanJob, LoanOutcome, LoanState, Orchestrator, Selection};
