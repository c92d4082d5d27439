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

//! Lending service access: session API, legacy license files and the
//! manifest both of them resolve loans into.

pub mod auth;
pub mod client;
pub mod legacy;
pub mod loans;
pub mod manifest;
pub mod openbook;

pub use auth::{CredentialStore, Identity, TokenRefresher};
pub use client::{ClientConfig, LibbyClient, SessionResolver};
pub use legacy::{LegacyLicenseClient, LicenseFileResolver, OdmFile};
pub use loans::{Loan, LoanFilter, LoanFormat};
pub use manifest::{BookMetadata, ManifestItem, ManifestResolver, ResolveMode, ResourceManifest, ReturnOutcome};
