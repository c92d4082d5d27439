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

//! Error types for LoanFetch
//!
//! One error enum for the whole crate, defined with thiserror. Variants are
//! grouped by the component that raises them (session, legacy license,
//! download, media tools, files).
//!
//! Two predicates drive the pipeline's error scoping:
//! - [`LoanError::is_retryable`] decides whether a download attempt or API
//!   call is worth repeating.
//! - [`LoanError::is_auth_error`] marks errors that abort a whole batch run.
//!   Everything else is scoped to the loan being processed.

use thiserror::Error;

/// Result type alias using our LoanError type
pub type Result<T> = std::result::Result<T, LoanError>;

/// Main error type for LoanFetch
#[derive(Error, Debug)]
pub enum LoanError {
    // ===== Session / Authentication Errors =====

    /// The setup-code handshake did not complete within the link timeout
    #[error("Timed out after {waited_secs} seconds waiting for the setup code to be confirmed")]
    AuthTimeout { waited_secs: u64 },

    /// The stored identity expired and could not be refreshed
    #[error("Stored credentials expired and could not be refreshed: {0}")]
    AuthExpiredAndRefreshFailed(String),

    /// No identity is stored and no setup code was supplied
    #[error("No stored credentials. A setup code from the companion app is required")]
    SetupCodeRequired,

    /// The service rejected a request for a reason other than expiry
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Generic API request failure
    #[error("API request failed: {message}")]
    ApiRequestFailed {
        message: String,
        /// HTTP status code if available
        status_code: Option<u16>,
        /// API endpoint that failed
        endpoint: Option<String>,
    },

    /// API returned an unexpected response format
    #[error("Invalid API response: {message}")]
    InvalidApiResponse {
        message: String,
        /// Response body snippet for debugging
        response_body: Option<String>,
    },

    /// API rate limiting (HTTP 429)
    #[error("API rate limit exceeded. Retry after {retry_after_seconds} seconds")]
    RateLimitExceeded {
        retry_after_seconds: u64,
        endpoint: String,
    },

    // ===== Loan Errors =====

    /// The loan's format cannot be resolved through the requested path
    #[error("Loan '{loan}' cannot be fulfilled: {reason}")]
    LoanNotFulfillable { loan: String, reason: String },

    /// The lending service refused to renew the loan
    #[error("Renewal not allowed for '{loan}': {reason}")]
    RenewalNotAllowed { loan: String, reason: String },

    // ===== Legacy License Errors =====

    /// License acquisition was refused (loan returned or expired)
    #[error("License denied: {0}")]
    LicenseDenied(String),

    /// The .odm / license document could not be parsed
    #[error("Malformed license file: {0}")]
    MalformedLicenseFile(String),

    // ===== Download Errors =====

    /// A manifest item could not be retrieved
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Network connectivity error
    #[error("Network error: {message}")]
    NetworkError {
        message: String,
        /// Whether this error might be transient
        is_transient: bool,
    },

    /// Downloaded byte count differs from the declared size
    #[error("Download file size mismatch: expected {expected} bytes, got {actual} bytes")]
    FileSizeMismatch { expected: u64, actual: u64 },

    /// Downloaded content hash differs from the declared checksum
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Server returned a status the downloader does not accept
    #[error("Server responded with unexpected status code {status_code} for {url}")]
    UnexpectedStatusCode { status_code: u16, url: String },

    /// Invalid download URL format or protocol
    #[error("Invalid download URL: {0}")]
    InvalidDownloadUrl(String),

    // ===== Media Tool Errors =====

    /// FFmpeg execution error
    #[error("FFmpeg error: {0}")]
    FfmpegError(String),

    /// FFmpeg binary not found in PATH
    #[error("FFmpeg not found. Please install FFmpeg and ensure it's in your PATH.")]
    FfmpegNotFound,

    /// Audio file is corrupted or has unreadable metadata
    #[error("Invalid audio file: {0}")]
    InvalidAudioFile(String),

    // ===== File Errors =====

    /// File or directory not found
    #[error("File not found: {0}")]
    FileNotFound(String),

    /// Generic file I/O error
    #[error("File I/O error: {0}")]
    FileIoError(String),

    /// Invalid file path or naming template
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    // ===== Validation / Configuration =====

    /// Generic input validation error
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Required field is missing
    #[error("Missing required field: {0}")]
    MissingRequiredField(String),

    /// Configuration file error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    // ===== General Errors =====

    /// Operation timed out
    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    /// Internal error that should not normally occur
    #[error("Internal error: {0}")]
    InternalError(String),

    // ===== External Library Errors =====

    /// HTTP client error from reqwest
    #[error("HTTP client error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    /// Standard I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<std::string::FromUtf8Error> for LoanError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        LoanError::InternalError(format!("UTF-8 conversion error: {}", err))
    }
}

impl From<std::num::ParseIntError> for LoanError {
    fn from(err: std::num::ParseIntError) -> Self {
        LoanError::InvalidInput(format!("Failed to parse integer: {}", err))
    }
}

impl From<roxmltree::Error> for LoanError {
    fn from(err: roxmltree::Error) -> Self {
        LoanError::MalformedLicenseFile(err.to_string())
    }
}

// Helper methods for creating common errors
impl LoanError {
    /// Create an InvalidInput error with a message
    pub fn invalid_input<S: Into<String>>(message: S) -> Self {
        LoanError::InvalidInput(message.into())
    }

    /// Create an InternalError with a message
    pub fn internal<S: Into<String>>(message: S) -> Self {
        LoanError::InternalError(message.into())
    }

    /// Create an ApiRequestFailed error
    pub fn api_failed<S: Into<String>>(
        message: S,
        status_code: Option<u16>,
        endpoint: Option<String>,
    ) -> Self {
        LoanError::ApiRequestFailed {
            message: message.into(),
            status_code,
            endpoint,
        }
    }

    /// Create a NetworkError
    pub fn network_error<S: Into<String>>(message: S, is_transient: bool) -> Self {
        LoanError::NetworkError {
            message: message.into(),
            is_transient,
        }
    }

    /// Create a LoanNotFulfillable error
    pub fn not_fulfillable<L: Into<String>, R: Into<String>>(loan: L, reason: R) -> Self {
        LoanError::LoanNotFulfillable {
            loan: loan.into(),
            reason: reason.into(),
        }
    }

    /// Create a MalformedLicenseFile error
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        LoanError::MalformedLicenseFile(message.into())
    }

    /// Check if error is retryable (network errors, timeouts, integrity failures)
    ///
    /// A size or checksum mismatch counts as a failed attempt, so it is
    /// retryable like any transient transport error.
    pub fn is_retryable(&self) -> bool {
        match self {
            LoanError::NetworkError { is_transient, .. } => *is_transient,
            LoanError::Timeout(_)
            | LoanError::FileSizeMismatch { .. }
            | LoanError::ChecksumMismatch { .. }
            | LoanError::RateLimitExceeded { .. } => true,
            LoanError::ApiRequestFailed { status_code: Some(code), .. }
            | LoanError::UnexpectedStatusCode { status_code: code, .. } => {
                matches!(code, 408 | 429 | 500..=599)
            }
            LoanError::ReqwestError(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            _ => false,
        }
    }

    /// Check if error is due to authentication
    ///
    /// These errors abort a whole batch: every later loan would fail the same way.
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            LoanError::AuthTimeout { .. }
                | LoanError::AuthExpiredAndRefreshFailed(_)
                | LoanError::SetupCodeRequired
                | LoanError::AuthenticationFailed(_)
        )
    }

    /// Check if error comes from an external media tool
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            LoanError::FfmpegError(_) | LoanError::FfmpegNotFound | LoanError::InvalidAudioFile(_)
        )
    }

    /// Stable machine-readable category, used in batch reports
    pub fn category(&self) -> &'static str {
        match self {
            LoanError::AuthTimeout { .. } => "auth_timeout",
            LoanError::AuthExpiredAndRefreshFailed(_) => "auth_expired_and_refresh_failed",
            LoanError::SetupCodeRequired => "setup_code_required",
            LoanError::AuthenticationFailed(_) => "authentication_failed",
            LoanError::LoanNotFulfillable { .. } => "loan_not_fulfillable",
            LoanError::RenewalNotAllowed { .. } => "renewal_not_allowed",
            LoanError::LicenseDenied(_) => "license_denied",
            LoanError::MalformedLicenseFile(_) => "malformed_license_file",
            LoanError::RateLimitExceeded { .. } => "rate_limited",
            LoanError::ApiRequestFailed { .. } | LoanError::InvalidApiResponse { .. } => "api_error",
            LoanError::DownloadFailed(_)
            | LoanError::FileSizeMismatch { .. }
            | LoanError::ChecksumMismatch { .. }
            | LoanError::UnexpectedStatusCode { .. }
            | LoanError::InvalidDownloadUrl(_) => "download_failed",
            LoanError::NetworkError { .. } | LoanError::ReqwestError(_) => "network_error",
            LoanError::Timeout(_) => "timeout",
            LoanError::FfmpegError(_) | LoanError::FfmpegNotFound | LoanError::InvalidAudioFile(_) => {
                "media_tool_error"
            }
            LoanError::FileNotFound(_)
            | LoanError::FileIoError(_)
            | LoanError::InvalidPath(_)
            | LoanError::IoError(_) => "file_error",
            LoanError::InvalidInput(_)
            | LoanError::MissingRequiredField(_)
            | LoanError::ConfigurationError(_) => "invalid_input",
            LoanError::SerdeJsonError(_) => "invalid_data",
            LoanError::InternalError(_) => "internal_error",
        }
    }

    /// Get retry delay in seconds when the server supplied one
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            LoanError::RateLimitExceeded { retry_after_seconds, .. } => Some(*retry_after_seconds),
            _ => None,
        }
    }

    /// Get user-friendly error message suitable for display
    pub fn user_message(&self) -> String {
        match self {
            LoanError::FfmpegNotFound => {
                "FFmpeg is required but not found. Please install FFmpeg and ensure it's in your PATH.".to_string()
            }
            LoanError::SetupCodeRequired => {
                "Open the companion app, choose \"Copy to another device\" and pass the 8 digit setup code.".to_string()
            }
            LoanError::AuthTimeout { .. } => {
                "The setup code was not confirmed in time. Generate a new code and try again.".to_string()
            }
            LoanError::AuthExpiredAndRefreshFailed(_) => {
                "Your session has expired. Reset the stored credentials and link again with a new setup code.".to_string()
            }
            LoanError::LicenseDenied(_) => {
                "The license was refused. The loan may have been returned or may have expired.".to_string()
            }
            LoanError::RateLimitExceeded { retry_after_seconds, .. } => {
                format!(
                    "API rate limit exceeded. Please wait {} seconds before trying again.",
                    retry_after_seconds
                )
            }
            LoanError::FileSizeMismatch { expected, actual } => {
                format!(
                    "Download verification failed: file size mismatch (expected {} MB, got {} MB). Please try downloading again.",
                    expected / 1_000_000,
                    actual / 1_000_000
                )
            }
            _ => self.to_string(),
        }
    }
}
