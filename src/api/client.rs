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

//! Session client for the lending service
//!
//! Wraps `reqwest::Client` with:
//! - Bearer authentication backed by the shared [`CredentialStore`]
//! - A single credential refresh and replay on 401 responses
//! - Retry with exponential backoff on 5xx and transport failures
//! - A cookie jar shared with the download manager (direct loans need
//!   the content cookie set by the open-loan handshake)
//!
//! # Retry Strategy
//! - `max_retries` retries after the first attempt
//! - Backoff: `retry_delay`, doubled after every failed attempt
//! - No retry on 4xx client errors; 429 surfaces as `RateLimitExceeded`

use crate::api::auth::{ChipResponse, CredentialStore, Identity, TokenRefresher};
use crate::api::legacy::LegacyLicenseClient;
use crate::api::loans::{
    filter_and_sort, DrmKind, Loan, LoanFilter, LoanFormat, RawLoan, FORMAT_AUDIOBOOK_MP3,
    FORMAT_AUDIOBOOK_OVERDRIVE, FORMAT_EBOOK_EPUB_ADOBE, FORMAT_EBOOK_EPUB_OPEN, FORMAT_EBOOK_OVERDRIVE,
    FORMAT_EBOOK_PDF_ADOBE, FORMAT_EBOOK_PDF_OPEN, FORMAT_MAGAZINE_OVERDRIVE,
};
use crate::api::manifest::{
    BookMetadata, ItemKind, ManifestItem, ManifestResolver, ResolveMode, ResourceManifest, ReturnOutcome,
};
use crate::api::openbook::{self, OpenLoan, Openbook};
use crate::error::{LoanError, Result};
use crate::file::manager::FileManager;
use crate::file::paths::sanitize_filename;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

/// Production session endpoint
pub const DEFAULT_BASE_URL: &str = "https://sentry-read.svc.overdrive.com";

/// Retries after the first attempt (2 retries = 3 total attempts)
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Initial retry delay (exponential backoff: 1s, 2s, 4s)
const INITIAL_RETRY_DELAY_SECS: u64 = 1;

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How long to wait for a setup code to be confirmed
const DEFAULT_LINK_TIMEOUT_SECS: u64 = 60;

/// Bearer lifetime assumed when the token carries no `exp` claim
const DEFAULT_IDENTITY_LIFETIME_SECS: i64 = 60 * 60;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub user_agent: String,
    pub enable_cookies: bool,
    /// Delay between account-state polls while linking
    pub poll_interval: Duration,
    pub link_timeout: Duration,
    pub identity_lifetime_secs: i64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_secs(INITIAL_RETRY_DELAY_SECS),
            user_agent: "Mozilla/5.0".to_string(),
            enable_cookies: true,
            poll_interval: Duration::from_secs(2),
            link_timeout: Duration::from_secs(DEFAULT_LINK_TIMEOUT_SECS),
            identity_lifetime_secs: DEFAULT_IDENTITY_LIFETIME_SECS,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.config.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn user_agent<S: Into<String>>(mut self, user_agent: S) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn enable_cookies(mut self, enable: bool) -> Self {
        self.config.enable_cookies = enable;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn link_timeout(mut self, timeout: Duration) -> Self {
        self.config.link_timeout = timeout;
        self
    }

    pub fn identity_lifetime_secs(mut self, secs: i64) -> Self {
        self.config.identity_lifetime_secs = secs;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Library card attached to the account
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Card {
    pub card_id: String,
    pub card_name: Option<String>,
    pub advantage_key: Option<String>,
}

/// Body of `GET /chip/sync`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SyncState {
    pub result: String,
    pub cards: Vec<Card>,
    pub loans: Vec<RawLoan>,
}

impl SyncState {
    /// Account linked and at least one card attached
    pub fn is_linked(&self) -> bool {
        self.result == "synchronized" && !self.cards.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct FulfillResponse {
    fulfill: FulfillLink,
}

#[derive(Debug, Deserialize)]
struct FulfillLink {
    href: String,
}

/// Error body returned by the session API
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    upstream: Option<UpstreamError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct UpstreamError {
    user_explanation: Option<String>,
    error_code: Option<String>,
}

/// Main HTTP client for the lending service session API
///
/// Cheap to share behind an `Arc`; all mutable state lives in the
/// credential store and the cookie jar.
#[derive(Debug)]
pub struct LibbyClient {
    client: Client,
    cookie_jar: Arc<Jar>,
    credentials: Arc<CredentialStore>,
    legacy: LegacyLicenseClient,
    config: ClientConfig,
}

impl LibbyClient {
    pub fn new(credentials: Arc<CredentialStore>) -> Result<Self> {
        Self::with_config(credentials, ClientConfig::default())
    }

    pub fn with_config(credentials: Arc<CredentialStore>, config: ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| LoanError::ConfigurationError(format!("Invalid user agent: {}", e)))?,
        );
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let cookie_jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .default_headers(default_headers)
            .timeout(config.timeout);
        if config.enable_cookies {
            builder = builder.cookie_provider(cookie_jar.clone());
        }
        let client = builder.build()?;
        let legacy = LegacyLicenseClient::new(config.timeout)?;

        Ok(Self {
            client,
            cookie_jar,
            credentials,
            legacy,
            config,
        })
    }

    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Cookie jar shared with downloads of direct-mode content
    pub fn cookie_jar(&self) -> Arc<Jar> {
        self.cookie_jar.clone()
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials.clone()
    }

    pub fn legacy(&self) -> &LegacyLicenseClient {
        &self.legacy
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.base_url, endpoint)
    }

    fn identity_lifetime(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.identity_lifetime_secs)
    }

    // ===== Authentication =====

    /// Obtain a linked identity
    ///
    /// A stored, linked identity is reused (refreshed if it is about to
    /// expire). Otherwise `setup_code` runs the linking handshake: create a
    /// device chip, submit the code, then poll the account state until it
    /// reports a linked card or `link_timeout` elapses.
    #[instrument(skip(self, setup_code))]
    pub async fn authenticate(&self, setup_code: Option<&str>) -> Result<Identity> {
        if let Some(identity) = self.credentials.current().await {
            if identity.is_linked() {
                if setup_code.is_some() {
                    info!("already linked, ignoring setup code");
                }
                return self.credentials.valid_identity(self).await;
            }
        }

        let code = setup_code.ok_or(LoanError::SetupCodeRequired)?;
        validate_setup_code(code)?;

        let chip = self.request_chip(None).await?;
        self.credentials
            .store(Identity::from_chip(&chip, self.identity_lifetime()))
            .await?;
        debug!("device chip created");

        let clone_url = self.url("/chip/clone/code");
        let cloned = self
            .send_with_retry(true, |client| client.post(&clone_url).form(&[("code", code)]))
            .await;
        match cloned {
            Ok(_) => {}
            Err(LoanError::ApiRequestFailed {
                status_code: Some(status),
                message,
                ..
            }) if (400..500).contains(&status) => {
                return Err(LoanError::AuthenticationFailed(format!("setup code rejected: {}", message)));
            }
            Err(e) => return Err(e),
        }

        let started = Instant::now();
        loop {
            let state = self.sync().await?;
            if state.is_linked() {
                break;
            }
            if started.elapsed() >= self.config.link_timeout {
                return Err(LoanError::AuthTimeout {
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            debug!(result = %state.result, "account not linked yet");
            sleep(self.config.poll_interval).await;
        }

        // Re-issue the chip so the bearer carries the linked account
        let current = self.credentials.current().await.ok_or(LoanError::SetupCodeRequired)?;
        let mut identity = self.refresh(&current).await?;
        identity.linked_at = Some(Utc::now());
        self.credentials.store(identity.clone()).await?;

        info!(identity = %identity.masked_log_entry(), "account linked");
        Ok(identity)
    }

    /// Forget the stored identity
    pub async fn reset(&self) -> Result<()> {
        self.credentials.reset().await
    }

    async fn request_chip(&self, bearer: Option<&str>) -> Result<ChipResponse> {
        let url = self.url("/chip");
        let response = self
            .send_with_retry(false, |client| {
                let request = client.post(&url).query(&[("client", "dewey")]);
                match bearer {
                    Some(token) => request.bearer_auth(token),
                    None => request,
                }
            })
            .await?;
        Self::parse_json(response).await
    }

    // ===== Loans =====

    /// Account state including cards and loans
    pub async fn sync(&self) -> Result<SyncState> {
        self.get_json("/chip/sync").await
    }

    /// Current loans matching `filter`, oldest checkout first
    #[instrument(skip(self))]
    pub async fn list_loans(&self, filter: &LoanFilter) -> Result<Vec<Loan>> {
        let state = self.sync().await?;
        let total = state.loans.len();
        let loans = filter_and_sort(state.loans.into_iter().map(Loan::from).collect(), filter);
        debug!(total, selected = loans.len(), "listed loans");
        Ok(loans)
    }

    /// Fulfillment document as raw bytes (`.odm` / `.acsm`)
    pub async fn fulfill_bytes(&self, loan: &Loan, format_id: &str) -> Result<Vec<u8>> {
        let url = self.fulfill_url(loan, format_id);
        let response = self
            .send_with_retry(true, |client| client.get(&url).header(ACCEPT, "*/*"))
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Fulfillment link for open formats
    async fn fulfill_link(&self, loan: &Loan, format_id: &str) -> Result<String> {
        let endpoint = format!("/card/{}/loan/{}/fulfill/{}", loan.card_id, loan.id, format_id);
        let body: FulfillResponse = self.get_json(&endpoint).await?;
        Ok(body.fulfill.href)
    }

    fn fulfill_url(&self, loan: &Loan, format_id: &str) -> String {
        self.url(&format!("/card/{}/loan/{}/fulfill/{}", loan.card_id, loan.id, format_id))
    }

    /// Open a loan for direct reading/listening
    ///
    /// Visiting the web URL sets the content cookie in the shared jar.
    pub async fn open_loan(&self, loan: &Loan) -> Result<(OpenLoan, Openbook)> {
        let loan_type = match loan.format {
            LoanFormat::Audiobook => "audiobook",
            LoanFormat::Ebook => "book",
            LoanFormat::Magazine => "magazine",
        };
        let endpoint = format!("/open/{}/card/{}/title/{}", loan_type, loan.card_id, loan.id);
        let open: OpenLoan = self.get_json(&endpoint).await?;

        let web_url = format!("{}?{}", open.urls.web, open.message);
        self.send_with_retry(false, |client| client.get(&web_url).header(ACCEPT, "*/*"))
            .await?;

        let openbook_url = open.urls.openbook.clone();
        let response = self
            .send_with_retry(false, |client| client.get(&openbook_url))
            .await?;
        let openbook: Openbook = Self::parse_json(response).await?;
        Ok((open, openbook))
    }

    /// Resolve a loan into a manifest through `mode`
    #[instrument(skip(self, loan, work_dir), fields(loan = %loan.id, title = %loan.title))]
    pub async fn resolve_manifest(&self, loan: &Loan, mode: ResolveMode, work_dir: &Path) -> Result<ResourceManifest> {
        match (mode, loan.format) {
            (ResolveMode::ViaLicenseFile, LoanFormat::Audiobook) => self.resolve_via_license(loan, work_dir).await,
            (ResolveMode::ViaLicenseFile, _) => self.resolve_ebook_file(loan).await,
            (ResolveMode::Direct, LoanFormat::Audiobook) => {
                if !loan.has_format(FORMAT_AUDIOBOOK_OVERDRIVE) && !loan.has_format(FORMAT_AUDIOBOOK_MP3) {
                    return Err(LoanError::not_fulfillable(&loan.id, "no streaming audiobook format"));
                }
                let (open, openbook) = self.open_loan(loan).await?;
                let parts = openbook::parse_toc(&open.urls.web, &openbook)?;
                Ok(openbook::audiobook_manifest(loan, &openbook, parts))
            }
            (ResolveMode::Direct, LoanFormat::Ebook) | (ResolveMode::Direct, LoanFormat::Magazine) => {
                if loan.first_format(&[FORMAT_EBOOK_OVERDRIVE, FORMAT_MAGAZINE_OVERDRIVE]).is_none() {
                    return Err(LoanError::not_fulfillable(&loan.id, "no readable web format"));
                }
                let (open, openbook) = self.open_loan(loan).await?;
                openbook::content_manifest(loan, &openbook, &open.urls.web)
            }
        }
    }

    async fn resolve_via_license(&self, loan: &Loan, work_dir: &Path) -> Result<ResourceManifest> {
        if !loan.has_format(FORMAT_AUDIOBOOK_MP3) {
            return Err(LoanError::not_fulfillable(
                &loan.id,
                "no downloadable mp3 format, try direct mode",
            ));
        }

        let odm_path = odm_path_for(work_dir, loan);
        if !FileManager::file_exists(&odm_path).await {
            let odm = self.fulfill_bytes(loan, FORMAT_AUDIOBOOK_MP3).await?;
            FileManager::atomic_write(&odm_path, &odm).await?;
            debug!(path = %odm_path.display(), "saved loan file");
        }

        let mut manifest = self.legacy.resolve_manifest(&odm_path).await?;
        manifest.loan_id = loan.id.clone();
        merge_loan_metadata(&mut manifest.metadata, loan);
        if manifest.cover().is_none() {
            if let Some(ref cover) = loan.cover_url {
                manifest
                    .items
                    .push(ManifestItem::new(ItemKind::Cover, cover.clone(), "cover.jpg"));
            }
        }
        Ok(manifest)
    }

    /// Ebook or magazine delivered as one file: an open epub/pdf or a DRM wrapper
    async fn resolve_ebook_file(&self, loan: &Loan) -> Result<ResourceManifest> {
        let mut metadata = BookMetadata::default();
        merge_loan_metadata(&mut metadata, loan);
        let mut manifest = ResourceManifest::new(loan.id.clone(), metadata);
        let stem = sanitize_filename(&loan.title);

        if let Some(format_id) = loan.first_format(&[FORMAT_EBOOK_EPUB_OPEN, FORMAT_EBOOK_PDF_OPEN]) {
            let href = self.fulfill_link(loan, format_id).await?;
            let extension = if format_id == FORMAT_EBOOK_PDF_OPEN { "pdf" } else { "epub" };
            manifest.items.push(ManifestItem::new(
                ItemKind::Content,
                href,
                format!("{}.{}", stem, extension),
            ));
        } else if let Some(format_id) = loan.first_format(&[FORMAT_EBOOK_EPUB_ADOBE, FORMAT_EBOOK_PDF_ADOBE]) {
            let identity = self.credentials.valid_identity(self).await?;
            manifest.items.push(
                ManifestItem::new(ItemKind::DrmWrapper, self.fulfill_url(loan, format_id), format!("{}.acsm", stem))
                    .with_header("Authorization", format!("Bearer {}", identity.access_token.token))
                    .with_header("Accept", "*/*"),
            );
        } else {
            let reason = match loan.drm {
                DrmKind::Open => "only readable online, try direct mode",
                DrmKind::Protected => "no downloadable format",
            };
            return Err(LoanError::not_fulfillable(&loan.id, reason));
        }

        if let Some(ref cover) = loan.cover_url {
            manifest
                .items
                .push(ManifestItem::new(ItemKind::Cover, cover.clone(), "cover.jpg"));
        }
        Ok(manifest)
    }

    /// Return a loan. A loan the service no longer knows counts as returned.
    #[instrument(skip(self, loan), fields(loan = %loan.id))]
    pub async fn return_loan(&self, loan: &Loan) -> Result<ReturnOutcome> {
        let url = self.url(&format!("/card/{}/loan/{}", loan.card_id, loan.id));
        match self.send_with_retry(true, |client| client.delete(&url)).await {
            Ok(_) => {
                info!(title = %loan.title, "loan returned");
                Ok(ReturnOutcome::Returned)
            }
            Err(LoanError::ApiRequestFailed {
                status_code: Some(404),
                ..
            }) => {
                warn!(title = %loan.title, "loan was already returned");
                Ok(ReturnOutcome::AlreadyReturned)
            }
            Err(e) => Err(e),
        }
    }

    /// Renew a loan, returning the updated loan
    #[instrument(skip(self, loan), fields(loan = %loan.id))]
    pub async fn renew_loan(&self, loan: &Loan) -> Result<Loan> {
        let url = self.url(&format!("/card/{}/loan/{}", loan.card_id, loan.id));
        let body = serde_json::json!({
            "id": loan.id,
            "title_format": loan.format_ids.first().map(String::as_str).unwrap_or(FORMAT_AUDIOBOOK_MP3),
        });

        match self.send_with_retry(true, |client| client.put(&url).json(&body)).await {
            Ok(response) => {
                let raw: RawLoan = Self::parse_json(response).await?;
                let mut renewed = Loan::from(raw);
                if renewed.card_id.is_empty() {
                    renewed.card_id = loan.card_id.clone();
                }
                info!(title = %loan.title, expires = ?renewed.expires_at, "loan renewed");
                Ok(renewed)
            }
            Err(LoanError::ApiRequestFailed {
                status_code: Some(status),
                message,
                ..
            }) if (400..500).contains(&status) && status != 401 => Err(LoanError::RenewalNotAllowed {
                loan: loan.title.clone(),
                reason: message,
            }),
            Err(e) => Err(e),
        }
    }

    // ===== Transport =====

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T> {
        let url = self.url(endpoint);
        let response = self.send_with_retry(true, |client| client.get(&url)).await?;
        Self::parse_json(response).await
    }

    /// Send a request with retry and credential handling
    ///
    /// Retries on:
    /// - transport errors (connect, timeout)
    /// - 5xx server errors
    ///
    /// A 401 on an authenticated request refreshes the credential once and
    /// replays; the replay does not count as a retry.
    async fn send_with_retry<F>(&self, authenticated: bool, request_builder: F) -> Result<Response>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempts = 0;
        let mut refreshed = false;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;

            let mut request = request_builder(&self.client);
            let mut bearer = None;
            if authenticated {
                let identity = self.credentials.valid_identity(self).await?;
                request = request.bearer_auth(&identity.access_token.token);
                bearer = Some(identity.access_token.token);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    match status {
                        s if s.is_success() => return Ok(response),

                        StatusCode::UNAUTHORIZED if authenticated => {
                            if refreshed {
                                return Err(LoanError::AuthExpiredAndRefreshFailed(
                                    "service rejected the refreshed credential".to_string(),
                                ));
                            }
                            refreshed = true;
                            if let Some(stale) = bearer {
                                self.credentials.force_refresh(&stale, self).await?;
                            }
                            attempts -= 1;
                            continue;
                        }

                        StatusCode::TOO_MANY_REQUESTS => {
                            return Err(LoanError::RateLimitExceeded {
                                retry_after_seconds: extract_retry_after(&response),
                                endpoint: self.extract_endpoint_from_url(response.url().as_str()),
                            });
                        }

                        s if s.is_server_error() && attempts < max_attempts => {
                            let endpoint = self.extract_endpoint_from_url(response.url().as_str());
                            let error_body = response.text().await.unwrap_or_default();
                            warn!(status = s.as_u16(), endpoint = %endpoint, attempt = attempts, "server error, retrying");
                            last_error = Some(LoanError::api_failed(
                                format!("Server error: {}", error_body),
                                Some(s.as_u16()),
                                Some(endpoint),
                            ));
                            sleep(self.backoff(attempts)).await;
                            continue;
                        }

                        _ => return Err(self.error_from_response(response).await),
                    }
                }

                Err(e) if attempts < max_attempts && is_retryable_network_error(&e) => {
                    warn!(error = %e, attempt = attempts, "request failed, retrying");
                    last_error = Some(LoanError::network_error(format!("Network request failed: {}", e), true));
                    sleep(self.backoff(attempts)).await;
                    continue;
                }

                Err(e) => {
                    let transient = is_retryable_network_error(&e);
                    return Err(LoanError::network_error(
                        format!("Network request failed: {}", e),
                        transient,
                    ));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| LoanError::ApiRequestFailed {
            message: format!("Request failed after {} attempts", attempts),
            status_code: None,
            endpoint: None,
        }))
    }

    fn backoff(&self, attempts: u32) -> Duration {
        self.config.retry_delay * 2_u32.pow(attempts.saturating_sub(1))
    }

    /// Parse a successful response body, with context on failure
    async fn parse_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        let url = response.url().clone();

        let response_text = response.text().await.map_err(|e| LoanError::ApiRequestFailed {
            message: format!("Failed to read response body: {}", e),
            status_code: Some(status.as_u16()),
            endpoint: Some(url.path().to_string()),
        })?;

        serde_json::from_str::<T>(&response_text).map_err(|e| {
            let context: String = response_text.chars().take(400).collect();
            LoanError::InvalidApiResponse {
                message: format!("Parse error for {}: {} at col {}. Context: {}", url.path(), e, e.column(), context),
                response_body: Some(response_text.clone()),
            }
        })
    }

    /// Build an error from a non-success response, preferring the
    /// service's own explanation
    async fn error_from_response(&self, response: Response) -> LoanError {
        let status = response.status();
        let endpoint = self.extract_endpoint_from_url(response.url().as_str());
        let error_body = response.text().await.unwrap_or_default();

        let message = serde_json::from_str::<ErrorBody>(&error_body)
            .ok()
            .and_then(|body| body.upstream)
            .and_then(|upstream| match (upstream.user_explanation, upstream.error_code) {
                (Some(explanation), Some(code)) => Some(format!("{} ({})", explanation, code)),
                (Some(explanation), None) => Some(explanation),
                (None, Some(code)) => Some(code),
                (None, None) => None,
            })
            .unwrap_or(error_body);

        LoanError::api_failed(message, Some(status.as_u16()), Some(endpoint))
    }

    fn extract_endpoint_from_url(&self, url: &str) -> String {
        url.strip_prefix(&self.config.base_url).unwrap_or(url).to_string()
    }
}

#[async_trait]
impl TokenRefresher for LibbyClient {
    /// Re-issue the chip with the current refresh credential
    async fn refresh(&self, identity: &Identity) -> Result<Identity> {
        let chip = self.request_chip(Some(&identity.refresh_token)).await?;
        let mut refreshed = Identity::from_chip(&chip, self.identity_lifetime());
        refreshed.linked_at = identity.linked_at;
        Ok(refreshed)
    }
}

/// Setup codes are exactly 8 digits
pub fn validate_setup_code(code: &str) -> Result<()> {
    if code.len() == 8 && code.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(LoanError::invalid_input(format!("Invalid setup code: {}", code)))
    }
}

fn is_retryable_network_error(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_request()
}

/// Retry-After header in seconds, 60 when absent
fn extract_retry_after(response: &Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(60)
}

/// Where a fulfilled `.odm` for `loan` is kept
pub fn odm_path_for(work_dir: &Path, loan: &Loan) -> PathBuf {
    work_dir.join(format!("{} {}.odm", sanitize_filename(&loan.title), loan.id))
}

/// Fill gaps in resolved metadata from the loan listing
fn merge_loan_metadata(metadata: &mut BookMetadata, loan: &Loan) {
    if metadata.id.is_empty() {
        metadata.id = loan.id.clone();
    }
    if metadata.title.is_empty() {
        metadata.title = loan.title.clone();
    }
    if metadata.authors.is_empty() {
        metadata.authors = loan.authors.clone();
    }
    metadata.subtitle = metadata.subtitle.take().or_else(|| loan.subtitle.clone());
    metadata.series = metadata.series.take().or_else(|| loan.series.clone());
    metadata.reading_order = metadata.reading_order.take().or_else(|| loan.reading_order.clone());
    metadata.edition = metadata.edition.take().or_else(|| loan.edition.clone());
    metadata.publisher = metadata.publisher.take().or_else(|| loan.publisher.clone());
    metadata.published = metadata.published.take().or_else(|| loan.published.clone());
    metadata.cover_url = metadata.cover_url.take().or_else(|| loan.cover_url.clone());
    if metadata.subjects.is_empty() {
        metadata.subjects = loan.subjects.clone();
    }
    metadata.format = loan.format;
}

/// Resolves a loan listed by a linked session
#[derive(Debug, Clone)]
pub struct SessionResolver {
    client: Arc<LibbyClient>,
    loan: Loan,
    mode: ResolveMode,
}

impl SessionResolver {
    pub fn new(client: Arc<LibbyClient>, loan: Loan, mode: ResolveMode) -> Self {
        Self { client, loan, mode }
    }

    pub fn loan(&self) -> &Loan {
        &self.loan
    }
}

#[async_trait]
impl ManifestResolver for SessionResolver {
    fn loan_id(&self) -> String {
        self.loan.id.clone()
    }

    fn label(&self) -> String {
        self.loan.label()
    }

    async fn resolve(&self, work_dir: &Path) -> Result<ResourceManifest> {
        self.client.resolve_manifest(&self.loan, self.mode, work_dir).await
    }

    async fn return_loan(&self) -> Result<ReturnOutcome> {
        self.client.return_loan(&self.loan).await
    }
}
