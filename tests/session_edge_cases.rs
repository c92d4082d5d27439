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


mod common;

use axum::extract::{Form, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use common::{odm_xml, serve};
use loanfetch::api::auth::AccessToken;
use loanfetch::api::{
    ClientConfig, CredentialStore, Identity, LegacyLicenseClient, LibbyClient, Loan, LoanFilter, OdmFile,
    ResolveMode, ReturnOutcome,
};
use loanfetch::LoanError;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct Account {
    chips: AtomicUsize,
    polls: AtomicUsize,
    submitted_code: Mutex<Option<String>>,
    /// Polls answered before the account reports a card; `None` never links
    link_after_polls: Option<usize>,
}

async fn chip(State(account): State<Arc<Account>>) -> Json<Value> {
    let n = account.chips.fetch_add(1, Ordering::SeqCst) + 1;
    Json(json!({ "identity": format!("token-{}", n), "chip": "chip-1" }))
}

async fn clone_code(State(account): State<Arc<Account>>, Form(form): Form<HashMap<String, String>>) -> Json<Value> {
    *account.submitted_code.lock().unwrap() = form.get("code").cloned();
    Json(json!({ "result": "ok" }))
}

async fn sync(State(account): State<Arc<Account>>) -> Json<Value> {
    let polls = account.polls.fetch_add(1, Ordering::SeqCst) + 1;
    let linked = account.submitted_code.lock().unwrap().is_some()
        && account.link_after_polls.map_or(false, |after| polls > after);
    if !linked {
        return Json(json!({ "result": "ok", "cards": [] }));
    }
    Json(json!({
        "result": "synchronized",
        "cards": [{ "cardId": "c1" }],
        "loans": [
            { "id": "a", "cardId": "c1", "title": "Audio Book", "type": { "id": "audiobook" },
              "formats": [{ "id": "audiobook-mp3" }] },
            { "id": "k", "cardId": "c1", "title": "Kindle Only", "type": { "id": "ebook" },
              "formats": [{ "id": "ebook-kindle" }] },
            { "id": "s", "cardId": "c1", "title": "Stream Only", "type": { "id": "audiobook" },
              "formats": [{ "id": "audiobook-overdrive" }] }
        ]
    }))
}

async fn renew() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "upstream": { "userExplanation": "no renewals left" } })),
    )
}

async fn start(account: Arc<Account>) -> String {
    let app = Router::new()
        .route("/chip", post(chip))
        .route("/chip/clone/code", post(clone_code))
        .route("/chip/sync", get(sync))
        .route("/card/c1/loan/a", axum::routing::put(renew).delete(|| async { StatusCode::NOT_FOUND }))
        .route("/return", get(|| async { StatusCode::FORBIDDEN }))
        .with_state(account);
    serve(app).await
}

fn config(base: &str) -> ClientConfig {
    ClientConfig::builder()
        .base_url(base)
        .retry_delay(Duration::from_millis(10))
        .max_retries(0)
        .poll_interval(Duration::from_millis(10))
        .link_timeout(Duration::from_millis(200))
        .build()
}

fn linked_client(base: &str) -> LibbyClient {
    let identity = Identity {
        device_id: "chip-1".to_string(),
        access_token: AccessToken {
            token: "token".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
        },
        refresh_token: "refresh".to_string(),
        linked_at: Some(Utc::now()),
    };
    LibbyClient::with_config(Arc::new(CredentialStore::in_memory(Some(identity))), config(base)).unwrap()
}

fn linked_account() -> Arc<Account> {
    Arc::new(Account {
        link_after_polls: Some(0),
        submitted_code: Mutex::new(Some("00000000".to_string())),
        ..Default::default()
    })
}

async fn loan(client: &LibbyClient, id: &str) -> Loan {
    client
        .list_loans(&LoanFilter::all())
        .await
        .unwrap()
        .into_iter()
        .find(|l| l.id == id)
        .unwrap()
}

#[tokio::test]
async fn test_setup_code_links_after_polling() {
    let account = Arc::new(Account {
        link_after_polls: Some(2),
        ..Default::default()
    });
    let base = start(account.clone()).await;
    let client = LibbyClient::with_config(Arc::new(CredentialStore::in_memory(None)), config(&base)).unwrap();

    let identity = client.authenticate(Some("12345678")).await.unwrap();
    assert!(identity.is_linked());
    assert_eq!(account.submitted_code.lock().unwrap().as_deref(), Some("12345678"));
    assert_eq!(account.polls.load(Ordering::SeqCst), 3);
    // the chip is re-issued once the account is linked
    assert_eq!(account.chips.load(Ordering::SeqCst), 2);
    assert_eq!(identity.access_token.token, "token-2");

    let stored = client.credentials().current().await.unwrap();
    assert_eq!(stored, identity);

    // a linked identity is reused without another handshake
    client.authenticate(Some("12345678")).await.unwrap();
    assert_eq!(account.chips.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_setup_code_never_confirmed_times_out() {
    let account = Arc::new(Account::default());
    let base = start(account.clone()).await;
    let client = LibbyClient::with_config(Arc::new(CredentialStore::in_memory(None)), config(&base)).unwrap();

    let err = client.authenticate(Some("12345678")).await.unwrap_err();
    assert!(matches!(err, LoanError::AuthTimeout { .. }), "{:?}", err);
    assert!(err.is_auth_error());
    assert!(account.polls.load(Ordering::SeqCst) > 1);
    let stored = client.credentials().current().await.unwrap();
    assert!(!stored.is_linked());
}

#[tokio::test]
async fn test_return_of_unknown_loan_counts_as_returned() {
    let base = start(linked_account()).await;
    let client = linked_client(&base);
    let loan = loan(&client, "a").await;

    let outcome = client.return_loan(&loan).await.unwrap();
    assert_eq!(outcome, ReturnOutcome::AlreadyReturned);
}

#[tokio::test]
async fn test_refused_early_return_counts_as_returned() {
    let base = start(linked_account()).await;
    let odm = OdmFile::parse(&odm_xml(&base, 1, false)).unwrap();
    let legacy = LegacyLicenseClient::new(Duration::from_secs(5)).unwrap();

    let outcome = legacy.return_loan(&odm).await.unwrap();
    assert_eq!(outcome, ReturnOutcome::AlreadyReturned);
}

#[tokio::test]
async fn test_refused_renewal_carries_service_explanation() {
    let base = start(linked_account()).await;
    let client = linked_client(&base);
    let loan = loan(&client, "a").await;

    match client.renew_loan(&loan).await {
        Err(LoanError::RenewalNotAllowed { loan, reason }) => {
            assert_eq!(loan, "Audio Book");
            assert_eq!(reason, "no renewals left");
        }
        other => panic!("unexpected renewal result: {:?}", other),
    }
}

#[tokio::test]
async fn test_loan_without_usable_format_is_not_fulfillable() {
    let base = start(linked_account()).await;
    let client = linked_client(&base);
    let work = TempDir::new().unwrap();

    let kindle = loan(&client, "k").await;
    for mode in [ResolveMode::Direct, ResolveMode::ViaLicenseFile] {
        let err = client.resolve_manifest(&kindle, mode, work.path()).await.unwrap_err();
        assert!(matches!(err, LoanError::LoanNotFulfillable { .. }), "{:?}: {:?}", mode, err);
    }

    let stream_only = loan(&client, "s").await;
    let err = client
        .resolve_manifest(&stream_only, ResolveMode::ViaLicenseFile, work.path())
        .await
        .unwrap_err();
    assert_eq!(err.category(), "loan_not_fulfillable");
    // nothing was fetched for a loan that cannot be fulfilled
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}
