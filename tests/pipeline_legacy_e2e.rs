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

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::{body_of, fake_tools, fast_retry, odm_xml, part_body, serve, LICENSE_XML};
use loanfetch::api::{LegacyLicenseClient, LicenseFileResolver, ReturnOutcome};
use loanfetch::download::{DownloadManager, TaskState};
use loanfetch::pipeline::{LoanJob, LoanState, Orchestrator};
use loanfetch::PipelineConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct Library {
    license_requests: AtomicUsize,
    part_requests: Mutex<HashMap<String, usize>>,
    returns: AtomicUsize,
    /// Answer the license request with 404
    deny_license: bool,
    /// Serve a cover image instead of 404
    serve_cover: bool,
    /// Part that always answers 404
    missing_part: Option<&'static str>,
}

impl Library {
    fn part_hits(&self, name: &str) -> usize {
        self.part_requests.lock().unwrap().get(name).copied().unwrap_or(0)
    }
}

async fn license(State(lib): State<Arc<Library>>, Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
    lib.license_requests.fetch_add(1, Ordering::SeqCst);
    if lib.deny_license {
        return (StatusCode::NOT_FOUND, String::new());
    }
    assert!(query.contains_key("MediaID"));
    assert!(query.contains_key("Hash"));
    (StatusCode::OK, LICENSE_XML.to_string())
}

async fn part(State(lib): State<Arc<Library>>, UrlPath(name): UrlPath<String>) -> impl IntoResponse {
    let hits = {
        let mut requests = lib.part_requests.lock().unwrap();
        let hits = requests.entry(name.clone()).or_insert(0);
        *hits += 1;
        *hits
    };
    if lib.missing_part == Some(name.as_str()) {
        return (StatusCode::NOT_FOUND, Vec::new());
    }
    // part 2 fails once
    if name == "Part02.mp3" && hits == 1 {
        return (StatusCode::SERVICE_UNAVAILABLE, Vec::new());
    }
    let number: u32 = name.trim_start_matches("Part").trim_end_matches(".mp3").parse().unwrap();
    (StatusCode::OK, part_body(number))
}

async fn early_return(State(lib): State<Arc<Library>>) -> StatusCode {
    lib.returns.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn cover(State(lib): State<Arc<Library>>) -> impl IntoResponse {
    if lib.serve_cover {
        (StatusCode::OK, b"JFIF-cover".to_vec())
    } else {
        (StatusCode::NOT_FOUND, Vec::new())
    }
}

async fn start(lib: Arc<Library>) -> String {
    let app = Router::new()
        .route("/license", get(license))
        .route("/dl/:name", get(part))
        .route("/return", get(early_return))
        .route("/cover.jpg", get(cover))
        .with_state(lib);
    serve(app).await
}

struct Fixture {
    _dir: TempDir,
    odm_path: PathBuf,
    output: PathBuf,
}

async fn fixture(base: &str, cover: bool) -> Fixture {
    let dir = TempDir::new().unwrap();
    let odm_path = dir.path().join("Sample Book.odm");
    tokio::fs::write(&odm_path, odm_xml(base, 3, cover)).await.unwrap();
    let output = dir.path().join("out");
    Fixture {
        _dir: dir,
        odm_path,
        output,
    }
}

fn job(odm_path: &PathBuf) -> LoanJob {
    let legacy = Arc::new(LegacyLicenseClient::new(Duration::from_secs(5)).unwrap());
    LoanJob::new(Arc::new(LicenseFileResolver::new(legacy, odm_path.clone())))
}

#[tokio::test]
async fn test_three_part_loan_survives_transient_failure() {
    let lib = Arc::new(Library::default());
    let base = start(lib.clone()).await;
    let fx = fixture(&base, true).await;

    let (tools, tags) = fake_tools();
    let config = PipelineConfig::new().output_dir(&fx.output).retry(fast_retry(1));
    let orchestrator = Orchestrator::new(DownloadManager::new().unwrap(), tools, config);

    let report = orchestrator.run_batch(vec![job(&fx.odm_path)], Vec::new()).await;
    assert_eq!(report.exit_code(), 0);

    let outcome = &report.outcomes[0];
    assert_eq!(
        outcome.transitions,
        vec![
            LoanState::Resolving,
            LoanState::Downloading,
            LoanState::Processing,
            LoanState::Done
        ]
    );
    assert_eq!(lib.part_hits("Part02.mp3"), 2);
    assert_eq!(lib.part_hits("Part01.mp3"), 1);

    let artifact = outcome.artifact.as_ref().unwrap();
    assert_eq!(artifact.files.len(), 3);
    for (i, file) in artifact.files.iter().enumerate() {
        assert_eq!(body_of(file), part_body(i as u32 + 1));

        let written = tags.tags_of(file);
        assert_eq!(written.get("artist").map(String::as_str), Some("Author A;Author B"));
        assert_eq!(written.get("track"), Some(&format!("{:02}/03", i + 1)));
    }
    assert_eq!(artifact.tags.get("artist").map(String::as_str), Some("Author A;Author B"));

    // the cover 404 only costs a warning
    assert!(artifact.cover.is_none());
    assert!(outcome.warnings.iter().any(|w| w.contains("cover.jpg")));

    let starts: Vec<u64> = artifact.chapters.iter().map(|c| c.start_ms).collect();
    assert_eq!(starts, vec![0, 1_800_000, 3_600_000]);
    assert!(fx.odm_path.with_extension("license").exists());
    assert_eq!(lib.returns.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rerun_reuses_parts_and_license_then_returns() {
    let lib = Arc::new(Library::default());
    let base = start(lib.clone()).await;
    let fx = fixture(&base, false).await;

    let (tools, _tags) = fake_tools();
    let config = PipelineConfig::new().output_dir(&fx.output).retry(fast_retry(1));
    let orchestrator = Orchestrator::new(DownloadManager::new().unwrap(), tools, config);

    let first = orchestrator.run_loan(job(&fx.odm_path)).await;
    assert!(first.is_done());
    assert_eq!(first.returned, None);

    // tagging rewrote every part, so none matches its declared size any more
    for file in &first.artifact.as_ref().unwrap().files {
        let size = tokio::fs::metadata(file).await.unwrap().len();
        assert_ne!(size, part_body(1).len() as u64);
    }

    let second = orchestrator.run_loan(job(&fx.odm_path).return_after(true)).await;
    assert!(second.is_done());
    assert!(second.downloads.iter().all(|t| t.reused_existing && t.attempts == 0));
    assert_eq!(lib.license_requests.load(Ordering::SeqCst), 1);
    assert_eq!(lib.part_hits("Part01.mp3"), 1);
    assert_eq!(lib.part_hits("Part02.mp3"), 2);
    assert_eq!(lib.part_hits("Part03.mp3"), 1);
    assert_eq!(second.returned, Some(ReturnOutcome::Returned));
    assert_eq!(lib.returns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_denied_license_fails_loan_without_returning() {
    let lib = Arc::new(Library {
        deny_license: true,
        ..Default::default()
    });
    let base = start(lib.clone()).await;
    let fx = fixture(&base, false).await;

    let (tools, _tags) = fake_tools();
    let config = PipelineConfig::new().output_dir(&fx.output).retry(fast_retry(0));
    let orchestrator = Orchestrator::new(DownloadManager::new().unwrap(), tools, config);

    let report = orchestrator
        .run_batch(vec![job(&fx.odm_path).return_after(true)], Vec::new())
        .await;
    assert_eq!(report.exit_code(), 1);
    assert!(report.aborted.is_none());

    let outcome = &report.outcomes[0];
    assert!(matches!(outcome.state(), LoanState::Failed(_)));
    assert_eq!(outcome.error_category, Some("license_denied"));
    assert_eq!(lib.returns.load(Ordering::SeqCst), 0);
    assert_eq!(lib.part_hits("Part01.mp3"), 0);
}

#[tokio::test]
async fn test_merge_writes_single_tagged_file() {
    let lib = Arc::new(Library::default());
    let base = start(lib.clone()).await;
    let fx = fixture(&base, false).await;

    let (tools, tags) = fake_tools();
    let mut config = PipelineConfig::new().output_dir(&fx.output).retry(fast_retry(1));
    config.assembly.merge = true;
    config.assembly.export_opf = true;
    let orchestrator = Orchestrator::new(DownloadManager::new().unwrap(), tools, config);

    let outcome = orchestrator.run_loan(job(&fx.odm_path)).await;
    assert!(outcome.is_done(), "{:?}", outcome.state());

    let artifact = outcome.artifact.as_ref().unwrap();
    let merged = artifact.merged.clone().unwrap();
    assert_eq!(artifact.files, vec![merged.clone()]);
    assert_eq!(merged.extension().and_then(|e| e.to_str()), Some("mp3"));

    let expected: Vec<u8> = (1..=3).flat_map(part_body).collect();
    assert_eq!(body_of(&merged), expected);

    let merged_tags = tags.tags_of(&merged);
    assert_eq!(merged_tags.get("title").map(String::as_str), Some("Sample Book"));
    assert!(!merged_tags.contains_key("track"));
    assert_eq!(tags.chapters_of(&merged).len(), 3);
    assert_eq!(artifact.sidecars.len(), 1);

    // a merged file on disk short-circuits the next run
    let again = orchestrator.run_loan(job(&fx.odm_path)).await;
    assert!(again.is_done());
    assert!(again.downloads.is_empty());
    assert_eq!(lib.part_hits("Part01.mp3"), 1);
}

#[tokio::test]
async fn test_cover_is_embedded_in_every_part() {
    let lib = Arc::new(Library {
        serve_cover: true,
        ..Default::default()
    });
    let base = start(lib.clone()).await;
    let fx = fixture(&base, true).await;

    let (tools, tags) = fake_tools();
    let config = PipelineConfig::new().output_dir(&fx.output).retry(fast_retry(1));
    let orchestrator = Orchestrator::new(DownloadManager::new().unwrap(), tools, config);

    let outcome = orchestrator.run_loan(job(&fx.odm_path)).await;
    assert!(outcome.is_done());
    assert!(outcome.warnings.is_empty(), "{:?}", outcome.warnings);

    let artifact = outcome.artifact.as_ref().unwrap();
    assert!(artifact.cover.is_some());
    for file in &artifact.files {
        assert_eq!(tags.cover_of(file).as_deref(), Some("cover.jpg"));
    }
}

#[tokio::test]
async fn test_missing_part_is_reported_as_failed_task() {
    let lib = Arc::new(Library {
        missing_part: Some("Part03.mp3"),
        ..Default::default()
    });
    let base = start(lib.clone()).await;
    let fx = fixture(&base, false).await;

    let (tools, _tags) = fake_tools();
    let config = PipelineConfig::new().output_dir(&fx.output).retry(fast_retry(2));
    let orchestrator = Orchestrator::new(DownloadManager::new().unwrap(), tools, config);

    let outcome = orchestrator.run_loan(job(&fx.odm_path).return_after(true)).await;
    assert!(matches!(outcome.state(), LoanState::Failed(_)));
    assert_eq!(outcome.error_category, Some("download_failed"));
    assert_eq!(outcome.returned, None);

    assert_eq!(outcome.downloads.len(), 3);
    let failed = &outcome.downloads[2];
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.attempts, 1);
    assert!(failed.last_error.as_deref().unwrap().contains("404"));
    assert!(outcome.downloads[..2].iter().all(|t| t.state == TaskState::Succeeded));
}
