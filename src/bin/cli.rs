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

use anyhow::{bail, Context};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use loanfetch::api::{
    CredentialStore, LegacyLicenseClient, LibbyClient, LicenseFileResolver, Loan, LoanFilter, OdmFile,
    ResolveMode, SessionResolver,
};
use loanfetch::audio::{MediaTools, MergeFormat};
use loanfetch::download::{DownloadManager, DownloadProgress, ProgressCallback, RetryPolicy};
use loanfetch::download::progress::DownloadState;
use loanfetch::pipeline::{select, BatchReport, LoanJob, Orchestrator, Selection};
use loanfetch::{LoanError, PipelineConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loanfetch")]
#[command(about = "Download library loans and turn them into tagged audiobooks", long_about = None)]
#[command(version)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Settings folder holding the linked identity
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List or download loans of a linked account
    Libby {
        #[command(flatten)]
        loans: LoanArgs,

        #[command(flatten)]
        process: ProcessArgs,

        /// 8-digit setup code from the companion app (Copy To Another Device)
        #[arg(long = "setup-code", short = 'c')]
        setup_code: Option<String>,

        /// Forget the linked identity and exit
        #[arg(long)]
        reset: bool,

        /// Read audiobooks straight from the web manifest instead of the loan file
        #[arg(long)]
        direct: bool,

        /// Return each loan after it downloaded successfully
        #[arg(long = "return-after")]
        return_after: bool,
    },
    /// Return loans of a linked account
    LibbyReturn {
        #[command(flatten)]
        loans: LoanArgs,
    },
    /// Renew loans of a linked account
    LibbyRenew {
        #[command(flatten)]
        loans: LoanArgs,
    },
    /// Download a loan from a `.odm` file
    Dl {
        odm: PathBuf,

        #[command(flatten)]
        process: ProcessArgs,

        /// Return the loan after it downloaded successfully
        #[arg(long = "return-after")]
        return_after: bool,
    },
    /// Return a loan through its `.odm` file
    Ret { odm: PathBuf },
    /// Show what a `.odm` file contains
    Info {
        odm: PathBuf,

        /// Print JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Clone, Default)]
struct LoanArgs {
    /// Include ebooks
    #[arg(long)]
    ebooks: bool,

    /// Include magazines
    #[arg(long)]
    magazines: bool,

    /// Loan numbers as listed (1-based)
    #[arg(long, num_args = 1..)]
    select: Vec<usize>,

    /// Loan ids
    #[arg(long = "select-id", num_args = 1..)]
    select_id: Vec<String>,

    /// The N most recent loans
    #[arg(long)]
    latest: Option<usize>,
}

impl LoanArgs {
    fn filter(&self) -> LoanFilter {
        LoanFilter {
            audiobooks: true,
            ebooks: self.ebooks,
            magazines: self.magazines,
        }
    }

    fn selection(&self) -> Selection {
        Selection {
            indices: self.select.clone(),
            ids: self.select_id.clone(),
            latest: self.latest,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MergeFormatArg {
    Mp3,
    M4b,
}

impl From<MergeFormatArg> for MergeFormat {
    fn from(value: MergeFormatArg) -> Self {
        match value {
            MergeFormatArg::Mp3 => MergeFormat::Mp3,
            MergeFormatArg::M4b => MergeFormat::M4b,
        }
    }
}

#[derive(Args, Clone, Default)]
struct ProcessArgs {
    /// Output folder
    #[arg(short = 'd', long)]
    output: Option<PathBuf>,

    /// Retries per part
    #[arg(short = 'r', long)]
    retries: Option<u32>,

    /// Seconds allowed for one download attempt
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Parts downloaded at the same time
    #[arg(long)]
    jobs: Option<usize>,

    /// Merge parts into one file
    #[arg(short = 'm', long)]
    merge: bool,

    #[arg(long = "merge-format", value_enum)]
    merge_format: Option<MergeFormatArg>,

    /// Do not write chapters
    #[arg(long = "no-chapters")]
    no_chapters: bool,

    /// Delete the parts once merged
    #[arg(long = "delete-parts")]
    delete_parts: bool,

    /// Replace tags already present in the parts
    #[arg(long = "overwrite-tags")]
    overwrite_tags: bool,

    /// Joins multi-valued tags
    #[arg(long = "tag-delimiter")]
    tag_delimiter: Option<String>,

    /// Write an OPF package document
    #[arg(long)]
    opf: bool,

    /// Write debug.json
    #[arg(long = "write-json")]
    write_json: bool,

    /// Book folder template, e.g. "{title} - {author}"
    #[arg(long = "book-folder")]
    book_folder: Option<String>,

    /// Book file template, e.g. "{title}"
    #[arg(long = "book-file")]
    book_file: Option<String>,
}

impl ProcessArgs {
    fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(ref output) = self.output {
            config.output_dir = output.clone();
        }
        if self.retries.is_some() || self.timeout.is_some() {
            let retries = self.retries.unwrap_or(config.retry.max_retries);
            let timeout = self.timeout.unwrap_or(config.retry.attempt_timeout_secs);
            config.retry = RetryPolicy {
                backoff_base_ms: config.retry.backoff_base_ms,
                ..RetryPolicy::new(retries, Duration::from_secs(timeout))
            };
        }
        if let Some(jobs) = self.jobs {
            config = config.part_concurrency(jobs);
        }
        if let Some(ref template) = self.book_folder {
            config.book_folder_template = template.clone();
        }
        if let Some(ref template) = self.book_file {
            config.book_file_template = template.clone();
        }

        let assembly = &mut config.assembly;
        assembly.merge |= self.merge;
        if let Some(format) = self.merge_format {
            assembly.merge_format = format.into();
        }
        if self.no_chapters {
            assembly.chapters = false;
        }
        assembly.delete_parts_after_merge |= self.delete_parts;
        assembly.overwrite_tags |= self.overwrite_tags;
        if let Some(ref delimiter) = self.tag_delimiter {
            assembly.tag_delimiter = delimiter.clone();
        }
        assembly.export_opf |= self.opf;
        assembly.export_debug_json |= self.write_json;
        config
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "loanfetch=info",
        1 => "loanfetch=debug",
        _ => "loanfetch=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn progress_logger() -> ProgressCallback {
    Arc::new(|progress: DownloadProgress| match progress.state {
        DownloadState::Completed | DownloadState::Skipped => info!("{}", progress.display_string()),
        DownloadState::Retrying | DownloadState::Failed => warn!("{}", progress.display_string()),
        _ => tracing::debug!("{}", progress.display_string()),
    })
}

fn load_config(cli: &Cli) -> anyhow::Result<PipelineConfig> {
    let mut config = match cli.config {
        Some(ref path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    if let Some(ref settings) = cli.settings {
        config.settings_dir = settings.clone();
    }
    Ok(config)
}

fn orchestrator(config: PipelineConfig, client: Option<&LibbyClient>) -> anyhow::Result<Orchestrator> {
    config.validate()?;
    let downloads = match client {
        Some(client) => DownloadManager::with_cookie_jar(client.cookie_jar())?,
        None => DownloadManager::new()?,
    }
    .with_progress(progress_logger());
    let tools = MediaTools::ffmpeg(config.tool_timeout_duration());
    Ok(Orchestrator::new(downloads, tools, config))
}

async fn linked_client(config: &PipelineConfig, setup_code: Option<&str>) -> anyhow::Result<Arc<LibbyClient>> {
    let store = CredentialStore::open(&config.settings_dir)
        .await
        .with_context(|| format!("opening settings in {}", config.settings_dir.display()))?;
    let client = LibbyClient::new(Arc::new(store))?;
    client.authenticate(setup_code).await.context("linking account")?;
    Ok(Arc::new(client))
}

fn print_loans(loans: &[Loan]) {
    if loans.is_empty() {
        println!("No loans.");
        return;
    }
    for (index, loan) in loans.iter().enumerate() {
        let expires = loan
            .expires_at
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:>3}. {:<50} {:<10} expires {}  [{}]",
            index + 1,
            loan.label(),
            loan.format.as_str(),
            expires,
            loan.id
        );
    }
}

fn print_report(report: &BatchReport) {
    for outcome in &report.outcomes {
        let files = outcome
            .artifact
            .as_ref()
            .map(|a| a.files.len())
            .unwrap_or_default();
        println!(
            "{:<10} {} ({} file(s), {} warning(s))",
            outcome.state().as_str(),
            outcome.label,
            files,
            outcome.warnings.len()
        );
        if let loanfetch::LoanState::Failed(ref reason) = outcome.state() {
            println!("           {}", reason);
        }
    }
    for entry in &report.not_found {
        println!("not found  {}", entry);
    }
    if let Some(ref reason) = report.aborted {
        println!("aborted    {}", reason);
    }
}

/// Pick loans from the listing, or list them when nothing was selected
async fn selected_loans(client: &LibbyClient, args: &LoanArgs) -> anyhow::Result<Option<(Vec<Loan>, Vec<String>)>> {
    let loans = client.list_loans(&args.filter()).await.context("listing loans")?;
    let selection = args.selection();
    if selection.is_empty() {
        print_loans(&loans);
        return Ok(None);
    }
    let selected = select(&loans, &selection);
    for entry in &selected.not_found {
        warn!(entry = %entry, "not found");
    }
    Ok(Some((
        selected.loans.into_iter().map(|(_, loan)| loan).collect(),
        selected.not_found,
    )))
}

async fn run_libby(
    config: PipelineConfig,
    loans_args: LoanArgs,
    setup_code: Option<String>,
    reset: bool,
    direct: bool,
    return_after: bool,
) -> anyhow::Result<i32> {
    if reset {
        let store = CredentialStore::open(&config.settings_dir).await?;
        store.reset().await?;
        println!("Identity removed from {}", config.settings_dir.display());
        return Ok(0);
    }

    let client = linked_client(&config, setup_code.as_deref()).await?;
    let Some((loans, not_found)) = selected_loans(&client, &loans_args).await? else {
        return Ok(0);
    };

    let mode = if direct { ResolveMode::Direct } else { config.resolve_mode };
    let return_after = return_after || config.return_after_download;
    let jobs = loans
        .into_iter()
        .map(|loan| {
            LoanJob::new(Arc::new(SessionResolver::new(client.clone(), loan, mode))).return_after(return_after)
        })
        .collect();

    let orchestrator = orchestrator(config, Some(&client))?;
    let report = orchestrator.run_batch(jobs, not_found).await;
    print_report(&report);
    Ok(report.exit_code())
}

async fn run_libby_return(config: PipelineConfig, args: LoanArgs, renew: bool) -> anyhow::Result<i32> {
    let client = linked_client(&config, None).await?;
    // unmatched selections were already reported and do not fail the run
    let Some((loans, _not_found)) = selected_loans(&client, &args).await? else {
        return Ok(0);
    };

    let mut failures = 0;
    for loan in &loans {
        if renew {
            match client.renew_loan(loan).await {
                Ok(renewed) => println!(
                    "Renewed {} until {}",
                    loan.label(),
                    renewed
                        .expires_at
                        .map(|d| d.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string())
                ),
                Err(e) if e.is_auth_error() => return Err(e.into()),
                Err(e) => {
                    if fails_run(&e) {
                        failures += 1;
                    }
                    println!("Could not renew {}: {}", loan.label(), e.user_message());
                }
            }
        } else {
            match client.return_loan(loan).await {
                Ok(_) => println!("Returned {}", loan.label()),
                Err(e) if e.is_auth_error() => return Err(e.into()),
                Err(e) => {
                    if fails_run(&e) {
                        failures += 1;
                    }
                    println!("Could not return {}: {}", loan.label(), e.user_message());
                }
            }
        }
    }
    Ok(if failures == 0 { 0 } else { 1 })
}

/// Whether a per-loan return or renewal error makes the exit code non-zero
///
/// A refused renewal is the service's answer, not a failure of the run.
fn fails_run(error: &LoanError) -> bool {
    !matches!(error, LoanError::RenewalNotAllowed { .. })
}

async fn run_odm(config: PipelineConfig, odm: &Path, return_after: bool) -> anyhow::Result<i32> {
    if !odm.exists() {
        bail!("{} does not exist", odm.display());
    }
    let legacy = Arc::new(LegacyLicenseClient::new(Duration::from_secs(30))?);
    let return_after = return_after || config.return_after_download;
    let job = LoanJob::new(Arc::new(LicenseFileResolver::new(legacy, odm.to_path_buf()))).return_after(return_after);

    let orchestrator = orchestrator(config, None)?;
    let report = orchestrator.run_batch(vec![job], Vec::new()).await;
    print_report(&report);
    Ok(report.exit_code())
}

async fn run_info(odm: &Path, json: bool) -> anyhow::Result<i32> {
    let parsed = OdmFile::load(odm).await.with_context(|| format!("reading {}", odm.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&parsed.metadata)?);
        return Ok(0);
    }

    let meta = &parsed.metadata;
    println!("Title:       {}", meta.title);
    if let Some(ref subtitle) = meta.subtitle {
        println!("Subtitle:    {}", subtitle);
    }
    println!("Authors:     {}", meta.authors.join(", "));
    if !meta.narrators.is_empty() {
        println!("Narrators:   {}", meta.narrators.join(", "));
    }
    if let Some(ref series) = meta.series {
        println!("Series:      {}", series);
    }
    if let Some(ref publisher) = meta.publisher {
        println!("Publisher:   {}", publisher);
    }
    let total = parsed.total_duration_ms() / 1000;
    println!("Duration:    {}:{:02}:{:02}", total / 3600, (total % 3600) / 60, total % 60);
    println!("Parts:       {}", parsed.parts.len());
    for part in &parsed.parts {
        let size = part
            .filesize
            .map(DownloadProgress::bytes_string)
            .unwrap_or_else(|| "?".to_string());
        println!("  {:>3}. {} ({})", part.number, part.filename, size);
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(&cli)?;

    let code = match cli.command {
        Commands::Libby {
            loans,
            process,
            setup_code,
            reset,
            direct,
            return_after,
        } => run_libby(process.apply(config), loans, setup_code, reset, direct, return_after).await?,
        Commands::LibbyReturn { loans } => run_libby_return(config, loans, false).await?,
        Commands::LibbyRenew { loans } => run_libby_return(config, loans, true).await?,
        Commands::Dl {
            odm,
            process,
            return_after,
        } => run_odm(process.apply(config), &odm, return_after).await?,
        Commands::Ret { odm } => {
            let legacy = LegacyLicenseClient::new(Duration::from_secs(30))?;
            let parsed = OdmFile::load(&odm).await?;
            let outcome = legacy.return_loan(&parsed).await?;
            println!("{}: {:?}", parsed.metadata.title, outcome);
            0
        }
        Commands::Info { odm, json } => run_info(&odm, json).await?,
    };

    std::process::exit(code)
}
