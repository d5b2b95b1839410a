use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;
use unslave::config::{RunConfig, RunOverrides, Settings};
use unslave::context::CallContext;
use unslave::crawl::{CrawlController, Granularity, SearchCursor};
use unslave::credentials;
use unslave::git_ops::GitCli;
use unslave::github::GitHubClient;
use unslave::hosting::Hosting;
use unslave::ledger::Ledger;
use unslave::pipeline::Remediator;
use unslave::quota::ApiResource;
use unslave::retry::{with_retry, Call};
use unslave::rewrite::{default_rules, BoundaryPolicy, Rewriter};
use unslave::runner::{RunSummary, Runner};
use unslave::workspace::Workspace;

#[derive(Parser, Debug)]
#[command(
    name = "unslave",
    about = "Find repositories using master/slave terminology and propose a fix upstream",
    version
)]
struct Args {
    /// GitHub token (falls back to GITHUB_TOKEN, then the keychain)
    #[arg(long)]
    token: Option<String>,

    /// Commit email (defaults to the account's public or noreply address)
    #[arg(long)]
    email: Option<String>,

    /// Crawl start: RFC 3339, YYYY-MM-DD or YYYY-MM-DDTHH (default: now)
    #[arg(long)]
    since: Option<String>,

    /// Stop once the crawl window moves before this time
    #[arg(long)]
    until: Option<String>,

    /// Width of each search window
    #[arg(long, value_enum)]
    granularity: Option<Granularity>,

    /// Directory forks are cloned into (wiped for every repository)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Skip forks larger than this many KB
    #[arg(long)]
    max_size_kb: Option<u64>,

    /// Where terms may match
    #[arg(long, value_enum)]
    boundary: Option<BoundaryPolicy>,

    /// Restrict the search to one language
    #[arg(long)]
    language: Option<String>,

    /// Stop after this many search windows
    #[arg(long)]
    max_windows: Option<u32>,

    /// Save the resolved token to the system keychain
    #[arg(long)]
    store_token: bool,

    /// Log level (trace, debug, info, warn, error) or a filter directive
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Settings file (default: <config dir>/unslave/config.json)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config_path = args
        .config
        .clone()
        .or_else(Settings::config_path)
        .context("Could not determine config directory")?;
    let state_dir = config_path
        .parent()
        .map(PathBuf::from)
        .context("Config path has no parent directory")?;
    let settings = Settings::load_from(&config_path);

    let (token, source) = credentials::resolve_token(args.token.clone())?;
    if args.store_token {
        credentials::set_github_token(&token)
            .map_err(anyhow::Error::msg)
            .context("Failed to store token in keychain")?;
        info!("token stored in keychain");
    }

    let overrides = RunOverrides {
        email: args.email,
        since: args.since,
        until: args.until,
        granularity: args.granularity,
        workdir: args.workdir,
        max_size_kb: args.max_size_kb,
        boundary: args.boundary,
        language: args.language,
        max_windows: args.max_windows,
    };
    let run = RunConfig::resolve(settings, overrides, Utc::now(), &state_dir)?;

    let ctx = CallContext::system(run.pacing);
    let hosting = Arc::new(GitHubClient::new(&token, ctx.quota().clone())?);

    let client = hosting.as_ref();
    let mut operator = with_retry(
        &ctx,
        Call::api("current user", ApiResource::Core),
        &run.remediation.retry.read,
        move || client.current_operator(),
    )
    .await
    .context("Failed to resolve the GitHub account for this token")?;
    if let Some(email) = run.email.clone() {
        operator.email = email;
    }
    info!(login = %operator.login, token_source = %source, "authenticated");

    let rewriter =
        Rewriter::new(default_rules(), run.boundary).context("Failed to build rewrite rules")?;
    let ledger = Ledger::open(&run.ledger_path)?;
    let workspace = Workspace::acquire(&run.workdir)?;

    let crawl = CrawlController::new(
        Arc::clone(&hosting),
        run.filters.clone(),
        run.until,
        run.remediation.retry.search,
    );
    let remediator = Remediator::new(
        hosting,
        Arc::new(GitCli::default()),
        rewriter,
        ledger,
        workspace,
        operator,
        token,
        run.remediation.clone(),
    );
    let mut runner = Runner::new(crawl, remediator, run.max_windows);

    let cancel = ctx.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current step");
            cancel.cancel();
        }
    });

    info!(
        since = %run.since.to_rfc3339(),
        granularity = ?run.granularity,
        workdir = %run.workdir.display(),
        "starting crawl"
    );
    let cursor = SearchCursor::starting_at(run.since, run.granularity, run.per_page);
    let summary = runner.run(&ctx, cursor).await;
    print_summary(&summary);
    Ok(())
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("  Windows crawled:   {}", summary.windows);
    println!("  Search pages:      {}", summary.pages);
    println!("  Repositories:      {}", summary.attempted);
    println!("  Proposals opened:  {}", summary.proposed);
    println!("  Skipped:           {}", summary.skipped);
    println!("  Failed:            {}", summary.failed);
    if summary.search_errors > 0 {
        println!("  Failed windows:    {}", summary.search_errors);
    }
    for url in &summary.proposals {
        println!("    {}", url);
    }
    if summary.cancelled {
        println!("  (interrupted)");
    }
}
