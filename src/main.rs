use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use eventagg::config::{Config, StoreBackend};
use eventagg::event::RawEvent;
use eventagg::migrate::{Migrator, SqliteMigrator};
use eventagg::node::Node;
use eventagg::store::sqlite::open_connection;
use tracing_subscriber::{fmt, EnvFilter};

/// Events appended per store call while ingesting.
const INGEST_CHUNK: usize = 500;

/// Cluster-coordinated usage event aggregator.
#[derive(Parser)]
#[command(name = "eventagg", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and health server until SIGINT/SIGTERM (default).
    Run,
    /// Run every job once and exit.
    Once,
    /// Populate date/time dimensions and exit.
    Populate,
    /// Append raw events from a JSON-lines file.
    Ingest {
        /// File with one JSON raw event per line.
        file: PathBuf,
    },
    /// Manage the SQLite schema.
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
    /// Print version information and exit.
    Version,
}

#[derive(Subcommand, Clone, Copy)]
enum MigrateAction {
    /// Apply all pending migrations.
    Up,
    /// Roll back the last applied migration.
    Down,
    /// Show applied and latest versions.
    Status,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run);

    if let Command::Version = command {
        println!("eventagg {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if cli.config.is_none() {
        tracing::warn!("no --config given, using defaults");
    }

    match command {
        Command::Migrate { action } => migrate(&cfg, action),
        Command::Ingest { file } => ingest(cfg, &file),
        Command::Populate => {
            let node = Node::new(cfg)?;
            let outcome = node.engine().populate_dimensions()?;
            tracing::info!(?outcome, "dimension population finished");
            Ok(())
        }
        Command::Once => run_once(cfg),
        Command::Run => {
            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting eventagg",
            );

            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("building tokio runtime")?;

            rt.block_on(run(cfg))
        }
        Command::Version => Ok(()),
    }
}

async fn run(cfg: Config) -> Result<()> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .context("registering SIGTERM handler")?;

    let mut node = Node::new(cfg)?;
    node.start().await?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for SIGINT")?;
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    node.stop().await?;

    tracing::info!("eventagg stopped");

    Ok(())
}

fn run_once(cfg: Config) -> Result<()> {
    let node = Node::new(cfg)?;
    let engine = node.engine();

    let populated = engine.populate_dimensions()?;
    tracing::info!(outcome = ?populated, "dimension population");

    let aggregated = engine.run_aggregation()?;
    tracing::info!(outcome = ?aggregated, "aggregation");

    let purged = engine.purge_raw_events()?;
    tracing::info!(outcome = ?purged, "raw event purge");

    let expired = engine.purge_event_sessions()?;
    tracing::info!(outcome = ?expired, "event session purge");

    Ok(())
}

fn ingest(cfg: Config, path: &Path) -> Result<()> {
    if cfg.store.backend == StoreBackend::Memory {
        bail!("ingest requires a persistent store backend");
    }

    let node = Node::new(cfg)?;
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;

    let mut chunk: Vec<RawEvent> = Vec::with_capacity(INGEST_CHUNK);
    let mut total = 0usize;

    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }

        let event: RawEvent = serde_json::from_str(&line)
            .with_context(|| format!("parsing event on line {}", idx + 1))?;
        chunk.push(event);

        if chunk.len() == INGEST_CHUNK {
            total += node.events().append(&chunk)?.len();
            chunk.clear();
        }
    }

    if !chunk.is_empty() {
        total += node.events().append(&chunk)?.len();
    }

    tracing::info!(events = total, file = %path.display(), "ingested raw events");
    Ok(())
}

fn migrate(cfg: &Config, action: MigrateAction) -> Result<()> {
    if cfg.store.backend != StoreBackend::Sqlite {
        bail!("migrations only apply to the sqlite backend");
    }

    let conn = open_connection(&cfg.store.path, cfg.store.busy_timeout)
        .with_context(|| format!("opening {}", cfg.store.path.display()))?;
    let migrator = SqliteMigrator::new(&conn);

    match action {
        MigrateAction::Up => migrator.up(),
        MigrateAction::Down => migrator.down(),
        MigrateAction::Status => {
            let status = migrator.status()?;
            println!(
                "current: {}, latest: {}{}",
                status.current,
                status.latest,
                if status.is_current() { "" } else { " (pending)" },
            );
            Ok(())
        }
    }
}
