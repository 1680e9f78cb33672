use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use shardlens::clock;
use shardlens::config::Config;
use shardlens::export::health::HealthMetrics;
use shardlens::output::OutputReader;
use shardlens::reader::{self, Pipeline};
use shardlens::store::Stat;

/// Reader pipeline for search-node performance metrics.
#[derive(Parser)]
#[command(name = "shardlens", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Query the newest committed output bucket.
    Query {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Metric table to read.
        #[arg(long)]
        metric: String,

        /// Dimension to group by; repeatable.
        #[arg(long = "dim")]
        dims: Vec<String>,

        /// Statistic column to aggregate.
        #[arg(long, value_enum, default_value = "avg")]
        stat: Stat,
    },
}

/// Build-time version info, injected via RUSTFLAGS.
mod version {
    /// Release version string.
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

    if let Some(Command::Version) = &cli.command {
        println!("shardlens {}", version::full());
        return Ok(());
    }

    let config_path = match &cli.command {
        Some(Command::Query { config, .. }) => config.as_ref().or(cli.config.as_ref()),
        _ => cli.config.as_ref(),
    }
    .context("--config is required (use --help for usage)")?;
    let cfg = load_config(config_path)?;

    let log_level = cfg.log_filter(cli.log_level.as_deref());
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    if let Some(Command::Query {
        metric, dims, stat, ..
    }) = &cli.command
    {
        return query(&cfg, metric, dims, *stat);
    }

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        log_level,
        "starting shardlens",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

async fn run(cfg: Config) -> Result<()> {
    let cancel = CancellationToken::new();

    let metrics = if cfg.health.enabled {
        let metrics = Arc::new(HealthMetrics::new(&cfg.health.addr)?);
        metrics.start().await?;
        Some(metrics)
    } else {
        None
    };

    let pipeline = Pipeline::new(&cfg, metrics.clone())?;
    let worker = reader::spawn(pipeline, tokio::runtime::Handle::current(), cancel.clone())?;

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = cancel.cancelled() => {
            tracing::warn!("reader pipeline stopped, shutting down");
        }
    }

    cancel.cancel();

    let joined = tokio::task::spawn_blocking(move || worker.join())
        .await
        .context("joining reader pipeline thread")?;

    if let Some(metrics) = &metrics {
        metrics.stop();
    }

    match joined {
        Ok(result) => result?,
        Err(_) => bail!("reader pipeline thread panicked"),
    }

    tracing::info!("shardlens stopped");

    Ok(())
}

fn query(cfg: &Config, metric: &str, dims: &[String], stat: Stat) -> Result<()> {
    let reader = OutputReader::discover(&cfg.output.dir)?;
    let Some(key) = reader.latest() else {
        bail!("no committed output bucket in {}", cfg.output.dir.display());
    };

    let group_by: Vec<&str> = dims.iter().map(String::as_str).collect();
    let rows = reader.query(key, metric, &group_by, stat)?;

    println!("# bucket {} ({key})", clock::format_millis(key));
    let mut header = group_by.clone();
    header.push(stat.column());
    println!("{}", header.join("\t"));

    for row in rows {
        let mut fields: Vec<String> = row
            .dims
            .into_iter()
            .map(|d| d.unwrap_or_else(|| "-".to_string()))
            .collect();
        fields.push(row.value.map_or_else(|| "-".to_string(), |v| v.to_string()));
        println!("{}", fields.join("\t"));
    }

    Ok(())
}
