//! CLI for the ringhist metrics history engine.
//!
//! Provides commands for inspecting and querying a file-backed history store,
//! and for running the collector against it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand, ValueEnum};
use ringhist::collect::{MetricSource, Readiness, Scheduler, Snapshot};
use ringhist::error::{CollectError, ErrorCode};
use ringhist::{AdminRequest, CollectorConfig, FileBackend, MetricsHistory, SeriesStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// ringhist: multi-resolution round-robin metrics history CLI.
#[derive(Parser)]
#[command(name = "ringhist", version, about)]
struct Cli {
    /// Path to the store directory.
    #[arg(long, global = true, default_value = "./history")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// List stored series.
    List {
        /// Maximum number of names to print.
        #[arg(long, default_value = "100")]
        rows: usize,
    },

    /// Show the definition and state of one series.
    Status {
        /// Series name.
        name: String,
    },

    /// Fetch consolidated rows of one series.
    Get {
        /// Series name.
        name: String,

        /// Datasource to fetch; repeat for several. All when omitted.
        #[arg(long = "ds")]
        datasources: Vec<String>,

        /// Only rows within this long before now (e.g., "1h", "30m", "7d").
        #[arg(long)]
        range: Option<String>,

        /// Output format.
        #[arg(long, default_value = "list")]
        format: OutputFormat,
    },

    /// Delete one series, or every series with "all".
    Delete {
        /// Series name, or "all".
        name: String,
    },

    /// Collect metrics from a JSON snapshot file until interrupted.
    Collect {
        /// Collector config file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Snapshot file re-read every cycle, shaped as
        /// `{"<group>": {"<series>": {"<metric>": value}}}`.
        #[arg(long)]
        metrics: PathBuf,
    },
}

/// Output format for fetched rows.
#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Parallel arrays.
    List,
    /// Newline-joined text blocks.
    String,
}

impl OutputFormat {
    fn as_str(self) -> &'static str {
        match self {
            Self::List => "list",
            Self::String => "string",
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::List { rows } => cmd_admin(
            &cli.store,
            AdminRequest {
                action: Some("list".to_string()),
                rows: Some(rows),
                ..AdminRequest::default()
            },
        ),
        Commands::Status { name } => cmd_admin(
            &cli.store,
            AdminRequest {
                action: Some("status".to_string()),
                name: Some(name),
                ..AdminRequest::default()
            },
        ),
        Commands::Get {
            name,
            datasources,
            range,
            format,
        } => get_request(name, datasources, range.as_deref(), format)
            .and_then(|request| cmd_admin(&cli.store, request)),
        Commands::Delete { name } => cmd_admin(
            &cli.store,
            AdminRequest {
                action: Some("delete".to_string()),
                name: Some(name),
                ..AdminRequest::default()
            },
        ),
        Commands::Collect { config, metrics } => cmd_collect(&cli.store, config.as_deref(), metrics),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Opens the store and runs one admin request, printing the JSON response.
fn cmd_admin(store_path: &Path, request: AdminRequest) -> Result<(), Box<dyn std::error::Error>> {
    let backend = FileBackend::open(store_path)?;
    let history = MetricsHistory::new(Arc::new(SeriesStore::new(Arc::new(backend))));

    match history.handle(&request) {
        Ok(response) => {
            println!("{}", serde_json::to_string_pretty(&response)?);
            if response.get("error").is_some() {
                std::process::exit(2);
            }
            Ok(())
        }
        Err(e) if e.code() == ErrorCode::BadRequest => Err(format!("bad request: {e}").into()),
        Err(e) => Err(e.into()),
    }
}

/// Builds the admin request behind `ringhist get`.
fn get_request(
    name: String,
    datasources: Vec<String>,
    range: Option<&str>,
    format: OutputFormat,
) -> Result<AdminRequest, Box<dyn std::error::Error>> {
    let (start, end) = match range {
        Some(range) => {
            let now = now_secs();
            (Some(now.saturating_sub(parse_duration(range)?)), Some(now))
        }
        None => (None, None),
    };
    Ok(AdminRequest {
        action: Some("get".to_string()),
        name: Some(name),
        ds: datasources,
        format: Some(format.as_str().to_string()),
        start,
        end,
        ..AdminRequest::default()
    })
}

/// Implements `ringhist collect`.
fn cmd_collect(
    store_path: &Path,
    config_path: Option<&Path>,
    metrics: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = match config_path {
        Some(path) => CollectorConfig::load(path)?,
        None => CollectorConfig::default(),
    };
    let backend = FileBackend::open(store_path)?;
    let store = Arc::new(SeriesStore::new(Arc::new(backend)).with_sync_period(config.sync_period));
    let source = Arc::new(SnapshotFile::new(metrics));
    let scheduler = Scheduler::new(config, store, source.clone(), source);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let handle = scheduler.spawn();
        info!(store = %store_path.display(), "collector running, press ctrl-c to stop");
        tokio::signal::ctrl_c().await?;
        info!("shutting down collector");
        handle.stop().await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Metric source backed by a JSON file written by another process.
///
/// The collector treats a missing file as a backing store that is not ready
/// yet.
struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn read(&self) -> Result<BTreeMap<String, Snapshot>, String> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| e.to_string())?;
        serde_json::from_str(&text).map_err(|e| e.to_string())
    }
}

impl Readiness for SnapshotFile {
    fn is_ready(&self) -> ringhist::Result<bool> {
        Ok(self.path.is_file())
    }
}

impl MetricSource for SnapshotFile {
    fn snapshot(&self, group: &str, _counters: &[String], _gauges: &[String]) -> ringhist::Result<Snapshot> {
        let mut groups = self.read().map_err(|reason| CollectError::Source {
            group: group.to_string(),
            reason,
        })?;
        Ok(groups.remove(group).unwrap_or_default())
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Parses a human-readable duration string (e.g., "1h", "30m", "7d") to seconds.
fn parse_duration(s: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let s = s.trim();
    let Some((split, unit)) = s.char_indices().last() else {
        return Err("Empty duration string".into());
    };

    let num: u64 = s[..split].parse()?;
    let scale = match unit {
        's' => 1,
        'm' => 60,
        'h' => 3600,
        'd' => 86400,
        _ => return Err(format!("Unknown duration unit: '{unit}'. Use s, m, h, or d.").into()),
    };

    num.checked_mul(scale)
        .ok_or_else(|| format!("Duration '{s}' is too large").into())
}
