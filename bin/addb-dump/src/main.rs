//! ADDB Dump - print the records of a storage repository

use addb_common::AddbConfig;
use addb_core::record::WireRecord;
use addb_core::registry::Registry;
use addb_core::retrieval::{Cursor, CursorFilter, type_name};
use addb_core::sink::FileStob;
use addb_core::subsystem::register_builtin_types;
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Filter {
    Events,
    Contexts,
    All,
}

impl From<Filter> for CursorFilter {
    fn from(f: Filter) -> Self {
        match f {
            Filter::Events => Self::Events,
            Filter::Contexts => Self::Contexts,
            Filter::All => Self::All,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "addb-dump")]
#[command(about = "Dump records from an ADDB storage repository")]
#[command(version)]
struct Args {
    /// Repository file written by a storage sink
    path: PathBuf,

    /// Which records to print
    #[arg(long, value_enum, default_value = "all")]
    filter: Filter,

    /// Print one JSON object per record
    #[arg(long)]
    json: bool,

    /// Log level (overrides the config file)
    #[arg(long, env = "ADDB_LOG_LEVEL")]
    log_level: Option<String>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.to_string().into());
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn format_record(registry: &Registry, rec: &WireRecord) -> String {
    let kind = rec
        .rid
        .kind()
        .map_or_else(|| format!("kind{}", rec.rid.as_u64() >> 32), |k| k.to_string());
    let name = type_name(registry, rec).unwrap_or_else(|| "?".to_string());
    let contexts: Vec<String> = rec
        .contexts
        .iter()
        .map(|path| {
            path.iter()
                .map(|id| format!("{id:x}"))
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    format!(
        "{kind} {}({name}) ts={} ctx=[{}] fields={:?}",
        rec.rid.type_id(),
        rec.timestamp,
        contexts.join(", "),
        rec.fields
    )
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AddbConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => AddbConfig::default(),
    };
    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.logging.level.clone());
    init_logging(&level, config.logging.json);

    let registry = Registry::new();
    register_builtin_types(&registry)?;

    let stob = FileStob::open_read_only(&args.path)?;
    let cursor = Cursor::new(&stob, args.filter.into())
        .with_context(|| format!("{} is not an ADDB repository", args.path.display()))?;

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let mut printed = 0usize;
    let mut invalid = 0usize;
    for item in cursor {
        let rec = match item {
            Ok(rec) => rec,
            Err(e) => {
                warn!("Skipping invalid segment: {e}");
                invalid += 1;
                continue;
            }
        };
        if args.json {
            writeln!(out, "{}", serde_json::to_string(&rec)?)?;
        } else {
            writeln!(out, "{}", format_record(&registry, &rec))?;
        }
        printed += 1;
    }

    info!("{printed} records, {invalid} invalid segments");
    Ok(())
}
