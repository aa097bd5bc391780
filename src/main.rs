mod config;
mod core;
mod db;
mod error;
mod explore;
mod signals;
mod tags;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::core::pipeline::{self, RunSummary, Stage};
use crate::core::{CallerRecord, ContractRecord, SignatureRecord};
use crate::db::SharedDatabase;
use crate::error::Result;

#[derive(Parser)]
#[command(name = "botradar", version, about = "Flags and scores bot contracts, signatures and callers")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Tag the most frequent signatures and propagate suspicion.
    Explore,
    /// Score suspicious entities and merge bot tags.
    Analyze,
    /// Explore, then analyze.
    Run,
    /// Load transactions from a CSV file.
    ImportTransactions { file: PathBuf },
    /// Load whitelisted contract addresses from a CSV file.
    ImportWhitelist { file: PathBuf },
    /// Print row counts per table.
    Status,
    /// Dump all tagged contracts, signatures and callers.
    Export,
}

#[derive(Serialize)]
struct Export {
    contracts: Vec<ContractRecord>,
    signatures: Vec<SignatureRecord>,
    callers: Vec<CallerRecord>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("botradar=info".parse().expect("valid directive")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config);
    tracing::debug!("Config: {:?}", config);

    if let Err(e) = execute(cli.command, config) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn open_database(config: &Config) -> Result<SharedDatabase> {
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = SharedDatabase::open(db_path)?;
    tracing::info!("Database opened at {}", config.database.path);
    Ok(db)
}

fn execute(command: Command, config: Config) -> Result<()> {
    let db = open_database(&config)?;
    match command {
        Command::Explore => print_json(&run_stages(&[Stage::Explore], db, &config)?),
        Command::Analyze => print_json(&run_stages(&[Stage::Analyze], db, &config)?),
        Command::Run => print_json(&run_stages(&[Stage::Explore, Stage::Analyze], db, &config)?),
        Command::ImportTransactions { file } => {
            let count = db.load_transactions_from_csv(&file)?;
            tracing::info!("Loaded {count} transactions from {}", file.display());
            print_json(&db.counts()?)
        }
        Command::ImportWhitelist { file } => {
            let count = db.load_whitelist_from_csv(&file)?;
            tracing::info!("Loaded {count} whitelist addresses from {}", file.display());
            print_json(&db.counts()?)
        }
        Command::Status => print_json(&db.counts()?),
        Command::Export => print_json(&Export {
            contracts: db.all_contracts()?,
            signatures: db.all_signatures()?,
            callers: db.all_callers()?,
        }),
    }
}

fn run_stages(stages: &[Stage], db: SharedDatabase, config: &Config) -> Result<Vec<RunSummary>> {
    let timeout = Duration::from_secs(config.run.timeout_seconds);
    pipeline::run_stages(stages, db, config, timeout)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
