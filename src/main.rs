//! fcsload command line interface.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use fcsload::config::Config;
use fcsload::filter::Filters;
use fcsload::reconcile::{Reconciler, RunOptions};
use fcsload::shutdown::ShutdownFlag;
use fcsload::store::StatusStore;
use fcsload::transport::FtpTransport;

/// Environment override for the config file path.
const ENV_CONFIG_FILE: &str = "FCSLOAD_CONFIG";

#[derive(Parser)]
#[command(name = "fcsload")]
#[command(about = "Incremental loader for government procurement archives")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fcsload.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one crawl pass over the remote listing
    Run {
        /// Stop after this many archives were actually processed
        #[arg(short, long)]
        limit: Option<usize>,

        /// Remote folder to read ("notifications" or "protocols")
        #[arg(short, long)]
        folder: Option<String>,

        /// JSON filter over date and region, e.g.
        /// '[{"field":"date","match":">=","value":"2019-01-01"}]'
        #[arg(long)]
        filter: Option<String>,
    },

    /// Write a starter configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Show ingest statistics from the status store
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Init { path } => init_config(path),
        command => {
            let config_path = std::env::var(ENV_CONFIG_FILE)
                .map(PathBuf::from)
                .unwrap_or(cli.config);
            let config = Config::load(&config_path)?;
            match command {
                Commands::Run { limit, folder, filter } => run_pass(config, limit, folder, filter),
                Commands::Status => show_status(config),
                Commands::Init { .. } => unreachable!("handled above"),
            }
        }
    }
}

fn run_pass(
    mut config: Config,
    limit: Option<usize>,
    folder: Option<String>,
    filter: Option<String>,
) -> Result<()> {
    if let Some(limit) = limit {
        config.app.limit_archives = limit;
    }
    if let Some(folder) = folder {
        config.app.folder = folder;
    }
    if let Some(filter) = filter {
        config.app.filters = Some(filter);
    }
    config.validate()?;

    let filters = match &config.app.filters {
        Some(raw) => Filters::parse(raw).context("cannot parse filters")?,
        None => Filters::none(),
    };

    std::fs::create_dir_all(&config.app.download_dir).with_context(|| {
        format!(
            "cannot create download directory {}",
            config.app.download_dir.display()
        )
    })?;

    // An unreachable store is fatal before any archive is touched.
    let store = StatusStore::open(&config.database.path, config.database.echo)
        .with_context(|| format!("cannot open store at {}", config.database.path.display()))?;

    let transport = FtpTransport::connect(
        &config.server.address,
        &config.server.root_dir,
        &config.app.folder,
    )
    .with_context(|| format!("cannot connect to {}", config.server.address))?;

    let shutdown = ShutdownFlag::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            info!("interrupt received, finishing the current member");
            shutdown.set();
        })
        .context("cannot install the interrupt handler")?;
    }

    let options = RunOptions {
        law_number: config.app.law_number.clone(),
        folder: config.app.folder.clone(),
        download_dir: config.app.download_dir.clone(),
        limit_archives: config.app.limit_archives,
    };
    let mut reconciler = Reconciler::new(transport, store, filters, shutdown.clone(), options);
    let stats = reconciler.run();

    println!("\nPass complete{}", if shutdown.is_set() { " (interrupted)" } else { "" });
    println!("=============");
    println!("Archives processed: {}", stats.processed);
    println!("Errors:             {}", stats.errors);

    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    let config_path = path.join("fcsload.toml");
    std::fs::write(&config_path, Config::starter_toml())?;
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

fn show_status(config: Config) -> Result<()> {
    let store = StatusStore::open(&config.database.path, config.database.echo)
        .with_context(|| format!("cannot open store at {}", config.database.path.display()))?;
    let stats = store.stats()?;

    println!("\nIngest status");
    println!("=============");
    println!("Store:            {}", config.database.path.display());
    println!("Archives:         {} ({} parsed)", stats.archives, stats.archives_parsed);
    println!("Archive members:  {} ({} parsed)", stats.files, stats.files_parsed);
    println!("Records:          {}", stats.records);

    Ok(())
}
