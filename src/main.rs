//! Binary entrypoint for the shardcore CLI.
//!
//! Commands:
//! - `start` - load the save (if any) and run the tick loop until Ctrl-C
//! - `init` - write a starter `config.toml` and create the data directory
//! - `inspect <save>` - print a save file's segment table as JSON
//! - `check <save> [--strict]` - load a save and report issues and invariant violations
//! - `backups [list|create|verify|restore]` - manage compressed save backups
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde::Serialize;

use shardcore::config::Config;
use shardcore::errors::LoadIssue;
use shardcore::persist::format::{parse_header, SegmentHeader, SegmentId};
use shardcore::server::{ServerOptions, WorldServer};
use shardcore::storage::backup::{BackupKind, BackupManager, RetentionPolicy};
use shardcore::world::diagnostics::InvariantViolation;
use shardcore::world::events::{EventRegistry, EventRegistryBuilder};
use shardcore::world::World;

#[derive(Parser)]
#[command(name = "shardcore")]
#[command(about = "World state core for a multiplayer game shard")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the world server
    Start,
    /// Write a default configuration file
    Init,
    /// Print the segment table of a save file
    Inspect {
        /// Save file; defaults to the configured one
        save: Option<PathBuf>,
    },
    /// Load a save file and report problems
    Check {
        save: Option<PathBuf>,
        /// Exit non-zero when any load issue or invariant violation is found
        #[arg(long)]
        strict: bool,
    },
    /// Manage backups of the save file
    Backups {
        #[command(subcommand)]
        action: Option<BackupAction>,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// List backups, newest first (default)
    List,
    /// Back up the current save file
    Create {
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Check a backup's checksum and header
    Verify { id: String },
    /// Replace the save file with a backup
    Restore { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let loaded = match cli.command {
        Commands::Init => None,
        _ => match Config::load(&cli.config).await {
            Ok(config) => Some(config),
            Err(e) if Path::new(&cli.config).exists() => return Err(e),
            Err(_) => None,
        },
    };
    init_logging(&loaded, cli.verbose);
    let config = match loaded {
        Some(config) => config,
        None => {
            if !matches!(cli.command, Commands::Init) {
                warn!("{} not found; using built-in defaults", cli.config);
            }
            Config::default()
        }
    };

    match cli.command {
        Commands::Init => {
            if Path::new(&cli.config).exists() {
                return Err(anyhow!("{} already exists; not overwriting", cli.config));
            }
            Config::create_default(&cli.config).await?;
            tokio::fs::create_dir_all(&config.storage.data_dir).await?;
            println!("Wrote {} and created {}", cli.config, config.storage.data_dir);
        }
        Commands::Start => run_server(config).await?,
        Commands::Inspect { save } => {
            let path = save.unwrap_or_else(|| config.save_path());
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| anyhow!("Failed to read {}: {}", path.display(), e))?;
            let headers = parse_header(&bytes)?;
            let listing: Vec<SegmentListing> = headers
                .iter()
                .map(|header| SegmentListing::new(header, bytes.len()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        Commands::Check { save, strict } => {
            let path = save.unwrap_or_else(|| config.save_path());
            let (world, report) = World::load(&path, config.world_settings())?;
            let outcome = CheckOutcome {
                entities: report.entities,
                statics: report.statics,
                timers: report.timers,
                accounts: report.accounts,
                leaked: world.leaked().len(),
                issues: report.issues,
                violations: world.check_invariants(),
            };
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            if strict && !(outcome.issues.is_empty() && outcome.violations.is_empty()) {
                std::process::exit(2);
            }
        }
        Commands::Backups { action } => {
            let retention = RetentionPolicy {
                keep: config.storage.backup_retention,
                keep_manual: true,
            };
            let mut manager = BackupManager::new(config.save_path(), config.backup_dir(), retention)?;
            match action.unwrap_or(BackupAction::List) {
                BackupAction::List => {
                    println!("{}", serde_json::to_string_pretty(&manager.list_backups())?);
                }
                BackupAction::Create { name } => {
                    let metadata = manager.create_backup(name, BackupKind::Manual)?;
                    println!("{}", serde_json::to_string_pretty(&metadata)?);
                }
                BackupAction::Verify { id } => {
                    let ok = manager.verify_backup(&id)?;
                    println!("{}: {}", id, if ok { "ok" } else { "FAILED" });
                    if !ok {
                        std::process::exit(2);
                    }
                }
                BackupAction::Restore { id } => {
                    manager.restore_backup(&id, &config.save_path())?;
                    println!("Restored {} to {}", id, config.save_path().display());
                }
            }
        }
    }

    Ok(())
}

#[derive(Serialize)]
struct SegmentListing {
    id: u8,
    name: Option<SegmentId>,
    offset: u64,
    length: u64,
    records: u32,
    within_file: bool,
}

impl SegmentListing {
    fn new(header: &SegmentHeader, file_len: usize) -> Self {
        Self {
            id: header.id,
            name: header.segment(),
            offset: header.offset,
            length: header.length,
            records: header.records,
            within_file: header.within(file_len),
        }
    }
}

#[derive(Serialize)]
struct CheckOutcome {
    entities: usize,
    statics: usize,
    timers: usize,
    accounts: usize,
    leaked: usize,
    issues: Vec<LoadIssue>,
    violations: Vec<InvariantViolation>,
}

/// Handlers shipped with the binary. Gameplay crates register their own.
fn builtin_events() -> Arc<EventRegistry> {
    EventRegistryBuilder::new()
        .register("decay", |world, receiver, _source, _payload| world.destroy(receiver))
        .build()
}

async fn run_server(config: Config) -> Result<()> {
    info!("Starting shardcore v{}", env!("CARGO_PKG_VERSION"));
    tokio::fs::create_dir_all(&config.storage.data_dir).await?;
    let save_path = config.save_path();
    let settings = config.world_settings();
    let world = if save_path.exists() {
        let (world, report) = World::load(&save_path, settings)?;
        if !report.is_clean() {
            warn!(
                "{} loaded with {} issues; run `shardcore check` for details",
                save_path.display(),
                report.issues.len()
            );
        }
        world
    } else {
        info!("no save at {}; starting an empty world", save_path.display());
        World::new(settings)
    };
    let world = world
        .with_templates(config.template_registry())
        .with_events(builtin_events());

    let options = ServerOptions::from_config(&config)?;
    let (server, _handle) = WorldServer::new(world, options);
    let world = server.run().await?;
    info!(
        "shutdown complete: {} entities, metrics {}",
        world.len(),
        serde_json::to_string(&shardcore::metrics::snapshot())?
    );
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);

    let file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|path| {
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(f) => Some(f),
                Err(e) => {
                    eprintln!("cannot open log file {}: {}", path, e);
                    None
                }
            }
        });
    match file {
        Some(f) => {
            let log_file = shardcore::logutil::LogFile::new(f);
            // Foreground runs also echo to the console.
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                // only the first failure reaches stderr
                let _ = log_file.write_line(&line);
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
            });
        }
    }
    if let Err(e) = builder.try_init() {
        eprintln!("logger already initialised: {}", e);
    }
}
