//! DDR sync - background git status scheduler and inheritance tool
//!
//! Runs the status loop (or single ticks from cron), refreshes the gitolite
//! info cache, manages operation locks and pushes inheritable fields down a
//! collection.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use ddr_sync_core::{Config, Error, FileCache, Identifier, IdentifierKind, Result, global_metrics};
use ddr_sync_storage::inherit::MetadataObject;
use ddr_sync_storage::operation::with_operation;
use ddr_sync_storage::{
    Collection, FieldSchema, FsInventory, GitCli, GitoliteSsh, InheritanceEngine, LoopExit,
    SchedulerContext, SyncScheduler, locks,
};

#[derive(Parser)]
#[command(name = "ddr-sync")]
#[command(version, about = "Background git status scheduler for DDR collections")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override DDR_BASE_PATH
    #[arg(long, global = true)]
    base_path: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the status loop until stopped
    Loop {
        /// Exit after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
    },

    /// Run a single status tick
    Tick,

    /// Pop the next collection from the queue
    Next,

    /// Re-query gitolite info if the cached entry is past the cutoff
    #[command(name = "refresh-access")]
    RefreshAccess,

    /// List organizations the configured identity may reach
    Orgs,

    /// Show a collection's status
    Status {
        collection: String,

        /// Recompute, bypassing the cache
        #[arg(long)]
        force: bool,

        /// Also run `git fetch`
        #[arg(long)]
        fetch: bool,
    },

    /// Drop a collection's cached status and queue it for the next tick
    Invalidate { collection: String },

    /// Set a named operation lock (`name` or `name@collection_id`)
    Lock { name: String },

    /// Clear a named operation lock
    Unlock { name: String },

    /// Raise the global stop flag
    Stop,

    /// Clear the global stop flag
    Start,

    /// List held locks
    Locks,

    /// Propagate inheritable fields from a parent metadata file
    Inherit {
        /// Path to `collection.json` or `entity.json`
        parent: PathBuf,

        /// Field to propagate (repeatable)
        #[arg(long = "field", required = true)]
        fields: Vec<String>,

        /// Field schema JSON (defaults to the built-in DDR schema)
        #[arg(long)]
        schema: Option<PathBuf>,
    },

    /// Show queue, lock and metrics summary
    Stats,

    /// Show configuration
    Config,
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_scheduler(config: &Config) -> Result<SyncScheduler> {
    let cache = FileCache::open(&config.cache_dir)?;
    let ctx = SchedulerContext::new(config.clone(), Arc::new(cache));
    Ok(SyncScheduler::new(
        ctx,
        Arc::new(GitoliteSsh::new(
            config.gitolite.clone(),
            Duration::from_secs(config.gitolite_timeout),
        )),
        Arc::new(GitCli::new(config.git_bin.clone())),
        Arc::new(FsInventory),
    ))
}

fn load_collection(config: &Config, raw: &str) -> Result<Collection> {
    let id = Identifier::parse(raw)?;
    if id.kind != IdentifierKind::Collection {
        return Err(Error::InvalidArgument(format!(
            "{raw} is a {}, not a collection",
            id.kind
        )));
    }
    Collection::from_path(&config.base_path.join(&id.id))
}

#[derive(Serialize)]
struct LockReport {
    stopped: bool,
    locks: Vec<locks::LockInfo>,
}

#[derive(Serialize)]
struct StatsReport {
    queue_depth: usize,
    stopped: bool,
    held_locks: usize,
    metrics: ddr_sync_core::metrics::GlobalMetricsSnapshot,
}

fn run(command: Commands, config: &Config) -> Result<()> {
    let base = config.base_path.as_path();
    match command {
        Commands::Loop { max_ticks } => {
            let scheduler = build_scheduler(config)?;
            match scheduler.gitstatus_loop(max_ticks) {
                LoopExit::StorageUnavailable(reason) => Err(Error::StorageUnavailable(reason)),
                exit => {
                    tracing::info!(?exit, "gitstatus loop finished");
                    Ok(())
                }
            }
        }
        Commands::Tick => print_json(&build_scheduler(config)?.gitstatus_update()?),
        Commands::Next => {
            if let Some(path) = build_scheduler(config)?.gitstatus_next_repo()? {
                println!("{}", path.display());
            }
            Ok(())
        }
        Commands::RefreshAccess => {
            let outcome = build_scheduler(config)?.access().refresh()?;
            println!("{outcome:?}");
            Ok(())
        }
        Commands::Orgs => {
            for org in build_scheduler(config)?.access().get_repos_orgs()? {
                println!("{org}");
            }
            Ok(())
        }
        Commands::Status {
            collection,
            force,
            fetch,
        } => {
            let scheduler = build_scheduler(config)?;
            let collection = load_collection(config, &collection)?;
            if fetch {
                let out = scheduler.status().repo_fetch(&collection, force)?;
                eprintln!("{}", out.text.trim_end());
            }
            let snapshot = if force {
                scheduler.status().refresh(&collection)?
            } else {
                scheduler.status().current(&collection)?
            };
            print_json(&snapshot)
        }
        Commands::Invalidate { collection } => {
            let scheduler = build_scheduler(config)?;
            let collection = load_collection(config, &collection)?;
            scheduler.status().cache_delete(&collection.id.id)?;
            scheduler.queue().push_front(&collection.path)
        }
        Commands::Lock { name } => {
            if !locks::lock(base, &name)? {
                println!("{name}: already locked");
            }
            Ok(())
        }
        Commands::Unlock { name } => {
            if !locks::unlock(base, &name)? {
                println!("{name}: not locked");
            }
            Ok(())
        }
        Commands::Stop => {
            locks::stop(base)?;
            Ok(())
        }
        Commands::Start => {
            locks::start(base)?;
            Ok(())
        }
        Commands::Locks => print_json(&LockReport {
            stopped: locks::locked(base),
            locks: locks::list_locks(base)?,
        }),
        Commands::Inherit {
            parent,
            fields,
            schema,
        } => {
            let schema = match schema {
                Some(path) => FieldSchema::load(&path)?,
                None => FieldSchema::default(),
            };
            let engine = InheritanceEngine::new(schema);
            let parent = MetadataObject::load(&parent)?;
            let collection_id = Identifier::parse(&parent.id)?
                .collection_id()
                .ok_or_else(|| Error::InvalidIdentifier(parent.id.clone()))?;
            let collection = load_collection(config, &collection_id)?;
            let names = engine.schema().inheritable_fields(parent.kind);
            let selection: HashMap<String, bool> = fields
                .iter()
                .map(|f| (format!("{f}_inherit"), true))
                .collect();

            let scheduler = build_scheduler(config)?;
            let changes = with_operation(&scheduler, "collection_edit", &collection, true, |_| {
                engine.update_inheritables(&parent, &names, &selection)
            });
            if let Err(Error::PartialWrite {
                child_ids,
                changed_files,
                ..
            }) = &changes
            {
                // rewritten before the failure; still has to be committed
                print_json(&serde_json::json!({
                    "child_ids": child_ids,
                    "changed_files": changed_files,
                    "complete": false,
                }))?;
            }
            print_json(&changes?)
        }
        Commands::Stats => {
            let scheduler = build_scheduler(config)?;
            print_json(&StatsReport {
                queue_depth: scheduler.queue().len()?,
                stopped: locks::locked(base),
                held_locks: locks::list_locks(base)?.len(),
                metrics: global_metrics().snapshot(),
            })
        }
        Commands::Config => {
            println!("{config:#?}");
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();

    // Load configuration
    let mut config = Config::from_env();
    if let Some(base_path) = cli.base_path {
        config.base_path = base_path;
    }

    // Initialize logging on stderr so JSON output stays clean
    let default_level = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run(cli.command, &config) {
        tracing::error!(error_type = err.error_type(), "{err}");
        std::process::exit(1);
    }
}
