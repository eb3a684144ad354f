//! Process startup
//!
//! Parses arguments, loads configuration, installs logging, opens and
//! migrates the database and then dispatches the subcommand. Every failure
//! before the workers start is fatal and ends the process with a non-zero
//! exit code.

use super::cli::{Args, Command};
use crate::config::Config;
use crate::core::error_handling::log_error_with_context;
use crate::core::logging::{init_logging, LogFormat};
use crate::core::retry::RetryPolicy;
use crate::core::shutdown::ShutdownCoordinator;
use crate::core::time::{SystemTimeProvider, TimeProvider};
use crate::git::LocalGit;
use crate::github::GitHubLister;
use crate::metrics::LogEmitter;
use crate::notify::LogNotifier;
use crate::pool::RepoLocks;
use crate::queue::{HintSource, MemoryHintQueue};
use crate::rescanner::Rescanner;
use crate::sniff::PatternSniffer;
use crate::store::{RepositoryStore, SqliteStore};
use crate::supervisor::{Services, Supervisor};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

const HINT_QUEUE_SIZE: usize = 4096;

/// Run the process; returns the exit code
pub fn startup() -> i32 {
    let args = Args::parse();
    let loaded = Config::load(args.config_file.as_deref());

    let logging = match &loaded {
        Ok(config) => config.logging.clone(),
        Err(_) => Default::default(),
    };
    let level = args.log_level.clone().unwrap_or(logging.level);
    let format = args
        .log_format
        .as_deref()
        .unwrap_or(logging.format.as_str())
        .parse::<LogFormat>()
        .unwrap_or_default();
    let color = logging.color && !args.no_color;
    if !color {
        colored::control::set_override(false);
    }
    let log_file = args.log_file_or(logging.file.as_deref());
    if let Err(e) = init_logging(&level, format, log_file.as_deref(), color) {
        eprintln!("repowatch: cannot initialise logging: {}", e);
        return 2;
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log_error_with_context(&e, "Loading configuration");
            return 1;
        }
    };
    log::info!(
        "repowatch {} ({} built {})",
        env!("CARGO_PKG_VERSION"),
        crate::GIT_HASH,
        crate::BUILD_TIME
    );

    if let Err(e) = config.prepare_workspace() {
        log_error_with_context(&e, "Preparing workspace");
        return 1;
    }

    let clock: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let store = match open_store(&config, clock.as_ref()) {
        Some(store) => Arc::new(store),
        None => return 1,
    };

    match args.command() {
        Command::Migrate => match store.schema_version() {
            Ok(version) => {
                log::info!("Database schema is at version {}", version);
                0
            }
            Err(e) => {
                log_error_with_context(&e, "Reading schema version");
                1
            }
        },
        Command::Stats { json } => print_stats(store.as_ref(), json),
        Command::Rescan => with_runtime(|shutdown| rescan(store, clock, shutdown)),
        Command::Run => with_runtime(|shutdown| run(config, store, clock, shutdown)),
    }
}

fn open_store(config: &Config, clock: &dyn TimeProvider) -> Option<SqliteStore> {
    let storage = &config.storage;
    let store = match SqliteStore::open(&storage.database, storage.pool_size) {
        Ok(store) => store,
        Err(e) => {
            log_error_with_context(&e, "Opening database");
            return None;
        }
    };
    let policy = RetryPolicy::new(
        storage.migration_lock_attempts,
        Duration::from_millis(storage.migration_lock_delay_ms),
    );
    match store.migrate(&policy, clock) {
        Ok(0) => log::debug!("No schema migrations pending"),
        Ok(applied) => log::info!("Applied {} schema migration(s)", applied),
        Err(e) => {
            log_error_with_context(&e, "Migrating database schema");
            return None;
        }
    }
    Some(store)
}

fn print_stats(store: &dyn RepositoryStore, json: bool) -> i32 {
    let counts = match store.counts() {
        Ok(counts) => counts,
        Err(e) => {
            log_error_with_context(&e, "Reading stats");
            return 1;
        }
    };
    if json {
        match serde_json::to_string_pretty(&counts) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                log::error!("Cannot encode stats: {}", e);
                return 1;
            }
        }
    } else {
        println!("repositories      {}", counts.repositories);
        println!("  cloned          {}", counts.cloned);
        println!("  disabled        {}", counts.disabled);
        println!("  failing         {}", counts.failing);
        println!("fetches           {}", counts.fetches);
        println!("scans             {}", counts.scans);
        println!("credentials       {}", counts.credentials);
        println!("head credentials  {}", counts.head_credentials);
    }
    0
}

fn with_runtime<F, Fut>(body: F) -> i32
where
    F: FnOnce(ShutdownCoordinator) -> Fut,
    Fut: std::future::Future<Output = i32>,
{
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("FATAL: Cannot start async runtime: {}", e);
            return 1;
        }
    };
    runtime.block_on(async move {
        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers();
        body(shutdown).await
    })
}

async fn rescan(
    store: Arc<SqliteStore>,
    clock: Arc<dyn TimeProvider>,
    shutdown: ShutdownCoordinator,
) -> i32 {
    let rescanner = Rescanner::new(
        store,
        Arc::new(LocalGit::new()),
        Arc::new(PatternSniffer::new()),
        Arc::new(LogNotifier),
        Arc::new(LogEmitter),
        clock,
        Arc::new(RepoLocks::new()),
    );
    match rescanner.rescan_all(&shutdown.subscribe()).await {
        Ok(report) if report.failures == 0 => 0,
        Ok(_) => 1,
        Err(e) => {
            log_error_with_context(&e, "Rescanning repositories");
            1
        }
    }
}

/// Where the Push Event Processor reads hints from.
///
/// A broker adapter implements [`HintSource`] and is returned here. Until one
/// is configured the processor reads an in-process queue that nothing
/// outside the process publishes to, and fetches run on schedule only.
fn hint_source(clock: Arc<dyn TimeProvider>) -> Arc<dyn HintSource> {
    log::info!("No external push-hint source; fetches follow the schedule only");
    Arc::new(MemoryHintQueue::new(HINT_QUEUE_SIZE, clock))
}

async fn run(
    config: Config,
    store: Arc<SqliteStore>,
    clock: Arc<dyn TimeProvider>,
    shutdown: ShutdownCoordinator,
) -> i32 {
    let lister = match GitHubLister::new(&config.github, clock.clone()) {
        Ok(lister) => lister,
        Err(e) => {
            log::error!("FATAL: Creating GitHub client: {}", e);
            return 1;
        }
    };
    let services = Services {
        store,
        git: Arc::new(LocalGit::new()),
        lister: Arc::new(lister),
        hints: hint_source(clock.clone()),
        sniffer: Arc::new(PatternSniffer::new()),
        notifier: Arc::new(LogNotifier),
        metrics: Arc::new(LogEmitter),
        clock,
    };
    Supervisor::new(config, services, shutdown).run().await;
    0
}
