use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use forgequeue_core::config::DatabaseKind;
use forgequeue_core::keys::rotation::KEY_ROTATION_JOB_TYPE;
use forgequeue_core::{
    Config, EncryptionProvider, EventBus, JobProcessorService, JobQueueService,
    KeyRotationService, KeyStore, NewJob, PgMigrator, PgStore, Result, SqliteMigrator,
    SqliteStore, Store,
};

#[derive(Parser)]
#[command(name = "forgequeue-worker")]
#[command(about = "Background job queue processor and encryption key rotation worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true, help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Override the configured log directive")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the job processor and key rotation scheduler until terminated
    Run {
        #[arg(long, help = "Skip automatic database migration on startup")]
        skip_migrate: bool,
    },

    /// Database operations
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Run one key rotation cycle immediately, bypassing the interval check
    RotateNow,

    /// Print the resolved configuration and exit
    ShowConfig,
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run pending migrations
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path.to_str().unwrap())?,
        None => Config::from_env()?,
    };

    let directive = cli.log_level.as_deref().unwrap_or(&config.logging.directive);
    tracing_subscriber::fmt().with_env_filter(directive).init();

    info!(version = forgequeue_core::VERSION, "starting forgequeue-worker");

    match cli.command {
        Commands::Run { skip_migrate } => run(config, skip_migrate).await,
        Commands::Db {
            command: DbCommands::Migrate,
        } => {
            open_store(&config, true).await?;
            println!("migrations applied");
            Ok(())
        }
        Commands::RotateNow => rotate_now(&config).await,
        Commands::ShowConfig => {
            println!("{:#?}", config);
            Ok(())
        }
    }
}

/// Opens the configured backend's store, optionally applying pending
/// migrations first against the same pool.
async fn open_store(config: &Config, run_migrations: bool) -> Result<Arc<dyn Store>> {
    match config.database.kind {
        DatabaseKind::Postgres => {
            let store = PgStore::connect(&config.database.connection_string, config.database.pool_size).await?;
            if run_migrations {
                info!("running database migrations");
                PgMigrator::new(store.pool().clone()).migrate().await?;
            }
            Ok(Arc::new(store))
        }
        DatabaseKind::Sqlite => {
            let store = SqliteStore::connect(&config.database.connection_string, config.database.pool_size).await?;
            if run_migrations {
                info!("running database migrations");
                SqliteMigrator::new(store.pool().clone()).migrate().await?;
            }
            Ok(Arc::new(store))
        }
    }
}

/// Wires up the job queue, processor, and key rotation service, registers
/// the rotation handler, and blocks until a shutdown signal arrives.
async fn run(config: Config, skip_migrate: bool) -> Result<()> {
    let store = open_store(&config, !skip_migrate).await?;
    let events = Arc::new(EventBus::new());

    let key_store = Arc::new(KeyStore::new(config.key_rotation.key_file_path.clone()));
    let key_record = key_store.ensure_initialized()?;
    let provider = Arc::new(EncryptionProvider::new(&key_record)?);

    let queue = Arc::new(JobQueueService::new(store.clone(), events.clone()).with_encryption(provider.clone()));
    let processor = JobProcessorService::new(queue.clone(), events.clone(), config.job_processor.clone());

    let rotation = KeyRotationService::new(key_store, provider, store, config.key_rotation.clone());
    processor.register_handler(KEY_ROTATION_JOB_TYPE, rotation);

    processor.start().await;
    info!("job processor running");

    let scheduler_queue = queue.clone();
    let check_interval = config.key_rotation.check_interval();
    let scheduler = tokio::spawn(async move {
        loop {
            tokio::time::sleep(check_interval).await;
            let job = NewJob::new(KEY_ROTATION_JOB_TYPE).sequential_for(KEY_ROTATION_JOB_TYPE, "singleton");
            if let Err(e) = scheduler_queue.enqueue_if_not_exists(job).await {
                error!(error = %e, "failed to enqueue key rotation check");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");

    scheduler.abort();
    processor.stop().await;
    info!("forgequeue-worker stopped cleanly");

    Ok(())
}

/// One-shot manual rotation for operator-triggered key rollover, bypassing
/// the job queue entirely.
async fn rotate_now(config: &Config) -> Result<()> {
    let store = open_store(config, false).await?;

    let key_store = Arc::new(KeyStore::new(config.key_rotation.key_file_path.clone()));
    let key_record = key_store.ensure_initialized()?;
    let provider = Arc::new(EncryptionProvider::new(&key_record)?);

    let rotation = KeyRotationService::new(key_store, provider, store, config.key_rotation.clone());
    let outcome = rotation.trigger_manual_rotation().await?;

    info!(outcome = ?outcome, "manual rotation finished");
    println!("{:?}", outcome);
    Ok(())
}
