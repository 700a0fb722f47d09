//! Task Relay server and queue worker.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use task_relay::auth::{AuthService, TokenIssuer};
use task_relay::cli::{Cli, Command};
use task_relay::config::{CompletionStrategy, Config, ConfigLoader};
use task_relay::db::Database;
use task_relay::logging::{self, LogTarget};
use task_relay::notify::{DetachedDispatcher, NotificationDispatcher, RegistryDispatcher};
use task_relay::registry::ConnectionRegistry;
use task_relay::scheduler::{Broker, CompletionHandler, WorkerPool, build_scheduler};
use task_relay::server::{AppState, start_server};
use task_relay::service::TaskService;
use task_relay::store::TaskStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let mut loader = ConfigLoader::load(cli.config.as_deref().map(Path::new))?;
    for (tier, path) in loader.sources() {
        info!(tier = %tier, path = %path.display(), "Using config file");
    }
    for var in loader.env_overrides() {
        info!(var = %var, "Config value overridden from environment");
    }
    cli.apply_overrides(loader.config_mut());
    let config = loader.into_config();

    match &cli.command {
        None | Some(Command::Serve(_)) => run_server(config).await,
        Some(Command::Worker(args)) => run_workers(config, args.concurrency).await,
    }
}

fn open_database(config: &Config) -> Result<Arc<Database>> {
    config.ensure_db_dir()?;
    let db = Database::open(&config.server.db_path)
        .with_context(|| format!("Failed to open database {}", config.server.db_path.display()))?;
    info!("Database: {:?}", config.server.db_path);
    Ok(Arc::new(db))
}

async fn run_server(config: Config) -> Result<()> {
    config.validate()?;

    info!("Starting Task Relay v{}", env!("CARGO_PKG_VERSION"));
    info!("Completion strategy: {}", config.scheduler.strategy.as_str());

    let db = open_database(&config)?;
    let store: Arc<dyn TaskStore> = db.clone();
    let broker: Arc<dyn Broker> = db.clone();

    let registry = Arc::new(ConnectionRegistry::new());
    let dispatcher: Arc<dyn NotificationDispatcher> =
        Arc::new(RegistryDispatcher::new(Arc::clone(&registry)));
    let handler = Arc::new(CompletionHandler::new(Arc::clone(&store), dispatcher));
    let scheduler = build_scheduler(&config.scheduler, Arc::clone(&handler), Arc::clone(&broker));

    let workers = if config.scheduler.strategy == CompletionStrategy::DurableQueue
        && config.scheduler.queue.embedded_workers > 0
    {
        info!(
            workers = config.scheduler.queue.embedded_workers,
            queue = %config.scheduler.queue.name,
            "Starting embedded queue workers"
        );
        Some(WorkerPool::spawn(
            config.scheduler.queue.embedded_workers,
            Arc::clone(&broker),
            Arc::clone(&handler),
            &config.scheduler.queue,
        ))
    } else {
        None
    };

    let tokens = Arc::new(TokenIssuer::new(&config.auth));
    let auth = Arc::new(AuthService::new(
        Arc::clone(&db),
        tokens,
        config.auth.bcrypt_cost,
    ));
    let tasks = Arc::new(TaskService::new(
        store,
        scheduler,
        config.scheduler.completion_delay(),
    ));

    let state = AppState {
        auth,
        tasks,
        registry,
        websocket: config.websocket.clone(),
    };

    let ip: IpAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;
    let server = start_server(state, SocketAddr::new(ip, config.server.port)).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server.shutdown().await;
    if let Some(workers) = workers {
        workers.shutdown().await;
    }
    if config.scheduler.strategy == CompletionStrategy::DurableQueue {
        log_queue_stats(broker.as_ref(), &config.scheduler.queue.name).await;
    }

    Ok(())
}

async fn run_workers(config: Config, concurrency: usize) -> Result<()> {
    if concurrency == 0 {
        anyhow::bail!("worker concurrency must be at least 1");
    }

    info!(
        "Starting {} queue worker(s) on '{}'",
        concurrency, config.scheduler.queue.name
    );

    let db = open_database(&config)?;
    let store: Arc<dyn TaskStore> = db.clone();
    let broker: Arc<dyn Broker> = db;

    // No sockets live in this process.
    let handler = Arc::new(CompletionHandler::new(store, Arc::new(DetachedDispatcher)));
    let pool = WorkerPool::spawn(
        concurrency,
        Arc::clone(&broker),
        handler,
        &config.scheduler.queue,
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    pool.shutdown().await;
    log_queue_stats(broker.as_ref(), &config.scheduler.queue.name).await;

    Ok(())
}

async fn log_queue_stats(broker: &dyn Broker, queue: &str) {
    match broker.stats(queue).await {
        Ok(stats) => info!(
            ready = stats.ready,
            reserved = stats.reserved,
            done = stats.done,
            dead = stats.dead,
            "Queue state at shutdown"
        ),
        Err(e) => warn!(error = %e, "Could not read queue stats"),
    }
}
