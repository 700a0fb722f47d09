//! Command-line interface.

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::{CompletionStrategy, Config};

/// Completion strategy as accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StrategyArg {
    /// In-process sleep, lost on restart
    BoundDelay,
    /// Durable queue with at-least-once workers
    DurableQueue,
}

impl From<StrategyArg> for CompletionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::BoundDelay => CompletionStrategy::BoundDelay,
            StrategyArg::DurableQueue => CompletionStrategy::DurableQueue,
        }
    }
}

/// Multi-tenant task backend with deferred completion
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Path to database file (overrides config)
    #[arg(short, long, global = true)]
    pub database: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Logging output: 0/off, 1/stdout, 2/stderr (default), or filename
    #[arg(short, long, default_value = "2", global = true)]
    pub log: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP and WebSocket server (default if no subcommand given)
    Serve(ServeArgs),

    /// Run standalone durable-queue workers
    Worker(WorkerArgs),
}

#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// Listen port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Listen address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,

    /// Completion strategy (overrides config)
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {
    /// Number of concurrent workers
    #[arg(short = 'n', long, default_value_t = 1)]
    pub concurrency: usize,

    /// Queue to consume (overrides config)
    #[arg(long)]
    pub queue: Option<String>,
}

impl Cli {
    /// Apply flags that override configuration values.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(db) = &self.database {
            config.server.db_path = db.into();
        }

        match &self.command {
            Some(Command::Serve(args)) => {
                if let Some(port) = args.port {
                    config.server.port = port;
                }
                if let Some(bind) = &args.bind {
                    config.server.bind = bind.clone();
                }
                if let Some(strategy) = args.strategy {
                    config.scheduler.strategy = strategy.into();
                }
            }
            Some(Command::Worker(args)) => {
                if let Some(queue) = &args.queue {
                    config.scheduler.queue.name = queue.clone();
                }
            }
            None => {}
        }
    }
}
