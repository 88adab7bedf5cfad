//! `process-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `serve`    start the HTTP API with the notification dispatcher and
//!              the escalation scheduler running alongside.
//! - `migrate`  run pending database migrations.
//! - `validate` check a process definition JSON file, optionally against
//!              a rules file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::WorkflowStore;
use engine::{
    DefinitionSpec, EngineConfig, EscalationConfig, EscalationScheduler, ProcessEngine, RuleConfig, RuleValidator,
};
use integrations::mock::StaticSnapshots;
use integrations::{LogChannel, NotificationChannel};
use queue::{ChannelRegistry, Dispatcher, DispatcherConfig};

#[derive(Parser)]
#[command(
    name = "process-engine",
    about = "Business process engine: staged approvals, rules, notifications and escalation",
    version
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the REST API server and background workers.
    Serve(ServeArgs),
    /// Run pending database migrations.
    Migrate {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,
    },
    /// Validate a process definition JSON file.
    Validate {
        /// Path to the definition JSON file.
        path: PathBuf,
        /// Rules file; when given, every rule the definition names must be in it.
        #[arg(long, env = "RULES_FILE")]
        rules: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind: String,

    /// Postgres connection string. Without it state is kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 10)]
    max_connections: u32,

    /// JSON object keyed by `"<objectType>/<objectId>"` with business
    /// object snapshots used by rule evaluation.
    #[arg(long, env = "SNAPSHOTS_FILE")]
    snapshots: Option<PathBuf>,

    /// JSON array of rule configurations registered at start-up.
    #[arg(long, env = "RULES_FILE")]
    rules: Option<PathBuf>,

    #[arg(
        long,
        env = "ESCALATION_TICK_SECS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    escalation_tick_secs: u64,

    #[arg(long, env = "ESCALATION_COOLDOWN_MINUTES", default_value_t = 240)]
    escalation_cooldown_minutes: u32,

    #[arg(long, env = "REMINDER_HORIZON_HOURS", default_value_t = 72)]
    reminder_horizon_hours: i64,

    #[arg(
        long,
        env = "NOTIFY_SWEEP_SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    sweep_secs: u64,

    #[arg(long, env = "NOTIFY_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    #[arg(long, env = "NOTIFY_RETRY_BASE_SECS", default_value_t = 30)]
    retry_base_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Migrate { database_url } => {
            info!("Running migrations");
            let pool = db::pool::create_pool(&database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
            Ok(())
        }
        Command::Validate { path, rules } => validate(&path, rules.as_deref()),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn validate(path: &Path, rules: Option<&Path>) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    let spec: DefinitionSpec = serde_json::from_str(&content).context("invalid definition JSON")?;

    engine::validate_definition(&spec).context("validation failed")?;
    if let Some(rules) = rules {
        load_rules(rules)?
            .ensure_known(&spec.business_rules)
            .context("validation failed")?;
    }
    println!("Definition '{}' is valid ({} stages)", spec.name, spec.stages.len());
    Ok(())
}

fn load_rules(path: &Path) -> anyhow::Result<RuleValidator> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    let configs: Vec<RuleConfig> =
        serde_json::from_str(&content).context("rules file must be a JSON array of rules")?;

    let rules = RuleValidator::new();
    let count = rules.register_config(configs)?;
    info!(rules = count, file = %path.display(), "business rules loaded");
    Ok(rules)
}

fn load_snapshots(path: &Path) -> anyhow::Result<StaticSnapshots> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    let objects: HashMap<String, Value> =
        serde_json::from_str(&content).context("snapshots file must be a JSON object")?;

    let snapshots = StaticSnapshots::new();
    for (key, snapshot) in objects {
        let Some((object_type, object_id)) = key.split_once('/') else {
            bail!("snapshot key '{key}' is not '<objectType>/<objectId>'");
        };
        snapshots.set(object_type, object_id, snapshot);
    }
    Ok(snapshots)
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let store: Arc<dyn WorkflowStore> = match &args.database_url {
        Some(url) => {
            let pool = db::pool::create_pool(url, args.max_connections)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            Arc::new(db::PgStore::new(pool))
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            Arc::new(db::MemoryStore::new())
        }
    };

    let snapshots = match &args.snapshots {
        Some(path) => load_snapshots(path)?,
        None => StaticSnapshots::new(),
    };
    let rules = match &args.rules {
        Some(path) => load_rules(path).context("cannot load rules")?,
        None => {
            warn!("RULES_FILE not set; no business rules are registered");
            RuleValidator::new()
        }
    };

    let mut channels: ChannelRegistry = HashMap::new();
    for name in ["email", "sms", "push"] {
        channels.insert(name.to_string(), Arc::new(LogChannel) as Arc<dyn NotificationChannel>);
    }
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        channels,
        DispatcherConfig {
            max_attempts: args.max_attempts,
            retry_base_delay: Duration::from_secs(args.retry_base_secs),
            sweep_interval: Duration::from_secs(args.sweep_secs),
            ..DispatcherConfig::default()
        },
    ));

    let engine = Arc::new(ProcessEngine::new(
        store,
        Arc::clone(&dispatcher),
        Arc::new(snapshots),
        Arc::new(rules),
        EngineConfig {
            escalation_cooldown_minutes: args.escalation_cooldown_minutes,
        },
    ));
    let scheduler = Arc::new(EscalationScheduler::new(
        Arc::clone(&engine),
        EscalationConfig {
            tick: Duration::from_secs(args.escalation_tick_secs),
            reminder_horizon: chrono::Duration::hours(args.reminder_horizon_hours),
            ..EscalationConfig::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dispatcher_task = tokio::spawn(Arc::clone(&dispatcher).run(shutdown_rx.clone()));
    let scheduler_task = tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("cannot bind {}", args.bind))?;

    let mut http_shutdown = shutdown_rx;
    let signal = async move {
        let _ = http_shutdown.changed().await;
    };
    let server = tokio::spawn(api::serve(listener, api::AppState { engine }, signal));

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("Shutdown requested");
    let _ = shutdown_tx.send(true);

    server.await.context("http server task panicked")??;
    let _ = tokio::join!(dispatcher_task, scheduler_task);
    info!("Stopped");
    Ok(())
}
