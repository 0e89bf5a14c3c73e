use std::sync::Arc;

use clap::Parser;
use timekeeper_core::TimekeeperConfig;
use timekeeper_timers::{AutoTimer, SqliteTimerStore, TimerService, TokioClock, TokioExecutor};
use tracing::{info, warn};

mod invoker;

use invoker::LogInvoker;

#[derive(Parser)]
#[command(version, about = "Run transactional timer services for the configured timed objects")]
struct Cli {
    /// Path to timekeeper.toml (falls back to TIMEKEEPER_CONFIG, then ~/.timekeeper/timekeeper.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "timekeeper=info,timekeeper_timers=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .or_else(|| std::env::var("TIMEKEEPER_CONFIG").ok());
    let config = TimekeeperConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        TimekeeperConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let db = rusqlite::Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let store = Arc::new(SqliteTimerStore::new(db)?);

    let runtime = tokio::runtime::Handle::current();
    let clock = Arc::new(TokioClock::new(runtime.clone()));
    let executor = Arc::new(TokioExecutor::new(runtime, config.engine.worker_threads));

    let mut services = Vec::with_capacity(config.timed_objects.len());
    for object in &config.timed_objects {
        let service = TimerService::builder(Arc::new(LogInvoker::new(&object.id)), clock.clone())
            .persistence(store.clone())
            .executor(executor.clone())
            .auto_timers(object.auto_timers.iter().map(AutoTimer::from))
            .config(config.engine.clone())
            .build();
        service.start()?;
        info!(
            timed_object = %object.id,
            timers = service.get_timers()?.len(),
            "timed object deployed"
        );
        services.push(service);
    }
    if services.is_empty() {
        warn!("no timed objects configured; nothing will fire");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    for service in &services {
        service.stop();
    }
    executor.close();
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
