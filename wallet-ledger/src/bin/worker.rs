//! Ledger worker binary
//!
//! Runs the periodic sweeps (lock maturity, goal auto-save, balance audit)
//! against the Postgres store until Ctrl-C.

use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use wallet_ledger::integration::TracingNotifier;
use wallet_ledger::{
    Config, GoalService, Ledger, LockedService, Metrics, PgStore, Scheduler, SystemClock,
};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());
    let json = std::env::var("LEDGER_LOG_JSON").map(|v| v == "1").unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("LEDGER_CONFIG") {
        Ok(path) => {
            let mut config = Config::from_file(&path)
                .with_context(|| format!("loading config from {}", path))?;
            config.apply_env()?;
            config.validate()?;
            Ok(config)
        }
        Err(_) => Ok(Config::from_env()?),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = load_config()?;
    info!(
        "Starting {} v{}",
        config.service_name, config.service_version
    );

    let store = PgStore::connect(&config.database)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;

    let metrics = Metrics::new()?;
    let ledger = Arc::new(Ledger::new(
        Arc::new(store),
        Arc::new(SystemClock),
        metrics,
        &config.ledger,
    ));
    let notifier = Arc::new(TracingNotifier);

    let locked = Arc::new(LockedService::new(
        ledger.clone(),
        notifier.clone(),
        config.locked.clone(),
    ));
    let goals = Arc::new(GoalService::new(ledger.clone(), notifier));

    let scheduler = Arc::new(Scheduler::new(ledger, locked, goals, config.jobs.clone()));
    let handles = scheduler.spawn();
    info!("Worker running {} schedulers", handles.len());

    tokio::signal::ctrl_c().await?;

    info!("Shutting down worker");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
