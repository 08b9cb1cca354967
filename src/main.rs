use microclimate_risk::config::Config;
use microclimate_risk::db::PgHistory;
use microclimate_risk::history::{AssessmentHistory, InMemoryHistory};
use microclimate_risk::loader::load_dataset;
use microclimate_risk::scheduler::Scheduler;
use microclimate_risk::Engine;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,microclimate_risk=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Micro-climate risk engine starting...");

    let config = Config::load("config/config.yaml").map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration: {}\n\n\
             Make sure:\n\
             1. config/config.yaml exists\n\
             2. All required environment variables are set (check .env.example)\n\
             3. Create a .env file if needed",
            e
        )
    })?;
    info!("Configuration loaded");

    let history: Arc<dyn AssessmentHistory> = match &config.database {
        Some(db) => {
            let history = PgHistory::connect(db).await.map_err(|e| {
                anyhow::anyhow!(
                    "Failed to connect to database: {}\n\n\
                     Host: {}:{}\n\
                     Database: {}\n\
                     User: {}\n\n\
                     Common fixes:\n\
                     1. Ensure PostgreSQL is running\n\
                     2. Check username/password are correct (DB_USER, DB_PASSWORD)\n\
                     3. Verify database exists: createdb {}",
                    e,
                    db.host,
                    db.port,
                    db.name,
                    db.user,
                    db.name
                )
            })?;
            info!(
                "Connected to database: {}@{}:{}/{}",
                db.user, db.host, db.port, db.name
            );
            history.run_migrations().await?;
            Arc::new(history)
        }
        None => {
            warn!("No database configured, assessment history is kept in memory only");
            Arc::new(InMemoryHistory::new())
        }
    };

    let dataset = Arc::new(load_dataset(&config.data.dir)?);
    let engine = Arc::new(Engine::new(&config, dataset.clone(), dataset, history)?);
    engine.rebuild_index().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let mut scheduler = Scheduler::new(engine, config.scheduler.clone(), shutdown_rx);

    if let Err(e) = scheduler.run().await {
        error!("Scheduler error: {}", e);
    }

    info!("Micro-climate risk engine shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating shutdown");
        }
    }
}
