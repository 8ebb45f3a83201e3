use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use relaunch::app::App;
use relaunch::cli::Cli;
use relaunch::config::RelaunchConfig;
use relaunch::job::{JobTypeRegistry, SLEEP_JOB_TYPE, SleepJob};
use relaunch::logging;
use relaunch::store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = RelaunchConfig::load(&cli.config)?;
    if let Some(bind) = cli.bind {
        config.bind = bind;
    }

    let store = Arc::new(
        SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?,
    );
    let mut registry = JobTypeRegistry::new();
    registry.register(SLEEP_JOB_TYPE, Arc::new(SleepJob));

    let bind = config.bind.clone();
    let mut app = App::new(config, registry, store).await?;
    let router = app.router();
    let background = app.start_background();

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(%bind, "listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    for task in background {
        task.abort();
    }
    Ok(())
}
