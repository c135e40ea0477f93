use anyhow::{Context, Result};
use facematch_store::Store;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{FaceMatchService, BUS_NAME, OBJECT_PATH};
use engine::EngineSettings;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facematchd starting");

    let config = Config::from_env();
    let store = Store::open(&config.db_path)
        .with_context(|| format!("opening face store at {}", config.db_path.display()))?;

    let engine = engine::spawn_engine(
        store,
        EngineSettings {
            matcher: config.matcher_config(),
            rebuild_on_enroll: config.rebuild_on_enroll,
            queue_depth: config.queue_depth,
        },
    )?;

    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceMatchService::new(engine))?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "facematchd ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facematchd shutting down");

    Ok(())
}
