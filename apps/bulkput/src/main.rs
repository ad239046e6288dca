//! bulkput entry point.

mod app;
mod config;
mod scan;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting bulkput");

    let config = config::AppConfig::load()?;
    tracing::info!(
        source = ?config.source,
        store_root = %config.store_root.display(),
        dest = %config.bundle.remote_dest,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("upload finished");
    Ok(())
}
