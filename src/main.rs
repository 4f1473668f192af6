use anyhow::Context;
use tracing::{debug, info};

use catalyst_sync::{logging, SyncConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = SyncConfig::from_env().context("invalid configuration")?;
    let _log_guard = logging::init(&config.log_dir(), config.log_json)?;

    info!("Starting catalyst-sync v{}", env!("CARGO_PKG_VERSION"));
    debug!(?config, "Configuration loaded");

    catalyst_sync::run(config).await
}
