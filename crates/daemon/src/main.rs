//! GarlicCraft Daemon Binary
//!
//! Loads settings, starts the router core, and drains it cleanly on
//! ctrl-c. Startup failures exit nonzero.

use std::path::PathBuf;

use anyhow::Context;

use garliccraft_core::{i2p_base64_decode, Hash};
use garliccraft_router::{Router, RouterConfig};
use garliccraft_settings::Settings;

fn settings_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| default_home().join("settings.json"))
}

fn default_home() -> PathBuf {
    std::env::var_os("GARLICCRAFT_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".garliccraft")
        })
}

fn router_config(settings: &Settings) -> anyhow::Result<RouterConfig> {
    let mut explicit_peers = Vec::new();
    for encoded in &settings.explicit_peers {
        let bytes = i2p_base64_decode(encoded)
            .with_context(|| format!("bad explicit peer {encoded}"))?;
        let hash = Hash::from_slice(&bytes)
            .with_context(|| format!("explicit peer {encoded} is not a hash"))?;
        explicit_peers.push(hash);
    }
    Ok(RouterConfig {
        data_dir: settings.data_dir(),
        host: settings.host.clone(),
        port: settings.port,
        v6: settings.v6,
        floodfill: settings.floodfill,
        bandwidth: settings.bandwidth,
        max_participating: settings.max_participating,
        explicit_peers,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    garliccraft_logging::init();

    let path = settings_path();
    let settings = Settings::load_from(&path).context("loading settings")?;
    tracing::info!(?path, "starting GarlicCraft router");

    let config = router_config(&settings)?;
    let router = Router::start(config).await.context("router startup")?;

    tokio::signal::ctrl_c().await.context("signal handler")?;
    tracing::info!("received shutdown signal");
    router.stop().await;
    Ok(())
}
