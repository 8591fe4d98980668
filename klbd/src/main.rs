mod config;
mod director;
mod discovery;
mod instance;
mod ipvs;

use std::sync::Arc;

use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::instance::Instance;
use crate::ipvs::Ipvs;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("klbd=info")),
        )
        .init();

    tracing::info!("starting klbd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/klbd/klbd.toml".to_owned());

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {config_path}"))?;

    tracing::info!("loaded {} service(s) from {}", config.services.len(), config_path);

    let ipvs = Arc::new(Ipvs::open().context("failed to open IPVS control channel")?);

    // Clear whatever a previous (possibly crashed) instance left in
    // the kernel table.
    ipvs.flush().context("failed to flush IPVS table")?;

    let mdns = ServiceDaemon::new().context("failed to create mDNS daemon")?;

    // Restrict the daemon to the named interfaces, but only when every
    // service names one; an unfiltered service needs them all.
    if config.services.iter().all(|s| s.zeroconf_interface.is_some()) {
        mdns.disable_interface(mdns_sd::IfKind::All)
            .context("failed to disable default interfaces")?;
    }

    let cancel = CancellationToken::new();
    let mut instance = Instance::new(&config, ipvs, mdns, cancel.clone())?;

    // Tell systemd we're ready; harmless outside systemd.
    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        tracing::debug!("systemd readiness notification skipped: {err}");
    }

    let mut sigterm =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = instance.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received");
        }
        _ = sigterm.recv() => {
            tracing::info!("SIGTERM received");
        }
    }

    cancel.cancel();
    instance.shutdown().await;

    tracing::info!("shutdown complete");
    Ok(())
}
