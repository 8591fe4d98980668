//! Daemon orchestration: one director per configured service, one
//! shared IPVS handle, one shared mDNS daemon, and the single dispatch
//! loop that keeps all index mutation on one task.

use std::sync::Arc;

use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::director::{ServiceDirector, VirtualService};
use crate::discovery::{self, DiscoveryEvent};
use crate::ipvs::Ipvs;

pub struct Instance {
    mdns: ServiceDaemon,
    directors: Vec<ServiceDirector<Ipvs>>,
    browse_types: Vec<String>,
    events: mpsc::Receiver<(usize, DiscoveryEvent)>,
    pumps: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Instance {
    /// Wires every configured service to a director and a browse
    /// subscription. Any failure here is fatal to startup.
    pub fn new(
        config: &Config,
        ipvs: Arc<Ipvs>,
        mdns: ServiceDaemon,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (tx, events) = mpsc::channel(256);

        let mut directors = Vec::with_capacity(config.services.len());
        let mut browse_types = Vec::with_capacity(config.services.len());
        let mut pumps = Vec::with_capacity(config.services.len());

        for (index, service) in config.services.iter().enumerate() {
            if let Some(interface) = &service.zeroconf_interface {
                // mdns-sd filters by name, but resolve first so a bad
                // name fails startup instead of silently matching
                // nothing.
                nix::net::if_::if_nametoindex(interface.as_str())
                    .with_context(|| format!("failed to find interface '{interface}'"))?;
                mdns.enable_interface(interface.as_str())
                    .with_context(|| format!("failed to enable interface '{interface}'"))?;
            }

            let ty = discovery::zeroconf_service_type(
                &service.zeroconf_service,
                service.zeroconf_domain.as_deref(),
            );
            let receiver = mdns
                .browse(&ty)
                .with_context(|| format!("failed to browse {ty}"))?;

            let bind = service.bind_v4()?;
            let director = ServiceDirector::new(
                Arc::clone(&ipvs),
                ty.clone(),
                VirtualService {
                    bind,
                    scheduler: service.scheduler.clone(),
                },
            )
            .with_context(|| format!("failed to register virtual service {bind}"))?;

            tracing::info!("service {bind} (scheduler {}) tracking {ty}", service.scheduler);

            pumps.push(tokio::spawn(discovery::pump(
                index,
                receiver,
                tx.clone(),
                cancel.clone(),
            )));
            directors.push(director);
            browse_types.push(ty);
        }

        Ok(Self {
            mdns,
            directors,
            browse_types,
            events,
            pumps,
            cancel,
        })
    }

    /// Dispatches discovery events to their director, one at a time,
    /// until cancelled. Handlers run inline, so no two ever overlap
    /// and the indices need no locking.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                Some((index, event)) = self.events.recv() => {
                    let director = &mut self.directors[index];
                    match event {
                        DiscoveryEvent::Observed { key, address } => {
                            director.on_observed(&key, address);
                        }
                        DiscoveryEvent::Removed { key } => {
                            director.on_removed(&key);
                        }
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    /// Tears the instance down in order: pumps, subscriptions,
    /// directors (whose Drop removes the kernel services), then the
    /// mDNS daemon. Every step is best-effort.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();

        for pump in self.pumps.drain(..) {
            let _ = pump.await;
        }

        for ty in &self.browse_types {
            if let Err(err) = self.mdns.stop_browse(ty) {
                tracing::warn!("failed to stop browsing {ty}: {err}");
            }
        }

        self.directors.clear();

        if let Err(err) = self.mdns.shutdown() {
            tracing::error!("failed to shut down mDNS daemon: {err}");
        }
    }
}
