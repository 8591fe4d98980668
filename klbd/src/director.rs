use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use crate::ipvs::{IpvsError, IpvsTable};

/// One virtual service as the kernel sees it: a TCP bind address plus
/// a scheduler name. The scheduler is opaque configuration data here;
/// the kernel interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualService {
    pub bind: SocketAddrV4,
    pub scheduler: String,
}

/// A backend behind a virtual service. Connection mode (masquerade)
/// and weight (1) are fixed, so the address/port pair is the whole
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    pub addr: SocketAddrV4,
}

impl Destination {
    pub fn tuple(&self) -> (Ipv4Addr, u16) {
        (*self.addr.ip(), self.addr.port())
    }
}

/// Reconciles one virtual service against discovery events.
///
/// Keeps two indices that mirror each other: `destinations` maps the
/// discovery key to the destination registered in the kernel, and
/// `addresses` maps the (address, port) tuple back to the key that
/// currently owns it. Between events the key set of `destinations`
/// always equals the value set of `addresses`.
pub struct ServiceDirector<T: IpvsTable> {
    /// Log context; the browsed zeroconf service type.
    name: String,
    service: VirtualService,
    table: Arc<T>,
    destinations: HashMap<String, Destination>,
    addresses: HashMap<(Ipv4Addr, u16), String>,
}

impl<T: IpvsTable> ServiceDirector<T> {
    /// Registers the virtual service in the kernel. A failure here is
    /// fatal to this director's startup.
    pub fn new(table: Arc<T>, name: String, service: VirtualService) -> Result<Self, IpvsError> {
        table.add_service(&service)?;

        Ok(Self {
            name,
            service,
            table,
            destinations: HashMap::new(),
            addresses: HashMap::new(),
        })
    }

    /// A backend instance was observed (or re-announced) by the
    /// discovery layer.
    pub fn on_observed(&mut self, key: &str, address: SocketAddr) {
        let SocketAddr::V4(addr) = address else {
            // Only IPv4 backends are handled; anything else is
            // expected protocol traffic, not a fault.
            return;
        };

        let dest = Destination { addr };

        // A re-announcement may move this key to a new address; the
        // old tuple must not stay registered under it.
        let previous = self.destinations.get(key).copied();
        if let Some(previous) = previous.filter(|p| p.tuple() != dest.tuple()) {
            if let Err(err) = self.table.delete_destination(&self.service, &previous) {
                tracing::error!(service = %self.name, key, address = %previous.addr, %err,
                                "failed to delete stale destination");
            }

            self.addresses.remove(&previous.tuple());
            self.destinations.remove(key);
        }

        // The address/port pair may already be registered under a
        // different key. Delete and re-add instead of editing, because
        // parameters other than the pair may have changed.
        if let Some(owner) = self.addresses.remove(&dest.tuple()) {
            if let Some(old) = self.destinations.remove(&owner) {
                if let Err(err) = self.table.delete_destination(&self.service, &old) {
                    tracing::error!(service = %self.name, key = %owner, address = %old.addr, %err,
                                    "failed to delete replaced destination");
                }
            }
        }

        if let Err(err) = self.table.add_destination(&self.service, &dest) {
            // Leave both indices untouched so memory never claims a
            // destination the kernel does not have.
            tracing::error!(service = %self.name, key, address = %addr, %err,
                            "failed to add destination");
            return;
        }

        self.destinations.insert(key.to_owned(), dest);
        self.addresses.insert(dest.tuple(), key.to_owned());
    }

    /// A backend instance disappeared. Unknown keys are a no-op.
    pub fn on_removed(&mut self, key: &str) {
        let Some(dest) = self.destinations.remove(key) else {
            return;
        };

        // The discovery layer has declared the object gone; the index
        // entries go away even if the kernel call fails.
        if let Err(err) = self.table.delete_destination(&self.service, &dest) {
            tracing::error!(service = %self.name, key, address = %dest.addr, %err,
                            "failed to delete destination");
        }

        let owner = self.addresses.remove(&dest.tuple());
        debug_assert_eq!(owner.as_deref(), Some(key));
    }
}

impl<T: IpvsTable> Drop for ServiceDirector<T> {
    fn drop(&mut self) {
        // Best effort; shutdown must complete regardless.
        if let Err(err) = self.table.delete_service(&self.service) {
            tracing::error!(service = %self.name, %err, "failed to delete virtual service");
        }
    }
}
