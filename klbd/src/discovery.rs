//! Bridge from mdns-sd browse events to the director contract.

use std::net::{IpAddr, SocketAddr};

use mdns_sd::{ServiceEvent, ServiceInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The two notifications a director reacts to. The key is the mDNS
/// instance fullname, unique and stable per observed backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Observed { key: String, address: SocketAddr },
    Removed { key: String },
}

/// Normalize a configured zeroconf service type into a full DNS-SD
/// browse name: `_http._tcp` becomes `_http._tcp.local.`. A bare word
/// like `http` gets the leading underscore and a `_tcp` suffix.
pub fn zeroconf_service_type(service: &str, domain: Option<&str>) -> String {
    let mut name = String::new();
    if !service.starts_with('_') {
        name.push('_');
    }
    name.push_str(service);
    if !name.contains("._tcp") && !name.contains("._udp") {
        name.push_str("._tcp");
    }
    if !name.ends_with('.') {
        name.push('.');
    }
    name.push_str(domain.unwrap_or("local"));
    if !name.ends_with('.') {
        name.push('.');
    }
    name
}

/// Converts a resolved instance into an `Observed` event. Instances
/// with no addresses yield nothing.
pub fn observed_event(info: &ServiceInfo) -> Option<DiscoveryEvent> {
    let ip = pick_address(info.get_addresses())?;

    Some(DiscoveryEvent::Observed {
        key: info.get_fullname().to_owned(),
        address: SocketAddr::new(ip, info.get_port()),
    })
}

/// IPv4 is preferred when the instance announced several addresses; a
/// v6-only instance still yields one so the director can apply its own
/// family filter.
fn pick_address<'a>(addresses: impl IntoIterator<Item = &'a IpAddr>) -> Option<IpAddr> {
    let mut fallback = None;
    for addr in addresses {
        if addr.is_ipv4() {
            return Some(*addr);
        }
        if fallback.is_none() {
            fallback = Some(*addr);
        }
    }
    fallback
}

/// Forwards one subscription's events into the shared dispatch
/// channel, tagged with the owning service's index. Translation only;
/// all reconciliation happens on the dispatch loop's task.
pub async fn pump(
    index: usize,
    receiver: flume::Receiver<ServiceEvent>,
    tx: mpsc::Sender<(usize, DiscoveryEvent)>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            event = receiver.recv_async() => {
                match event {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        match observed_event(&info) {
                            Some(event) => {
                                if tx.send((index, event)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                tracing::debug!("ignoring {} with no addresses",
                                                info.get_fullname());
                            }
                        }
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        if tx.send((index, DiscoveryEvent::Removed { key: fullname })).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        tracing::warn!("mDNS receiver for subscription {index} closed: {err}");
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn service_type_normalization() {
        let cases = [
            (("_http._tcp", None), "_http._tcp.local."),
            (("_http._tcp.", None), "_http._tcp.local."),
            (("http", None), "_http._tcp.local."),
            (("_ipp._udp", None), "_ipp._udp.local."),
            (("_http._tcp", Some("local")), "_http._tcp.local."),
            (("_http._tcp", Some("example.org")), "_http._tcp.example.org."),
            (("_http._tcp", Some("example.org.")), "_http._tcp.example.org."),
        ];

        for ((service, domain), expected) in cases {
            assert_eq!(zeroconf_service_type(service, domain), expected);
        }
    }

    #[test]
    fn resolved_instance_becomes_observed_event() {
        let info = ServiceInfo::new(
            "_http._tcp.local.",
            "backend1",
            "backend1.local.",
            "10.0.0.5",
            8080,
            HashMap::<String, String>::new(),
        )
        .unwrap();

        assert_eq!(
            observed_event(&info),
            Some(DiscoveryEvent::Observed {
                key: "backend1._http._tcp.local.".to_owned(),
                address: "10.0.0.5:8080".parse().unwrap(),
            })
        );
    }

    #[test]
    fn ipv4_is_preferred_over_ipv6() {
        let addrs: Vec<IpAddr> = vec![
            "2001:db8::5".parse().unwrap(),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
        ];

        assert_eq!(pick_address(&addrs), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))));
    }

    #[test]
    fn ipv6_only_instance_still_yields_an_address() {
        let addrs: Vec<IpAddr> = vec!["2001:db8::5".parse().unwrap()];
        assert_eq!(pick_address(&addrs), Some("2001:db8::5".parse().unwrap()));
    }

    #[test]
    fn instance_without_addresses_yields_nothing() {
        assert_eq!(pick_address(&[]), None);
    }
}
