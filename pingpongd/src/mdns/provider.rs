use std::collections::HashMap;
use std::net::IpAddr;
use std::thread;
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use anyhow::{Context, Result};
use shared::protocol::TXT_PAYLOAD;
use shared::types::{identifier_from_fullname, ServiceRecord};
use super::{DiscoveryEvent, DiscoveryProvider};

const META_QUERY_TYPE: &str = "_services._dns-sd._udp.local.";

/// Multicast DNS provider backed by an `mdns-sd` daemon.
pub struct MdnsProvider {
    daemon: ServiceDaemon,
    host_name: String,
}

impl MdnsProvider {
    /// Start the mDNS daemon, optionally restricted to a single interface.
    pub fn new(interface: Option<&str>) -> Result<Self> {
        let daemon = ServiceDaemon::new().context("Failed to create mDNS daemon")?;

        if let Some(interface) = interface {
            daemon
                .disable_interface(IfKind::All)
                .context("Failed to disable default interfaces")?;
            daemon
                .enable_interface(interface)
                .with_context(|| format!("Failed to enable interface {}", interface))?;
        }

        let hostname = hostname::get()
            .context("Failed to get system hostname")?
            .to_string_lossy()
            .to_string();

        Ok(Self {
            daemon,
            host_name: mdns_host_name(&hostname),
        })
    }
}

impl DiscoveryProvider for MdnsProvider {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        let txt_records = HashMap::from([(TXT_PAYLOAD.to_string(), record.payload.clone())]);

        let mut service_info = ServiceInfo::new(
            &record.service_type,
            &record.identifier,
            &self.host_name,
            record.addresses.as_slice(),
            record.port,
            txt_records,
        )
        .context("Failed to create ServiceInfo")?;

        if record.addresses.is_empty() {
            service_info = service_info.enable_addr_auto();
        }

        self.daemon
            .register(service_info)
            .context("Failed to register mDNS service")?;

        tracing::info!(
            "Registered {} as {} on port {}",
            record.service_type,
            record.identifier,
            record.port
        );
        Ok(())
    }

    fn unregister(&self, record: &ServiceRecord) -> Result<()> {
        let fullname = record.fullname();
        self.daemon
            .unregister(&fullname)
            .context("Failed to unregister mDNS service")?;

        tracing::info!("Unregistered {}", fullname);
        Ok(())
    }

    fn browse_types(&self) -> Result<flume::Receiver<DiscoveryEvent>> {
        let receiver = self
            .daemon
            .browse(META_QUERY_TYPE)
            .context("Failed to start meta-query browse")?;

        // Meta-query answers name service types, not instances
        forward(receiver, "types", |event| match event {
            ServiceEvent::ServiceFound(_, service_type) => Some(DiscoveryEvent::TypeAdded(service_type)),
            ServiceEvent::ServiceResolved(info) => {
                Some(DiscoveryEvent::TypeAdded(info.get_fullname().to_string()))
            }
            _ => None,
        })
    }

    fn browse(&self, service_type: &str) -> Result<flume::Receiver<DiscoveryEvent>> {
        let receiver = self
            .daemon
            .browse(service_type)
            .with_context(|| format!("Failed to browse {}", service_type))?;

        forward(receiver, service_type, |event| match event {
            ServiceEvent::ServiceFound(service_type, fullname) => {
                Some(DiscoveryEvent::Found { service_type, fullname })
            }
            ServiceEvent::ServiceResolved(info) => convert_service_info(&info).map(DiscoveryEvent::Resolved),
            ServiceEvent::ServiceRemoved(service_type, fullname) => {
                Some(DiscoveryEvent::Removed { service_type, fullname })
            }
            _ => None,
        })
    }

    fn shutdown(&self) -> Result<()> {
        self.daemon
            .shutdown()
            .context("Failed to shutdown mDNS daemon")?;
        Ok(())
    }
}

/// Relay daemon events onto a channel of our own event type. The relay thread
/// ends when either side of it disconnects.
fn forward<F>(
    source: flume::Receiver<ServiceEvent>,
    label: &str,
    convert: F,
) -> Result<flume::Receiver<DiscoveryEvent>>
where
    F: Fn(ServiceEvent) -> Option<DiscoveryEvent> + Send + 'static,
{
    let (tx, rx) = flume::unbounded();
    let label = label.to_string();

    thread::Builder::new()
        .name(format!("mdns-relay-{}", label))
        .spawn(move || {
            while let Ok(event) = source.recv() {
                if let Some(event) = convert(event) {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            }
            tracing::debug!("mDNS relay for {} exiting", label);
        })
        .context("Failed to spawn mDNS relay thread")?;

    Ok(rx)
}

/// Convert an mdns-sd ServiceInfo to our ServiceRecord
fn convert_service_info(info: &ServiceInfo) -> Option<ServiceRecord> {
    let service_type = info.get_type();
    let Some(identifier) = identifier_from_fullname(info.get_fullname(), service_type) else {
        tracing::debug!("Skipping service {} - unexpected instance name", info.get_fullname());
        return None;
    };

    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    Some(ServiceRecord {
        identifier: identifier.to_string(),
        service_type: service_type.to_string(),
        addresses,
        port: info.get_port(),
        payload: info
            .get_property_val_str(TXT_PAYLOAD)
            .unwrap_or_default()
            .to_string(),
    })
}

/// mDNS host names must live under ".local."
fn mdns_host_name(hostname: &str) -> String {
    let bare = hostname.trim_end_matches('.').trim_end_matches(".local");
    format!("{}.local.", bare)
}
