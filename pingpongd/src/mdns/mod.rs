pub mod advertise;
pub mod browser;
pub mod provider;

use anyhow::Result;
use shared::types::ServiceRecord;

pub use provider::MdnsProvider;

/// Something the discovery provider observed on the network.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    /// A service type is being advertised by someone
    TypeAdded(String),
    /// An instance name was seen; resolution is under way
    Found { service_type: String, fullname: String },
    /// An instance was fully resolved to addresses and a port
    Resolved(ServiceRecord),
    /// An instance went away
    Removed { service_type: String, fullname: String },
}

/// Zero-configuration advertisement and lookup.
///
/// Events are delivered as messages on channels so that consumers never run
/// on the provider's own threads.
pub trait DiscoveryProvider: Send + Sync {
    fn register(&self, record: &ServiceRecord) -> Result<()>;

    fn unregister(&self, record: &ServiceRecord) -> Result<()>;

    /// Subscribe to `TypeAdded` events for every service type on the network.
    fn browse_types(&self) -> Result<flume::Receiver<DiscoveryEvent>>;

    /// Subscribe to found/resolved/removed events for one service type.
    fn browse(&self, service_type: &str) -> Result<flume::Receiver<DiscoveryEvent>>;

    /// Release the provider session. Nothing else may be called afterwards.
    fn shutdown(&self) -> Result<()>;
}
