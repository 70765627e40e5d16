use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::protocol::SERVICE_TYPE;

/// One advertised or discovered service instance.
/// Published records are never mutated; a new identity means a new record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance name, unique per advertiser, e.g. "annon-1804289383"
    pub identifier: String,

    /// Always `SERVICE_TYPE` for records this node publishes
    pub service_type: String,

    /// Addresses the instance can be reached on (empty when advertising
    /// with automatic address detection)
    pub addresses: Vec<IpAddr>,

    /// Port of the instance's connection server
    pub port: u16,

    /// Informational text carried in the TXT record
    pub payload: String,
}

impl ServiceRecord {
    pub fn new(identifier: impl Into<String>, port: u16, payload: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            service_type: SERVICE_TYPE.to_string(),
            addresses: Vec::new(),
            port,
            payload: payload.into(),
        }
    }

    pub fn with_addresses(mut self, addresses: Vec<IpAddr>) -> Self {
        self.addresses = addresses;
        self
    }

    /// Full DNS-SD instance name, e.g. "annon-42._pingpong._tcp.local."
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.identifier, self.service_type)
    }

    /// Address a request should be sent to: IPv4 first, then any IPv6
    /// address that does not need a scope id (i.e. not link-local).
    pub fn first_usable_address(&self) -> Option<IpAddr> {
        self.addresses
            .iter()
            .find(|addr| addr.is_ipv4())
            .or_else(|| {
                self.addresses.iter().find(|addr| match addr {
                    IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
                    IpAddr::V4(_) => false,
                })
            })
            .copied()
    }
}

/// Recover the instance identifier from a full DNS-SD name.
pub fn identifier_from_fullname<'a>(fullname: &'a str, service_type: &str) -> Option<&'a str> {
    fullname
        .strip_suffix(service_type)
        .and_then(|rest| rest.strip_suffix('.'))
        .filter(|identifier| !identifier.is_empty())
}

/// A peer that was resolved and answered our request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub identifier: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub payload: String,

    /// What the peer answered when it was confirmed
    pub response: String,

    pub confirmed_at: DateTime<Utc>,
}

impl PeerEntry {
    pub fn confirmed(record: ServiceRecord, response: String) -> Self {
        Self {
            identifier: record.identifier,
            addresses: record.addresses,
            port: record.port,
            payload: record.payload,
            response,
            confirmed_at: Utc::now(),
        }
    }
}
