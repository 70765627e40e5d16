//! In-memory discovery provider and helpers shared by the unit tests.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{bail, Result};
use shared::protocol::DEFAULT_PAYLOAD;
use shared::types::ServiceRecord;
use crate::hooks::PlatformHooks;
use crate::lock;
use crate::mdns::{DiscoveryEvent, DiscoveryProvider};

pub struct FakeProvider {
    pub registered: Mutex<Vec<ServiceRecord>>,
    pub register_calls: AtomicUsize,
    pub unregister_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
    pub fail_unregister: AtomicBool,
    pub browsed: Mutex<Vec<String>>,
    failing_registers: AtomicUsize,
    types: (flume::Sender<DiscoveryEvent>, flume::Receiver<DiscoveryEvent>),
    events: (flume::Sender<DiscoveryEvent>, flume::Receiver<DiscoveryEvent>),
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            registered: Mutex::new(Vec::new()),
            register_calls: AtomicUsize::new(0),
            unregister_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
            fail_unregister: AtomicBool::new(false),
            browsed: Mutex::new(Vec::new()),
            failing_registers: AtomicUsize::new(0),
            types: flume::unbounded(),
            events: flume::unbounded(),
        })
    }

    /// Make the next `count` register calls fail.
    pub fn fail_next_registers(&self, count: usize) {
        self.failing_registers.store(count, Ordering::SeqCst);
    }

    pub fn announce_type(&self, service_type: &str) {
        self.types
            .0
            .send(DiscoveryEvent::TypeAdded(service_type.to_string()))
            .unwrap();
    }

    /// Deliver an event on the service-type subscription.
    pub fn emit(&self, event: DiscoveryEvent) {
        self.events.0.send(event).unwrap();
    }

    pub fn registered_identifiers(&self) -> Vec<String> {
        lock(&self.registered)
            .iter()
            .map(|record| record.identifier.clone())
            .collect()
    }

    pub fn browsed_types(&self) -> Vec<String> {
        lock(&self.browsed).clone()
    }
}

impl DiscoveryProvider for FakeProvider {
    fn register(&self, record: &ServiceRecord) -> Result<()> {
        self.register_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_registers.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_registers.store(failing - 1, Ordering::SeqCst);
            bail!("registration refused");
        }
        lock(&self.registered).push(record.clone());
        Ok(())
    }

    fn unregister(&self, record: &ServiceRecord) -> Result<()> {
        self.unregister_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_unregister.load(Ordering::SeqCst) {
            bail!("unregister refused");
        }
        lock(&self.registered).retain(|r| r.identifier != record.identifier);
        Ok(())
    }

    fn browse_types(&self) -> Result<flume::Receiver<DiscoveryEvent>> {
        Ok(self.types.1.clone())
    }

    fn browse(&self, service_type: &str) -> Result<flume::Receiver<DiscoveryEvent>> {
        lock(&self.browsed).push(service_type.to_string());
        Ok(self.events.1.clone())
    }

    fn shutdown(&self) -> Result<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hooks that count calls and can refuse setup.
pub struct CountingHooks {
    pub setup_ok: bool,
    pub setup_calls: AtomicUsize,
    pub teardown_calls: AtomicUsize,
}

impl CountingHooks {
    pub fn new(setup_ok: bool) -> Arc<Self> {
        Arc::new(Self {
            setup_ok,
            setup_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
        })
    }
}

impl PlatformHooks for CountingHooks {
    fn setup(&self) -> bool {
        self.setup_calls.fetch_add(1, Ordering::SeqCst);
        self.setup_ok
    }

    fn teardown(&self) -> bool {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

/// A resolved record pointing at a loopback port.
pub fn loopback_record(identifier: &str, port: u16) -> ServiceRecord {
    ServiceRecord::new(identifier, port, DEFAULT_PAYLOAD)
        .with_addresses(vec![IpAddr::V4(Ipv4Addr::LOCALHOST)])
}

/// A port nothing listens on.
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
