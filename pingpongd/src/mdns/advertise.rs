use std::net::IpAddr;
use std::sync::Arc;
use shared::types::ServiceRecord;
use crate::error::EngineError;
use super::DiscoveryProvider;

/// Keeps exactly one record of ours published at a time.
pub struct Advertiser {
    provider: Arc<dyn DiscoveryProvider>,
    /// Empty means the provider detects addresses itself
    addresses: Vec<IpAddr>,
    current: Option<ServiceRecord>,
}

impl Advertiser {
    pub fn new(provider: Arc<dyn DiscoveryProvider>, addresses: Vec<IpAddr>) -> Self {
        Self {
            provider,
            addresses,
            current: None,
        }
    }

    /// The record currently published, if any
    pub fn current(&self) -> Option<&ServiceRecord> {
        self.current.as_ref()
    }

    pub fn publish(&mut self, identifier: &str, port: u16, payload: &str) -> Result<(), EngineError> {
        let record = ServiceRecord::new(identifier, port, payload).with_addresses(self.addresses.clone());
        self.provider
            .register(&record)
            .map_err(EngineError::advertisement)?;

        self.current = Some(record);
        Ok(())
    }

    /// Withdraw the current record, then publish a new one. On failure the old
    /// record stays withdrawn.
    pub fn republish(&mut self, identifier: &str, port: u16, payload: &str) -> Result<(), EngineError> {
        if let Some(previous) = self.current.take() {
            if let Err(e) = self.provider.unregister(&previous) {
                tracing::warn!("Failed to unregister {}: {:#}", previous.fullname(), e);
            }
        }
        self.publish(identifier, port, payload)
    }

    /// Withdraw everything and close the provider session. Every step runs;
    /// failures are logged and returned.
    pub fn shutdown(&mut self) -> Vec<String> {
        let mut failures = Vec::new();

        if let Some(record) = self.current.take() {
            if let Err(e) = self.provider.unregister(&record) {
                tracing::error!("Failed to unregister {}: {:#}", record.fullname(), e);
                failures.push(format!("unregister {}: {:#}", record.fullname(), e));
            }
        }

        if let Err(e) = self.provider.shutdown() {
            tracing::error!("Failed to shutdown discovery provider: {:#}", e);
            failures.push(format!("discovery shutdown: {:#}", e));
        }

        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use crate::test_support::FakeProvider;

    #[test]
    fn test_publish() {
        let provider = FakeProvider::new();
        let mut advertiser = Advertiser::new(provider.clone(), vec![]);

        advertiser.publish("annon-1", 4000, "ping pong").unwrap();

        assert_eq!(provider.registered_identifiers(), vec!["annon-1"]);
        let current = advertiser.current().unwrap();
        assert_eq!(current.port, 4000);
        assert_eq!(current.payload, "ping pong");
    }

    #[test]
    fn test_publish_failure() {
        let provider = FakeProvider::new();
        provider.fail_next_registers(1);
        let mut advertiser = Advertiser::new(provider.clone(), vec![]);

        let result = advertiser.publish("annon-1", 4000, "ping pong");

        assert!(matches!(result, Err(EngineError::Advertisement(_))));
        assert!(advertiser.current().is_none());
    }

    #[test]
    fn test_republish_unregisters_then_registers() {
        let provider = FakeProvider::new();
        let addr: IpAddr = "10.0.0.5".parse().unwrap();
        let mut advertiser = Advertiser::new(provider.clone(), vec![addr]);

        advertiser.publish("annon-1", 4000, "ping pong").unwrap();
        advertiser.republish("lab-2", 4000, "ping pong").unwrap();

        assert_eq!(provider.registered_identifiers(), vec!["lab-2"]);
        assert_eq!(provider.unregister_calls.load(Ordering::SeqCst), 1);
        assert_eq!(advertiser.current().unwrap().addresses, vec![addr]);
    }

    #[test]
    fn test_failed_republish_leaves_old_record_withdrawn() {
        let provider = FakeProvider::new();
        let mut advertiser = Advertiser::new(provider.clone(), vec![]);
        advertiser.publish("annon-1", 4000, "ping pong").unwrap();

        provider.fail_next_registers(1);
        let result = advertiser.republish("lab-2", 4000, "ping pong");

        assert!(result.is_err());
        assert!(provider.registered_identifiers().is_empty());
        assert!(advertiser.current().is_none());
    }

    #[test]
    fn test_shutdown_runs_every_step() {
        let provider = FakeProvider::new();
        let mut advertiser = Advertiser::new(provider.clone(), vec![]);
        advertiser.publish("annon-1", 4000, "ping pong").unwrap();

        provider.fail_unregister.store(true, Ordering::SeqCst);
        let failures = advertiser.shutdown();

        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("annon-1"));
        assert_eq!(provider.shutdown_calls.load(Ordering::SeqCst), 1);
    }
}
