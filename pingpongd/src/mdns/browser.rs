use std::collections::HashMap;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::{Context, Result};
use shared::client::{self, NetworkError};
use shared::protocol::{REQUEST_MESSAGE, SERVICE_TYPE};
use shared::types::{identifier_from_fullname, PeerEntry, ServiceRecord};
use crate::identity::IdentityManager;
use crate::registry::PeerRegistry;
use super::{DiscoveryEvent, DiscoveryProvider};

/// Notified with the affected entry when the peer set changes.
pub type PeerCallback = Arc<dyn Fn(&PeerEntry) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PeerCallbacks {
    added: Option<PeerCallback>,
    removed: Option<PeerCallback>,
}

impl PeerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_added<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PeerEntry) + Send + Sync + 'static,
    {
        self.added = Some(Arc::new(callback));
        self
    }

    pub fn on_removed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&PeerEntry) + Send + Sync + 'static,
    {
        self.removed = Some(Arc::new(callback));
        self
    }

    pub(crate) fn peer_added(&self, entry: &PeerEntry) {
        if let Some(callback) = &self.added {
            callback(entry);
        }
    }

    pub(crate) fn peer_removed(&self, entry: &PeerEntry) {
        if let Some(callback) = &self.removed {
            callback(entry);
        }
    }
}

type RecvResult = (usize, flume::Receiver<DiscoveryEvent>, std::result::Result<DiscoveryEvent, flume::RecvError>);
type RecvFuture = Pin<Box<dyn Future<Output = RecvResult> + Send>>;

/// Each future owns a clone of its receiver so it can be pushed back after
/// every event.
fn make_recv_future(idx: usize, rx: flume::Receiver<DiscoveryEvent>) -> RecvFuture {
    Box::pin(async move {
        let result = rx.recv_async().await;
        (idx, rx, result)
    })
}

/// Result of one "Ping " request, reported back from the blocking pool.
struct PingOutcome {
    record: ServiceRecord,
    generation: u64,
    result: std::result::Result<String, NetworkError>,
}

/// Outstanding requests by identifier. Each attempt gets its own generation
/// so a late answer to an abandoned attempt cannot settle a newer one.
#[derive(Default)]
struct InFlight {
    requests: HashMap<String, u64>,
    next_generation: u64,
}

impl InFlight {
    fn start(&mut self, identifier: &str) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.requests.insert(identifier.to_string(), generation);
        generation
    }

    fn contains(&self, identifier: &str) -> bool {
        self.requests.contains_key(identifier)
    }

    fn abandon(&mut self, identifier: &str) {
        self.requests.remove(identifier);
    }

    /// Settle the attempt `generation` for `identifier`. False if that
    /// attempt was abandoned or superseded.
    fn finish(&mut self, identifier: &str, generation: u64) -> bool {
        match self.requests.get(identifier) {
            Some(&current) if current == generation => {
                self.requests.remove(identifier);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

/// Turns discovery events into confirmed registry entries.
///
/// A resolved peer is only added once it answered a request. All state
/// transitions happen on the task running [`PeerListener::run`]; requests run
/// on the blocking pool and report back over a channel.
pub struct PeerListener {
    provider: Arc<dyn DiscoveryProvider>,
    registry: Arc<PeerRegistry>,
    identity: Arc<IdentityManager>,
    callbacks: PeerCallbacks,
    request_timeout: Duration,
    eager_browse: bool,
}

impl PeerListener {
    pub fn new(
        provider: Arc<dyn DiscoveryProvider>,
        registry: Arc<PeerRegistry>,
        identity: Arc<IdentityManager>,
        callbacks: PeerCallbacks,
        request_timeout: Duration,
        eager_browse: bool,
    ) -> Self {
        Self {
            provider,
            registry,
            identity,
            callbacks,
            request_timeout,
            eager_browse,
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        tracing::info!("Starting peer listener for {}", SERVICE_TYPE);

        let types_rx = self
            .provider
            .browse_types()
            .context("Failed to subscribe to service types")?;
        let mut types_open = true;

        let mut browsing = false;
        let mut next_idx = 0usize;
        let mut type_futures: FuturesUnordered<RecvFuture> = FuturesUnordered::new();

        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel::<PingOutcome>();
        let mut in_flight = InFlight::default();

        if self.eager_browse {
            browsing = self.browse_service_type(&mut type_futures, &mut next_idx);
        }

        loop {
            tokio::select! {
                event = types_rx.recv_async(), if types_open => {
                    match event {
                        Ok(DiscoveryEvent::TypeAdded(service_type)) => {
                            if !service_type.eq_ignore_ascii_case(SERVICE_TYPE) {
                                tracing::debug!("Ignoring service type {}", service_type);
                            } else if !browsing {
                                tracing::info!("Service type {} announced", service_type);
                                browsing = self.browse_service_type(&mut type_futures, &mut next_idx);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!("Service type subscription closed: {}", e);
                            types_open = false;
                        }
                    }
                }

                Some((idx, rx, result)) = type_futures.next() => {
                    match result {
                        Ok(event) => {
                            self.handle_event(event, &mut in_flight, &outcome_tx);
                            type_futures.push(make_recv_future(idx, rx));
                        }
                        Err(e) => {
                            tracing::warn!("Receiver {} disconnected: {}", idx, e);
                        }
                    }
                }

                Some(outcome) = outcome_rx.recv() => {
                    self.handle_outcome(outcome, &mut in_flight);
                }

                _ = cancel.cancelled() => {
                    tracing::info!("Peer listener shutting down");
                    break;
                }
            }
        }

        if in_flight.len() > 0 {
            tracing::debug!("Abandoning {} in-flight requests", in_flight.len());
        }
        Ok(())
    }

    /// Subscribe to instance events for our service type. Returns whether the
    /// subscription is now active.
    fn browse_service_type(&self, futures: &mut FuturesUnordered<RecvFuture>, next_idx: &mut usize) -> bool {
        match self.provider.browse(SERVICE_TYPE) {
            Ok(receiver) => {
                futures.push(make_recv_future(*next_idx, receiver));
                *next_idx += 1;
                true
            }
            Err(e) => {
                tracing::error!("Failed to browse {}: {:#}", SERVICE_TYPE, e);
                false
            }
        }
    }

    fn handle_event(
        &self,
        event: DiscoveryEvent,
        in_flight: &mut InFlight,
        outcome_tx: &mpsc::UnboundedSender<PingOutcome>,
    ) {
        match event {
            DiscoveryEvent::Found { fullname, .. } => {
                tracing::debug!("Found {}, waiting for resolution", fullname);
            }
            DiscoveryEvent::Resolved(record) => self.handle_resolved(record, in_flight, outcome_tx),
            DiscoveryEvent::Removed { service_type, fullname } => {
                let Some(identifier) = identifier_from_fullname(&fullname, &service_type) else {
                    tracing::debug!("Ignoring removal of {}", fullname);
                    return;
                };
                in_flight.abandon(identifier);

                match self.registry.remove(identifier) {
                    Some(entry) => {
                        tracing::info!("Peer {} removed", identifier);
                        self.callbacks.peer_removed(&entry);
                    }
                    None => tracing::debug!("Removal of unknown peer {}", identifier),
                }
            }
            DiscoveryEvent::TypeAdded(_) => {}
        }
    }

    fn handle_resolved(
        &self,
        record: ServiceRecord,
        in_flight: &mut InFlight,
        outcome_tx: &mpsc::UnboundedSender<PingOutcome>,
    ) {
        if self.identity.is_local(&record.identifier) {
            tracing::debug!("Ignoring our own record {}", record.identifier);
            return;
        }
        if self.registry.refresh(&record) {
            tracing::debug!("Refreshed known peer {}", record.identifier);
            return;
        }
        if in_flight.contains(&record.identifier) {
            tracing::debug!("Request to {} already in flight", record.identifier);
            return;
        }

        let Some(ip) = record.first_usable_address() else {
            tracing::warn!("Peer {} has no usable address", record.identifier);
            return;
        };
        let addr = SocketAddr::new(ip, record.port);
        let timeout = self.request_timeout;
        let tx = outcome_tx.clone();

        tracing::debug!("Sending request to {} at {}", record.identifier, addr);
        let generation = in_flight.start(&record.identifier);
        tokio::task::spawn_blocking(move || {
            let result = client::send(REQUEST_MESSAGE, addr, timeout);
            if tx.send(PingOutcome { record, generation, result }).is_err() {
                tracing::debug!("Listener gone, dropping response from {}", addr);
            }
        });
    }

    fn handle_outcome(&self, outcome: PingOutcome, in_flight: &mut InFlight) {
        let identifier = outcome.record.identifier.clone();
        if !in_flight.finish(&identifier, outcome.generation) {
            tracing::debug!("Dropping stale response from {}, attempt was abandoned", identifier);
            return;
        }

        match outcome.result {
            Ok(response) => {
                let entry = PeerEntry::confirmed(outcome.record, response);
                // Checked under the registry lock so an identity change cannot
                // slip in between the check and the insert
                let inserted = self
                    .registry
                    .insert_if(entry.clone(), |peer| !self.identity.is_local(&peer.identifier));
                match inserted {
                    Some(true) => {
                        tracing::info!("Peer {} confirmed: {:?}", identifier, entry.response);
                        self.callbacks.peer_added(&entry);
                    }
                    Some(false) => tracing::debug!("Peer {} re-confirmed", identifier),
                    None => tracing::debug!("Dropping response from {}, now our own identifier", identifier),
                }
            }
            Err(e) => {
                tracing::warn!("Request to peer {} failed: {}", identifier, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::task::JoinHandle;
    use crate::identity::SuffixSource;
    use crate::server::{default_policy, pong_response, ConnectionServer, ResponsePolicy};
    use crate::test_support::{closed_port, loopback_record, wait_until, FakeProvider};

    const WAIT: Duration = Duration::from_secs(3);

    struct Harness {
        provider: Arc<FakeProvider>,
        registry: Arc<PeerRegistry>,
        identity: Arc<IdentityManager>,
        added: Arc<AtomicUsize>,
        removed: Arc<AtomicUsize>,
        cancel: CancellationToken,
        task: JoinHandle<Result<()>>,
    }

    impl Harness {
        async fn stop(self) {
            self.cancel.cancel();
            self.task.await.unwrap().unwrap();
        }
    }

    fn spawn_listener(eager_browse: bool) -> Harness {
        let provider = FakeProvider::new();
        let registry = Arc::new(PeerRegistry::new());
        let identity = Arc::new(IdentityManager::with_hostname("local-", SuffixSource::Host, "this-host"));
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));

        let added_count = added.clone();
        let removed_count = removed.clone();
        let callbacks = PeerCallbacks::new()
            .on_added(move |_| {
                added_count.fetch_add(1, Ordering::SeqCst);
            })
            .on_removed(move |_| {
                removed_count.fetch_add(1, Ordering::SeqCst);
            });

        let listener = PeerListener::new(
            provider.clone(),
            registry.clone(),
            identity.clone(),
            callbacks,
            Duration::from_secs(2),
            eager_browse,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(listener.run(cancel.clone()));

        Harness {
            provider,
            registry,
            identity,
            added,
            removed,
            cancel,
            task,
        }
    }

    fn start_server(policy: ResponsePolicy) -> ConnectionServer {
        ConnectionServer::start(IpAddr::V4(Ipv4Addr::LOCALHOST), policy, Duration::from_secs(2)).unwrap()
    }

    fn removal(identifier: &str) -> DiscoveryEvent {
        DiscoveryEvent::Removed {
            service_type: SERVICE_TYPE.to_string(),
            fullname: loopback_record(identifier, 1).fullname(),
        }
    }

    #[tokio::test]
    async fn test_confirm_then_remove() {
        let server = start_server(default_policy());
        let h = spawn_listener(false);

        h.provider.announce_type(SERVICE_TYPE);
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("peer-1", server.listen_port())));

        assert!(wait_until(|| h.registry.contains("peer-1"), WAIT).await);
        let entry = &h.registry.snapshot()[0];
        assert_eq!(entry.response, "Ping  Pong");
        assert_eq!(entry.port, server.listen_port());
        assert_eq!(h.added.load(Ordering::SeqCst), 1);

        h.provider.emit(removal("peer-1"));
        assert!(wait_until(|| h.removed.load(Ordering::SeqCst) == 1, WAIT).await);
        assert!(h.registry.is_empty());

        h.stop().await;
    }

    #[tokio::test]
    async fn test_foreign_type_is_never_browsed() {
        let h = spawn_listener(false);

        h.provider.announce_type("_http._tcp.local.");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.provider.browsed_types().is_empty());

        h.provider.announce_type(SERVICE_TYPE);
        h.provider.announce_type(SERVICE_TYPE);
        assert!(wait_until(|| !h.provider.browsed_types().is_empty(), WAIT).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.provider.browsed_types(), vec![SERVICE_TYPE]);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_own_record_is_filtered() {
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = requests.clone();
        let server = start_server(Arc::new(move |request: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
            pong_response(request)
        }));
        let h = spawn_listener(true);

        let own = loopback_record(&h.identity.current(), server.listen_port());
        h.provider.emit(DiscoveryEvent::Resolved(own));
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("peer-2", server.listen_port())));

        assert!(wait_until(|| h.registry.contains("peer-2"), WAIT).await);
        assert_eq!(h.registry.len(), 1);
        assert_eq!(requests.load(Ordering::SeqCst), 1);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_failed_request_leaves_peer_absent() {
        let server = start_server(default_policy());
        let h = spawn_listener(true);

        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("gone", closed_port())));
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("alive", server.listen_port())));

        assert!(wait_until(|| h.registry.contains("alive"), WAIT).await);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!h.registry.contains("gone"));
        assert_eq!(h.added.load(Ordering::SeqCst), 1);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_record_without_usable_address() {
        let server = start_server(default_policy());
        let h = spawn_listener(true);

        let unreachable = ServiceRecord::new("no-addr", server.listen_port(), "ping pong");
        h.provider.emit(DiscoveryEvent::Resolved(unreachable));
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("peer-3", server.listen_port())));

        assert!(wait_until(|| h.registry.contains("peer-3"), WAIT).await);
        assert!(!h.registry.contains("no-addr"));

        h.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_removal_is_noop() {
        let server = start_server(default_policy());
        let h = spawn_listener(true);

        h.provider.emit(removal("stranger"));
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("peer-4", server.listen_port())));

        assert!(wait_until(|| h.registry.contains("peer-4"), WAIT).await);
        assert_eq!(h.removed.load(Ordering::SeqCst), 0);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_eager_browse_subscribes_immediately() {
        let h = spawn_listener(true);

        assert!(wait_until(|| h.provider.browsed_types() == vec![SERVICE_TYPE], WAIT).await);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_resolve_of_known_peer_refreshes_without_notification() {
        let server = start_server(default_policy());
        let h = spawn_listener(true);

        let record = loopback_record("peer-5", server.listen_port());
        h.provider.emit(DiscoveryEvent::Resolved(record.clone()));
        assert!(wait_until(|| h.registry.contains("peer-5"), WAIT).await);

        let mut moved = record;
        moved.payload = "new payload".to_string();
        h.provider.emit(DiscoveryEvent::Resolved(moved));

        assert!(wait_until(|| h.registry.snapshot()[0].payload == "new payload", WAIT).await);
        assert_eq!(h.added.load(Ordering::SeqCst), 1);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_removal_during_request_prevents_insertion() {
        let requests = Arc::new(AtomicUsize::new(0));
        let seen = requests.clone();
        let server = start_server(Arc::new(move |request: &str| {
            seen.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            pong_response(request)
        }));
        let h = spawn_listener(true);

        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("slow", server.listen_port())));
        assert!(wait_until(|| requests.load(Ordering::SeqCst) == 1, WAIT).await);
        h.provider.emit(removal("slow"));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!h.registry.contains("slow"));
        assert_eq!(h.added.load(Ordering::SeqCst), 0);
        assert_eq!(h.removed.load(Ordering::SeqCst), 0);

        h.stop().await;
    }

    /// Accepts one connection, reads the request, then hangs up after
    /// `delay` without answering.
    fn hang_up_after(delay: Duration) -> (u16, Arc<AtomicUsize>) {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let seen = accepted.clone();
        std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            seen.fetch_add(1, Ordering::SeqCst);
            let _ = shared::codec::read_frame(&mut stream);
            std::thread::sleep(delay);
        });
        (port, accepted)
    }

    fn delayed_pong(delay: Duration, requests: Arc<AtomicUsize>) -> ResponsePolicy {
        Arc::new(move |request: &str| {
            requests.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(delay);
            pong_response(request)
        })
    }

    #[tokio::test]
    async fn test_stale_failure_does_not_cancel_newer_attempt() {
        let (old_port, accepted) = hang_up_after(Duration::from_millis(300));
        let fresh = start_server(delayed_pong(Duration::from_millis(600), Arc::new(AtomicUsize::new(0))));
        let h = spawn_listener(true);

        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("p", old_port)));
        assert!(wait_until(|| accepted.load(Ordering::SeqCst) == 1, WAIT).await);
        h.provider.emit(removal("p"));
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("p", fresh.listen_port())));

        assert!(wait_until(|| h.registry.contains("p"), WAIT).await);
        assert_eq!(h.registry.snapshot()[0].port, fresh.listen_port());
        assert_eq!(h.added.load(Ordering::SeqCst), 1);

        h.stop().await;
    }

    #[tokio::test]
    async fn test_stale_success_does_not_insert_old_record() {
        let old_requests = Arc::new(AtomicUsize::new(0));
        let old = start_server(delayed_pong(Duration::from_millis(300), old_requests.clone()));
        let fresh = start_server(delayed_pong(Duration::from_millis(600), Arc::new(AtomicUsize::new(0))));
        let h = spawn_listener(true);

        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("p", old.listen_port())));
        assert!(wait_until(|| old_requests.load(Ordering::SeqCst) == 1, WAIT).await);
        h.provider.emit(removal("p"));
        h.provider.emit(DiscoveryEvent::Resolved(loopback_record("p", fresh.listen_port())));

        // The old attempt answers first; only the fresh one may land
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(!h.registry.contains("p"));

        assert!(wait_until(|| h.registry.contains("p"), WAIT).await);
        assert_eq!(h.registry.snapshot()[0].port, fresh.listen_port());
        assert_eq!(h.added.load(Ordering::SeqCst), 1);

        h.stop().await;
    }

    #[test]
    fn test_in_flight_generations() {
        let mut in_flight = InFlight::default();

        let first = in_flight.start("p");
        in_flight.abandon("p");
        let second = in_flight.start("p");

        assert!(!in_flight.finish("p", first));
        assert!(in_flight.contains("p"));
        assert!(in_flight.finish("p", second));
        assert!(!in_flight.contains("p"));
        assert!(!in_flight.finish("p", second));
    }
}
