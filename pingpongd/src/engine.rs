//! Wires the connection server, advertiser, listener and registry together
//! and owns their lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use anyhow::Context;
use shared::types::PeerEntry;
use crate::config::Config;
use crate::error::EngineError;
use crate::hooks::{NoopHooks, PlatformHooks};
use crate::identity::IdentityManager;
use crate::lock;
use crate::mdns::advertise::Advertiser;
use crate::mdns::browser::{PeerCallbacks, PeerListener};
use crate::mdns::{DiscoveryProvider, MdnsProvider};
use crate::registry::PeerRegistry;
use crate::server::{default_policy, ConnectionServer, ResponsePolicy};

/// How long `stop` waits for the listener task before giving up on it
const LISTENER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

type ProviderFactory = Box<dyn FnOnce(&Config) -> anyhow::Result<Arc<dyn DiscoveryProvider>> + Send>;

/// Failures collected during a best-effort shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub failures: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct EngineBuilder {
    config: Config,
    prefix: Option<String>,
    hooks: Arc<dyn PlatformHooks>,
    callbacks: PeerCallbacks,
    policy: ResponsePolicy,
    provider: Option<ProviderFactory>,
}

impl EngineBuilder {
    /// Identity prefix; `node.prefix` from the config when not set.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn PlatformHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn callbacks(mut self, callbacks: PeerCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn response_policy(mut self, policy: ResponsePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the multicast DNS provider.
    pub fn provider<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&Config) -> anyhow::Result<Arc<dyn DiscoveryProvider>> + Send + 'static,
    {
        self.provider = Some(Box::new(factory));
        self
    }

    /// Acquire every resource in order and start discovery.
    ///
    /// On failure whatever was already acquired is released (server stopped,
    /// provider shut down, teardown hook run) before the error is returned.
    pub async fn start(self) -> Result<Engine, EngineError> {
        let EngineBuilder {
            config,
            prefix,
            hooks,
            callbacks,
            policy,
            provider,
        } = self;

        config
            .validate()
            .map_err(|e| EngineError::Config(format!("{:#}", e)))?;

        let prefix = prefix.unwrap_or_else(|| config.node.prefix.clone());
        let identity = Arc::new(IdentityManager::new(&prefix, config.node.suffix));
        let request_timeout = config.network.request_timeout();

        if !hooks.setup() {
            tracing::error!("Platform setup hook refused, not starting");
            return Err(EngineError::SetupHook);
        }

        let server = match ConnectionServer::start(config.node.bind_address, policy, request_timeout) {
            Ok(server) => Arc::new(server),
            Err(e) => return Err(abort_startup(hooks.as_ref(), e)),
        };

        let factory: ProviderFactory = match provider {
            Some(factory) => factory,
            None => Box::new(default_provider),
        };
        let provider = match factory(&config) {
            Ok(provider) => provider,
            Err(e) => {
                stop_server(&server);
                let e = EngineError::advertisement(e.context("Failed to start discovery provider"));
                return Err(abort_startup(hooks.as_ref(), e));
            }
        };

        let mut advertiser = Advertiser::new(provider.clone(), config.node.advertise_addresses());
        if let Err(e) = advertiser.publish(&identity.current(), server.listen_port(), &config.node.payload) {
            stop_server(&server);
            if let Err(shutdown_err) = provider.shutdown() {
                tracing::error!("Failed to shutdown discovery provider: {:#}", shutdown_err);
            }
            return Err(abort_startup(hooks.as_ref(), e));
        }

        let registry = Arc::new(PeerRegistry::new());
        let listener = PeerListener::new(
            provider,
            registry.clone(),
            identity.clone(),
            callbacks.clone(),
            request_timeout,
            config.discovery.eager_browse,
        );
        let cancel = CancellationToken::new();
        let listener_task = tokio::spawn(listener.run(cancel.clone()));

        tracing::info!(
            "Engine started as {} on port {}",
            identity.current(),
            server.listen_port()
        );

        Ok(Engine {
            payload: config.node.payload,
            identity,
            registry,
            server,
            advertiser: Mutex::new(advertiser),
            hooks,
            callbacks,
            cancel,
            listener_task: Mutex::new(Some(listener_task)),
            stopped: AtomicBool::new(false),
        })
    }
}

fn default_provider(config: &Config) -> anyhow::Result<Arc<dyn DiscoveryProvider>> {
    let provider = MdnsProvider::new(config.discovery.interface.as_deref())
        .context("Failed to start mDNS")?;
    Ok(Arc::new(provider))
}

fn stop_server(server: &ConnectionServer) {
    if let Err(e) = server.stop() {
        tracing::error!("Failed to stop connection server: {}", e);
    }
}

fn abort_startup(hooks: &dyn PlatformHooks, err: EngineError) -> EngineError {
    tracing::error!("Engine startup failed: {}", err);
    if !hooks.teardown() {
        tracing::error!("Platform teardown hook failed after aborted startup");
    }
    err
}

/// A running node: advertised, answering requests and tracking peers.
pub struct Engine {
    payload: String,
    identity: Arc<IdentityManager>,
    registry: Arc<PeerRegistry>,
    server: Arc<ConnectionServer>,
    /// Serializes unregister/register pairs across identity changes
    advertiser: Mutex<Advertiser>,
    hooks: Arc<dyn PlatformHooks>,
    callbacks: PeerCallbacks,
    cancel: CancellationToken,
    listener_task: Mutex<Option<JoinHandle<anyhow::Result<()>>>>,
    stopped: AtomicBool,
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder {
            config,
            prefix: None,
            hooks: Arc::new(NoopHooks),
            callbacks: PeerCallbacks::default(),
            policy: default_policy(),
            provider: None,
        }
    }

    /// Re-advertise under a new identifier built from `prefix`.
    ///
    /// Returns false if the new record could not be published; the previous
    /// identifier and advertisement are then restored. Blocks on the
    /// discovery provider.
    pub fn change_identity(&self, prefix: &str) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            tracing::warn!("Ignoring identity change, engine is stopped");
            return false;
        }

        let mut advertiser = lock(&self.advertiser);
        let port = self.server.listen_port();
        let previous = self.identity.current();

        let changed = self
            .identity
            .change_identity(prefix, |identifier| advertiser.republish(identifier, port, &self.payload));

        if !changed {
            if advertiser.current().is_none() {
                match advertiser.publish(&previous, port, &self.payload) {
                    Ok(()) => tracing::info!("Restored advertisement for {}", previous),
                    Err(e) => tracing::error!("Failed to restore advertisement for {}: {}", previous, e),
                }
            }
            return false;
        }
        drop(advertiser);

        let current = self.identity.current();
        if let Some(entry) = self.registry.remove(&current) {
            tracing::info!("Evicted peer {}, it now matches our identifier", current);
            self.callbacks.peer_removed(&entry);
        }
        true
    }

    /// Confirmed peers, sorted by identifier.
    pub fn list_peers(&self) -> Vec<PeerEntry> {
        self.registry.snapshot()
    }

    pub fn identity(&self) -> String {
        self.identity.current()
    }

    pub fn listen_port(&self) -> u16 {
        self.server.listen_port()
    }

    pub fn subscribe_peers_hash(&self) -> watch::Receiver<String> {
        self.registry.subscribe_hash()
    }

    /// Release everything in reverse order of acquisition. Idempotent; every
    /// step runs even if an earlier one failed.
    pub async fn stop(&self) -> ShutdownReport {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        tracing::info!("Stopping engine {}", self.identity.current());

        let mut failures = Vec::new();

        self.cancel.cancel();
        let listener_task = lock(&self.listener_task).take();
        if let Some(task) = listener_task {
            match tokio::time::timeout(LISTENER_STOP_TIMEOUT, task).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    tracing::error!("Peer listener failed: {:#}", e);
                    failures.push(format!("peer listener: {:#}", e));
                }
                Ok(Err(e)) => {
                    tracing::error!("Peer listener task panicked: {}", e);
                    failures.push(format!("peer listener task: {}", e));
                }
                Err(_) => {
                    tracing::error!("Peer listener did not stop within {:?}", LISTENER_STOP_TIMEOUT);
                    failures.push("peer listener: stop timed out".to_string());
                }
            }
        }

        // Joining the accept thread can wait out a slow connection
        let server = self.server.clone();
        match tokio::task::spawn_blocking(move || server.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Failed to stop connection server: {}", e);
                failures.push(format!("connection server: {}", e));
            }
            Err(e) => {
                tracing::error!("Connection server stop task failed: {}", e);
                failures.push(format!("connection server stop task: {}", e));
            }
        }

        self.release_discovery_and_hooks(&mut failures);

        tracing::info!("Engine stopped");
        ShutdownReport { failures }
    }

    /// Shutdown steps that follow closing the listener, shared with `Drop`.
    fn release_discovery_and_hooks(&self, failures: &mut Vec<String>) {
        failures.extend(lock(&self.advertiser).shutdown());

        let cleared = self.registry.clear();
        tracing::debug!("Cleared {} peers", cleared);

        if !self.hooks.teardown() {
            tracing::error!("Platform teardown hook failed");
            failures.push("platform teardown hook failed".to_string());
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!("Engine {} dropped without stop, releasing resources", self.identity.current());

        self.cancel.cancel();
        let mut failures = Vec::new();
        if let Err(e) = self.server.stop() {
            failures.push(format!("connection server: {}", e));
        }
        self.release_discovery_and_hooks(&mut failures);

        for failure in &failures {
            tracing::error!("Shutdown step failed during drop: {}", failure);
        }
    }
}
