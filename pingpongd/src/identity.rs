use std::sync::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use crate::error::EngineError;

/// Where the uniqueness part of an identifier comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuffixSource {
    /// A fresh random number on every generation
    #[default]
    Random,
    /// A short hash of the host name, stable across restarts
    Host,
}

#[derive(Debug, Clone)]
struct Identity {
    prefix: String,
    identifier: String,
}

/// Owns this node's identifier. Only `change_identity` mutates it.
pub struct IdentityManager {
    suffix: SuffixSource,
    host_suffix: String,
    current: RwLock<Identity>,
}

impl IdentityManager {
    pub fn new(prefix: &str, suffix: SuffixSource) -> Self {
        let hostname = match hostname::get() {
            Ok(name) => name.to_string_lossy().to_string(),
            Err(e) => {
                tracing::warn!("Failed to get system hostname, using a placeholder: {}", e);
                "localhost".to_string()
            }
        };
        Self::with_hostname(prefix, suffix, &hostname)
    }

    pub fn with_hostname(prefix: &str, suffix: SuffixSource, hostname: &str) -> Self {
        let host_suffix = host_suffix(hostname);
        let identifier = make_identifier(suffix, &host_suffix, prefix);
        Self {
            suffix,
            host_suffix,
            current: RwLock::new(Identity {
                prefix: prefix.to_string(),
                identifier,
            }),
        }
    }

    /// Prefix followed by a uniqueness suffix.
    pub fn generate(&self, prefix: &str) -> String {
        make_identifier(self.suffix, &self.host_suffix, prefix)
    }

    pub fn current(&self) -> String {
        self.read().identifier
    }

    pub fn prefix(&self) -> String {
        self.read().prefix
    }

    pub fn is_local(&self, identifier: &str) -> bool {
        self.current.read().unwrap_or_else(|e| e.into_inner()).identifier == identifier
    }

    /// Switch to a new identifier derived from `prefix`.
    ///
    /// `readvertise` is called with the new identifier once it is current. If it
    /// fails the previous identifier is restored and `false` is returned. A
    /// candidate equal to the current identifier is a no-op and `readvertise` is
    /// never called.
    pub fn change_identity<F>(&self, prefix: &str, readvertise: F) -> bool
    where
        F: FnOnce(&str) -> Result<(), EngineError>,
    {
        let candidate = self.generate(prefix);
        let previous = self.read();
        if candidate == previous.identifier {
            tracing::debug!("Identity {} unchanged", candidate);
            return true;
        }

        self.write(Identity {
            prefix: prefix.to_string(),
            identifier: candidate.clone(),
        });

        match readvertise(&candidate) {
            Ok(()) => {
                tracing::info!("Identity changed from {} to {} and advertised", previous.identifier, candidate);
                true
            }
            Err(e) => {
                tracing::error!("Cannot change identity to {}: {}", candidate, e);
                self.write(previous);
                false
            }
        }
    }

    fn read(&self) -> Identity {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn write(&self, identity: Identity) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = identity;
    }
}

fn make_identifier(suffix: SuffixSource, host_suffix: &str, prefix: &str) -> String {
    match suffix {
        SuffixSource::Random => format!("{}{}", prefix, rand::random::<u32>()),
        SuffixSource::Host => format!("{}{}", prefix, host_suffix),
    }
}

/// First 5 hex characters of SHA-256(hostname).
fn host_suffix(hostname: &str) -> String {
    let digest = hex::encode(Sha256::digest(hostname.as_bytes()));
    digest[..5].to_string()
}
