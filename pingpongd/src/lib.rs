pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod identity;
pub mod mdns;
pub mod registry;
pub mod server;

#[cfg(test)]
mod test_support;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use engine::{Engine, EngineBuilder, ShutdownReport};
pub use error::EngineError;
pub use mdns::browser::{PeerCallback, PeerCallbacks};

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
