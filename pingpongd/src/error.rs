use std::io;
use std::net::SocketAddr;
use shared::client::NetworkError;
use shared::codec::{FrameError, ProtocolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// No listening socket; the engine cannot start.
    #[error("failed to bind connection server to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Publishing or withdrawing the discovery record failed.
    #[error("advertisement failed: {0}")]
    Advertisement(String),

    /// Malformed frame on a single connection.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// A single peer request failed.
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The supplied configuration cannot work, e.g. a zero timeout.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The platform refused to provide network resources.
    #[error("platform setup hook failed")]
    SetupHook,
}

impl EngineError {
    pub(crate) fn advertisement(err: anyhow::Error) -> Self {
        EngineError::Advertisement(format!("{:#}", err))
    }
}

impl From<FrameError> for EngineError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Protocol(e) => EngineError::Protocol(e),
            FrameError::Io(e) => EngineError::Io(e),
        }
    }
}
