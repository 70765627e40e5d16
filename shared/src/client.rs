use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;
use thiserror::Error;
use crate::codec::{self, FrameError, ProtocolError};

/// A single request/response exchange with a peer failed.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("request to {addr} timed out")]
    Timeout { addr: SocketAddr },

    #[error("I/O error talking to {addr}: {source}")]
    Io {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("malformed frame exchanged with {addr}: {source}")]
    Protocol {
        addr: SocketAddr,
        #[source]
        source: ProtocolError,
    },
}

impl NetworkError {
    fn from_io(addr: SocketAddr, err: io::Error) -> Self {
        match err.kind() {
            // Unix reports an expired socket timeout as WouldBlock
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => NetworkError::Timeout { addr },
            _ => NetworkError::Io { addr, source: err },
        }
    }

    fn from_frame(addr: SocketAddr, err: FrameError) -> Self {
        match err {
            FrameError::Protocol(source) => NetworkError::Protocol { addr, source },
            FrameError::Io(source) => Self::from_io(addr, source),
        }
    }
}

/// Send one request to `addr` over a fresh connection and wait for the reply.
///
/// `timeout` bounds the connect and every read and write; it must be non-zero.
/// No retries: a failed exchange is reported to the caller as is.
pub fn send(request: &str, addr: SocketAddr, timeout: Duration) -> Result<String, NetworkError> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
        io::ErrorKind::TimedOut => NetworkError::Timeout { addr },
        _ => NetworkError::Connect { addr, source: e },
    })?;

    stream
        .set_read_timeout(Some(timeout))
        .and_then(|_| stream.set_write_timeout(Some(timeout)))
        .map_err(|e| NetworkError::from_io(addr, e))?;

    codec::write_frame(&mut stream, request).map_err(|e| NetworkError::from_frame(addr, e))?;
    // Nothing more to send; lets the server see end of stream
    stream
        .shutdown(Shutdown::Write)
        .map_err(|e| NetworkError::from_io(addr, e))?;

    let response = codec::read_frame(&mut stream).map_err(|e| NetworkError::from_frame(addr, e))?;
    tracing::debug!("Received {:?} from {}", response, addr);

    Ok(response)
}
