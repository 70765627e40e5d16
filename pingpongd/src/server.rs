//! TCP server answering one framed request per connection.
//!
//! Connections are accepted and served one at a time on a dedicated thread.
//! What gets answered is decided by a `ResponsePolicy`; the accept loop itself
//! never changes.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use socket2::{Domain, Protocol, Socket, Type};
use shared::codec;
use shared::protocol::RESPONSE_SUFFIX;
use crate::error::EngineError;
use crate::lock;

/// Maps a request to the response sent back.
pub type ResponsePolicy = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Pending connections the OS queues while one is being served
const BACKLOG: i32 = 10;

const WAKE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause after a failed accept (e.g. out of file descriptors) so the loop
/// does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Default policy: echo the request with " Pong" appended.
pub fn pong_response(request: &str) -> String {
    format!("{}{}", request, RESPONSE_SUFFIX)
}

pub fn default_policy() -> ResponsePolicy {
    Arc::new(pong_response)
}

pub struct ConnectionServer {
    local_addr: SocketAddr,
    /// Where `stop` connects to wake the accept loop
    wake_addr: SocketAddr,
    alive: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionServer {
    /// Bind to `bind_address` on an OS-assigned port and start accepting.
    ///
    /// `io_timeout` bounds reads and writes on every served connection.
    pub fn start(
        bind_address: IpAddr,
        policy: ResponsePolicy,
        io_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let requested = SocketAddr::new(bind_address, 0);
        let bind_error = |source| EngineError::Bind { addr: requested, source };

        let listener = bind_listener(requested).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let accept_thread = thread::Builder::new()
            .name(format!("pingpong-accept-{}", local_addr.port()))
            .spawn(move || accept_loop(listener, loop_alive, policy, io_timeout))
            .map_err(bind_error)?;

        tracing::info!("Connection server listening on {}", local_addr);

        Ok(Self {
            local_addr,
            wake_addr: wake_addr(local_addr),
            alive,
            accept_thread: Mutex::new(Some(accept_thread)),
        })
    }

    pub fn listen_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop accepting and release the listening socket. Idempotent.
    ///
    /// Blocks until the accept thread exits, which takes at most one
    /// in-progress connection (bounded by the I/O timeout). If the accept loop
    /// cannot be woken the socket stays bound, the error is returned and a
    /// later call retries.
    pub fn stop(&self) -> io::Result<()> {
        let mut slot = lock(&self.accept_thread);
        let Some(accept_thread) = slot.take() else {
            return Ok(());
        };
        self.alive.store(false, Ordering::SeqCst);

        // The accept loop is blocked in accept(); hand it a connection so it
        // wakes up, sees the flag and drops the listener.
        if let Err(e) = TcpStream::connect_timeout(&self.wake_addr, WAKE_TIMEOUT) {
            if !accept_thread.is_finished() {
                tracing::warn!(
                    "Could not wake accept loop on port {}: {}",
                    self.local_addr.port(),
                    e
                );
                *slot = Some(accept_thread);
                return Err(e);
            }
        }

        if accept_thread.join().is_err() {
            tracing::error!("Accept thread on port {} panicked", self.local_addr.port());
        }
        tracing::info!("Connection server on port {} stopped", self.local_addr.port());
        Ok(())
    }
}

impl Drop for ConnectionServer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("Connection server on port {} left bound: {}", self.local_addr.port(), e);
        }
    }
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Where to connect to reach our own listener.
fn wake_addr(local_addr: SocketAddr) -> SocketAddr {
    match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local_addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local_addr.port())
        }
        _ => local_addr,
    }
}

fn accept_loop(
    listener: TcpListener,
    alive: Arc<AtomicBool>,
    policy: ResponsePolicy,
    io_timeout: Duration,
) {
    while alive.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                tracing::debug!("Request received from {}", peer);
                if let Err(e) = serve_connection(stream, policy.as_ref(), io_timeout) {
                    tracing::warn!("Connection from {} failed: {}", peer, e);
                }
            }
            Err(e) => {
                if !alive.load(Ordering::SeqCst) {
                    break;
                }
                tracing::warn!("Accept failed: {}", e);
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
    tracing::debug!("Accept loop exiting");
}

/// Read one request, answer it and close.
fn serve_connection(
    mut stream: TcpStream,
    policy: &(dyn Fn(&str) -> String + Send + Sync),
    io_timeout: Duration,
) -> Result<(), EngineError> {
    stream.set_read_timeout(Some(io_timeout))?;
    stream.set_write_timeout(Some(io_timeout))?;

    let request = codec::read_frame(&mut stream)?;
    tracing::debug!("Incoming request {:?}", request);
    stream.shutdown(Shutdown::Read)?;

    let response = policy(&request);
    codec::write_frame(&mut stream, &response)?;
    stream.shutdown(Shutdown::Write)?;
    tracing::debug!("Sent response {:?}", response);

    Ok(())
}
