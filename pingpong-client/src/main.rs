use std::net::ToSocketAddrs;
use std::time::Duration;
use clap::Parser;
use anyhow::{bail, Context, Result};
use shared::client;
use shared::protocol::{DEFAULT_REQUEST_TIMEOUT_MS, REQUEST_MESSAGE};

#[derive(Parser, Debug)]
#[command(name = "pingpong-client", version, about = "Send one request to a ping/pong peer")]
struct Args {
    /// Peer host name or address
    host: String,

    /// Peer port, as advertised
    port: u16,

    #[arg(short, long, default_value = REQUEST_MESSAGE)]
    message: String,

    /// Bound on connect, send and receive
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pingpong_client=warn,shared=warn"))
        )
        .init();

    let args = Args::parse();
    if args.timeout_ms == 0 {
        bail!("--timeout-ms must be greater than zero");
    }

    let addr = (args.host.as_str(), args.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}", args.host))?
        .next()
        .with_context(|| format!("No address found for {}", args.host))?;

    tracing::debug!("Sending {:?} to {}", args.message, addr);
    let response = client::send(&args.message, addr, Duration::from_millis(args.timeout_ms))
        .with_context(|| format!("Request to {} failed", addr))?;

    println!("{}", response);
    Ok(())
}
