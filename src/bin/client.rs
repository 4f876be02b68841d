//! Front Tunnel Client
//!
//! Helper for working with a front tunnel server:
//! - Encrypts backend addresses into framing lines
//! - Decrypts lines for inspection
//! - Opens a tunnel and bridges it to stdin/stdout

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use front_tunnel::{
    crypto::{decrypt, encrypt_base64},
    protocol::encode_request,
    tunnel::{pipe, Direction},
    Signal,
};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Relay buffer size for stdin/stdout bridging
const BRIDGE_BUFFER_SIZE: usize = 16 * 1024;

/// How long to wait for a possible failure signal before bridging
const SIGNAL_WAIT: Duration = Duration::from_millis(500);

/// Front Tunnel Client - build and test encrypted tunnel requests
#[derive(Parser, Debug)]
#[command(name = "front-client")]
#[command(about = "Front Tunnel Client - encrypt backend addresses and open tunnels")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the ciphertext line for a backend address
    Encrypt {
        /// Shared secret (falls back to $SECRET)
        #[arg(short, long, env = "SECRET")]
        secret: String,
        /// Backend address, host:port
        addr: String,
    },
    /// Print the backend address inside a ciphertext line
    Decrypt {
        /// Shared secret (falls back to $SECRET)
        #[arg(short, long, env = "SECRET")]
        secret: String,
        /// Base64 ciphertext
        ciphertext: String,
    },
    /// Open a tunnel and bridge it to stdin/stdout
    Connect {
        /// Front tunnel server address
        #[arg(long, default_value = "127.0.0.1:4043")]
        server: String,
        /// Shared secret (falls back to $SECRET)
        #[arg(short, long, env = "SECRET")]
        secret: String,
        /// Backend address, host:port
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Encrypt { secret, addr } => {
            let line = encrypt_base64(secret.as_bytes(), addr.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&line));
        }
        Command::Decrypt { secret, ciphertext } => {
            let addr = decrypt(secret.as_bytes(), ciphertext.as_bytes())?;
            println!("{}", String::from_utf8_lossy(&addr));
        }
        Command::Connect {
            server,
            secret,
            addr,
        } => connect(&server, secret.as_bytes(), &addr).await?,
    }

    Ok(())
}

/// Open a tunnel to `addr` through `server` and bridge stdin/stdout
async fn connect(server: &str, secret: &[u8], addr: &str) -> Result<()> {
    let line = encrypt_base64(secret, addr.as_bytes())?;

    let mut stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;
    stream.set_nodelay(true).ok();
    stream.write_all(&encode_request(&line)).await?;
    info!("Requested tunnel to {} via {}", addr, server);

    // A failed setup answers with one byte and closes; look for it briefly
    let mut pending = Vec::new();
    let mut first = [0u8; 2];
    if let Ok(result) = tokio::time::timeout(SIGNAL_WAIT, stream.peek(&mut first)).await {
        let n = result.context("Failed to read from server")?;
        if n == 0 {
            bail!("Server closed the connection without a reply");
        }
        if n == 1 {
            if let Ok(signal) = Signal::try_from(first[0]) {
                stream.read_exact(&mut first[..1]).await?;
                pending.push(first[0]);

                let mut probe = [0u8; 1];
                let closed = matches!(
                    tokio::time::timeout(SIGNAL_WAIT, stream.peek(&mut probe)).await,
                    Ok(Ok(0))
                );
                if closed {
                    return Err(anyhow!("Tunnel refused: {}", signal));
                }
                debug!("First byte looked like {} but the tunnel stayed open", signal);
            }
        }
    }

    let (server_read, server_write) = stream.into_split();
    let upstream = tokio::spawn(async move {
        let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
        pipe(
            tokio::io::stdin(),
            server_write,
            &[],
            &mut buf,
            Direction::ClientToBackend,
        )
        .await
    });

    let mut buf = vec![0u8; BRIDGE_BUFFER_SIZE];
    let (received, err) = pipe(
        server_read,
        tokio::io::stdout(),
        &pending,
        &mut buf,
        Direction::BackendToClient,
    )
    .await;
    upstream.abort();

    debug!("Received {} bytes", received);
    match err {
        Some(e) => Err(e).context("Tunnel relay failed"),
        None => Ok(()),
    }
}
