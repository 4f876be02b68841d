//! Front Tunnel Server
//!
//! Accepts client connections, decrypts the backend address each client
//! sends on its first line, and relays bytes to that backend.

use anyhow::{Context, Result};
use clap::Parser;
use front_tunnel::{
    config::{generate_example_config, Config, LoggingConfig},
    metrics, Acceptor, Dispatcher,
};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Front Tunnel Server - encrypted-destination TCP dispatcher
#[derive(Parser, Debug)]
#[command(name = "front-server")]
#[command(about = "Front Tunnel Server - routes clients to encrypted backend addresses")]
#[command(version)]
struct Args {
    /// Configuration file path (defaults and environment only when absent)
    #[arg(short, long)]
    config: Option<String>,

    /// Write an example configuration to this path and exit
    #[arg(long)]
    generate_config: Option<String>,

    /// Listen address (overrides config and environment)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Some(path) = args.generate_config {
        generate_example_config()
            .save(&path)
            .context("Failed to write example configuration")?;
        println!("Example configuration written to {}", path);
        return Ok(());
    }

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(Path::new(path)).context("Failed to load configuration")?,
        None => Config::default(),
    };
    config
        .apply_env()
        .context("Invalid environment configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    init_logging(&config.logging);

    if config.server.secret.is_empty() {
        warn!("No secret configured - backend addresses are encrypted with an empty passphrase");
    }

    #[cfg(unix)]
    match raise_open_file_limit(config.server.max_open_files) {
        Ok(limit) => info!("Open file limit: {}", limit),
        Err(e) => warn!("Failed to raise open file limit: {}", e),
    }

    let dispatcher = Arc::new(Dispatcher::from_config(&config.server));

    if let Some(diag_addr) = config.server.diagnostics_listen.clone() {
        let listener = TcpListener::bind(&diag_addr)
            .await
            .with_context(|| format!("Failed to bind diagnostics on {}", diag_addr))?;
        let metrics = dispatcher.metrics();
        let cache = dispatcher.cache();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(listener, metrics, cache).await {
                error!("Diagnostics server stopped: {}", e);
            }
        });
    }

    info!("Front Tunnel Server v{}", front_tunnel::VERSION);
    info!(
        "Backend timeout {:?}, cache capacity {}, read buffer {} bytes",
        config.server.backend_timeout(),
        config.server.cache_capacity,
        config.server.read_buffer_size
    );

    let acceptor = Acceptor::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    acceptor
        .run(dispatcher, shutdown)
        .await
        .context("Accept loop failed")?;

    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(logging.level.as_str());
    match logging.format.as_str() {
        "pretty" => builder.pretty().init(),
        "compact" => builder.compact().init(),
        _ => builder.init(),
    }
}

/// Raise `RLIMIT_NOFILE` towards `target`, returning the resulting soft limit
#[cfg(unix)]
fn raise_open_file_limit(target: u64) -> std::io::Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let target = target as libc::rlim_t;
    if limit.rlim_cur >= target {
        return Ok(limit.rlim_cur as u64);
    }

    let wanted = libc::rlimit {
        rlim_cur: target,
        rlim_max: std::cmp::max(limit.rlim_max, target),
    };
    // SAFETY: `wanted` is a valid rlimit
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &wanted) } == 0 {
        return Ok(target as u64);
    }

    // Unprivileged: go as far as the hard limit allows
    let capped = libc::rlimit {
        rlim_cur: std::cmp::min(target, limit.rlim_max),
        rlim_max: limit.rlim_max,
    };
    // SAFETY: `capped` is a valid rlimit
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &capped) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(capped.rlim_cur as u64)
}
