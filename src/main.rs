//! kilnd, a sandboxed compile-and-run daemon.
//!
//! Accepts front-end connections, materializes submitted sources into a
//! jailed per-session working directory, compiles and runs them under an
//! external jail wrapper with strict time and output limits, and streams
//! the results back over a line-oriented, quoted-printable-armored frame
//! protocol. A `Version` query probes every configured toolchain instead.

mod config;
mod error;
mod jail;
mod limits;
mod protocol;
mod qp;
mod run;
mod session;
mod sources;
mod version;
mod writer;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::session::Session;
use crate::writer::spawn_writer;

/// Backoff before retrying a failed accept, matching the transient-open
/// retry delay used for source files.
const ACCEPT_RETRY_DELAY_MS: u64 = 50;

#[derive(Parser, Debug)]
#[command(name = "kilnd")]
#[command(about = "Sandboxed compile-and-run daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "/etc/kilnd/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Arc::new(Config::load(&args.config)?);

    create_private_dir(&config.system.basedir)
        .context("failed to create basedir, check permission")?;
    create_private_dir(&config.system.storedir)
        .context("failed to create storedir, check permission")?;

    let listener = TcpListener::bind(("0.0.0.0", config.system.listen_port))
        .await
        .with_context(|| format!("failed to bind port {}", config.system.listen_port))?;
    info!(port = config.system.listen_port, "listening");

    let admission = Arc::new(Semaphore::new(config.system.max_connections));

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Accept errors are transient (EMFILE under load, aborted
                // handshakes); park briefly and keep serving the sessions
                // already running.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(ACCEPT_RETRY_DELAY_MS)).await;
                continue;
            }
        };
        info!(%peer, "connection established");
        let config = Arc::clone(&config);
        let admission = Arc::clone(&admission);
        tokio::spawn(async move {
            // One admission token per live session. The connection is
            // already accepted; its setup parks here while max-connections
            // sessions are running, and the token returns when this task's
            // state drops, however the session ends.
            let Ok(_permit) = admission.acquire_owned().await else {
                return;
            };
            handle_connection(stream, config).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, config: Arc<Config>) {
    let (read_half, write_half) = stream.into_split();
    let (sender, writer_task) = spawn_writer(write_half);
    let session = Session::new(config, sender);
    if let Err(e) = session.run(read_half).await {
        warn!(error = %e, "session closed with error");
    }
    // Every frame sender is gone by now; let the writer drain before the
    // connection drops.
    let _ = writer_task.await;
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    match std::fs::DirBuilder::new().mode(0o700).create(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}
