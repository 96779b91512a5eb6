//! HiVPN: TUN tunnel client
//!
//! Reads one JSON command per line on stdin and writes one JSON response
//! per line on stdout. Logs go to stderr.
//!
//! ```text
//! hivpn [settings.toml]
//! ```

use anyhow::{Context, Result};
use hivpn_tunnel::{handle_line, ClientSettings, TunnelClient};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    let settings = match std::env::args().nth(1) {
        Some(path) => ClientSettings::from_toml_file(Path::new(&path))
            .with_context(|| format!("loading settings from {}", path))?,
        None => ClientSettings::default(),
    };

    info!("HiVPN starting (interface {})", settings.interface.name);
    let client = build_client(settings)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(&client, &line).await;
        stdout.write_all(response.to_line().as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    let stats = client.get_stats();
    if client.disconnect().await {
        info!("Input closed, tunnel disconnected ({})", stats.format());
    }
    info!("HiVPN shutting down");
    Ok(())
}

#[cfg(target_os = "linux")]
fn build_client(settings: ClientSettings) -> Result<TunnelClient> {
    use hivpn_tunnel::{FwmarkProtector, LinuxBackend};

    let backend = Arc::new(LinuxBackend::new(settings.fwmark, settings.route_table));
    let protector = Arc::new(FwmarkProtector::new(settings.fwmark));
    Ok(TunnelClient::new(settings, backend, protector))
}

#[cfg(not(target_os = "linux"))]
fn build_client(_settings: ClientSettings) -> Result<TunnelClient> {
    anyhow::bail!("no virtual interface backend for this platform")
}
