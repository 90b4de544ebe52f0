#![forbid(unsafe_code)]
//! Sync simulator for TrinityChain - drives a full headers-first sync against
//! in-process loopback peers

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use trinity_netsync::blockchain::MemoryChain;
use trinity_netsync::config::load_config_from;
use trinity_netsync::network::{spawn_loopback_peer, LoopbackOptions, PeerId};
use trinity_netsync::SyncManager;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file; defaults apply when it is missing
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Number of loopback peers serving the remote chain
    #[arg(long, default_value_t = 3)]
    peers: u64,

    /// Height of the chain the peers serve
    #[arg(long, default_value_t = 500)]
    remote_height: u64,

    /// Height the local chain starts at
    #[arg(long, default_value_t = 0)]
    local_height: u64,

    /// Base reply latency of every peer, e.g. "5ms"
    #[arg(long, value_parser = humantime::parse_duration, default_value = "5ms")]
    latency: Duration,

    /// Give up if the chain is not current after this long
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    timeout: Duration,

    /// How many of the peers never answer block requests
    #[arg(long, default_value_t = 0)]
    stalling_peers: u64,

    /// Override logging.level from the configuration
    #[arg(long)]
    log_level: Option<String>,

    /// Print the final sync status as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = load_config_from(&cli.config)?;

    let level: tracing::Level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .parse()?;
    tracing_subscriber::fmt().with_max_level(level).init();

    if cli.local_height >= cli.remote_height {
        info!(
            local_height = cli.local_height,
            remote_height = cli.remote_height,
            "Local chain is not behind the peers, nothing to sync"
        );
        return Ok(());
    }
    if cli.stalling_peers >= cli.peers {
        warn!("Every peer stalls on block requests; sync will not complete");
    }

    let remote = Arc::new(MemoryChain::with_height(cli.remote_height));
    let local = Arc::new(MemoryChain::with_height(cli.local_height));
    let manager = SyncManager::new(config.sync.clone(), local.clone());
    let handle = manager.handle();
    manager.start()?;

    let mut peer_tasks = Vec::new();
    for i in 0..cli.peers {
        let options = LoopbackOptions {
            max_headers: config.sync.max_headers_per_batch,
            latency: cli.latency,
            jitter: cli.latency,
            answer_blocks: i >= cli.stalling_peers,
        };
        let (peer, task) = spawn_loopback_peer(PeerId(i), Arc::clone(&remote), handle.clone(), options);
        handle.peer_connected(peer, cli.remote_height).await?;
        peer_tasks.push(task);
    }

    let started = Instant::now();
    let synced = tokio::time::timeout(cli.timeout, async {
        while !manager.is_current() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .is_ok();
    let elapsed = Duration::from_millis(started.elapsed().as_millis() as u64);

    let status = manager.status();
    manager.stop().await?;
    for task in peer_tasks {
        let _ = task.await;
    }

    if !synced {
        return Err(format!(
            "sync did not complete within {} (phase {}, height {}/{})",
            humantime::format_duration(cli.timeout),
            status.phase,
            status.local_height,
            cli.remote_height
        )
        .into());
    }

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!(
        "Synced to height {} in {} ({} blocks applied, sync peer {})",
        local.height(),
        humantime::format_duration(elapsed),
        status.blocks_applied,
        status
            .sync_peer
            .map(|p| p.peer.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    Ok(())
}
