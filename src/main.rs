// src/main.rs
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use numatopo::cputree::{PackageTree, SYSFS_CPU_PATH};
use numatopo::numa::{self, NumaConfig, NumaNodes, SYSFS_NODE_PATH};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Opts {
    #[arg(long, default_value = SYSFS_NODE_PATH)]
    node_path: PathBuf,
    #[arg(long, default_value = SYSFS_CPU_PATH)]
    cpu_path: PathBuf,
    /// Treat the host as having no NUMA topology
    #[arg(long, default_value_t = false)]
    no_numa: bool,
    /// Rescan period; 0 scans once and exits
    #[arg(long, default_value_t = 0)]
    interval_ms: u64,
    /// Append one JSON line per scan to this file
    #[arg(long)]
    log_json: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("numatopo={}", opts.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut log = match opts.log_json {
        Some(ref p) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(p)
                .with_context(|| format!("open {}", p.display()))?,
        ),
        None => None,
    };

    let numa_available = !opts.no_numa && numa::numa_available(&opts.node_path);
    info!(numa_available, path = %opts.node_path.display(), "scanning numa topology");
    let mut nodes = NumaNodes::new(NumaConfig {
        node_path: opts.node_path.clone(),
        numa_available,
    });

    nodes.build();
    let mut packages = PackageTree::scan(&opts.cpu_path, &nodes);
    report(&nodes, &packages, log.as_mut())?;

    if opts.interval_ms == 0 {
        return Ok(());
    }

    let mut ticker = interval(Duration::from_millis(opts.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // the first tick fires immediately
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                nodes.rescan();
                packages = PackageTree::scan(&opts.cpu_path, &nodes);
                report(&nodes, &packages, log.as_mut())?;
            }
            _ = signal::ctrl_c() => {
                info!("ctrl-c; shutting down");
                break;
            }
        }
    }

    drop(packages);
    nodes.teardown();
    Ok(())
}

fn report(nodes: &NumaNodes, packages: &PackageTree, log: Option<&mut File>) -> Result<()> {
    nodes.dump();
    info!(nodes = nodes.len(), packages = packages.len(), "topology scanned");

    if let Some(file) = log {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let line = json!({
            "ts": { "sec": ts.as_secs(), "nsec": ts.subsec_nanos() },
            "numa_available": nodes.config().numa_available,
            "nodes": nodes.summaries(),
        });
        writeln!(file, "{}", serde_json::to_string(&line)?).context("write topology log")?;
    }
    Ok(())
}
