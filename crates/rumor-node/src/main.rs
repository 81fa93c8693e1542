//! rumord - gossip membership daemon
//!
//! Joins a cluster through its seeds, advertises the configured attributes
//! and logs membership changes until interrupted.

use clap::{Parser, Subcommand};
use rumor_core::{ClusterAction, ClusterEvent};
use rumor_node::{NodeConfig, RumorNode};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "rumord")]
#[command(about = "Gossip cluster membership daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the cluster and run until interrupted
    Run {
        /// Path to config file
        #[arg(short, long, default_value = "/etc/rumord/config.toml")]
        config: PathBuf,

        /// Seconds between stats log lines
        #[arg(long, default_value_t = 60)]
        stats_interval: u64,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "/etc/rumord/config.toml")]
        output: PathBuf,

        /// Cluster name
        #[arg(long, default_value = "default")]
        cluster: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("rumord=info".parse()?)
                .add_directive("rumor_node=info".parse()?)
                .add_directive("rumor_core=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            stats_interval,
        } => {
            run_node(config, stats_interval).await?;
        }

        Commands::InitConfig { output, cluster } => {
            init_config(output, cluster)?;
        }
    }

    Ok(())
}

fn log_event(event: &ClusterEvent) {
    match event.action {
        ClusterAction::Added => info!(member = %event.member, "member joined"),
        ClusterAction::Removed => info!(member = %event.member, "member left"),
        ClusterAction::Updated => info!(
            member = %event.member,
            added = ?event.added,
            removed = ?event.removed,
            updated = ?event.updated,
            "member attributes changed"
        ),
    }
}

async fn run_node(config_path: PathBuf, stats_interval: u64) -> anyhow::Result<()> {
    info!(config = %config_path.display(), "starting rumord");

    let config = NodeConfig::from_file(&config_path)?;
    info!(
        cluster = %config.cluster_name,
        seeds = config.seeds.len(),
        "loaded config"
    );

    let node = RumorNode::new(&config).await?;
    node.add_listener(Arc::new(log_event));
    node.start();

    let mut ticker = tokio::time::interval(Duration::from_secs(stats_interval.max(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                info!("interrupt received, leaving cluster");
                break;
            }
            _ = ticker.tick() => {
                let stats = node.stats();
                info!(
                    members = node.cluster().known_members().len(),
                    rounds = stats.rounds,
                    sent = stats.messages_sent,
                    received = stats.messages_received,
                    dropped = stats.messages_dropped,
                    resyncs = stats.resyncs_succeeded,
                    "gossip stats"
                );
            }
        }
    }

    node.shutdown().await;
    Ok(())
}

fn init_config(output: PathBuf, cluster: String) -> anyhow::Result<()> {
    let config = NodeConfig {
        cluster_name: cluster,
        ..NodeConfig::sample()
    };

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output, config.to_toml()?)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Edit the seeds and attributes, then run:");
    println!("  rumord run --config {}", output.display());

    Ok(())
}
