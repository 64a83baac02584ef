//! `rank-node`: drive a scheduling node on a tick clock.
//!
//! # Usage
//!
//! ```bash
//! # 1000 ticks of synthetic traffic with the default configuration
//! rank-node run --ticks 1000
//!
//! # WFQ, one tick every 100us, until Ctrl+C
//! rank-node run --discipline wfq --tick-us 100 --ticks 0
//!
//! # Configuration files
//! rank-node gen-config --output node.toml
//! rank-node validate --config node.toml
//! ```

use clap::{Parser, Subcommand};
use rank_scheduler::node::NodeStatsSnapshot;
use rank_scheduler::{Discipline, InboundPacket, NodeConfig, NodeController, PacketDescriptor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Rank-based packet scheduling node
#[derive(Parser, Debug)]
#[command(name = "rank-node")]
#[command(about = "Per-node rank scheduler (strict priority, DRR, WFQ)")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node against synthetic traffic
    Run {
        /// Configuration file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Override the default discipline (sp, drr, wfq)
        #[arg(short, long)]
        discipline: Option<Discipline>,

        /// Number of ticks to run (0 runs until Ctrl+C)
        #[arg(long, default_value = "1000")]
        ticks: u64,

        /// Tick period in microseconds (0 runs as fast as possible)
        #[arg(long, default_value = "0")]
        tick_us: u64,

        /// Offer a packet every N ticks
        #[arg(long, default_value = "1")]
        offer_every: u64,
    },

    /// Generate an example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "node.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Packet lengths cycled by the traffic generator.
const LENGTHS: [u16; 4] = [64, 128, 512, 1500];

fn synthetic_packet(seq: u64, flows: usize) -> PacketDescriptor {
    let flow_id = (seq % flows as u64) as u16;
    PacketDescriptor::new(flow_id, LENGTHS[(seq as usize / flows.max(1)) % LENGTHS.len()])
        .with_endpoints(1, 2)
        .with_priority((seq % 8) as u8)
        .with_arrival_time(seq as u16)
        .with_payload_ptr(seq as u32)
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::GenConfig { output } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            std::fs::write(&output, NodeConfig::default().to_toml()?)?;
            info!(path = %output.display(), "configuration written");
            Ok(())
        }
        Commands::Validate { config } => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            let loaded = NodeConfig::from_file(&config)?;
            info!(
                path = %config.display(),
                flows = loaded.flows,
                discipline = %loaded.discipline,
                "configuration valid"
            );
            Ok(())
        }
        Commands::Run {
            config,
            discipline,
            ticks,
            tick_us,
            offer_every,
        } => {
            let mut node_config = match config {
                Some(path) => NodeConfig::from_file(path)?,
                None => NodeConfig::default(),
            };
            if let Some(discipline) = discipline {
                node_config.discipline = discipline;
            }
            init_logging(args.log_level.as_deref().unwrap_or(&node_config.log_level));
            let snapshot = run(node_config, ticks, tick_us, offer_every.max(1)).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

/// Drive a node with synthetic traffic.
///
/// # Arguments
/// * `config` - Node configuration
/// * `ticks` - Number of ticks to run, 0 runs until Ctrl+C
/// * `tick_us` - Tick period in microseconds, 0 runs as fast as possible
/// * `offer_every` - Offer one packet every `offer_every` ticks
///
/// # Returns
/// The node's final stats snapshot
async fn run(
    config: NodeConfig,
    ticks: u64,
    tick_us: u64,
    offer_every: u64,
) -> Result<NodeStatsSnapshot, Box<dyn std::error::Error>> {
    let flows = config.flows;
    let (mut node, ports) = NodeController::new(config)?;
    info!(ticks, tick_us, "node running");

    let mut interval = (tick_us > 0).then(|| {
        let mut interval = tokio::time::interval(Duration::from_micros(tick_us));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut seq = 0u64;
    let mut elapsed = 0u64;
    while ticks == 0 || elapsed < ticks {
        if let Some(interval) = interval.as_mut() {
            tokio::select! {
                _ = interval.tick() => {}
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
            }
        } else if elapsed % 1024 == 0 {
            // The first poll registers the Ctrl+C handler.
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                _ = tokio::task::yield_now() => {}
            }
        }

        if elapsed % offer_every == 0 {
            let packet = synthetic_packet(seq, flows);
            if ports.inbound.try_send(InboundPacket::new(packet)).is_err() {
                warn!(flow_id = packet.flow_id, "inbound port full, offer skipped");
            }
            seq += 1;
        }

        node.tick();
        while ports.outbound.try_recv().is_ok() {}
        elapsed += 1;
    }

    Ok(node.snapshot())
}
