//! edgelink daemon entry point.
//!
//! Loads configuration, initializes tracing, and drives the agent tick loop
//! until SIGINT/SIGTERM. The tick interval is the embedder's only knob; all
//! protocol pacing lives inside the agent's own action clocks.

use clap::Parser;
use tracing::info;

use edgelink::{Agent, AgentConfig, NodeState};

/// Reverse-tunnel edge agent for hub-managed device fleets.
#[derive(Parser)]
#[command(name = "edgelink", version)]
struct Cli {
    /// Path to TOML config file (default: ./edgelink.toml if present).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = AgentConfig::load(cli.config.as_deref());

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("edgelink v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Hub: {}", config.hub.base_url);
    info!("Slot: {}", config.hub.slot_id);

    let tick_interval = tokio::time::Duration::from_millis(config.tick_interval_ms.max(10));
    let mut agent = Agent::new(config);

    if agent.state() == NodeState::Error && !agent.last_error().is_empty() {
        // Permanent configuration error; report it and keep the process up
        // so supervisors don't flap, matching the agent's self-looping ERROR.
        tracing::error!("{}", agent.last_error());
    }

    let mut ticker = tokio::time::interval(tick_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                agent.tick().await;
            }
            () = &mut shutdown => {
                break;
            }
        }
    }

    info!("Shutting down...");
    agent.shutdown().await;
    info!("Goodbye");
}
