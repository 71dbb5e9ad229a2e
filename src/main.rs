//! CLI entrypoint: parses `NodeConfig`, installs the `tracing` subscriber,
//! resolves this process's node identity, opens the sqlite store, wires
//! every component into a `Node`, and runs until `ctrl_c` — restarting
//! in place with a fresh identity if an id collision is detected.

mod aggregator;
mod config;
mod coordinator;
mod discovery;
mod election;
mod error;
mod identity;
mod ids;
mod lock;
mod messages;
mod node;
mod router;
mod store;
mod transport;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use config::NodeConfig;
use node::Node;
use store::SqliteStore;

#[tokio::main]
async fn main() {
    let config = NodeConfig::parse();
    install_tracing(&config.log_level);

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!(error = %e, "failed to create data directory");
        std::process::exit(1);
    }

    let mut bound = match node::resolve_identity(&config) {
        Ok(bound) => bound,
        Err(e) => {
            error!(error = %e, "failed to resolve node identity");
            std::process::exit(1);
        }
    };

    // Each iteration runs one node instance to completion; an id
    // collision (§4.4/§8 scenario 6) tears it down and loops with a
    // freshly obtained identity instead of exiting the process.
    loop {
        let store_path = config.store_path(bound.node_id.value());
        let store = match SqliteStore::open(&store_path, bound.node_id.value()) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "failed to open store");
                std::process::exit(1);
            }
        };

        let mut node = match Node::new(config.clone(), store, bound) {
            Ok(node) => node,
            Err(e) => {
                error!(error = %e, "failed to construct node");
                std::process::exit(1);
            }
        };

        if let Err(e) = node.start().await {
            error!(error = %e, "failed to start node");
            std::process::exit(1);
        }

        info!(node_id = %node.self_id, "running, press ctrl-c to stop");
        let restart = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                false
            }
            _ = node.wait_for_collision() => true,
        };

        node.stop().await;

        if !restart {
            break;
        }

        bound = match node::resolve_fresh_identity(&config) {
            Ok(bound) => bound,
            Err(e) => {
                error!(error = %e, "failed to resolve a fresh node identity after collision");
                std::process::exit(1);
            }
        };
    }
}

fn install_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
