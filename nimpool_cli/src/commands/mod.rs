// Copyright (C) 2024, 2025 NimPool Developers (see AUTHORS)
//
// This file is part of NimPool
//
// NimPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// NimPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// NimPool. If not, see <https://www.gnu.org/licenses/>.


pub mod payout;
pub mod validate;

use clap::{Parser, Subcommand};
use nimpool_lib::chain::{BlockchainPort, ChainEvent};
use nimpool_lib::config::Config;
use nimpool_lib::pool::server::wait_for_consensus;
use nimpool_lib::store::{Store, StoreHandle};
use nimpool_rpc::{NodeChain, NodeRpcClient};
use std::error::Error;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// NimPool payout utility
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to nimpool config file
    #[arg(short, long, env("NIMPOOL_CONFIG"), global = true)]
    pub config: String,

    /// Command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Pay users above the auto payout limit and serve payout requests
    Payout,
    /// Re-send recorded payouts the node does not know about
    Validate,
}

/// Connections a payout run needs.
pub struct PayoutContext {
    pub config: Config,
    pub store: StoreHandle,
    pub chain: Arc<dyn BlockchainPort>,
    /// Transactions the node accepted during this run
    pub relays: mpsc::UnboundedReceiver<ChainEvent>,
}

impl PayoutContext {
    /// Open the store and connect to the node, then wait until the node
    /// has established consensus.
    pub async fn connect(config: Config) -> Result<Self, Box<dyn Error>> {
        let store = Store::new(config.store.path.clone(), false)
            .map_err(|e| format!("Error opening store {}: {e}", config.store.path))?;
        let store = StoreHandle::spawn(Arc::new(store));

        let client = NodeRpcClient::new(
            &config.node.url,
            &config.node.username,
            &config.node.password,
        )?;
        let (relay_tx, relays) = mpsc::unbounded_channel();
        let chain: Arc<dyn BlockchainPort> =
            Arc::new(NodeChain::new(client).with_relay_events(relay_tx));

        info!("Waiting for consensus");
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        if !wait_for_consensus(chain.as_ref(), &mut shutdown_rx).await {
            return Err("Stopped before consensus was established".into());
        }

        Ok(Self {
            config,
            store,
            chain,
            relays,
        })
    }
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    match &cli.command {
        Some(command) => {
            let config = Config::load(&cli.config)?;
            let ctx = PayoutContext::connect(config).await?;
            match command {
                Commands::Payout => payout::execute(ctx).await?,
                Commands::Validate => validate::execute(ctx).await?,
            }
        }
        None => {
            println!("No command specified. Use --help for usage information.");
        }
    }

    Ok(())
}
