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


use clap::Parser;
use nimpool_lib::chain::BlockchainPort;
use nimpool_lib::config::Config;
use nimpool_lib::logging::setup_logging;
use nimpool_lib::pool::start_pool_server;
use nimpool_lib::store::{Store, StoreHandle};
use nimpool_lib::utils::time_provider::SystemTimeProvider;
use nimpool_rpc::{NodeChain, NodeRpcClient, start_head_poller};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, trace};

use crate::signal::{ShutdownReason, setup_signal_handler, wait_for_exit};

mod signal;

/// Chain events buffered between the head poller and the head processor.
const CHAIN_EVENT_BUFFER_SIZE: usize = 64;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, env("NIMPOOL_CONFIG"))]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    // hold guard to ensure logging is set up correctly
    let _guard = match setup_logging(&config.logging) {
        Ok(guard) => {
            info!("Logging set up successfully");
            guard
        }
        Err(e) => {
            eprintln!("Failed to set up logging: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("Starting NimPool {}...", config.pool.name);

    let exit_sender = watch::Sender::new(ShutdownReason::None);
    let sig_handle = setup_signal_handler(exit_sender.clone());

    let store = match Store::new(config.store.path.clone(), false) {
        Ok(store) => StoreHandle::spawn(Arc::new(store)),
        Err(e) => {
            error!("Failed to open store at {}: {e}", config.store.path);
            return ExitCode::FAILURE;
        }
    };

    let client = match NodeRpcClient::new(
        &config.node.url,
        &config.node.username,
        &config.node.password,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to create node client: {e}");
            return ExitCode::FAILURE;
        }
    };
    let chain: Arc<dyn BlockchainPort> = Arc::new(NodeChain::new(client));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(CHAIN_EVENT_BUFFER_SIZE);
    let poller = start_head_poller(
        chain.clone(),
        Duration::from_millis(config.node.poll_interval_ms),
        events_tx,
        shutdown_rx.clone(),
    );

    let exit_sender_server = exit_sender.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = start_pool_server(
            config,
            chain,
            events_rx,
            store,
            Arc::new(SystemTimeProvider),
            shutdown_rx,
        )
        .await
        {
            error!("Pool server failed: {e}");
            let _ = exit_sender_server.send(ShutdownReason::Error);
        }
        info!("Pool server stopped");
    });

    let reason = wait_for_exit(&mut exit_sender.subscribe()).await;

    info!("Pool shutting down...");
    let _ = shutdown_tx.send(true);
    if let Err(e) = server.await {
        error!("Pool server task failed: {e}");
    }
    if let Err(e) = poller.await {
        error!("Head poller task failed: {e}");
    }
    // Notify signal handler to exit
    let _ = exit_sender.send(reason);

    trace!("Waiting signal handlers");
    if let Err(e) = sig_handle.await {
        error!("Signal handler failed: {e}");
    }

    reason.exit_code()
}
