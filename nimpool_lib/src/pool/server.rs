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


//! The pool's websocket front end and the tasks that keep it fed.
//!
//! [`start_pool_server`] waits for the node to reach consensus, publishes the
//! first job, spawns the head processor and housekeeping tasks and then
//! serves websocket miners on `/` until shutdown.

use crate::accounting::RewardDistributor;
use crate::chain::{BlockchainPort, ChainEvent};
use crate::config::Config;
use crate::pool::admission::{Admission, ConnectionAdmission, start_unban_task};
use crate::pool::agent::{Agent, AgentSettings, Frame, Outbound, PoolContext};
use crate::pool::connections::{ConnectionId, ConnectionsHandle, start_connections_handler};
use crate::pool::head::{HeadProcessor, start_head_processor};
use crate::pool::job::job_channel;
use crate::pool::messages::ServerMessage;
use crate::pool::share_writer::ShareWriter;
use crate::pool::stats::{HASHRATE_SAMPLE_INTERVAL, PoolStatsHandle, start_pool_stats};
use crate::store::StoreHandle;
use crate::store::background_tasks::{PruneSettings, start_background_tasks};
use crate::utils::time_provider::TimeProvider;
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{Message, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How often the node is asked whether consensus has been established.
pub const CONSENSUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

const ROOT_RESPONSE: &str = "NimPool Server";
const FORWARDED_FOR: &str = "x-forwarded-for";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone)]
struct ServerState {
    ctx: PoolContext,
    trust_forwarded_for: bool,
    next_connection_id: Arc<AtomicU64>,
    shutdown_rx: watch::Receiver<bool>,
}

/// Poll the node until it reports established consensus. Returns false if
/// shutdown came first.
pub async fn wait_for_consensus(
    chain: &dyn BlockchainPort,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> bool {
    let mut interval = tokio::time::interval(CONSENSUS_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return false;
                }
                continue;
            }
        }
        match chain.is_established().await {
            Ok(true) => return true,
            Ok(false) => debug!("Waiting for consensus"),
            Err(e) => warn!("Failed to query consensus state: {e}"),
        }
    }
}

/// Client address of a request. A proxy supplied `X-Forwarded-For` is only
/// believed when `trust_forwarded_for` is set, and then its first entry wins.
pub fn client_ip(peer: SocketAddr, headers: &HeaderMap, trust_forwarded_for: bool) -> IpAddr {
    if !trust_forwarded_for {
        return peer.ip();
    }
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| peer.ip())
}

/// Start the pool and serve miners until `shutdown_rx` flips to true.
///
/// `events` is the node's ordered stream of chain events. The returned
/// error covers startup only: node queries before serving and binding the
/// listener.
pub async fn start_pool_server(
    config: Config,
    chain: Arc<dyn BlockchainPort>,
    events: mpsc::Receiver<ChainEvent>,
    store: StoreHandle,
    time_provider: Arc<dyn TimeProvider>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), BoxError> {
    info!("Waiting for consensus before accepting miners");
    if !wait_for_consensus(chain.as_ref(), &mut shutdown_rx).await {
        info!("Shutdown before consensus was established");
        return Ok(());
    }

    let genesis_hash = chain.genesis_hash().await?;
    let settings = Arc::new(AgentSettings::from_config(&config, genesis_hash));
    let admission = Arc::new(ConnectionAdmission::new(&config.admission));
    let connections = start_connections_handler();
    let stats = start_pool_stats();
    let share_writer = ShareWriter::new(store.clone(), time_provider.clone());
    let (job_tx, job_rx) = job_channel();

    let distributor = RewardDistributor::new(
        store.clone(),
        chain.clone(),
        config.pool.address,
        config.pool.pool_fee,
        config.pool.pplns_shares,
        time_provider.clone(),
    );
    let head_processor = HeadProcessor::new(
        chain.clone(),
        store.clone(),
        share_writer.clone(),
        connections.clone(),
        job_tx,
        distributor,
    );
    let head = chain.head().await?;
    info!("Starting on head {} at {}", head.hash(), head.height());
    if !head_processor.refresh_job(&head, &mut shutdown_rx).await {
        return Ok(());
    }

    let tasks: Vec<JoinHandle<()>> = vec![
        start_head_processor(head_processor, events, shutdown_rx.clone()),
        start_unban_task(admission.clone(), shutdown_rx.clone()),
        start_background_tasks(
            store.clone(),
            chain.clone(),
            PruneSettings {
                frequency: Duration::from_secs(config.pool.prune_interval_secs),
                payout_confirmations: config.pool.payout_confirmations,
                share_retention_blocks: config.pool.share_retention_blocks,
                pplns_shares: config.pool.pplns_shares,
            },
            shutdown_rx.clone(),
        ),
        start_stats_logger(
            connections.clone(),
            admission.clone(),
            stats.clone(),
            shutdown_rx.clone(),
        ),
    ];

    let state = ServerState {
        ctx: PoolContext {
            settings,
            chain,
            store,
            share_writer: share_writer.clone(),
            connections,
            admission,
            stats,
            jobs: job_rx,
            time_provider,
        },
        trust_forwarded_for: config.server.trust_forwarded_for,
        next_connection_id: Arc::new(AtomicU64::new(1)),
        shutdown_rx: shutdown_rx.clone(),
    };
    let app = Router::new().route("/", get(root)).with_state(state);

    let bind_address = format!("{}:{}", config.server.hostname, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&bind_address).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {bind_address}: {e}");
            return Err(Box::new(e));
        }
    };
    info!("Pool server listening on {bind_address}");

    let mut serve_shutdown = shutdown_rx.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        while serve_shutdown.changed().await.is_ok() {
            if *serve_shutdown.borrow() {
                break;
            }
        }
        info!("Pool server shutdown signal received");
    })
    .await;
    if let Err(e) = served {
        error!("Pool server stopped with error: {e}");
    }

    share_writer.flush().await;
    for task in tasks {
        let _ = task.await;
    }
    info!("Pool server stopped");
    Ok(())
}

/// Websocket upgrades become miner sessions, plain requests get a banner.
async fn root(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<ServerState>,
) -> Response {
    match ws {
        Ok(ws) => {
            let ip = client_ip(peer, &headers, state.trust_forwarded_for);
            let addr = SocketAddr::new(ip, peer.port());
            ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
        }
        Err(_) => ROOT_RESPONSE.into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, addr: SocketAddr, state: ServerState) {
    match state.ctx.admission.admit(addr.ip()).await {
        Admission::Accepted => {}
        Admission::Banned => {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
        Admission::TooManyConnections => {
            let reason = ServerMessage::error("too many connections").to_json();
            let _ = socket.send(Message::Text(reason.into())).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    }

    let id: ConnectionId = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    debug!("Connection {id} from {addr}");
    let (agent, channels) = Agent::new(id, addr, state.ctx.clone());
    let (mut sink, stream) = socket.split();

    let mut outbound_rx = channels.outbound_rx;
    let writer = tokio::spawn(async move {
        while let Some(outbound) = outbound_rx.recv().await {
            let message = match outbound {
                Outbound::Message(message) => Message::Text(message.to_json().into()),
                Outbound::Ping => Message::Ping(Default::default()),
            };
            if let Err(e) = sink.send(message).await {
                debug!("Failed to write to {addr}: {e}");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let inbound = stream.map(|message| match message {
        Ok(Message::Text(text)) => Frame::Text(text.as_str().to_owned()),
        Ok(Message::Binary(bytes)) => Frame::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Ok(Message::Ping(_)) => Frame::Ping,
        Ok(Message::Pong(_)) => Frame::Pong,
        Ok(Message::Close(_)) | Err(_) => Frame::Close,
    });

    agent
        .run(
            inbound,
            channels.timer_rx,
            channels.command_rx,
            state.shutdown_rx.clone(),
        )
        .await;
    let _ = writer.await;
    debug!("Connection {id} from {addr} closed");
}

/// Log pool statistics once per hashrate sample.
fn start_stats_logger(
    connections: ConnectionsHandle,
    admission: Arc<ConnectionAdmission>,
    stats: PoolStatsHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HASHRATE_SAMPLE_INTERVAL);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown_rx.changed() => return,
            }
            let (Some(counts), Some(pool_stats)) =
                (connections.client_counts().await, stats.get_stats().await)
            else {
                return;
            };
            info!(
                "Clients: {} ({} unregistered, {} smart, {} nano, {} dumb), {} IPs banned, {} blocks mined, hashrate {} H/s",
                counts.total(),
                counts.unregistered,
                counts.smart,
                counts.nano,
                counts.dumb,
                admission.num_ips_banned().await,
                pool_stats.blocks_mined,
                pool_stats.hashrate.round_dp(0),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::chain::port::MockBlockchainPort;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "198.51.100.4:5000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_ignores_header_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("203.0.113.9"));
        assert_eq!(client_ip(peer(), &headers, false), peer().ip());
        assert_eq!(
            client_ip(peer(), &headers, true),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_takes_first_forwarded_entry() {
        let mut headers = HeaderMap::new();
        headers.insert(
            FORWARDED_FOR,
            HeaderValue::from_static("2001:db8::1, 10.0.0.1"),
        );
        assert_eq!(
            client_ip(peer(), &headers, true),
            "2001:db8::1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_client_ip_falls_back_on_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert(FORWARDED_FOR, HeaderValue::from_static("not an ip"));
        assert_eq!(client_ip(peer(), &headers, true), peer().ip());
        assert_eq!(client_ip(peer(), &HeaderMap::new(), true), peer().ip());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_consensus_polls_until_established() {
        let mut chain = MockBlockchainPort::new();
        let mut calls = 0;
        chain.expect_is_established().times(3).returning(move || {
            calls += 1;
            match calls {
                1 => Err(ChainError::Rpc("node starting".to_string())),
                2 => Ok(false),
                _ => Ok(true),
            }
        });
        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        assert!(wait_for_consensus(&chain, &mut shutdown_rx).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_consensus_stops_on_shutdown() {
        let mut chain = MockBlockchainPort::new();
        chain.expect_is_established().returning(|| Ok(false));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_for_consensus(&chain, &mut shutdown_rx).await });
        tokio::time::sleep(Duration::from_secs(5)).await;
        shutdown_tx.send(true).unwrap();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_consensus_stops_when_shutdown_sender_is_dropped() {
        let mut chain = MockBlockchainPort::new();
        chain.expect_is_established().returning(|| Ok(false));
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        let waited = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_consensus(&chain, &mut shutdown_rx),
        )
        .await;
        assert_eq!(waited, Ok(false));
    }
}
