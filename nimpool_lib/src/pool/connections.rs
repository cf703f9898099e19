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

use crate::pool::agent::{AgentCommand, AgentMode};
use crate::pool::job::Job;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Identifier the server gives each accepted connection.
pub type ConnectionId = u64;

/// Number of live agents per mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientCounts {
    pub unregistered: usize,
    pub smart: usize,
    pub nano: usize,
    pub dumb: usize,
}

impl ClientCounts {
    pub fn total(&self) -> usize {
        self.unregistered + self.smart + self.nano + self.dumb
    }
}

struct AgentEntry {
    addr: SocketAddr,
    mode: AgentMode,
    command_tx: mpsc::Sender<AgentCommand>,
}

/// Commands that can be sent to the connections actor
#[derive(Debug)]
pub enum ConnectionCommand {
    Add {
        id: ConnectionId,
        addr: SocketAddr,
        command_tx: mpsc::Sender<AgentCommand>,
    },
    SetMode {
        id: ConnectionId,
        mode: AgentMode,
    },
    Remove {
        id: ConnectionId,
    },
    BroadcastJob {
        job: Arc<Job>,
    },
    GetClientCounts {
        response: oneshot::Sender<ClientCounts>,
    },
}

/// A handle to interact with the connections actor
#[derive(Clone)]
pub struct ConnectionsHandle {
    cmd_tx: mpsc::Sender<ConnectionCommand>,
}

impl ConnectionsHandle {
    /// Register a freshly accepted agent. It starts out unregistered.
    pub async fn add(
        &self,
        id: ConnectionId,
        addr: SocketAddr,
        command_tx: mpsc::Sender<AgentCommand>,
    ) {
        let _ = self
            .cmd_tx
            .send(ConnectionCommand::Add {
                id,
                addr,
                command_tx,
            })
            .await;
    }

    pub async fn set_mode(&self, id: ConnectionId, mode: AgentMode) {
        let _ = self
            .cmd_tx
            .send(ConnectionCommand::SetMode { id, mode })
            .await;
    }

    pub async fn remove(&self, id: ConnectionId) {
        let _ = self.cmd_tx.send(ConnectionCommand::Remove { id }).await;
    }

    /// Push a new job to every nano and dumb agent.
    /// Don't wait for the actor to respond. Fire and forget.
    pub async fn broadcast_job(&self, job: Arc<Job>) {
        let _ = self
            .cmd_tx
            .send(ConnectionCommand::BroadcastJob { job })
            .await;
    }

    /// None if the actor has stopped.
    pub async fn client_counts(&self) -> Option<ClientCounts> {
        let (response, rx) = oneshot::channel();
        self.cmd_tx
            .send(ConnectionCommand::GetClientCounts { response })
            .await
            .ok()?;
        rx.await.ok()
    }
}

/// Live agents, owned by a single task so fan-out never takes a lock.
#[derive(Default)]
struct Connections {
    agents: HashMap<ConnectionId, AgentEntry>,
}

impl Connections {
    fn add(&mut self, id: ConnectionId, addr: SocketAddr, command_tx: mpsc::Sender<AgentCommand>) {
        self.agents.insert(
            id,
            AgentEntry {
                addr,
                mode: AgentMode::Unregistered,
                command_tx,
            },
        );
    }

    fn set_mode(&mut self, id: ConnectionId, mode: AgentMode) {
        if let Some(entry) = self.agents.get_mut(&id) {
            entry.mode = mode;
        }
    }

    /// Dropping the entry closes the agent's command channel, which ends
    /// the connection if it is still running.
    fn remove(&mut self, id: ConnectionId) -> bool {
        self.agents.remove(&id).is_some()
    }

    /// Agents whose command channel is full or closed are removed.
    fn broadcast_job(&mut self, job: Arc<Job>) -> usize {
        let mut failed = Vec::new();
        let mut sent = 0;
        for (id, entry) in &self.agents {
            if !entry.mode.receives_jobs() {
                continue;
            }
            if entry
                .command_tx
                .try_send(AgentCommand::UpdateBlock(job.clone()))
                .is_ok()
            {
                sent += 1;
            } else {
                failed.push(*id);
            }
        }
        for id in failed {
            if let Some(entry) = self.agents.remove(&id) {
                debug!("Dropping agent {} at {}, job channel unavailable", id, entry.addr);
            }
        }
        sent
    }

    fn client_counts(&self) -> ClientCounts {
        let mut counts = ClientCounts::default();
        for entry in self.agents.values() {
            match entry.mode {
                AgentMode::Unregistered => counts.unregistered += 1,
                AgentMode::Smart => counts.smart += 1,
                AgentMode::Nano => counts.nano += 1,
                AgentMode::Dumb => counts.dumb += 1,
                AgentMode::Removed => {}
            }
        }
        counts
    }
}

/// Spawn a new connections actor and return a handle to it
pub fn start_connections_handler() -> ConnectionsHandle {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ConnectionCommand>(256);
    let handle = ConnectionsHandle { cmd_tx };

    let mut connections = Connections::default();

    tokio::spawn(async move {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                ConnectionCommand::Add {
                    id,
                    addr,
                    command_tx,
                } => connections.add(id, addr, command_tx),
                ConnectionCommand::SetMode { id, mode } => connections.set_mode(id, mode),
                ConnectionCommand::Remove { id } => {
                    connections.remove(id);
                }
                ConnectionCommand::BroadcastJob { job } => {
                    let sent = connections.broadcast_job(job);
                    debug!("Pushed new block to {sent} agents");
                }
                ConnectionCommand::GetClientCounts { response } => {
                    let _ = response.send(connections.client_counts());
                }
            }
        }
    });
    handle
}
