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

//! Per connection protocol state machine.
//!
//! An [`Agent`] is created for every accepted websocket. It starts
//! unregistered, becomes a smart, nano or dumb miner on `register` and ends
//! in [`AgentMode::Removed`]. All of its inputs (frames, timers, commands
//! from the server) are handled one at a time in [`Agent::run`].

mod share;

use crate::chain::codec::{decode_base64, encode_base64};
use crate::chain::signature::{SignatureProof, payout_message};
use crate::chain::target::{difficulty_to_target, target_to_compact};
use crate::chain::{Address, Block, BlockchainPort, Decode, Encode, Hash};
use crate::config::Config;
use crate::pool::admission::ConnectionAdmission;
use crate::pool::connections::{ConnectionId, ConnectionsHandle};
use crate::pool::difficulty_adjuster::DifficultyAdjuster;
use crate::pool::error::{AgentError, ShareRejection};
use crate::pool::extra_data::{ExtraDataWindow, build_extra_data};
use crate::pool::job::{Job, JobReceiver, PersonalJob};
use crate::pool::messages::{ClientMessage, ServerMessage};
use crate::pool::share_writer::ShareWriter;
use crate::pool::stats::PoolStatsHandle;
use crate::pool::timers::{TimerFired, TimerKind, Timers};
use crate::store::StoreHandle;
use crate::utils::time_provider::TimeProvider;
use futures::{Stream, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

/// Messages queued for the socket before the connection is considered dead.
pub const OUTBOUND_BUFFER_SIZE: usize = 64;

const COMMAND_BUFFER_SIZE: usize = 8;
const TIMER_BUFFER_SIZE: usize = 8;

/// Payout nonces stay below 2^53 so JSON clients read them exactly.
const MAX_PAYOUT_NONCE: u64 = 1 << 53;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Unregistered,
    Smart,
    Nano,
    Dumb,
    Removed,
}

impl AgentMode {
    /// Parse the `mode` of a register message.
    pub fn from_wire(mode: &str) -> Option<Self> {
        match mode {
            "smart" => Some(AgentMode::Smart),
            "nano" => Some(AgentMode::Nano),
            "dumb" => Some(AgentMode::Dumb),
            _ => None,
        }
    }

    /// Nano and dumb miners work on templates the pool pushes to them.
    pub fn receives_jobs(&self) -> bool {
        matches!(self, AgentMode::Nano | AgentMode::Dumb)
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self {
            AgentMode::Unregistered => "unregistered",
            AgentMode::Smart => "smart",
            AgentMode::Nano => "nano",
            AgentMode::Dumb => "dumb",
            AgentMode::Removed => "removed",
        };
        write!(f, "{mode}")
    }
}

/// Commands the server sends to a running agent.
#[derive(Debug, Clone)]
pub enum AgentCommand {
    UpdateBlock(Arc<Job>),
}

/// What the agent wants written to its socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
}

/// Inbound websocket frames, stripped of transport detail.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Ping,
    Pong,
    Close,
}

/// Pool wide settings every agent follows.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub pool_name: String,
    pub pool_address: Address,
    pub genesis_hash: Hash,
    pub banned_addresses: HashSet<Address>,
    pub start_difficulty: Decimal,
    pub min_difficulty: Decimal,
    pub max_difficulty: Option<Decimal>,
    pub desired_sps: Decimal,
    pub sps_time_unit: Duration,
    pub connection_timeout: Duration,
    pub allowed_errors: u32,
    pub send_balance_interval: Duration,
    pub keep_alive_interval: Duration,
    pub payout_confirmations: u32,
}

impl AgentSettings {
    pub fn from_config(config: &Config, genesis_hash: Hash) -> Self {
        Self {
            pool_name: config.pool.name.clone(),
            pool_address: config.pool.address,
            genesis_hash,
            banned_addresses: config.pool.banned_addresses.iter().copied().collect(),
            start_difficulty: config.server.start_difficulty,
            min_difficulty: config.server.min_difficulty,
            max_difficulty: config.server.max_difficulty,
            desired_sps: config.server.desired_sps,
            sps_time_unit: config.server.sps_time_unit(),
            connection_timeout: config.server.connection_timeout(),
            allowed_errors: config.server.allowed_errors,
            send_balance_interval: config.server.send_balance_interval(),
            keep_alive_interval: config.server.keep_alive_interval(),
            payout_confirmations: config.pool.payout_confirmations,
        }
    }
}

/// Everything an agent shares with the rest of the server.
#[derive(Clone)]
pub struct PoolContext {
    pub settings: Arc<AgentSettings>,
    pub chain: Arc<dyn BlockchainPort>,
    pub store: StoreHandle,
    pub share_writer: Arc<ShareWriter>,
    pub connections: ConnectionsHandle,
    pub admission: Arc<ConnectionAdmission>,
    pub stats: PoolStatsHandle,
    pub jobs: JobReceiver,
    pub time_provider: Arc<dyn TimeProvider>,
}

/// Receiving ends owned by the connection task.
pub struct AgentChannels {
    pub outbound_rx: mpsc::Receiver<Outbound>,
    pub timer_rx: mpsc::Receiver<TimerFired>,
    pub command_rx: mpsc::Receiver<AgentCommand>,
}

/// The template a nano or dumb agent was last sent.
#[derive(Clone)]
struct CurrentWork {
    prev_block: Block,
    job: PersonalJob,
}

pub struct Agent {
    id: ConnectionId,
    addr: SocketAddr,
    ip: IpAddr,
    ctx: PoolContext,
    mode: AgentMode,
    address: Option<Address>,
    device_id: u32,
    user_id: Option<u64>,
    difficulty: DifficultyAdjuster,
    extra_data: ExtraDataWindow,
    session_nonce: u32,
    /// Anti-replay nonce a payout proof must sign
    nonce: u64,
    errors_since_reset: u32,
    work: Option<CurrentWork>,
    timers: Timers,
    outbound_tx: mpsc::Sender<Outbound>,
    command_tx: mpsc::Sender<AgentCommand>,
}

impl Agent {
    /// Build an agent for a freshly admitted connection and arm its idle
    /// timeout.
    pub fn new(id: ConnectionId, addr: SocketAddr, ctx: PoolContext) -> (Self, AgentChannels) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_BUFFER_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);

        let settings = ctx.settings.clone();
        let difficulty = DifficultyAdjuster::new(
            settings.start_difficulty,
            settings.min_difficulty,
            settings.max_difficulty,
            settings.desired_sps,
            ctx.time_provider.clone(),
        );
        let mut timers = Timers::new(timer_tx);
        timers.reset_timeout(TimerKind::ConnectionTimeout, settings.connection_timeout);

        let agent = Self {
            id,
            addr,
            ip: addr.ip(),
            ctx,
            mode: AgentMode::Unregistered,
            address: None,
            device_id: 0,
            user_id: None,
            difficulty,
            extra_data: ExtraDataWindow::default(),
            session_nonce: rand::random(),
            nonce: 0,
            errors_since_reset: 0,
            work: None,
            timers,
            outbound_tx,
            command_tx,
        };
        let channels = AgentChannels {
            outbound_rx,
            timer_rx,
            command_rx,
        };
        (agent, channels)
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    pub fn difficulty(&self) -> Decimal {
        self.difficulty.current_difficulty()
    }

    /// Run the session to completion and tear it down.
    ///
    /// The agent registers itself with the live set, processes frames,
    /// timers and server commands in order until the peer goes away, an error
    /// ends the session or shutdown is signalled, then releases everything
    /// it holds. Returns the error that ended the session, if any.
    pub async fn run<S>(
        mut self,
        inbound: S,
        mut timer_rx: mpsc::Receiver<TimerFired>,
        mut command_rx: mpsc::Receiver<AgentCommand>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Option<AgentError>
    where
        S: Stream<Item = Frame> + Unpin,
    {
        self.ctx
            .connections
            .add(self.id, self.addr, self.command_tx.clone())
            .await;
        let result = self
            .event_loop(inbound, &mut timer_rx, &mut command_rx, shutdown_rx)
            .await;
        let error = result.err();
        self.shutdown(error.as_ref().is_some_and(AgentError::is_ban))
            .await;
        if let Some(e) = &error {
            info!("Closing connection from {}: {e}", self.ip);
        }
        error
    }

    async fn event_loop<S>(
        &mut self,
        mut inbound: S,
        timer_rx: &mut mpsc::Receiver<TimerFired>,
        command_rx: &mut mpsc::Receiver<AgentCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<(), AgentError>
    where
        S: Stream<Item = Frame> + Unpin,
    {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("Shutdown signal received, closing connection from {}", self.ip);
                        return Ok(());
                    }
                }
                frame = inbound.next() => match frame {
                    Some(Frame::Text(text)) => {
                        self.touch();
                        self.handle_text(&text).await?;
                    }
                    Some(Frame::Ping) | Some(Frame::Pong) => self.touch(),
                    Some(Frame::Close) | None => return Ok(()),
                },
                Some(fired) = timer_rx.recv() => {
                    if let Some(kind) = self.timers.accept(fired) {
                        self.handle_timer(kind).await?;
                    }
                }
                command = command_rx.recv() => match command {
                    Some(AgentCommand::UpdateBlock(job)) => self.update_block(&job)?,
                    None => return Err(AgentError::Terminate("removed from live set".to_string())),
                },
            }
        }
    }

    /// Idempotent. Bans the peer if asked, stops all timers and leaves the
    /// live set. Dropping the agent closes its outbound channel, which ends
    /// the socket writer.
    async fn shutdown(&mut self, ban: bool) {
        if self.mode == AgentMode::Removed {
            return;
        }
        if ban {
            self.ctx.admission.ban(self.ip).await;
        }
        self.timers.clear_all();
        self.mode = AgentMode::Removed;
        self.ctx.connections.remove(self.id).await;
        self.ctx.admission.release(self.ip).await;
    }

    /// Any inbound frame proves the peer is alive.
    fn touch(&mut self) {
        self.timers.reset_timeout(
            TimerKind::ConnectionTimeout,
            self.ctx.settings.connection_timeout,
        );
    }

    pub(crate) async fn handle_text(&mut self, text: &str) -> Result<(), AgentError> {
        trace!("IN {}: {text}", self.ip);
        let message = ClientMessage::from_json(text)
            .map_err(|e| AgentError::Protocol(format!("malformed message: {e}")))?;

        let message = match (self.mode, message) {
            (_, register @ ClientMessage::Register { .. }) => register,
            (AgentMode::Unregistered, _) => {
                self.send_error("registration required")?;
                return Err(AgentError::Protocol(
                    "message before registration".to_string(),
                ));
            }
            (_, message) => message,
        };

        match message {
            ClientMessage::Register {
                address,
                device_id,
                mode,
                genesis_hash,
            } => self.on_register(&address, device_id, &mode, &genesis_hash).await,
            ClientMessage::Share {
                block_header,
                miner_addr_proof,
                extra_data_proof,
                block,
                nonce,
            } => {
                match self.mode {
                    AgentMode::Smart => {
                        self.on_smart_share(block_header, miner_addr_proof, extra_data_proof, block)
                            .await?
                    }
                    AgentMode::Nano => self.on_nano_share(block).await?,
                    AgentMode::Dumb => self.on_dumb_share(nonce).await?,
                    AgentMode::Unregistered | AgentMode::Removed => return Ok(()),
                }
                self.after_share()
            }
            ClientMessage::Payout { proof } => self.on_payout(proof).await,
            ClientMessage::BalanceRequest => self.send_balance().await,
        }
    }

    pub(crate) async fn handle_timer(&mut self, kind: TimerKind) -> Result<(), AgentError> {
        match kind {
            TimerKind::RecalcDifficulty => self.recalc_difficulty(),
            TimerKind::ConnectionTimeout => Err(AgentError::Terminate(
                "connection timed out".to_string(),
            )),
            TimerKind::SendBalance => self.send_balance().await,
            TimerKind::KeepAlive => self.push(Outbound::Ping),
        }
    }

    async fn on_register(
        &mut self,
        address: &str,
        device_id: u32,
        mode: &str,
        genesis_hash: &str,
    ) -> Result<(), AgentError> {
        if self.mode != AgentMode::Unregistered {
            return self.send_error("already registered");
        }

        let address = Address::from_slice(&decode_base64(address)?)?;
        if self.ctx.settings.banned_addresses.contains(&address) {
            self.send_error("Banned")?;
            return Err(AgentError::Terminate(format!("banned address {address}")));
        }
        let mode = AgentMode::from_wire(mode)
            .ok_or_else(|| AgentError::Protocol(format!("unknown mode {mode}")))?;
        let genesis_hash = Hash::from_slice(&decode_base64(genesis_hash)?)?;
        if genesis_hash != self.ctx.settings.genesis_hash {
            self.send_error("different genesis block")?;
            return Err(AgentError::Protocol(format!(
                "different genesis block {genesis_hash}"
            )));
        }

        self.difficulty.reset();
        self.timers.reset_timeout(
            TimerKind::RecalcDifficulty,
            self.ctx.settings.sps_time_unit,
        );

        self.address = Some(address);
        self.device_id = device_id;
        self.user_id = Some(self.ctx.store.get_or_create_user(address).await?);
        self.regenerate_nonce();
        self.regenerate_settings(self.difficulty.current_difficulty());

        self.mode = mode;
        self.push(Outbound::Message(ServerMessage::Registered))?;
        self.send_settings()?;
        self.ctx.connections.set_mode(self.id, mode).await;

        if mode.receives_jobs() {
            let job = self.ctx.jobs.borrow().clone();
            if let Some(job) = job {
                self.update_block(&job)?;
            }
        }
        self.send_balance().await?;

        let settings = self.ctx.settings.clone();
        self.timers
            .reset_interval(TimerKind::SendBalance, settings.send_balance_interval);
        self.timers
            .reset_interval(TimerKind::KeepAlive, settings.keep_alive_interval);

        info!("REGISTER {address} / {device_id} ({mode}) from {}", self.ip);
        Ok(())
    }

    async fn on_payout(&mut self, proof: Option<String>) -> Result<(), AgentError> {
        let (Some(address), Some(user_id)) = (self.address, self.user_id) else {
            return Ok(());
        };
        let valid = proof
            .and_then(|proof| SignatureProof::from_base64(&proof).ok())
            .is_some_and(|proof| proof.is_signed_by(&address, &payout_message(self.nonce)));
        if !valid {
            debug!("Invalid payout proof from {address}");
            self.send_error("invalid payout proof")?;
            return self.count_error();
        }

        self.ctx
            .store
            .add_payout_request(user_id, self.ctx.time_provider.millis_since_epoch())
            .await?;
        info!("Payout request from {address}");
        self.regenerate_nonce();
        self.send_settings()
    }

    /// Virtual and confirmed balance plus whether a payout is pending.
    pub(crate) async fn send_balance(&mut self) -> Result<(), AgentError> {
        let Some(user_id) = self.user_id else {
            return Ok(());
        };
        let head_height = self.ctx.chain.head_height().await?;
        let confirmed_height = head_height.saturating_sub(self.ctx.settings.payout_confirmations);
        let store = &self.ctx.store;
        let balance = store.get_user_balance(user_id, None)?;
        let confirmed_balance = store.get_user_balance(user_id, Some(confirmed_height))?;
        let payout_request_active = store.has_payout_request(user_id)?;
        self.push(Outbound::Message(ServerMessage::Balance {
            balance,
            confirmed_balance,
            payout_request_active,
        }))
    }

    /// Re-evaluate the share rate, announce a changed difficulty and restart
    /// the measurement period.
    fn recalc_difficulty(&mut self) -> Result<(), AgentError> {
        self.timers.clear(TimerKind::RecalcDifficulty);
        if let Some(difficulty) = self.difficulty.recalculate() {
            debug!(
                "Difficulty for {} now {difficulty}",
                self.address.map(|a| a.to_string()).unwrap_or_default()
            );
            self.regenerate_settings(difficulty);
            self.send_settings()?;
        }
        self.timers.reset_timeout(
            TimerKind::RecalcDifficulty,
            self.ctx.settings.sps_time_unit,
        );
        Ok(())
    }

    fn after_share(&mut self) -> Result<(), AgentError> {
        if self.difficulty.record_share() {
            self.recalc_difficulty()?;
        }
        self.timers.reset_timeout(
            TimerKind::ConnectionTimeout,
            self.ctx.settings.connection_timeout,
        );
        Ok(())
    }

    /// Send the job to a nano or dumb miner, rebuilt around this agent's
    /// extra data. Nothing is sent when the header would not change.
    pub(crate) fn update_block(&mut self, job: &Job) -> Result<(), AgentError> {
        let Some((extra_data, _)) = self.extra_data.current() else {
            return Ok(());
        };
        let Some(personal) = job.personalise(extra_data) else {
            return Ok(());
        };
        if self
            .work
            .as_ref()
            .is_some_and(|work| work.job.header == personal.header)
        {
            return Ok(());
        }

        let message = match self.mode {
            AgentMode::Nano => ServerMessage::NewBlock {
                body_hash: Some(encode_base64(personal.header.body_hash.as_bytes())),
                accounts_hash: Some(encode_base64(personal.header.accounts_hash.as_bytes())),
                previous_block: Some(job.prev_block.to_base64()),
                block_header: None,
            },
            AgentMode::Dumb => ServerMessage::NewBlock {
                body_hash: None,
                accounts_hash: None,
                previous_block: None,
                block_header: Some(personal.header.to_base64()),
            },
            _ => return Ok(()),
        };
        self.work = Some(CurrentWork {
            prev_block: job.prev_block.clone(),
            job: personal,
        });
        self.push(Outbound::Message(message))?;
        self.errors_since_reset = 0;
        Ok(())
    }

    fn regenerate_nonce(&mut self) {
        self.nonce = rand::thread_rng().gen_range(0..MAX_PAYOUT_NONCE);
    }

    /// Rotate in extra data for `difficulty`, keeping the current pair as the
    /// previous one.
    fn regenerate_settings(&mut self, difficulty: Decimal) {
        let Some(address) = self.address else {
            return;
        };
        let extra_data = build_extra_data(
            &self.ctx.settings.pool_name,
            &address,
            self.session_nonce,
            difficulty,
        );
        self.extra_data.rotate(extra_data, difficulty);
    }

    fn send_settings(&mut self) -> Result<(), AgentError> {
        let Some((extra_data, difficulty)) = self.extra_data.current() else {
            return Ok(());
        };
        let target = difficulty_to_target(difficulty);
        let message = ServerMessage::Settings {
            address: encode_base64(self.ctx.settings.pool_address.as_bytes()),
            extra_data: encode_base64(extra_data),
            target: target.to_string(),
            target_compact: target_to_compact(&target),
            nonce: self.nonce,
        };
        self.push(Outbound::Message(message))?;
        self.errors_since_reset = 0;
        Ok(())
    }

    /// Report a rejected share and charge it to the error budget.
    fn reject(&mut self, rejection: ShareRejection) -> Result<(), AgentError> {
        debug!(
            "INVALID share from {} / {} ({}): {rejection}",
            self.address.map(|a| a.to_string()).unwrap_or_default(),
            self.device_id,
            self.mode
        );
        self.send_error(&rejection.error_message())?;
        if rejection.counts_as_error() {
            self.count_error()?;
        }
        Ok(())
    }

    fn count_error(&mut self) -> Result<(), AgentError> {
        self.errors_since_reset += 1;
        if self.errors_since_reset > self.ctx.settings.allowed_errors {
            return Err(AgentError::Protocol("too many errors".to_string()));
        }
        Ok(())
    }

    fn send_error(&mut self, reason: &str) -> Result<(), AgentError> {
        self.push(Outbound::Message(ServerMessage::error(reason)))
    }

    /// Queue a frame for the socket writer. A full or closed queue means the
    /// peer is not keeping up, so the session ends.
    fn push(&self, outbound: Outbound) -> Result<(), AgentError> {
        self.outbound_tx
            .try_send(outbound)
            .map_err(|_| AgentError::Terminate("send failed".to_string()))
    }
}
