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

//! Connection admission: temporary IP bans and per-IP connection limits.
//!
//! All state sits behind one lock so a decision and the bookkeeping it
//! implies happen together.

pub mod ban_list;
pub mod rate_limiter;

use crate::config::AdmissionConfig;
use ban_list::{BanList, IpKey, is_exempt};
use rate_limiter::{ConnectionLimiter, LimitExceeded};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Outcome of an incoming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Accepted and counted, call [`ConnectionAdmission::release`] on teardown
    Accepted,
    Banned,
    TooManyConnections,
}

struct AdmissionState {
    bans: BanList,
    limiter: ConnectionLimiter,
}

pub struct ConnectionAdmission {
    state: Mutex<AdmissionState>,
    ban_time: Duration,
    unban_interval: Duration,
}

impl ConnectionAdmission {
    pub fn new(config: &AdmissionConfig) -> Self {
        Self {
            state: Mutex::new(AdmissionState {
                bans: BanList::default(),
                limiter: ConnectionLimiter::new(
                    config.max_connections_per_ip,
                    config.max_connections_per_ip_per_window,
                    Duration::from_secs(config.connection_rate_window_secs),
                ),
            }),
            ban_time: Duration::from_secs(config.ban_time_secs),
            unban_interval: Duration::from_secs(config.unban_interval_secs),
        }
    }

    /// Decide whether `ip` may open a connection. Exempt addresses skip the
    /// per-IP limits.
    pub async fn admit(&self, ip: IpAddr) -> Admission {
        let mut state = self.state.lock().await;
        if state.bans.is_banned(ip) {
            info!("Banned IP tried to connect {ip}");
            return Admission::Banned;
        }
        if is_exempt(ip) {
            return Admission::Accepted;
        }
        match state.limiter.try_acquire(IpKey::from(ip), Instant::now()) {
            Ok(()) => Admission::Accepted,
            Err(LimitExceeded::Concurrent) => {
                info!("Too many open connections from {ip}");
                Admission::TooManyConnections
            }
            Err(LimitExceeded::Rate) => {
                info!("Too many new connections from {ip}");
                Admission::TooManyConnections
            }
        }
    }

    /// Give back the slot taken by an accepted connection.
    pub async fn release(&self, ip: IpAddr) {
        if is_exempt(ip) {
            return;
        }
        self.state.lock().await.limiter.release(IpKey::from(ip));
    }

    pub async fn ban(&self, ip: IpAddr) {
        let mut state = self.state.lock().await;
        if state.bans.ban(ip, self.ban_time, Instant::now()) {
            info!("Banning IP {ip}");
        }
    }

    pub async fn is_banned(&self, ip: IpAddr) -> bool {
        self.state.lock().await.bans.is_banned(ip)
    }

    pub async fn num_ips_banned(&self) -> usize {
        self.state.lock().await.bans.len()
    }

    /// Lift expired bans and forget idle addresses.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let lifted = state.bans.sweep(now);
        state.limiter.sweep(now);
        if lifted > 0 {
            debug!("Lifted {lifted} expired IP bans");
        }
    }
}

/// Run [`ConnectionAdmission::sweep`] every unban interval until shutdown.
pub fn start_unban_task(
    admission: Arc<ConnectionAdmission>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = admission.unban_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = interval.tick() => admission.sweep().await,
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
