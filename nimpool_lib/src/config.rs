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


use crate::chain::Address;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Name written at the front of every miner's extra data
    #[serde(default = "default_pool_name")]
    pub name: String,
    /// Wallet address blocks are mined to and payouts are sent from
    pub address: Address,
    /// Fraction of each block reward kept by the pool
    #[serde(default = "default_pool_fee")]
    pub pool_fee: Decimal,
    /// Fee per byte paid on payout transactions
    #[serde(default = "default_network_fee")]
    pub network_fee: u64,
    /// Blocks a payin has to wait before it counts as confirmed
    #[serde(default = "default_payout_confirmations")]
    pub payout_confirmations: u32,
    /// Confirmed balances above this are paid automatically
    #[serde(default = "default_auto_payout_limit")]
    pub auto_payout_limit: u64,
    /// Number of most recent shares rewarded for a mined block
    #[serde(default = "default_pplns_shares")]
    pub pplns_shares: usize,
    /// Shares are kept at least this many blocks behind the head
    #[serde(default = "default_share_retention_blocks")]
    pub share_retention_blocks: u32,
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,
    /// Addresses refused at registration
    #[serde(default)]
    pub banned_addresses: Vec<Address>,
}

fn default_pool_name() -> String {
    "NimPool".to_string()
}

fn default_pool_fee() -> Decimal {
    dec!(0.01)
}

fn default_network_fee() -> u64 {
    1
}

fn default_payout_confirmations() -> u32 {
    10
}

fn default_auto_payout_limit() -> u64 {
    5_000_000
}

fn default_pplns_shares() -> usize {
    1000
}

fn default_share_retention_blocks() -> u32 {
    1440
}

fn default_prune_interval_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub port: u16,
    #[serde(default = "default_difficulty")]
    pub start_difficulty: Decimal,
    #[serde(default = "default_difficulty")]
    pub min_difficulty: Decimal,
    /// Upper clamp for vardiff, unbounded when unset
    pub max_difficulty: Option<Decimal>,
    /// Shares per second each miner should aim for
    #[serde(default = "default_desired_sps")]
    pub desired_sps: Decimal,
    #[serde(default = "default_sps_time_unit_secs")]
    pub sps_time_unit_secs: u64,
    /// Connections without any inbound frame for this long are closed
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    /// Invalid messages tolerated between settings before a ban
    #[serde(default = "default_allowed_errors")]
    pub allowed_errors: u32,
    #[serde(default = "default_send_balance_interval_secs")]
    pub send_balance_interval_secs: u64,
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,
    /// Take the client IP from X-Forwarded-For when behind a proxy
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

fn default_difficulty() -> Decimal {
    Decimal::ONE
}

fn default_desired_sps() -> Decimal {
    dec!(0.2)
}

fn default_sps_time_unit_secs() -> u64 {
    60
}

fn default_connection_timeout_secs() -> u64 {
    600
}

fn default_allowed_errors() -> u32 {
    3
}

fn default_send_balance_interval_secs() -> u64 {
    300
}

fn default_keep_alive_interval_secs() -> u64 {
    10
}

impl ServerConfig {
    pub fn sps_time_unit(&self) -> Duration {
        Duration::from_secs(self.sps_time_unit_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn send_balance_interval(&self) -> Duration {
        Duration::from_secs(self.send_balance_interval_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: u32,
    #[serde(default = "default_max_connections_per_ip_per_window")]
    pub max_connections_per_ip_per_window: u32,
    #[serde(default = "default_connection_rate_window_secs")]
    pub connection_rate_window_secs: u64,
    #[serde(default = "default_ban_time_secs")]
    pub ban_time_secs: u64,
    #[serde(default = "default_unban_interval_secs")]
    pub unban_interval_secs: u64,
}

fn default_max_connections_per_ip() -> u32 {
    50
}

fn default_max_connections_per_ip_per_window() -> u32 {
    100
}

fn default_connection_rate_window_secs() -> u64 {
    60
}

fn default_ban_time_secs() -> u64 {
    600
}

fn default_unban_interval_secs() -> u64 {
    60
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        AdmissionConfig {
            max_connections_per_ip: default_max_connections_per_ip(),
            max_connections_per_ip_per_window: default_max_connections_per_ip_per_window(),
            connection_rate_window_secs: default_connection_rate_window_secs(),
            ban_time_secs: default_ban_time_secs(),
            unban_interval_secs: default_unban_interval_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: String,
}

/// Connection to the node's JSON-RPC interface
#[derive(Deserialize, Clone)]
pub struct NodeConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// How often the head is polled for changes
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

/// Custom Debug to redact passwords
impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("NodeConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PayoutConfig {
    /// Time to wait for relays after sending payouts
    #[serde(default = "default_relay_grace_secs")]
    pub relay_grace_secs: u64,
    /// Wait after the last relayed payout before quitting
    #[serde(default = "default_relay_quiet_secs")]
    pub relay_quiet_secs: u64,
}

fn default_relay_grace_secs() -> u64 {
    30
}

fn default_relay_quiet_secs() -> u64 {
    10
}

impl Default for PayoutConfig {
    fn default() -> Self {
        PayoutConfig {
            relay_grace_secs: default_relay_grace_secs(),
            relay_quiet_secs: default_relay_quiet_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct LoggingConfig {
    /// Log to file if specified
    pub file: Option<String>,
    /// Log level (defaults to "info")
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log to stdout, on unless disabled
    pub console: Option<bool>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub pool: PoolConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    pub store: StoreConfig,
    pub node: NodeConfig,
    #[serde(default)]
    pub payout: PayoutConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("NIMPOOL").separator("_"))
            .build()?
            .try_deserialize()
    }

    pub fn with_pool_address(mut self, address: Address) -> Self {
        self.pool.address = address;
        self
    }

    pub fn with_pool_fee(mut self, pool_fee: Decimal) -> Self {
        self.pool.pool_fee = pool_fee;
        self
    }

    pub fn with_network_fee(mut self, network_fee: u64) -> Self {
        self.pool.network_fee = network_fee;
        self
    }

    pub fn with_payout_confirmations(mut self, payout_confirmations: u32) -> Self {
        self.pool.payout_confirmations = payout_confirmations;
        self
    }

    pub fn with_auto_payout_limit(mut self, auto_payout_limit: u64) -> Self {
        self.pool.auto_payout_limit = auto_payout_limit;
        self
    }

    pub fn with_pplns_shares(mut self, pplns_shares: usize) -> Self {
        self.pool.pplns_shares = pplns_shares;
        self
    }

    pub fn with_banned_addresses(mut self, banned_addresses: Vec<Address>) -> Self {
        self.pool.banned_addresses = banned_addresses;
        self
    }

    pub fn with_server_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    pub fn with_start_difficulty(mut self, start_difficulty: Decimal) -> Self {
        self.server.start_difficulty = start_difficulty;
        self
    }

    pub fn with_min_difficulty(mut self, min_difficulty: Decimal) -> Self {
        self.server.min_difficulty = min_difficulty;
        self
    }

    pub fn with_max_difficulty(mut self, max_difficulty: Option<Decimal>) -> Self {
        self.server.max_difficulty = max_difficulty;
        self
    }

    pub fn with_allowed_errors(mut self, allowed_errors: u32) -> Self {
        self.server.allowed_errors = allowed_errors;
        self
    }

    pub fn with_max_connections_per_ip(mut self, max_connections_per_ip: u32) -> Self {
        self.admission.max_connections_per_ip = max_connections_per_ip;
        self
    }

    pub fn with_store_path(mut self, path: String) -> Self {
        self.store.path = path;
        self
    }

    pub fn with_node_url(mut self, url: String) -> Self {
        self.node.url = url;
        self
    }

    pub fn with_relay_waits(mut self, grace_secs: u64, quiet_secs: u64) -> Self {
        self.payout.relay_grace_secs = grace_secs;
        self.payout.relay_quiet_secs = quiet_secs;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use temp_env::with_var;

    #[test]
    fn test_config_defaults_from_file() {
        let config = Config::load("../config.toml").unwrap();
        assert_eq!(config.pool.pool_fee, dec!(0.01));
        assert_eq!(config.pool.payout_confirmations, 10);
        assert_eq!(config.pool.auto_payout_limit, 5_000_000);
        assert_eq!(config.pool.pplns_shares, 1000);
        assert_eq!(config.server.desired_sps, dec!(0.2));
        assert_eq!(config.server.sps_time_unit(), Duration::from_secs(60));
        assert_eq!(config.server.connection_timeout(), Duration::from_secs(600));
        assert_eq!(config.server.allowed_errors, 3);
        assert_eq!(config.server.max_difficulty, None);
        assert_eq!(config.admission.ban_time_secs, 600);
        assert_eq!(config.payout.relay_grace_secs, 30);
        assert!(config.pool.banned_addresses.is_empty());
    }

    #[test]
    fn test_config_builder() {
        let address: Address = "0101010101010101010101010101010101010101".parse().unwrap();
        let config = Config::load("../config.toml")
            .unwrap()
            .with_pool_address(address)
            .with_pool_fee(dec!(0.02))
            .with_network_fee(2)
            .with_payout_confirmations(3)
            .with_auto_payout_limit(10)
            .with_pplns_shares(5)
            .with_banned_addresses(vec![address])
            .with_server_port(9000)
            .with_start_difficulty(dec!(2))
            .with_min_difficulty(dec!(0.5))
            .with_max_difficulty(Some(dec!(100)))
            .with_allowed_errors(1)
            .with_max_connections_per_ip(2)
            .with_store_path("/tmp/store".to_string())
            .with_node_url("http://localhost:1".to_string())
            .with_relay_waits(1, 1);

        assert_eq!(config.pool.address, address);
        assert_eq!(config.pool.pool_fee, dec!(0.02));
        assert_eq!(config.pool.network_fee, 2);
        assert_eq!(config.pool.payout_confirmations, 3);
        assert_eq!(config.pool.auto_payout_limit, 10);
        assert_eq!(config.pool.pplns_shares, 5);
        assert_eq!(config.pool.banned_addresses, vec![address]);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.start_difficulty, dec!(2));
        assert_eq!(config.server.min_difficulty, dec!(0.5));
        assert_eq!(config.server.max_difficulty, Some(dec!(100)));
        assert_eq!(config.server.allowed_errors, 1);
        assert_eq!(config.admission.max_connections_per_ip, 2);
        assert_eq!(config.store.path, "/tmp/store");
        assert_eq!(config.node.url, "http://localhost:1");
        assert_eq!(config.payout.relay_quiet_secs, 1);
    }

    #[test]
    fn test_node_config_debug_redacts_password() {
        let node = NodeConfig {
            url: "http://127.0.0.1:8648".to_string(),
            username: "pool".to_string(),
            password: "hunter2".to_string(),
            poll_interval_ms: 1000,
        };
        let printed = format!("{node:?}");
        assert!(printed.contains("[redacted]"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_config_from_env_vars() {
        with_var("NIMPOOL_NODE_URL", Some("http://node-from-env:8648"), || {
            let config = Config::load("../config.toml").unwrap();
            assert_eq!(config.node.url, "http://node-from-env:8648");
        });
    }
}
