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


//! Store writer for serialized database writes.
//!
//! This module provides a dedicated task for processing all Store write
//! operations sequentially. Reads are direct via Arc<Store>, while writes
//! go through a channel to ensure serialization.

mod handle;

pub use handle::StoreHandle;

use crate::chain::{Address, Hash};
use crate::store::{NewShare, Store};
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Channel buffer size for write commands
pub const WRITE_CHANNEL_SIZE: usize = 100;

/// Error type for store operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database error
    Database(String),
    /// Channel closed
    ChannelClosed,
    /// Item not found
    NotFound(String),
    /// Share already stored for this user
    DuplicateShare,
    /// Value could not be encoded or decoded
    Codec(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Database(msg) => write!(f, "Database error: {msg}"),
            StoreError::ChannelClosed => write!(f, "Channel closed"),
            StoreError::NotFound(msg) => write!(f, "Not found: {msg}"),
            StoreError::DuplicateShare => write!(f, "Duplicate share"),
            StoreError::Codec(msg) => write!(f, "Codec error: {msg}"),
        }
    }
}

impl Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

type Reply<T> = oneshot::Sender<Result<T, StoreError>>;

/// Commands for write operations on the Store.
#[derive(Debug)]
pub enum WriteCommand {
    GetOrCreateUser {
        address: Address,
        reply: Reply<u64>,
    },
    GetOrCreateBlock {
        hash: Hash,
        height: u32,
        timestamp: u64,
        reply: Reply<u64>,
    },
    SetBlockMainChain {
        hash: Hash,
        height: u32,
        timestamp: u64,
        main_chain: bool,
        reply: Reply<u64>,
    },
    AddShares {
        shares: Vec<NewShare>,
        reply: Reply<Vec<bool>>,
    },
    AddPayins {
        block_id: u64,
        payins: Vec<(u64, u64)>,
        datetime: u64,
        reply: Reply<usize>,
    },
    AddPayout {
        user_id: u64,
        amount: u64,
        datetime: u64,
        transaction_hash: Hash,
        reply: Reply<u64>,
    },
    RemovePayout {
        id: u64,
        reply: Reply<()>,
    },
    AddPayoutRequest {
        user_id: u64,
        datetime: u64,
        reply: Reply<()>,
    },
    RemovePayoutRequest {
        user_id: u64,
        reply: Reply<()>,
    },
    SetCustomPoolFee {
        user_id: u64,
        fee: Option<Decimal>,
        reply: Reply<()>,
    },
    PruneShares {
        below_height: u32,
        reply: Reply<usize>,
    },
}

/// Sender type for write commands
pub type WriteSender = mpsc::Sender<WriteCommand>;

/// Receiver type for write commands
pub type WriteReceiver = mpsc::Receiver<WriteCommand>;

/// Create a new write channel
pub fn write_channel() -> (WriteSender, WriteReceiver) {
    mpsc::channel(WRITE_CHANNEL_SIZE)
}

/// Store writer that processes write commands sequentially.
///
/// Id counters are read and bumped inside single commands, so they rely on
/// this task being the only writer.
pub struct StoreWriter {
    store: Arc<Store>,
    command_rx: WriteReceiver,
}

impl StoreWriter {
    /// Create a new store writer
    pub fn new(store: Arc<Store>, command_rx: WriteReceiver) -> Self {
        Self { store, command_rx }
    }

    /// Run the writer event loop until the channel is closed
    pub async fn run(mut self) {
        info!("Store writer started");

        while let Some(cmd) = self.command_rx.recv().await {
            self.handle_command(cmd);
        }

        info!("Store writer stopped - channel closed");
    }

    /// Handle a single write command
    fn handle_command(&self, cmd: WriteCommand) {
        match cmd {
            WriteCommand::GetOrCreateUser { address, reply } => {
                let _ = reply.send(self.store.get_or_create_user(&address));
            }
            WriteCommand::GetOrCreateBlock {
                hash,
                height,
                timestamp,
                reply,
            } => {
                let _ = reply.send(self.store.get_or_create_block(&hash, height, timestamp));
            }
            WriteCommand::SetBlockMainChain {
                hash,
                height,
                timestamp,
                main_chain,
                reply,
            } => {
                debug!("Setting block {hash} main_chain={main_chain}");
                let _ = reply.send(
                    self.store
                        .set_block_main_chain(&hash, height, timestamp, main_chain),
                );
            }
            WriteCommand::AddShares { shares, reply } => {
                debug!("Writing {} shares", shares.len());
                let _ = reply.send(self.store.add_shares(&shares));
            }
            WriteCommand::AddPayins {
                block_id,
                payins,
                datetime,
                reply,
            } => {
                debug!("Writing {} payins for block {block_id}", payins.len());
                let _ = reply.send(self.store.add_payins(block_id, &payins, datetime));
            }
            WriteCommand::AddPayout {
                user_id,
                amount,
                datetime,
                transaction_hash,
                reply,
            } => {
                let _ = reply.send(
                    self.store
                        .add_payout(user_id, amount, datetime, transaction_hash),
                );
            }
            WriteCommand::RemovePayout { id, reply } => {
                let _ = reply.send(self.store.remove_payout(id));
            }
            WriteCommand::AddPayoutRequest {
                user_id,
                datetime,
                reply,
            } => {
                let _ = reply.send(self.store.add_payout_request(user_id, datetime));
            }
            WriteCommand::RemovePayoutRequest { user_id, reply } => {
                let _ = reply.send(self.store.remove_payout_request(user_id));
            }
            WriteCommand::SetCustomPoolFee {
                user_id,
                fee,
                reply,
            } => {
                let _ = reply.send(self.store.set_custom_pool_fee(user_id, fee));
            }
            WriteCommand::PruneShares {
                below_height,
                reply,
            } => {
                let _ = reply.send(self.store.prune_shares(below_height));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::Database("test error".to_string());
        assert_eq!(format!("{err}"), "Database error: test error");

        let err = StoreError::ChannelClosed;
        assert_eq!(format!("{err}"), "Channel closed");

        let err = StoreError::NotFound("block".to_string());
        assert_eq!(format!("{err}"), "Not found: block");

        assert_eq!(format!("{}", StoreError::DuplicateShare), "Duplicate share");
    }

    #[test]
    fn test_write_channel_creation() {
        let (tx, _rx) = write_channel();
        assert!(!tx.is_closed());
    }
}
