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

//! Narrow interface to the blockchain node.
//!
//! The pool never runs consensus. Everything it needs from the chain, from
//! the current head to signing payout transactions with the pool wallet,
//! goes through [`BlockchainPort`].

use super::codec::DecodeError;
use super::{Address, Block, BlockHeader, Hash, Transaction};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use num_bigint::BigUint;
use std::fmt;

/// Outcome of handing a block to the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Extended,
    Rebranched,
    Forked,
    Known,
    Orphan,
    Invalid,
}

impl PushResult {
    pub fn is_invalid(&self) -> bool {
        matches!(self, PushResult::Invalid)
    }
}

/// Notifications from the node, delivered in order on one channel.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Established,
    HeadChanged(Block),
    BlockReverted(Block),
    TransactionRelayed(Transaction),
}

#[derive(Debug)]
pub enum ChainError {
    Rpc(String),
    NotFound(String),
    Decode(DecodeError),
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Rpc(e) => write!(f, "Node RPC error: {e}"),
            ChainError::NotFound(what) => write!(f, "Not found on chain: {what}"),
            ChainError::Decode(e) => write!(f, "Failed to decode node data: {e}"),
        }
    }
}

impl std::error::Error for ChainError {}

impl From<DecodeError> for ChainError {
    fn from(e: DecodeError) -> Self {
        ChainError::Decode(e)
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait BlockchainPort: Send + Sync {
    async fn genesis_hash(&self) -> Result<Hash, ChainError>;

    /// Light head block.
    async fn head(&self) -> Result<Block, ChainError>;

    async fn head_height(&self) -> Result<u32, ChainError>;

    /// Adjusted network time in milliseconds.
    async fn network_time_ms(&self) -> Result<u64, ChainError>;

    async fn is_established(&self) -> Result<bool, ChainError>;

    async fn get_block(&self, hash: &Hash, include_body: bool)
    -> Result<Option<Block>, ChainError>;

    /// Network target for a block built on `prev_hash`.
    async fn get_next_target(&self, prev_hash: &Hash) -> Result<BigUint, ChainError>;

    /// Proof-of-work hash of a header.
    async fn pow(&self, header: &BlockHeader) -> Result<Hash, ChainError>;

    async fn push_block(&self, block: &Block) -> Result<PushResult, ChainError>;

    async fn get_successor_blocks(&self, hash: &Hash) -> Result<Vec<Block>, ChainError>;

    async fn block_reward_at(&self, height: u32) -> Result<u64, ChainError>;

    /// Full template paying to the pool wallet, built on the current head.
    async fn get_next_block(&self) -> Result<Block, ChainError>;

    /// Transaction from the pool wallet, signed by the node.
    async fn create_transaction(
        &self,
        recipient: &Address,
        value: u64,
        fee: u64,
        validity_start_height: u32,
    ) -> Result<Transaction, ChainError>;

    async fn push_transaction(&self, transaction: &Transaction) -> Result<(), ChainError>;

    async fn get_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<Transaction>, ChainError>;

    async fn balance(&self, address: &Address) -> Result<u64, ChainError>;
}
