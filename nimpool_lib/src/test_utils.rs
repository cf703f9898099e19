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

//! Fixtures shared by unit tests and by the other workspace crates (behind
//! the `test-utils` feature).

use crate::chain::target::BLOCK_TARGET_MAX;
use crate::chain::target::target_to_compact;
use crate::chain::{
    Address, Block, BlockBody, BlockHeader, BlockInterlink, Hash, Transaction,
};
use crate::config::Config;
use crate::store::{Store, StoreHandle};
use std::sync::Arc;
use tempfile::{TempDir, tempdir};

pub const TEST_GENESIS_TIMESTAMP: u32 = 1_600_000_000;

/// Wallet address the test pool mines to.
pub fn pool_address() -> Address {
    Address([0xaa; 20])
}

/// Config from the repository's `config.toml` pointed at `store_path`.
pub fn test_config(store_path: &str) -> Config {
    Config::load("../config.toml")
        .expect("config.toml should load")
        .with_pool_address(pool_address())
        .with_store_path(store_path.to_string())
}

/// Store in a temporary directory with its writer task running. Keep the
/// `TempDir` alive for as long as the store is used.
pub fn setup_test_store() -> (TempDir, StoreHandle) {
    let temp_dir = tempdir().expect("temp dir");
    let path = temp_dir
        .path()
        .to_str()
        .expect("utf8 temp path")
        .to_string();
    let store = Arc::new(Store::new(path, false).expect("store opens"));
    (temp_dir, StoreHandle::spawn(store))
}

pub fn test_transaction(recipient: Address, value: u64, fee: u64) -> Transaction {
    Transaction {
        sender: pool_address(),
        recipient,
        value,
        fee,
        validity_start_height: 1,
        network_id: 42,
        proof: vec![1u8; 8],
    }
}

/// Full block at `height` with a deterministic parent, mined by `miner`.
pub fn test_block_mined_by(height: u32, miner: Address) -> Block {
    let body = BlockBody {
        miner_addr: miner,
        extra_data: vec![],
        transactions: vec![],
        pruned_accounts: vec![],
    };
    let interlink = BlockInterlink {
        hashes: vec![Hash([height.wrapping_sub(1) as u8; 32])],
    };
    Block {
        header: BlockHeader {
            version: crate::chain::block::BLOCK_VERSION,
            prev_hash: Hash::compute(&height.wrapping_sub(1).to_be_bytes()),
            interlink_hash: interlink.hash(),
            body_hash: body.hash(),
            accounts_hash: Hash([0x11; 32]),
            n_bits: target_to_compact(&BLOCK_TARGET_MAX),
            height,
            timestamp: TEST_GENESIS_TIMESTAMP + height * 60,
            nonce: 0,
        },
        interlink,
        body: Some(body),
    }
}

pub fn test_block(height: u32) -> Block {
    test_block_mined_by(height, Address([0x22; 20]))
}

/// Template on top of `prev` paying the pool address.
pub fn test_template(prev: &Block, transactions: Vec<Transaction>) -> Block {
    test_child_block(prev, pool_address(), transactions)
}

/// Full block directly on top of `prev`.
pub fn test_child_block(prev: &Block, miner: Address, transactions: Vec<Transaction>) -> Block {
    let body = BlockBody {
        miner_addr: miner,
        extra_data: vec![],
        transactions,
        pruned_accounts: vec![],
    };
    let interlink = BlockInterlink {
        hashes: vec![prev.hash()],
    };
    Block {
        header: BlockHeader {
            version: crate::chain::block::BLOCK_VERSION,
            prev_hash: prev.hash(),
            interlink_hash: interlink.hash(),
            body_hash: body.hash(),
            accounts_hash: Hash([0x33; 32]),
            n_bits: prev.header.n_bits,
            height: prev.height() + 1,
            timestamp: prev.header.timestamp + 60,
            nonce: 0,
        },
        interlink,
        body: Some(body),
    }
}
