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


use super::{ColumnFamily, NEXT_SHARE_SEQ, Store, StoreError, decode_value, encode_value};
use crate::chain::{HASH_SIZE, Hash};
use rocksdb::{Direction, IteratorMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// An accepted share waiting to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewShare {
    pub user_id: u64,
    pub device_id: u32,
    /// Milliseconds since epoch
    pub datetime: u64,
    pub prev_block_id: u64,
    pub prev_block_height: u32,
    pub difficulty: Decimal,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredShare {
    pub user_id: u64,
    pub device_id: u32,
    pub datetime: u64,
    pub prev_block_id: u64,
    pub prev_block_height: u32,
    pub difficulty: Decimal,
    pub hash: Hash,
}

impl From<&NewShare> for StoredShare {
    fn from(share: &NewShare) -> Self {
        StoredShare {
            user_id: share.user_id,
            device_id: share.device_id,
            datetime: share.datetime,
            prev_block_id: share.prev_block_id,
            prev_block_height: share.prev_block_height,
            difficulty: share.difficulty,
            hash: share.hash,
        }
    }
}

/// Difficulty credited per user over the last N main chain shares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PplnsWindow {
    pub difficulty_by_user: HashMap<u64, Decimal>,
    pub total_difficulty: Decimal,
    pub share_count: usize,
    /// Prev block height of the oldest share counted
    pub oldest_height: Option<u32>,
}

/// Shares sort by the height of the block they were mined on, then by
/// insertion order.
pub fn make_share_key(prev_block_height: u32, seq: u64) -> [u8; 12] {
    let mut key = [0u8; 12];
    key[..4].copy_from_slice(&prev_block_height.to_be_bytes());
    key[4..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn make_share_index_key(user_id: u64, hash: &Hash) -> [u8; 8 + HASH_SIZE] {
    let mut key = [0u8; 8 + HASH_SIZE];
    key[..8].copy_from_slice(&user_id.to_be_bytes());
    key[8..].copy_from_slice(hash.as_bytes());
    key
}

impl Store {
    /// Write a batch of shares atomically. Shares whose `(user, hash)` is
    /// already stored, or repeated inside the batch, are not written. The
    /// returned flags line up with `shares`, false marking a duplicate.
    pub fn add_shares(&self, shares: &[NewShare]) -> Result<Vec<bool>, StoreError> {
        let mut batch = Store::get_write_batch();
        let first_seq = self.reserve_ids(NEXT_SHARE_SEQ, shares.len() as u64, &mut batch)?;
        let share_cf = self.cf(ColumnFamily::Share)?;
        let index_cf = self.cf(ColumnFamily::ShareIndex)?;

        let mut seen = HashSet::with_capacity(shares.len());
        let mut accepted = Vec::with_capacity(shares.len());
        for (offset, share) in shares.iter().enumerate() {
            let index_key = make_share_index_key(share.user_id, &share.hash);
            if !seen.insert(index_key) || self.contains_key(ColumnFamily::ShareIndex, &index_key)? {
                debug!("Duplicate share {} from user {}", share.hash, share.user_id);
                accepted.push(false);
                continue;
            }
            let key = make_share_key(share.prev_block_height, first_seq + offset as u64);
            batch.put_cf(share_cf, key, encode_value(&StoredShare::from(share))?);
            batch.put_cf(index_cf, index_key, key);
            accepted.push(true);
        }
        self.commit_batch(batch)?;
        Ok(accepted)
    }

    pub fn contains_share(&self, user_id: u64, hash: &Hash) -> Result<bool, StoreError> {
        self.contains_key(
            ColumnFamily::ShareIndex,
            &make_share_index_key(user_id, hash),
        )
    }

    /// Sum difficulty per user over the newest `max_shares` shares mined on
    /// main chain blocks at or below `max_height`.
    pub fn get_pplns_window(
        &self,
        max_height: u32,
        max_shares: usize,
    ) -> Result<PplnsWindow, StoreError> {
        let mut window = PplnsWindow::default();
        if max_shares == 0 {
            return Ok(window);
        }
        let start = make_share_key(max_height, u64::MAX);
        let iter = self.db.iterator_cf(
            self.cf(ColumnFamily::Share)?,
            IteratorMode::From(&start, Direction::Reverse),
        );

        let mut main_chain: HashMap<u64, bool> = HashMap::new();
        for item in iter {
            let (_, value) = item?;
            let share: StoredShare = decode_value(&value)?;
            let on_main_chain = match main_chain.get(&share.prev_block_id) {
                Some(flag) => *flag,
                None => {
                    let flag = self
                        .get_block_by_id(share.prev_block_id)?
                        .is_some_and(|block| block.main_chain);
                    main_chain.insert(share.prev_block_id, flag);
                    flag
                }
            };
            if !on_main_chain {
                continue;
            }
            *window
                .difficulty_by_user
                .entry(share.user_id)
                .or_insert(Decimal::ZERO) += share.difficulty;
            window.total_difficulty += share.difficulty;
            window.share_count += 1;
            window.oldest_height = Some(share.prev_block_height);
            if window.share_count >= max_shares {
                break;
            }
        }
        Ok(window)
    }

    /// Prev block height of the oldest stored share.
    pub fn get_oldest_share_height(&self) -> Result<Option<u32>, StoreError> {
        let mut iter = self
            .db
            .iterator_cf(self.cf(ColumnFamily::Share)?, IteratorMode::Start);
        match iter.next() {
            Some(item) => {
                let (_, value) = item?;
                let share: StoredShare = decode_value(&value)?;
                Ok(Some(share.prev_block_height))
            }
            None => Ok(None),
        }
    }

    /// Delete every share mined on a block below `below_height`, together
    /// with its uniqueness entry. Returns the number of shares removed.
    pub fn prune_shares(&self, below_height: u32) -> Result<usize, StoreError> {
        let share_cf = self.cf(ColumnFamily::Share)?;
        let index_cf = self.cf(ColumnFamily::ShareIndex)?;
        let end = make_share_key(below_height, 0);

        let mut batch = Store::get_write_batch();
        let mut removed = 0;
        for item in self.db.iterator_cf(share_cf, IteratorMode::Start) {
            let (key, value) = item?;
            if key.as_ref() >= end.as_slice() {
                break;
            }
            let share: StoredShare = decode_value(&value)?;
            batch.delete_cf(index_cf, make_share_index_key(share.user_id, &share.hash));
            removed += 1;
        }
        batch.delete_range_cf(share_cf, make_share_key(0, 0), end);
        self.commit_batch(batch)?;
        Ok(removed)
    }
}
