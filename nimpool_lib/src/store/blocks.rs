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


use super::{ColumnFamily, NEXT_BLOCK_ID, Store, StoreError};
use crate::chain::Hash;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A chain block the pool has seen shares for, paid in on or mined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlock {
    pub id: u64,
    pub hash: Hash,
    pub height: u32,
    /// Seconds since epoch
    pub timestamp: u64,
    pub main_chain: bool,
}

impl Store {
    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        match self.get_u64(ColumnFamily::BlockIndex, hash.as_bytes())? {
            Some(id) => self.get_block_by_id(id),
            None => Ok(None),
        }
    }

    pub fn get_block_by_id(&self, id: u64) -> Result<Option<StoredBlock>, StoreError> {
        self.get_value(ColumnFamily::Block, &id.to_be_bytes())
    }

    /// Id of the block with `hash`, inserting it off the main chain if it is
    /// new. Existing rows are left untouched.
    pub fn get_or_create_block(
        &self,
        hash: &Hash,
        height: u32,
        timestamp: u64,
    ) -> Result<u64, StoreError> {
        if let Some(block) = self.get_block_by_hash(hash)? {
            return Ok(block.id);
        }
        self.insert_block(hash, height, timestamp, false)
    }

    /// Insert or relabel a block with the given main chain flag.
    pub fn set_block_main_chain(
        &self,
        hash: &Hash,
        height: u32,
        timestamp: u64,
        main_chain: bool,
    ) -> Result<u64, StoreError> {
        match self.get_block_by_hash(hash)? {
            Some(mut block) => {
                if block.main_chain != main_chain {
                    debug!("Relabelling block {hash} at {height} main_chain={main_chain}");
                    block.main_chain = main_chain;
                    let mut batch = Store::get_write_batch();
                    self.put_value(
                        ColumnFamily::Block,
                        &block.id.to_be_bytes(),
                        &block,
                        &mut batch,
                    )?;
                    self.commit_batch(batch)?;
                }
                Ok(block.id)
            }
            None => self.insert_block(hash, height, timestamp, main_chain),
        }
    }

    fn insert_block(
        &self,
        hash: &Hash,
        height: u32,
        timestamp: u64,
        main_chain: bool,
    ) -> Result<u64, StoreError> {
        let mut batch = Store::get_write_batch();
        let id = self.reserve_ids(NEXT_BLOCK_ID, 1, &mut batch)?;
        let block = StoredBlock {
            id,
            hash: *hash,
            height,
            timestamp,
            main_chain,
        };
        self.put_value(ColumnFamily::Block, &id.to_be_bytes(), &block, &mut batch)?;
        batch.put_cf(
            self.cf(ColumnFamily::BlockIndex)?,
            hash.as_bytes(),
            id.to_be_bytes(),
        );
        self.commit_batch(batch)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_get_or_create_block_keeps_existing_row() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        let hash = Hash([1u8; 32]);

        let id = store.set_block_main_chain(&hash, 10, 1000, true).unwrap();
        assert_eq!(store.get_or_create_block(&hash, 10, 2000).unwrap(), id);

        let block = store.get_block_by_hash(&hash).unwrap().unwrap();
        assert!(block.main_chain);
        assert_eq!(block.timestamp, 1000);
    }

    #[test]
    fn test_new_block_is_not_main_chain() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        let id = store.get_or_create_block(&Hash([2u8; 32]), 5, 0).unwrap();
        let block = store.get_block_by_id(id).unwrap().unwrap();
        assert!(!block.main_chain);
        assert_eq!(block.height, 5);
    }

    #[test]
    fn test_set_block_main_chain_relabels() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        let hash = Hash([3u8; 32]);

        let id = store.get_or_create_block(&hash, 7, 0).unwrap();
        assert_eq!(store.set_block_main_chain(&hash, 7, 0, true).unwrap(), id);
        assert!(store.get_block_by_id(id).unwrap().unwrap().main_chain);

        store.set_block_main_chain(&hash, 7, 0, false).unwrap();
        assert!(!store.get_block_by_id(id).unwrap().unwrap().main_chain);
        assert!(store.get_block_by_hash(&Hash([4u8; 32])).unwrap().is_none());
    }
}
