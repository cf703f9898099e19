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


use crate::store::column_families::ColumnFamily;
use rocksdb::{ColumnFamilyDescriptor, DB, Options as RocksDbOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub mod background_tasks;
pub mod blocks;
pub mod column_families;
pub mod ledger;
pub mod shares;
pub mod users;
pub mod writer;

pub use blocks::StoredBlock;
pub use ledger::{StoredPayin, StoredPayout, UserBalance};
pub use shares::{NewShare, PplnsWindow, StoredShare};
pub use users::StoredUser;
pub use writer::{StoreError, StoreHandle, StoreWriter, write_channel};

const NEXT_USER_ID: &[u8] = b"next_user_id";
const NEXT_BLOCK_ID: &[u8] = b"next_block_id";
const NEXT_SHARE_SEQ: &[u8] = b"next_share_seq";
const NEXT_PAYOUT_ID: &[u8] = b"next_payout_id";

/// Pool database on RocksDB.
///
/// Every table of the pool lives in its own column family so compactions are
/// independent. Values are CBOR, keys are big endian integers and raw
/// hashes so that iteration order follows ids and heights:
/// - user / user_index: users by id and by address
/// - block / block_index: blocks the pool has seen, by id and by hash
/// - share / share_index: shares keyed by prev block height, plus the
///   `(user, hash)` uniqueness index
/// - payin / user_payin: rewards per `(block, user)` and per `(user, block)`
/// - payout / user_payout: disbursements by id and per user
/// - payout_request, pool_fee: per user flags and overrides
/// - metadata: id counters
pub struct Store {
    path: String,
    db: DB,
}

impl Store {
    /// Open or create the store at `path`.
    pub fn new(path: String, read_only: bool) -> Result<Self, StoreError> {
        // default options for all column families until profiling says otherwise
        let cfs = ColumnFamily::ALL
            .iter()
            .map(|cf| ColumnFamilyDescriptor::new(*cf, RocksDbOptions::default()))
            .collect::<Vec<_>>();

        let mut db_options = RocksDbOptions::default();
        db_options.create_missing_column_families(true);
        db_options.create_if_missing(true);
        let db = if read_only {
            DB::open_cf_descriptors_read_only(&db_options, path.clone(), cfs, false)?
        } else {
            DB::open_cf_descriptors(&db_options, path.clone(), cfs)?
        };
        Ok(Self { path, db })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Get a rocksdb write batch
    pub fn get_write_batch() -> rocksdb::WriteBatch {
        rocksdb::WriteBatch::default()
    }

    /// Commit a write batch earlier obtained using get batch
    pub fn commit_batch(&self, batch: rocksdb::WriteBatch) -> Result<(), StoreError> {
        self.db.write(batch)?;
        Ok(())
    }

    fn cf(&self, cf: ColumnFamily) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(&cf)
            .ok_or_else(|| StoreError::Database(format!("missing column family {}", cf.as_str())))
    }

    fn get_value<T: DeserializeOwned>(
        &self,
        cf: ColumnFamily,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_value<T: Serialize>(
        &self,
        cf: ColumnFamily,
        key: &[u8],
        value: &T,
        batch: &mut rocksdb::WriteBatch,
    ) -> Result<(), StoreError> {
        batch.put_cf(self.cf(cf)?, key, encode_value(value)?);
        Ok(())
    }

    fn contains_key(&self, cf: ColumnFamily, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.db.get_pinned_cf(self.cf(cf)?, key)?.is_some())
    }

    fn get_u64(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<u64>, StoreError> {
        match self.db.get_pinned_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(read_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Reserve `count` consecutive ids from a counter. The counter update is
    /// added to `batch`, so callers must commit before reserving again.
    fn reserve_ids(
        &self,
        counter: &[u8],
        count: u64,
        batch: &mut rocksdb::WriteBatch,
    ) -> Result<u64, StoreError> {
        let first = self.get_u64(ColumnFamily::Metadata, counter)?.unwrap_or(1);
        batch.put_cf(
            self.cf(ColumnFamily::Metadata)?,
            counter,
            (first + count).to_be_bytes(),
        );
        Ok(first)
    }
}

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| StoreError::Codec(e.to_string()))?;
    Ok(out)
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    ciborium::de::from_reader(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

pub(crate) fn read_u64(bytes: &[u8]) -> Result<u64, StoreError> {
    let array: [u8; 8] = bytes
        .get(..8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| StoreError::Codec("expected 8 byte integer".to_string()))?;
    Ok(u64::from_be_bytes(array))
}

/// Concatenate two big endian ids into one key.
pub(crate) fn pair_key(a: u64, b: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&a.to_be_bytes());
    key[8..].copy_from_slice(&b.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_opens_all_column_families() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        for cf in ColumnFamily::ALL {
            assert!(store.cf(cf).is_ok(), "missing {}", cf.as_str());
        }
    }

    #[test]
    fn test_reserve_ids_is_monotonic() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();

        let mut batch = Store::get_write_batch();
        assert_eq!(store.reserve_ids(NEXT_USER_ID, 3, &mut batch).unwrap(), 1);
        store.commit_batch(batch).unwrap();

        let mut batch = Store::get_write_batch();
        assert_eq!(store.reserve_ids(NEXT_USER_ID, 1, &mut batch).unwrap(), 4);
        store.commit_batch(batch).unwrap();
    }

    #[test]
    fn test_reopen_read_only_sees_data() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().to_str().unwrap().to_string();
        {
            let store = Store::new(path.clone(), false).unwrap();
            let mut batch = Store::get_write_batch();
            store.reserve_ids(NEXT_PAYOUT_ID, 5, &mut batch).unwrap();
            store.commit_batch(batch).unwrap();
        }
        let store = Store::new(path, true).unwrap();
        assert_eq!(
            store.get_u64(ColumnFamily::Metadata, NEXT_PAYOUT_ID).unwrap(),
            Some(6)
        );
    }
}
