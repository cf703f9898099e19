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


use super::{ColumnFamily, NEXT_USER_ID, Store, StoreError};
use crate::chain::Address;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A miner, identified by the address it registered with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredUser {
    pub user_id: u64,
    pub address: Address,
    /// Microseconds since epoch
    pub created_at: u64,
}

impl StoredUser {
    pub fn new(user_id: u64, address: Address) -> Self {
        Self {
            user_id,
            address,
            created_at: chrono::Utc::now().timestamp_micros() as u64,
        }
    }
}

impl Store {
    /// Return the id for `address`, creating the user on first sight.
    pub fn get_or_create_user(&self, address: &Address) -> Result<u64, StoreError> {
        if let Some(user_id) = self.get_user_id(address)? {
            return Ok(user_id);
        }
        let mut batch = Store::get_write_batch();
        let user_id = self.reserve_ids(NEXT_USER_ID, 1, &mut batch)?;
        let user = StoredUser::new(user_id, *address);
        self.put_value(ColumnFamily::User, &user_id.to_be_bytes(), &user, &mut batch)?;
        batch.put_cf(
            self.cf(ColumnFamily::UserIndex)?,
            address.as_bytes(),
            user_id.to_be_bytes(),
        );
        self.commit_batch(batch)?;
        debug!("Created user {user_id} for {address}");
        Ok(user_id)
    }

    pub fn get_user_id(&self, address: &Address) -> Result<Option<u64>, StoreError> {
        self.get_u64(ColumnFamily::UserIndex, address.as_bytes())
    }

    pub fn get_user_by_id(&self, user_id: u64) -> Result<Option<StoredUser>, StoreError> {
        self.get_value(ColumnFamily::User, &user_id.to_be_bytes())
    }

    /// All users in id order.
    pub fn get_users(&self) -> Result<Vec<StoredUser>, StoreError> {
        let iter = self
            .db
            .iterator_cf(self.cf(ColumnFamily::User)?, rocksdb::IteratorMode::Start);
        let mut users = Vec::new();
        for item in iter {
            let (_, value) = item?;
            users.push(super::decode_value(&value)?);
        }
        Ok(users)
    }

    /// Addresses for the given ids. Unknown ids are skipped.
    pub fn get_addresses_for_user_ids(
        &self,
        user_ids: &[u64],
    ) -> Result<Vec<(u64, Address)>, StoreError> {
        let cf = self.cf(ColumnFamily::User)?;
        let keys = user_ids.iter().map(|id| (cf, id.to_be_bytes()));
        let mut out = Vec::with_capacity(user_ids.len());
        for (user_id, value) in user_ids.iter().zip(self.db.multi_get_cf(keys)) {
            if let Some(bytes) = value? {
                let user: StoredUser = super::decode_value(&bytes)?;
                out.push((*user_id, user.address));
            }
        }
        Ok(out)
    }

    #[cfg(test)]
    fn user_count(&self) -> Result<u64, StoreError> {
        Ok(self
            .get_u64(ColumnFamily::Metadata, NEXT_USER_ID)?
            .map(|next| next - 1)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_get_user() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        let address = Address([1u8; 20]);

        let user_id = store.get_or_create_user(&address).unwrap();
        let stored = store.get_user_by_id(user_id).unwrap().unwrap();
        assert_eq!(stored.address, address);
        assert!(stored.created_at > 0);
        assert_eq!(store.get_user_id(&address).unwrap(), Some(user_id));

        // same address, same id
        assert_eq!(store.get_or_create_user(&address).unwrap(), user_id);
        assert_eq!(store.user_count().unwrap(), 1);

        let other = store.get_or_create_user(&Address([2u8; 20])).unwrap();
        assert_ne!(other, user_id);
        assert_eq!(store.get_users().unwrap().len(), 2);
    }

    #[test]
    fn test_get_nonexistent_user() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        assert!(store.get_user_by_id(7).unwrap().is_none());
        assert!(store.get_user_id(&Address([9u8; 20])).unwrap().is_none());
    }

    #[test]
    fn test_get_addresses_for_user_ids() {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        let a = store.get_or_create_user(&Address([1u8; 20])).unwrap();
        let b = store.get_or_create_user(&Address([2u8; 20])).unwrap();

        let addresses = store.get_addresses_for_user_ids(&[a, 99, b]).unwrap();
        assert_eq!(
            addresses,
            vec![(a, Address([1u8; 20])), (b, Address([2u8; 20]))]
        );
    }
}
