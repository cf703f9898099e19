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


//! Payins, payouts, payout requests and the balances derived from them.

use super::{
    ColumnFamily, NEXT_PAYOUT_ID, Store, StoreError, StoredBlock, decode_value, pair_key,
    read_u64,
};
use crate::chain::{Address, Hash};
use rocksdb::{Direction, IteratorMode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPayin {
    pub user_id: u64,
    pub block_id: u64,
    pub amount: u64,
    /// Milliseconds since epoch
    pub datetime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPayout {
    pub id: u64,
    pub user_id: u64,
    pub amount: u64,
    /// Milliseconds since epoch
    pub datetime: u64,
    pub transaction_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBalance {
    pub user_id: u64,
    pub address: Address,
    pub balance: u64,
}

impl Store {
    /// Iterate `(key, value)` pairs of `cf` whose key starts with `id`.
    fn for_each_with_prefix(
        &self,
        cf: ColumnFamily,
        id: u64,
        mut f: impl FnMut(&[u8], &[u8]) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let prefix = id.to_be_bytes();
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            f(&key, &value)?;
        }
        Ok(())
    }

    /// Credit `payins` as `(user, amount)` for `block_id`. Users already
    /// paid in for this block are skipped, so replays are harmless. Returns
    /// how many payins were written.
    pub fn add_payins(
        &self,
        block_id: u64,
        payins: &[(u64, u64)],
        datetime: u64,
    ) -> Result<usize, StoreError> {
        let user_payin_cf = self.cf(ColumnFamily::UserPayin)?;
        let mut batch = Store::get_write_batch();
        let mut written = 0;
        for (user_id, amount) in payins {
            let key = pair_key(block_id, *user_id);
            if self.contains_key(ColumnFamily::Payin, &key)? {
                debug!("Payin for user {user_id} on block {block_id} already stored");
                continue;
            }
            let payin = StoredPayin {
                user_id: *user_id,
                block_id,
                amount: *amount,
                datetime,
            };
            self.put_value(ColumnFamily::Payin, &key, &payin, &mut batch)?;
            batch.put_cf(
                user_payin_cf,
                pair_key(*user_id, block_id),
                amount.to_be_bytes(),
            );
            written += 1;
        }
        self.commit_batch(batch)?;
        Ok(written)
    }

    pub fn get_payins_for_block(&self, block_id: u64) -> Result<Vec<StoredPayin>, StoreError> {
        let mut payins = Vec::new();
        self.for_each_with_prefix(ColumnFamily::Payin, block_id, |_, value| {
            payins.push(decode_value(value)?);
            Ok(())
        })?;
        Ok(payins)
    }

    /// Total paid in per main chain block, for every block with payins.
    pub fn get_main_chain_payin_sums(&self) -> Result<Vec<(StoredBlock, u64)>, StoreError> {
        let mut sums: Vec<(u64, u64)> = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf(ColumnFamily::Payin)?, IteratorMode::Start);
        for item in iter {
            let (_, value) = item?;
            let payin: StoredPayin = decode_value(&value)?;
            match sums.last_mut() {
                Some((block_id, sum)) if *block_id == payin.block_id => *sum += payin.amount,
                _ => sums.push((payin.block_id, payin.amount)),
            }
        }

        let mut out = Vec::with_capacity(sums.len());
        for (block_id, sum) in sums {
            if let Some(block) = self.get_block_by_id(block_id)? {
                if block.main_chain {
                    out.push((block, sum));
                }
            }
        }
        Ok(out)
    }

    pub fn add_payout(
        &self,
        user_id: u64,
        amount: u64,
        datetime: u64,
        transaction_hash: Hash,
    ) -> Result<u64, StoreError> {
        let mut batch = Store::get_write_batch();
        let id = self.reserve_ids(NEXT_PAYOUT_ID, 1, &mut batch)?;
        let payout = StoredPayout {
            id,
            user_id,
            amount,
            datetime,
            transaction_hash,
        };
        self.put_value(ColumnFamily::Payout, &id.to_be_bytes(), &payout, &mut batch)?;
        batch.put_cf(
            self.cf(ColumnFamily::UserPayout)?,
            pair_key(user_id, id),
            amount.to_be_bytes(),
        );
        self.commit_batch(batch)?;
        Ok(id)
    }

    pub fn remove_payout(&self, id: u64) -> Result<(), StoreError> {
        let payout: StoredPayout = self
            .get_value(ColumnFamily::Payout, &id.to_be_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("payout {id}")))?;
        let mut batch = Store::get_write_batch();
        batch.delete_cf(self.cf(ColumnFamily::Payout)?, id.to_be_bytes());
        batch.delete_cf(
            self.cf(ColumnFamily::UserPayout)?,
            pair_key(payout.user_id, id),
        );
        self.commit_batch(batch)
    }

    pub fn get_payouts(&self) -> Result<Vec<StoredPayout>, StoreError> {
        let iter = self
            .db
            .iterator_cf(self.cf(ColumnFamily::Payout)?, IteratorMode::Start);
        let mut payouts = Vec::new();
        for item in iter {
            let (_, value) = item?;
            payouts.push(decode_value(&value)?);
        }
        Ok(payouts)
    }

    /// Ignored when the user already has an open request.
    pub fn add_payout_request(&self, user_id: u64, datetime: u64) -> Result<(), StoreError> {
        if self.has_payout_request(user_id)? {
            return Ok(());
        }
        let mut batch = Store::get_write_batch();
        batch.put_cf(
            self.cf(ColumnFamily::PayoutRequest)?,
            user_id.to_be_bytes(),
            datetime.to_be_bytes(),
        );
        self.commit_batch(batch)
    }

    pub fn remove_payout_request(&self, user_id: u64) -> Result<(), StoreError> {
        let mut batch = Store::get_write_batch();
        batch.delete_cf(self.cf(ColumnFamily::PayoutRequest)?, user_id.to_be_bytes());
        self.commit_batch(batch)
    }

    pub fn has_payout_request(&self, user_id: u64) -> Result<bool, StoreError> {
        self.contains_key(ColumnFamily::PayoutRequest, &user_id.to_be_bytes())
    }

    /// Users with an open payout request.
    pub fn get_payout_requests(&self) -> Result<Vec<u64>, StoreError> {
        let iter = self
            .db
            .iterator_cf(self.cf(ColumnFamily::PayoutRequest)?, IteratorMode::Start);
        let mut users = Vec::new();
        for item in iter {
            let (key, _) = item?;
            users.push(read_u64(&key)?);
        }
        Ok(users)
    }

    /// Set or clear the fee override for one user.
    pub fn set_custom_pool_fee(&self, user_id: u64, fee: Option<Decimal>) -> Result<(), StoreError> {
        let mut batch = Store::get_write_batch();
        match fee {
            Some(fee) => {
                self.put_value(ColumnFamily::PoolFee, &user_id.to_be_bytes(), &fee, &mut batch)?
            }
            None => batch.delete_cf(self.cf(ColumnFamily::PoolFee)?, user_id.to_be_bytes()),
        }
        self.commit_batch(batch)
    }

    pub fn get_custom_pool_fees(&self) -> Result<HashMap<u64, Decimal>, StoreError> {
        let iter = self
            .db
            .iterator_cf(self.cf(ColumnFamily::PoolFee)?, IteratorMode::Start);
        let mut fees = HashMap::new();
        for item in iter {
            let (key, value) = item?;
            fees.insert(read_u64(&key)?, decode_value(&value)?);
        }
        Ok(fees)
    }

    /// Main chain payins on blocks at or below `max_height` minus all
    /// payouts. Without a height every main chain payin counts, which gives
    /// the virtual balance.
    pub fn get_user_balance(&self, user_id: u64, max_height: Option<u32>) -> Result<u64, StoreError> {
        let mut blocks: HashMap<u64, Option<StoredBlock>> = HashMap::new();
        let mut payins = 0u64;
        self.for_each_with_prefix(ColumnFamily::UserPayin, user_id, |key, value| {
            let block_id = read_u64(&key[8..])?;
            let block = match blocks.get(&block_id) {
                Some(block) => block.clone(),
                None => {
                    let block = self.get_block_by_id(block_id)?;
                    blocks.insert(block_id, block.clone());
                    block
                }
            };
            let counts = block.is_some_and(|block| {
                block.main_chain && max_height.is_none_or(|max| block.height <= max)
            });
            if counts {
                payins = payins.saturating_add(read_u64(value)?);
            }
            Ok(())
        })?;

        let mut payouts = 0u64;
        self.for_each_with_prefix(ColumnFamily::UserPayout, user_id, |_, value| {
            payouts = payouts.saturating_add(read_u64(value)?);
            Ok(())
        })?;
        Ok(payins.saturating_sub(payouts))
    }

    /// Balance of every user holding more than `threshold`.
    pub fn get_user_balances_above(
        &self,
        max_height: Option<u32>,
        threshold: u64,
    ) -> Result<Vec<UserBalance>, StoreError> {
        let mut balances = Vec::new();
        for user in self.get_users()? {
            let balance = self.get_user_balance(user.user_id, max_height)?;
            if balance > threshold {
                balances.push(UserBalance {
                    user_id: user.user_id,
                    address: user.address,
                    balance,
                });
            }
        }
        Ok(balances)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, Store) {
        let temp_dir = tempdir().unwrap();
        let store = Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap();
        (temp_dir, store)
    }

    #[test]
    fn test_add_payins_is_idempotent() {
        let (_dir, store) = store();
        let block = store.set_block_main_chain(&Hash([1u8; 32]), 10, 0, true).unwrap();

        assert_eq!(store.add_payins(block, &[(1, 100), (2, 50)], 0).unwrap(), 2);
        assert_eq!(store.add_payins(block, &[(1, 999), (3, 5)], 0).unwrap(), 1);

        let payins = store.get_payins_for_block(block).unwrap();
        assert_eq!(payins.len(), 3);
        assert_eq!(payins.iter().find(|p| p.user_id == 1).unwrap().amount, 100);
    }

    #[test]
    fn test_confirmed_balance_never_exceeds_virtual() {
        let (_dir, store) = store();
        let user = store.get_or_create_user(&Address([1u8; 20])).unwrap();
        let old = store.set_block_main_chain(&Hash([1u8; 32]), 10, 0, true).unwrap();
        let recent = store.set_block_main_chain(&Hash([2u8; 32]), 30, 0, true).unwrap();
        let forked = store.set_block_main_chain(&Hash([3u8; 32]), 11, 0, false).unwrap();

        store.add_payins(old, &[(user, 100)], 0).unwrap();
        store.add_payins(forked, &[(user, 1000)], 0).unwrap();
        let before = store.get_user_balance(user, None).unwrap();
        store.add_payins(recent, &[(user, 40)], 0).unwrap();

        let confirmed = store.get_user_balance(user, Some(20)).unwrap();
        let virtual_balance = store.get_user_balance(user, None).unwrap();
        assert_eq!(confirmed, 100);
        assert_eq!(virtual_balance, before + 40);
        assert!(confirmed <= virtual_balance);

        store.add_payout(user, 60, 0, Hash([9u8; 32])).unwrap();
        assert_eq!(store.get_user_balance(user, Some(20)).unwrap(), 40);
        assert_eq!(store.get_user_balance(user, None).unwrap(), 80);
    }

    #[test]
    fn test_reverted_block_drops_out_of_balance() {
        let (_dir, store) = store();
        let hash = Hash([1u8; 32]);
        let block = store.set_block_main_chain(&hash, 10, 0, true).unwrap();
        store.add_payins(block, &[(1, 100)], 0).unwrap();
        assert_eq!(store.get_main_chain_payin_sums().unwrap()[0].1, 100);

        store.set_block_main_chain(&hash, 10, 0, false).unwrap();
        assert_eq!(store.get_user_balance(1, None).unwrap(), 0);
        assert!(store.get_main_chain_payin_sums().unwrap().is_empty());
    }

    #[test]
    fn test_remove_payout_restores_balance() {
        let (_dir, store) = store();
        let block = store.set_block_main_chain(&Hash([1u8; 32]), 1, 0, true).unwrap();
        store.add_payins(block, &[(1, 100)], 0).unwrap();
        let id = store.add_payout(1, 100, 0, Hash([2u8; 32])).unwrap();
        assert_eq!(store.get_user_balance(1, None).unwrap(), 0);
        assert_eq!(store.get_payouts().unwrap().len(), 1);

        store.remove_payout(id).unwrap();
        assert_eq!(store.get_user_balance(1, None).unwrap(), 100);
        assert!(store.get_payouts().unwrap().is_empty());
        assert!(matches!(store.remove_payout(id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_payout_requests() {
        let (_dir, store) = store();
        store.add_payout_request(3, 1).unwrap();
        store.add_payout_request(3, 2).unwrap();
        store.add_payout_request(1, 3).unwrap();
        assert_eq!(store.get_payout_requests().unwrap(), vec![1, 3]);
        assert!(store.has_payout_request(3).unwrap());

        store.remove_payout_request(3).unwrap();
        assert!(!store.has_payout_request(3).unwrap());
    }

    #[test]
    fn test_custom_pool_fees() {
        let (_dir, store) = store();
        store.set_custom_pool_fee(1, Some(dec!(0.05))).unwrap();
        store.set_custom_pool_fee(2, Some(dec!(0.5))).unwrap();
        store.set_custom_pool_fee(2, None).unwrap();
        let fees = store.get_custom_pool_fees().unwrap();
        assert_eq!(fees.len(), 1);
        assert_eq!(fees[&1], dec!(0.05));
    }

    #[test]
    fn test_balances_above_threshold() {
        let (_dir, store) = store();
        let a = store.get_or_create_user(&Address([1u8; 20])).unwrap();
        let b = store.get_or_create_user(&Address([2u8; 20])).unwrap();
        let block = store.set_block_main_chain(&Hash([1u8; 32]), 1, 0, true).unwrap();
        store.add_payins(block, &[(a, 500), (b, 5)], 0).unwrap();

        let balances = store.get_user_balances_above(Some(1), 10).unwrap();
        assert_eq!(
            balances,
            vec![UserBalance {
                user_id: a,
                address: Address([1u8; 20]),
                balance: 500
            }]
        );
    }
}
