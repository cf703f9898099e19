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


//! Store handle providing direct reads and serialized writes.
//!
//! `StoreHandle` combines an `Arc<Store>` for direct read access with a
//! write channel for serialized database writes. This allows fast reads
//! while ensuring all writes are processed sequentially.

use super::{Reply, StoreError, StoreWriter, WriteCommand, WriteSender, write_channel};
use crate::chain::{Address, Hash};
use crate::store::{
    NewShare, PplnsWindow, Store, StoredBlock, StoredPayin, StoredPayout, StoredUser, UserBalance,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Handle for interacting with the store.
///
/// Provides direct read access via `Arc<Store>` and serialized write
/// access through a channel to the `StoreWriter` task.
#[derive(Clone)]
pub struct StoreHandle {
    store: Arc<Store>,
    write_tx: WriteSender,
}

impl StoreHandle {
    /// Create a new store handle.
    pub fn new(store: Arc<Store>, write_tx: WriteSender) -> Self {
        Self { store, write_tx }
    }

    /// Spawn a `StoreWriter` for `store` and return a handle wired to it.
    pub fn spawn(store: Arc<Store>) -> Self {
        let (write_tx, write_rx) = write_channel();
        tokio::spawn(StoreWriter::new(store.clone(), write_rx).run());
        Self::new(store, write_tx)
    }

    /// Get direct access to the underlying store for read operations.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    // ========================================================================
    // DIRECT READS - These delegate directly to Store (may block briefly)
    // ========================================================================

    pub fn get_user_id(&self, address: &Address) -> Result<Option<u64>, StoreError> {
        self.store.get_user_id(address)
    }

    pub fn get_user_by_id(&self, user_id: u64) -> Result<Option<StoredUser>, StoreError> {
        self.store.get_user_by_id(user_id)
    }

    pub fn get_addresses_for_user_ids(
        &self,
        user_ids: &[u64],
    ) -> Result<Vec<(u64, Address)>, StoreError> {
        self.store.get_addresses_for_user_ids(user_ids)
    }

    pub fn get_block_by_hash(&self, hash: &Hash) -> Result<Option<StoredBlock>, StoreError> {
        self.store.get_block_by_hash(hash)
    }

    pub fn contains_share(&self, user_id: u64, hash: &Hash) -> Result<bool, StoreError> {
        self.store.contains_share(user_id, hash)
    }

    pub fn get_pplns_window(
        &self,
        max_height: u32,
        max_shares: usize,
    ) -> Result<PplnsWindow, StoreError> {
        self.store.get_pplns_window(max_height, max_shares)
    }

    pub fn get_payins_for_block(&self, block_id: u64) -> Result<Vec<StoredPayin>, StoreError> {
        self.store.get_payins_for_block(block_id)
    }

    pub fn get_main_chain_payin_sums(&self) -> Result<Vec<(StoredBlock, u64)>, StoreError> {
        self.store.get_main_chain_payin_sums()
    }

    pub fn get_payouts(&self) -> Result<Vec<StoredPayout>, StoreError> {
        self.store.get_payouts()
    }

    pub fn has_payout_request(&self, user_id: u64) -> Result<bool, StoreError> {
        self.store.has_payout_request(user_id)
    }

    pub fn get_payout_requests(&self) -> Result<Vec<u64>, StoreError> {
        self.store.get_payout_requests()
    }

    pub fn get_custom_pool_fees(&self) -> Result<HashMap<u64, Decimal>, StoreError> {
        self.store.get_custom_pool_fees()
    }

    pub fn get_user_balance(
        &self,
        user_id: u64,
        max_height: Option<u32>,
    ) -> Result<u64, StoreError> {
        self.store.get_user_balance(user_id, max_height)
    }

    pub fn get_user_balances_above(
        &self,
        max_height: Option<u32>,
        threshold: u64,
    ) -> Result<Vec<UserBalance>, StoreError> {
        self.store.get_user_balances_above(max_height, threshold)
    }

    // ========================================================================
    // SERIALIZED WRITES - These go through the channel to StoreWriter
    //
    // Writes go through a single worker so rocksdb write stalls never
    // block the tokio worker threads serving miners.
    // ========================================================================

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> WriteCommand,
    ) -> Result<T, StoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.write_tx
            .send(command(reply_tx))
            .await
            .map_err(|_| StoreError::ChannelClosed)?;
        reply_rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    pub async fn get_or_create_user(&self, address: Address) -> Result<u64, StoreError> {
        self.request(|reply| WriteCommand::GetOrCreateUser { address, reply })
            .await
    }

    pub async fn get_or_create_block(
        &self,
        hash: Hash,
        height: u32,
        timestamp: u64,
    ) -> Result<u64, StoreError> {
        self.request(|reply| WriteCommand::GetOrCreateBlock {
            hash,
            height,
            timestamp,
            reply,
        })
        .await
    }

    pub async fn set_block_main_chain(
        &self,
        hash: Hash,
        height: u32,
        timestamp: u64,
        main_chain: bool,
    ) -> Result<u64, StoreError> {
        self.request(|reply| WriteCommand::SetBlockMainChain {
            hash,
            height,
            timestamp,
            main_chain,
            reply,
        })
        .await
    }

    /// Write shares in one batch. See [`Store::add_shares`].
    pub async fn add_shares(&self, shares: Vec<NewShare>) -> Result<Vec<bool>, StoreError> {
        self.request(|reply| WriteCommand::AddShares { shares, reply })
            .await
    }

    pub async fn add_share(&self, share: NewShare) -> Result<(), StoreError> {
        match self.add_shares(vec![share]).await?.first() {
            Some(true) => Ok(()),
            _ => Err(StoreError::DuplicateShare),
        }
    }

    pub async fn add_payins(
        &self,
        block_id: u64,
        payins: Vec<(u64, u64)>,
        datetime: u64,
    ) -> Result<usize, StoreError> {
        self.request(|reply| WriteCommand::AddPayins {
            block_id,
            payins,
            datetime,
            reply,
        })
        .await
    }

    pub async fn add_payout(
        &self,
        user_id: u64,
        amount: u64,
        datetime: u64,
        transaction_hash: Hash,
    ) -> Result<u64, StoreError> {
        self.request(|reply| WriteCommand::AddPayout {
            user_id,
            amount,
            datetime,
            transaction_hash,
            reply,
        })
        .await
    }

    pub async fn remove_payout(&self, id: u64) -> Result<(), StoreError> {
        self.request(|reply| WriteCommand::RemovePayout { id, reply })
            .await
    }

    pub async fn add_payout_request(&self, user_id: u64, datetime: u64) -> Result<(), StoreError> {
        self.request(|reply| WriteCommand::AddPayoutRequest {
            user_id,
            datetime,
            reply,
        })
        .await
    }

    pub async fn remove_payout_request(&self, user_id: u64) -> Result<(), StoreError> {
        self.request(|reply| WriteCommand::RemovePayoutRequest { user_id, reply })
            .await
    }

    pub async fn set_custom_pool_fee(
        &self,
        user_id: u64,
        fee: Option<Decimal>,
    ) -> Result<(), StoreError> {
        self.request(|reply| WriteCommand::SetCustomPoolFee {
            user_id,
            fee,
            reply,
        })
        .await
    }

    pub async fn prune_shares(&self, below_height: u32) -> Result<usize, StoreError> {
        self.request(|reply| WriteCommand::PruneShares {
            below_height,
            reply,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    fn new_store() -> (tempfile::TempDir, Arc<Store>) {
        let temp_dir = tempdir().unwrap();
        let store =
            Arc::new(Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap());
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_writes_go_through_writer() {
        let (_dir, store) = new_store();
        let handle = StoreHandle::spawn(store);

        let address = Address([1u8; 20]);
        let user_id = handle.get_or_create_user(address).await.unwrap();
        assert_eq!(handle.get_user_id(&address).unwrap(), Some(user_id));

        let block_id = handle
            .set_block_main_chain(Hash([1u8; 32]), 3, 0, true)
            .await
            .unwrap();
        let share = NewShare {
            user_id,
            device_id: 1,
            datetime: 0,
            prev_block_id: block_id,
            prev_block_height: 3,
            difficulty: dec!(1),
            hash: Hash([2u8; 32]),
        };
        handle.add_share(share.clone()).await.unwrap();
        assert_eq!(
            handle.add_share(share).await,
            Err(StoreError::DuplicateShare)
        );
        assert!(handle.contains_share(user_id, &Hash([2u8; 32])).unwrap());
    }

    #[tokio::test]
    async fn test_closed_writer_reports_channel_closed() {
        let (_dir, store) = new_store();
        let (write_tx, write_rx) = write_channel();
        drop(write_rx);
        let handle = StoreHandle::new(store, write_tx);
        assert_eq!(
            handle.get_or_create_user(Address([1u8; 20])).await,
            Err(StoreError::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_store_handle_clone_shares_store() {
        let (_dir, store) = new_store();
        let handle1 = StoreHandle::spawn(store);
        let handle2 = handle1.clone();
        handle1.add_payout_request(4, 0).await.unwrap();
        assert!(handle2.has_payout_request(4).unwrap());
        assert!(Arc::ptr_eq(handle1.store(), handle2.store()));
    }
}
