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

//! Pay Per Last N Shares reward distribution.
//!
//! When the pool mines a block its payable reward is split over the users
//! behind the last N main chain shares, in proportion to the difficulty they
//! submitted. Amounts are rounded down per user and whatever is left over
//! stays with the pool.

use super::reward::payable_block_reward;
use crate::chain::{Address, Block, BlockchainPort, ChainError};
use crate::store::{PplnsWindow, StoreHandle};
use crate::utils::time_provider::TimeProvider;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Payins credited for one mined block.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    pub block_id: u64,
    pub payable: u64,
    /// `(user_id, amount)`, ordered by user id
    pub payins: Vec<(u64, u64)>,
    /// Rounding remainder kept by the pool
    pub residue: u64,
}

/// Split `payable` over the users in `window`.
///
/// Each user gets `floor(difficulty * payable / total_difficulty)`. A custom
/// fee above the pool fee scales that down by `(1 - custom) / (1 - pool_fee)`,
/// a lower custom fee is ignored. The sum of the result never exceeds
/// `payable`.
pub fn split_reward(
    window: &PplnsWindow,
    payable: u64,
    pool_fee: Decimal,
    custom_fees: &HashMap<u64, Decimal>,
) -> Vec<(u64, u64)> {
    if window.total_difficulty <= Decimal::ZERO {
        return Vec::new();
    }
    let payable = Decimal::from(payable);
    let mut users: Vec<(&u64, &Decimal)> = window.difficulty_by_user.iter().collect();
    users.sort_by_key(|(user_id, _)| **user_id);

    users
        .into_iter()
        .filter_map(|(user_id, difficulty)| {
            let base = (*difficulty * payable / window.total_difficulty).floor();
            let fee = custom_fees
                .get(user_id)
                .copied()
                .unwrap_or(pool_fee)
                .max(pool_fee);
            let amount = if fee > pool_fee && pool_fee < Decimal::ONE {
                let keep = (Decimal::ONE - fee).max(Decimal::ZERO);
                (base * keep / (Decimal::ONE - pool_fee)).floor()
            } else {
                base
            };
            let amount = amount.to_u64().unwrap_or(0);
            (amount > 0).then_some((*user_id, amount))
        })
        .collect()
}

/// Credits payins for blocks the pool mined.
pub struct RewardDistributor {
    store: StoreHandle,
    chain: Arc<dyn BlockchainPort>,
    pool_address: Address,
    pool_fee: Decimal,
    pplns_shares: usize,
    time_provider: Arc<dyn TimeProvider>,
}

impl RewardDistributor {
    pub fn new(
        store: StoreHandle,
        chain: Arc<dyn BlockchainPort>,
        pool_address: Address,
        pool_fee: Decimal,
        pplns_shares: usize,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            chain,
            pool_address,
            pool_fee,
            pplns_shares,
            time_provider,
        }
    }

    /// Distribute the reward of `block` if the pool mined it. Returns None
    /// for blocks mined by someone else.
    ///
    /// Payins are stored once per user and block, so running this twice for
    /// the same block credits nothing new.
    pub async fn distribute(
        &self,
        block: &Block,
    ) -> Result<Option<Distribution>, Box<dyn Error + Send + Sync>> {
        let block = match block.is_full() {
            true => block.clone(),
            false => self
                .chain
                .get_block(&block.hash(), true)
                .await?
                .ok_or_else(|| ChainError::NotFound(format!("block {}", block.hash())))?,
        };
        debug!(
            "Miner addr {:?} our {}",
            block.miner_addr(),
            self.pool_address
        );
        if block.miner_addr() != Some(&self.pool_address) {
            return Ok(None);
        }

        let hash = block.hash();
        let block_id = self
            .store
            .get_or_create_block(hash, block.height(), u64::from(block.header.timestamp))
            .await?;
        let window = self
            .store
            .get_pplns_window(block.height(), self.pplns_shares)?;
        let payable = payable_block_reward(self.chain.as_ref(), &block, self.pool_fee).await?;
        let custom_fees = self.store.get_custom_pool_fees()?;

        if window.share_count == 0 {
            warn!("No shares to reward for block {hash} at {}", block.height());
        }
        let payins = split_reward(&window, payable, self.pool_fee, &custom_fees);
        let distributed: u64 = payins.iter().map(|(_, amount)| amount).sum();
        let residue = payable.saturating_sub(distributed);

        info!(
            "Distributing {payable} to {} users for block {hash} at {}",
            payins.len(),
            block.height()
        );
        let written = self
            .store
            .add_payins(
                block_id,
                payins.clone(),
                self.time_provider.millis_since_epoch(),
            )
            .await?;
        info!("Distributed payable value of {distributed} in {written} new payins");
        info!("Collected {residue} in rounding residue");

        Ok(Some(Distribution {
            block_id,
            payable,
            payins,
            residue,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::port::MockBlockchainPort;
    use crate::chain::{Hash, HASH_SIZE};
    use crate::store::NewShare;
    use crate::test_utils::{
        pool_address, setup_test_store, test_block, test_child_block, test_transaction,
    };
    use crate::utils::time_provider::SystemTimeProvider;
    use rust_decimal_macros::dec;

    fn window(difficulties: &[(u64, Decimal)]) -> PplnsWindow {
        let mut window = PplnsWindow::default();
        for (user_id, difficulty) in difficulties {
            window.difficulty_by_user.insert(*user_id, *difficulty);
            window.total_difficulty += *difficulty;
            window.share_count += 1;
        }
        window
    }

    #[test]
    fn test_split_is_proportional() {
        let window = window(&[(1, dec!(3)), (2, dec!(1))]);
        let payins = split_reward(&window, 1000, dec!(0.01), &HashMap::new());
        assert_eq!(payins, vec![(1, 750), (2, 250)]);
    }

    #[test]
    fn test_split_never_exceeds_payable() {
        let window = window(&[(1, dec!(1)), (2, dec!(1)), (3, dec!(1))]);
        let payins = split_reward(&window, 1000, dec!(0.01), &HashMap::new());
        let sum: u64 = payins.iter().map(|(_, amount)| amount).sum();
        assert_eq!(payins, vec![(1, 333), (2, 333), (3, 333)]);
        assert!(sum <= 1000);
    }

    #[test]
    fn test_custom_fee_only_reduces() {
        let window = window(&[(1, dec!(1)), (2, dec!(1))]);
        let mut custom = HashMap::new();
        custom.insert(1, dec!(0.5));
        // Lower than the pool fee, ignored
        custom.insert(2, dec!(0));
        let payins = split_reward(&window, 990, dec!(0.01), &custom);
        // 495 * 0.5 / 0.99 = 250
        assert_eq!(payins, vec![(1, 250), (2, 495)]);
    }

    #[test]
    fn test_empty_window_pays_nothing() {
        let payins = split_reward(&PplnsWindow::default(), 1000, dec!(0.01), &HashMap::new());
        assert!(payins.is_empty());
    }

    async fn add_share(store: &StoreHandle, user_id: u64, block_id: u64, height: u32, n: u8) {
        store
            .add_share(NewShare {
                user_id,
                device_id: 0,
                datetime: 0,
                prev_block_id: block_id,
                prev_block_height: height,
                difficulty: dec!(1),
                hash: Hash([n; HASH_SIZE]),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_distribute_block_mined_by_pool() {
        let (_dir, store) = setup_test_store();
        let alice = store.get_or_create_user(Address([1; 20])).await.unwrap();
        let bob = store.get_or_create_user(Address([2; 20])).await.unwrap();
        let prev = test_block(10);
        let prev_id = store
            .set_block_main_chain(prev.hash(), 10, 0, true)
            .await
            .unwrap();
        add_share(&store, alice, prev_id, 10, 1).await;
        add_share(&store, alice, prev_id, 10, 2).await;
        add_share(&store, bob, prev_id, 10, 3).await;

        let mined = test_child_block(&prev, pool_address(), vec![test_transaction(Address([3; 20]), 5, 100)]);
        let mut chain = MockBlockchainPort::new();
        chain.expect_block_reward_at().returning(|_| Ok(1900));
        let distributor = RewardDistributor::new(
            store.clone(),
            Arc::new(chain),
            pool_address(),
            dec!(0.01),
            1000,
            Arc::new(SystemTimeProvider),
        );

        let distribution = distributor.distribute(&mined).await.unwrap().unwrap();
        // floor(0.99 * 2000) = 1980, split 2:1
        assert_eq!(distribution.payable, 1980);
        assert_eq!(distribution.payins, vec![(alice, 1320), (bob, 660)]);
        assert_eq!(distribution.residue, 0);
        assert_eq!(store.get_user_balance(alice, None).unwrap(), 0);

        // Balances only count main chain blocks
        store
            .set_block_main_chain(mined.hash(), 11, 0, true)
            .await
            .unwrap();
        assert_eq!(store.get_user_balance(alice, None).unwrap(), 1320);

        // Replaying the head credits nothing twice
        distributor.distribute(&mined).await.unwrap();
        assert_eq!(store.get_user_balance(alice, None).unwrap(), 1320);
    }

    #[tokio::test]
    async fn test_foreign_block_is_ignored() {
        let (_dir, store) = setup_test_store();
        let distributor = RewardDistributor::new(
            store,
            Arc::new(MockBlockchainPort::new()),
            pool_address(),
            dec!(0.01),
            1000,
            Arc::new(SystemTimeProvider),
        );
        assert_eq!(distributor.distribute(&test_block(5)).await.unwrap(), None);
    }
}
