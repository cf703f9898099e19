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

//! Paying confirmed balances out to miners.
//!
//! A payout run first checks that every stored payin is backed by a main
//! chain block the pool really mined, then pays every user above the
//! automatic payout limit and every user that asked for a payout. The run
//! is a one shot job: once the transactions are out it waits for the node to
//! relay them and returns.

use super::reward::payable_block_reward;
use crate::chain::{Address, BlockchainPort, ChainError, ChainEvent, Hash};
use crate::config::Config;
use crate::store::{StoreError, StoreHandle};
use crate::utils::time_provider::TimeProvider;
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{error, info};

/// Size in bytes of a basic transaction, used to price the payout fee.
pub const BASIC_TRANSACTION_SIZE: u64 = 138;

#[derive(Debug)]
pub enum PayoutError {
    /// Stored payins do not match the chain. Nothing is paid.
    PayinInconsistency(String),
    Chain(ChainError),
    Store(StoreError),
}

impl fmt::Display for PayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PayoutError::PayinInconsistency(reason) => write!(f, "Payin inconsistency: {reason}"),
            PayoutError::Chain(e) => write!(f, "{e}"),
            PayoutError::Store(e) => write!(f, "{e}"),
        }
    }
}

impl Error for PayoutError {}

impl From<ChainError> for PayoutError {
    fn from(e: ChainError) -> Self {
        PayoutError::Chain(e)
    }
}

impl From<StoreError> for PayoutError {
    fn from(e: StoreError) -> Self {
        PayoutError::Store(e)
    }
}

#[derive(Debug, Clone)]
pub struct PayoutSettings {
    pub pool_address: Address,
    pub pool_fee: Decimal,
    /// Fee per byte
    pub network_fee: u64,
    pub payout_confirmations: u32,
    pub auto_payout_limit: u64,
    pub relay_grace: Duration,
    pub relay_quiet: Duration,
}

impl PayoutSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool_address: config.pool.address,
            pool_fee: config.pool.pool_fee,
            network_fee: config.pool.network_fee,
            payout_confirmations: config.pool.payout_confirmations,
            auto_payout_limit: config.pool.auto_payout_limit,
            relay_grace: Duration::from_secs(config.payout.relay_grace_secs),
            relay_quiet: Duration::from_secs(config.payout.relay_quiet_secs),
        }
    }

    /// Fee attached to every payout transaction.
    pub fn transaction_fee(&self) -> u64 {
        BASIC_TRANSACTION_SIZE.saturating_mul(self.network_fee)
    }
}

/// A transaction sent to a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayout {
    pub user_id: u64,
    pub address: Address,
    /// Debited from the user's balance
    pub amount: u64,
    /// Transferred on chain
    pub value: u64,
    pub transaction_hash: Hash,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PayoutReport {
    pub auto_payouts: usize,
    pub payout_requests: usize,
    pub sent: Vec<SentPayout>,
    /// Wallet balance left over after all confirmed user balances
    pub operator_residual: i128,
}

impl PayoutReport {
    pub fn is_empty(&self) -> bool {
        self.auto_payouts == 0 && self.payout_requests == 0
    }
}

pub struct PayoutEngine {
    chain: Arc<dyn BlockchainPort>,
    store: StoreHandle,
    settings: PayoutSettings,
    time_provider: Arc<dyn TimeProvider>,
}

impl PayoutEngine {
    pub fn new(
        chain: Arc<dyn BlockchainPort>,
        store: StoreHandle,
        settings: PayoutSettings,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            chain,
            store,
            settings,
            time_provider,
        }
    }

    /// Validate payins, then send automatic payouts and requested payouts.
    pub async fn run(&self) -> Result<PayoutReport, PayoutError> {
        self.validate_payins().await?;

        let head_height = self.chain.head_height().await?;
        let confirmed_height = head_height.saturating_sub(self.settings.payout_confirmations);
        let mut report = PayoutReport::default();

        let auto_payouts = self
            .store
            .get_user_balances_above(Some(confirmed_height), self.settings.auto_payout_limit)?;
        info!("Processing {} auto payouts", auto_payouts.len());
        report.auto_payouts = auto_payouts.len();
        for balance in auto_payouts {
            if let Some(sent) = self
                .payout(balance.user_id, balance.address, balance.balance, false, head_height)
                .await?
            {
                report.sent.push(sent);
            }
        }

        let requests = self.store.get_payout_requests()?;
        info!("Processing {} payout requests", requests.len());
        report.payout_requests = requests.len();
        let addresses = self.store.get_addresses_for_user_ids(&requests)?;
        for user_id in requests {
            let address = addresses
                .iter()
                .find(|(id, _)| *id == user_id)
                .map(|(_, address)| *address);
            if let Some(address) = address {
                let balance = self
                    .store
                    .get_user_balance(user_id, Some(confirmed_height))?;
                if let Some(sent) = self
                    .payout(user_id, address, balance, true, head_height)
                    .await?
                {
                    report.sent.push(sent);
                }
            }
            self.store.remove_payout_request(user_id).await?;
        }

        report.operator_residual = self.operator_residual(confirmed_height).await?;
        info!(
            "Wallet holds {} beyond confirmed user balances",
            report.operator_residual
        );
        Ok(report)
    }

    /// Every main chain block with payins must be known to the node, mined
    /// to the pool address and pay in no more than its payable reward.
    pub async fn validate_payins(&self) -> Result<(), PayoutError> {
        for (block, payin_sum) in self.store.get_main_chain_payin_sums()? {
            let Some(chain_block) = self.chain.get_block(&block.hash, true).await? else {
                return Err(PayoutError::PayinInconsistency(format!(
                    "block {} unknown to the node",
                    block.hash
                )));
            };
            if chain_block.miner_addr() != Some(&self.settings.pool_address) {
                error!(
                    "Wrong miner address in block {}: {:?} != {}",
                    block.hash,
                    chain_block.miner_addr(),
                    self.settings.pool_address
                );
                return Err(PayoutError::PayinInconsistency(format!(
                    "block {} not mined by the pool",
                    block.hash
                )));
            }
            let payable =
                payable_block_reward(self.chain.as_ref(), &chain_block, self.settings.pool_fee)
                    .await?;
            if payin_sum > payable {
                error!(
                    "Stored payins {payin_sum} exceed payable reward {payable} for block {}",
                    block.hash
                );
                return Err(PayoutError::PayinInconsistency(format!(
                    "payins for block {} exceed the payable reward",
                    block.hash
                )));
            }
        }
        Ok(())
    }

    /// Send `amount` to `address`, taking the transaction fee out of it when
    /// `deduct_fee` is set. Nothing is sent if no value would remain.
    async fn payout(
        &self,
        user_id: u64,
        address: Address,
        amount: u64,
        deduct_fee: bool,
        head_height: u32,
    ) -> Result<Option<SentPayout>, PayoutError> {
        let fee = self.settings.transaction_fee();
        let value = match deduct_fee {
            true => amount.saturating_sub(fee),
            false => amount,
        };
        if value == 0 {
            return Ok(None);
        }

        info!("PAYING {value} to {address}");
        let transaction = self
            .chain
            .create_transaction(&address, value, fee, head_height)
            .await?;
        let transaction_hash = transaction.hash();
        self.store
            .add_payout(
                user_id,
                amount,
                self.time_provider.millis_since_epoch(),
                transaction_hash,
            )
            .await?;
        self.chain.push_transaction(&transaction).await?;
        Ok(Some(SentPayout {
            user_id,
            address,
            amount,
            value,
            transaction_hash,
        }))
    }

    async fn operator_residual(&self, confirmed_height: u32) -> Result<i128, PayoutError> {
        let wallet = self.chain.balance(&self.settings.pool_address).await?;
        let owed: u128 = self
            .store
            .get_user_balances_above(Some(confirmed_height), 0)?
            .iter()
            .map(|balance| u128::from(balance.balance))
            .sum();
        Ok(i128::from(wallet) - owed as i128)
    }
}

/// Wait until the node has had time to relay what was sent from `wallet`.
///
/// Returns `grace` after the call unless a relayed transaction from the
/// wallet arrives, each of which pushes the deadline to `quiet` after it.
pub async fn wait_for_relays(
    events: &mut mpsc::UnboundedReceiver<ChainEvent>,
    wallet: &Address,
    grace: Duration,
    quiet: Duration,
) {
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => return,
            event = events.recv() => match event {
                Some(ChainEvent::TransactionRelayed(transaction)) if transaction.sender == *wallet => {
                    deadline.as_mut().reset(Instant::now() + quiet);
                }
                Some(_) => {}
                None => {
                    deadline.await;
                    return;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::port::MockBlockchainPort;
    use crate::chain::Transaction;
    use crate::test_utils::{pool_address, setup_test_store, test_block, test_child_block};
    use crate::utils::time_provider::SystemTimeProvider;
    use rust_decimal_macros::dec;

    fn settings() -> PayoutSettings {
        PayoutSettings {
            pool_address: pool_address(),
            pool_fee: dec!(0.01),
            network_fee: 1,
            payout_confirmations: 10,
            auto_payout_limit: 5000,
            relay_grace: Duration::from_secs(30),
            relay_quiet: Duration::from_secs(10),
        }
    }

    fn signed(recipient: &Address, value: u64, fee: u64, height: u32) -> Transaction {
        Transaction {
            sender: pool_address(),
            recipient: *recipient,
            value,
            fee,
            validity_start_height: height,
            network_id: 42,
            proof: vec![7; 8],
        }
    }

    /// Chain where block 11 was mined by the pool with a 10_000 reward.
    fn chain_with_pool_block(mined: crate::chain::Block) -> MockBlockchainPort {
        let mut chain = MockBlockchainPort::new();
        chain.expect_head_height().returning(|| Ok(100));
        chain
            .expect_get_block()
            .returning(move |_, _| Ok(Some(mined.clone())));
        chain.expect_block_reward_at().returning(|_| Ok(10_000));
        chain
            .expect_create_transaction()
            .returning(|recipient, value, fee, height| Ok(signed(recipient, value, fee, height)));
        chain.expect_push_transaction().returning(|_| Ok(()));
        chain.expect_balance().returning(|_| Ok(20_000));
        chain
    }

    #[test_log::test(tokio::test)]
    async fn test_auto_payout_and_request() {
        let (_dir, store) = setup_test_store();
        let rich = store.get_or_create_user(Address([1; 20])).await.unwrap();
        let asking = store.get_or_create_user(Address([2; 20])).await.unwrap();
        let mined = test_child_block(&test_block(10), pool_address(), vec![]);
        let block_id = store
            .set_block_main_chain(mined.hash(), 11, 0, true)
            .await
            .unwrap();
        store
            .add_payins(block_id, vec![(rich, 6000), (asking, 1000)], 0)
            .await
            .unwrap();
        store.add_payout_request(asking, 0).await.unwrap();

        let engine = PayoutEngine::new(
            Arc::new(chain_with_pool_block(mined)),
            store.clone(),
            settings(),
            Arc::new(SystemTimeProvider),
        );
        let report = engine.run().await.unwrap();

        assert_eq!(report.auto_payouts, 1);
        assert_eq!(report.payout_requests, 1);
        assert_eq!(report.sent.len(), 2);
        // Auto payouts move the full balance, the pool pays the fee
        assert_eq!(report.sent[0].user_id, rich);
        assert_eq!(report.sent[0].value, 6000);
        // Requests pay the fee out of the balance
        assert_eq!(report.sent[1].user_id, asking);
        assert_eq!(report.sent[1].amount, 1000);
        assert_eq!(report.sent[1].value, 1000 - 138);

        assert_eq!(store.get_user_balance(rich, None).unwrap(), 0);
        assert_eq!(store.get_user_balance(asking, None).unwrap(), 0);
        assert!(!store.has_payout_request(asking).unwrap());
        assert_eq!(report.operator_residual, 20_000);
    }

    #[tokio::test]
    async fn test_request_too_small_for_fee_is_dropped() {
        let (_dir, store) = setup_test_store();
        let user = store.get_or_create_user(Address([1; 20])).await.unwrap();
        let mined = test_child_block(&test_block(10), pool_address(), vec![]);
        let block_id = store
            .set_block_main_chain(mined.hash(), 11, 0, true)
            .await
            .unwrap();
        store.add_payins(block_id, vec![(user, 100)], 0).await.unwrap();
        store.add_payout_request(user, 0).await.unwrap();

        let engine = PayoutEngine::new(
            Arc::new(chain_with_pool_block(mined)),
            store.clone(),
            settings(),
            Arc::new(SystemTimeProvider),
        );
        let report = engine.run().await.unwrap();
        assert!(report.sent.is_empty());
        assert!(!store.has_payout_request(user).unwrap());
        assert_eq!(store.get_user_balance(user, None).unwrap(), 100);
    }

    #[tokio::test]
    async fn test_payins_above_payable_abort_the_run() {
        let (_dir, store) = setup_test_store();
        let user = store.get_or_create_user(Address([1; 20])).await.unwrap();
        let mined = test_child_block(&test_block(10), pool_address(), vec![]);
        let block_id = store
            .set_block_main_chain(mined.hash(), 11, 0, true)
            .await
            .unwrap();
        // Payable is floor(0.99 * 10_000) = 9900
        store.add_payins(block_id, vec![(user, 9901)], 0).await.unwrap();

        let engine = PayoutEngine::new(
            Arc::new(chain_with_pool_block(mined)),
            store.clone(),
            settings(),
            Arc::new(SystemTimeProvider),
        );
        assert!(matches!(
            engine.run().await,
            Err(PayoutError::PayinInconsistency(_))
        ));
        assert!(store.get_payouts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_payins_for_foreign_block_abort_the_run() {
        let (_dir, store) = setup_test_store();
        let user = store.get_or_create_user(Address([1; 20])).await.unwrap();
        let foreign = test_block(11);
        let block_id = store
            .set_block_main_chain(foreign.hash(), 11, 0, true)
            .await
            .unwrap();
        store.add_payins(block_id, vec![(user, 1)], 0).await.unwrap();

        let engine = PayoutEngine::new(
            Arc::new(chain_with_pool_block(foreign)),
            store,
            settings(),
            Arc::new(SystemTimeProvider),
        );
        assert!(matches!(
            engine.validate_payins().await,
            Err(PayoutError::PayinInconsistency(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_relayed_transactions_extend_the_wait() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(25)).await;
            let tx = signed(&Address([1; 20]), 1, 1, 1);
            events_tx.send(ChainEvent::TransactionRelayed(tx)).unwrap();
            // Keep the channel open past the deadline
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        wait_for_relays(
            &mut events_rx,
            &pool_address(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(35) && waited < Duration::from_secs(36));
        sender.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_relays_do_not_extend_the_wait() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let start = Instant::now();
        let mut tx = signed(&Address([1; 20]), 1, 1, 1);
        tx.sender = Address([9; 20]);
        events_tx
            .send(ChainEvent::TransactionRelayed(tx))
            .unwrap();

        wait_for_relays(
            &mut events_rx,
            &pool_address(),
            Duration::from_secs(30),
            Duration::from_secs(10),
        )
        .await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
    }
}
