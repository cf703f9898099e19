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

//! Serialized processing of chain head changes.
//!
//! Every [`ChainEvent`] is handled by one task, in the order the node emitted
//! them, so a block is never relabelled while the previous head is still
//! being processed.

use crate::accounting::RewardDistributor;
use crate::chain::{Block, BlockchainPort, ChainEvent};
use crate::pool::connections::ConnectionsHandle;
use crate::pool::job::{JobSender, fetch_job};
use crate::pool::share_writer::{SEEN_RETENTION_BLOCKS, ShareWriter};
use crate::store::{StoreError, StoreHandle};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

pub struct HeadProcessor {
    chain: Arc<dyn BlockchainPort>,
    store: StoreHandle,
    share_writer: Arc<ShareWriter>,
    connections: ConnectionsHandle,
    job_tx: JobSender,
    distributor: RewardDistributor,
}

impl HeadProcessor {
    pub fn new(
        chain: Arc<dyn BlockchainPort>,
        store: StoreHandle,
        share_writer: Arc<ShareWriter>,
        connections: ConnectionsHandle,
        job_tx: JobSender,
        distributor: RewardDistributor,
    ) -> Self {
        Self {
            chain,
            store,
            share_writer,
            connections,
            job_tx,
            distributor,
        }
    }

    /// Publish a job on `head` and push it to nano and dumb miners. Returns
    /// false if shutdown interrupted the template request.
    pub async fn refresh_job(&self, head: &Block, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        let Some(job) = fetch_job(self.chain.as_ref(), head, shutdown_rx).await else {
            return false;
        };
        let job = Arc::new(job);
        self.job_tx.send_replace(Some(job.clone()));
        self.connections.broadcast_job(job).await;
        true
    }

    pub async fn handle_event(
        &self,
        event: ChainEvent,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<(), StoreError> {
        match event {
            ChainEvent::HeadChanged(head) => {
                info!("New head {} at {}", head.hash(), head.height());
                self.share_writer.flush().await;
                self.set_main_chain(&head, true).await?;
                if !self.refresh_job(&head, shutdown_rx).await {
                    return Ok(());
                }
                if let Err(e) = self.distributor.distribute(&head).await {
                    error!("Failed to distribute reward for block {}: {e}", head.hash());
                }
                self.share_writer
                    .forget_below(head.height().saturating_sub(SEEN_RETENTION_BLOCKS))
                    .await;
            }
            ChainEvent::BlockReverted(block) => {
                info!("Block {} at {} reverted", block.hash(), block.height());
                self.share_writer.flush().await;
                self.set_main_chain(&block, false).await?;
            }
            ChainEvent::Established => debug!("Consensus established"),
            ChainEvent::TransactionRelayed(_) => {}
        }
        Ok(())
    }

    async fn set_main_chain(&self, block: &Block, main_chain: bool) -> Result<u64, StoreError> {
        self.store
            .set_block_main_chain(
                block.hash(),
                block.height(),
                u64::from(block.header.timestamp),
                main_chain,
            )
            .await
    }
}

/// Consume chain events until the channel closes or shutdown is signalled.
pub fn start_head_processor(
    processor: HeadProcessor,
    mut events: mpsc::Receiver<ChainEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        info!("Chain event stream closed");
                        return;
                    }
                },
                _ = shutdown_rx.changed() => {
                    info!("Stopping head processing");
                    return;
                }
            };
            if let Err(e) = processor.handle_event(event, &mut shutdown_rx).await {
                error!("Failed to process chain event: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::port::MockBlockchainPort;
    use crate::pool::connections::start_connections_handler;
    use crate::pool::job::job_channel;
    use crate::test_utils::{pool_address, setup_test_store, test_block, test_child_block, test_template};
    use crate::utils::time_provider::SystemTimeProvider;
    use rust_decimal_macros::dec;

    fn processor(
        chain: MockBlockchainPort,
        store: StoreHandle,
    ) -> (HeadProcessor, crate::pool::job::JobReceiver) {
        let chain: Arc<dyn BlockchainPort> = Arc::new(chain);
        let time_provider = Arc::new(SystemTimeProvider);
        let (job_tx, job_rx) = job_channel();
        let distributor = RewardDistributor::new(
            store.clone(),
            chain.clone(),
            pool_address(),
            dec!(0.01),
            1000,
            time_provider.clone(),
        );
        let processor = HeadProcessor::new(
            chain,
            store.clone(),
            ShareWriter::new(store, time_provider),
            start_connections_handler(),
            job_tx,
            distributor,
        );
        (processor, job_rx)
    }

    #[test_log::test(tokio::test)]
    async fn test_head_change_publishes_job_and_pays_in() {
        let (_dir, store) = setup_test_store();
        let miner = store
            .get_or_create_user(crate::chain::Address([1; 20]))
            .await
            .unwrap();
        let prev = test_block(10);
        let prev_id = store
            .set_block_main_chain(prev.hash(), 10, 0, true)
            .await
            .unwrap();
        store
            .add_share(crate::store::NewShare {
                user_id: miner,
                device_id: 0,
                datetime: 0,
                prev_block_id: prev_id,
                prev_block_height: 10,
                difficulty: dec!(1),
                hash: crate::chain::Hash([5; 32]),
            })
            .await
            .unwrap();

        let head = test_child_block(&prev, pool_address(), vec![]);
        let template = test_template(&head, vec![]);
        let mut chain = MockBlockchainPort::new();
        chain
            .expect_get_next_block()
            .returning(move || Ok(template.clone()));
        chain.expect_block_reward_at().returning(|_| Ok(1000));
        let (processor, job_rx) = processor(chain, store.clone());

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        processor
            .handle_event(ChainEvent::HeadChanged(head.clone()), &mut shutdown_rx)
            .await
            .unwrap();

        let stored = store.get_block_by_hash(&head.hash()).unwrap().unwrap();
        assert!(stored.main_chain);
        let job = job_rx.borrow().clone().unwrap();
        assert_eq!(job.prev_block, head.to_light());
        assert_eq!(store.get_user_balance(miner, None).unwrap(), 990);
    }

    #[test_log::test(tokio::test)]
    async fn test_revert_relabels_block() {
        let (_dir, store) = setup_test_store();
        let block = test_block(20);
        store
            .set_block_main_chain(block.hash(), 20, 0, true)
            .await
            .unwrap();
        let (processor, _job_rx) = processor(MockBlockchainPort::new(), store.clone());

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        processor
            .handle_event(ChainEvent::BlockReverted(block.clone()), &mut shutdown_rx)
            .await
            .unwrap();
        assert!(!store.get_block_by_hash(&block.hash()).unwrap().unwrap().main_chain);
    }
}
