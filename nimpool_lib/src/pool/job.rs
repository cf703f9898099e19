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

//! The work the pool hands to nano and dumb miners.

use crate::chain::{Block, BlockBody, BlockHeader, BlockInterlink, BlockchainPort};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Delay between attempts when the node fails to produce a template.
pub const TEMPLATE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Current head and the next block template built on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    /// Light block the template extends
    pub prev_block: Block,
    /// Full template paying to the pool address
    pub template: Block,
}

/// A job with the miner's own extra data swapped into the body.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonalJob {
    pub header: BlockHeader,
    pub interlink: BlockInterlink,
    pub body: BlockBody,
}

impl Job {
    pub fn new(prev_block: Block, template: Block) -> Self {
        Self {
            prev_block: prev_block.to_light(),
            template,
        }
    }

    /// Rebuild the template body as `(miner, transactions, extra_data,
    /// pruned accounts)` and point the header at the new body hash.
    /// Returns None for a template without a body.
    pub fn personalise(&self, extra_data: &[u8]) -> Option<PersonalJob> {
        let template_body = self.template.body.as_ref()?;
        let body = BlockBody {
            miner_addr: template_body.miner_addr,
            extra_data: extra_data.to_vec(),
            transactions: template_body.transactions.clone(),
            pruned_accounts: template_body.pruned_accounts.clone(),
        };
        let mut header = self.template.header.clone();
        header.body_hash = body.hash();
        Some(PersonalJob {
            header,
            interlink: self.template.interlink.clone(),
            body,
        })
    }
}

/// Latest job, shared with every agent.
pub type JobReceiver = watch::Receiver<Option<Arc<Job>>>;
pub type JobSender = watch::Sender<Option<Arc<Job>>>;

pub fn job_channel() -> (JobSender, JobReceiver) {
    watch::channel(None)
}

/// Ask the node for a template on top of `prev_block`, retrying every
/// [`TEMPLATE_RETRY_INTERVAL`] until it answers. Returns None if shutdown is
/// signalled first or the shutdown sender is gone.
pub async fn fetch_job(
    chain: &dyn BlockchainPort,
    prev_block: &Block,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Option<Job> {
    loop {
        match chain.get_next_block().await {
            Ok(template) if template.is_full() => {
                debug!(
                    "New block template at height {} on {}",
                    template.height(),
                    prev_block.hash()
                );
                return Some(Job::new(prev_block.clone(), template));
            }
            Ok(_) => warn!("Node returned a block template without a body, retrying"),
            Err(e) => warn!("Failed to get block template: {e}, retrying"),
        }
        tokio::select! {
            _ = tokio::time::sleep(TEMPLATE_RETRY_INTERVAL) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::port::MockBlockchainPort;
    use crate::chain::{ChainError, Encode};
    use crate::test_utils::{test_block, test_template};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_personalise_swaps_extra_data() {
        let prev = test_block(10);
        let template = test_template(&prev, vec![]);
        let job = Job::new(prev, template.clone());

        let personal = job.personalise(b"mine").unwrap();
        assert_eq!(personal.body.extra_data, b"mine".to_vec());
        assert_eq!(personal.header.body_hash, personal.body.hash());
        assert_ne!(personal.header.body_hash, template.header.body_hash);
        assert_eq!(personal.header.prev_hash, template.header.prev_hash);
        assert_eq!(personal.header.height, template.header.height);
        assert!(!job.prev_block.is_full());
        assert!(personal.body.to_bytes().len() > 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_job_retries_until_template_arrives() {
        let prev = test_block(10);
        let template = test_template(&prev, vec![]);
        let calls = Arc::new(AtomicUsize::new(0));

        let mut chain = MockBlockchainPort::new();
        let counter = calls.clone();
        chain.expect_get_next_block().returning(move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(ChainError::Rpc("busy".to_string()))
            } else {
                Ok(template.clone())
            }
        });

        let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let job = fetch_job(&chain, &prev, &mut shutdown_rx).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(job.template.height(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_job_stops_on_shutdown() {
        let prev = test_block(10);
        let mut chain = MockBlockchainPort::new();
        chain
            .expect_get_next_block()
            .returning(|| Err(ChainError::Rpc("down".to_string())));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let fetch = tokio::spawn(async move { fetch_job(&chain, &prev, &mut shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown_tx.send(true).unwrap();
        assert!(fetch.await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_job_stops_when_shutdown_sender_is_dropped() {
        let prev = test_block(10);
        let mut chain = MockBlockchainPort::new();
        chain
            .expect_get_next_block()
            .times(1)
            .returning(|| Err(ChainError::Rpc("down".to_string())));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        assert!(fetch_job(&chain, &prev, &mut shutdown_rx).await.is_none());
    }
}
