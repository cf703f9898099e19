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


//! Chain events from head polling.
//!
//! The node is asked for its head on an interval. A new head is walked back
//! to the last block the tracker knows on its main chain. Blocks above that
//! fork point are reported as reverted, highest first, then every block of
//! the new branch is reported as a head change, lowest first.

use nimpool_lib::chain::{Block, BlockchainPort, ChainError, ChainEvent, Hash};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Main chain blocks remembered for fork detection.
pub const TRACKED_BLOCKS: usize = 128;

/// Recent main chain, oldest first.
pub struct HeadTracker {
    recent: VecDeque<Block>,
}

impl HeadTracker {
    pub fn new(head: Block) -> Self {
        let mut recent = VecDeque::with_capacity(TRACKED_BLOCKS);
        recent.push_back(head.to_light());
        Self { recent }
    }

    pub fn head(&self) -> Option<&Block> {
        self.recent.back()
    }

    fn position(&self, hash: &Hash) -> Option<usize> {
        self.recent.iter().rposition(|block| block.hash() == *hash)
    }

    /// Move to `head` and return the events that describe the move.
    pub async fn advance(
        &mut self,
        chain: &dyn BlockchainPort,
        head: Block,
    ) -> Result<Vec<ChainEvent>, ChainError> {
        let head = head.to_light();
        if self.head().is_some_and(|known| known.hash() == head.hash()) {
            return Ok(Vec::new());
        }

        // Head moved back onto a block we already know
        if let Some(index) = self.position(&head.hash()) {
            let mut events = self.revert_above(index);
            events.push(ChainEvent::HeadChanged(head));
            return Ok(events);
        }

        let oldest_height = self.recent.front().map_or(0, Block::height);
        let mut branch = vec![head];
        let fork = loop {
            let Some(lowest) = branch.last() else {
                break None;
            };
            if let Some(index) = self.position(lowest.prev_hash()) {
                break Some(index);
            }
            if lowest.height() <= oldest_height || branch.len() > TRACKED_BLOCKS {
                break None;
            }
            let prev_hash = *lowest.prev_hash();
            match chain.get_block(&prev_hash, false).await? {
                Some(prev) => branch.push(prev),
                None => return Err(ChainError::NotFound(format!("block {prev_hash}"))),
            }
        };

        let mut events = match fork {
            Some(index) => self.revert_above(index),
            None => {
                warn!("New head does not connect to tracked chain, starting over");
                self.recent.clear();
                branch.truncate(1);
                Vec::new()
            }
        };
        for block in branch.into_iter().rev() {
            self.recent.push_back(block.clone());
            events.push(ChainEvent::HeadChanged(block));
        }
        while self.recent.len() > TRACKED_BLOCKS {
            self.recent.pop_front();
        }
        Ok(events)
    }

    fn revert_above(&mut self, index: usize) -> Vec<ChainEvent> {
        let reverted = self.recent.split_off(index + 1);
        reverted
            .into_iter()
            .rev()
            .map(ChainEvent::BlockReverted)
            .collect()
    }
}

/// Poll `chain` every `interval` and send what changed on `events_tx`.
///
/// [`ChainEvent::Established`] is sent once, the first time the node
/// reports consensus. Head tracking starts from the head seen then.
pub fn start_head_poller(
    chain: Arc<dyn BlockchainPort>,
    interval: Duration,
    events_tx: mpsc::Sender<ChainEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut tracker: Option<HeadTracker> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.changed() => {
                    info!("Stopping head polling");
                    return;
                }
            }
            let events = match poll_once(chain.as_ref(), &mut tracker).await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to poll node head: {e}");
                    continue;
                }
            };
            for event in events {
                if events_tx.send(event).await.is_err() {
                    debug!("Chain event receiver closed");
                    return;
                }
            }
        }
    })
}

async fn poll_once(
    chain: &dyn BlockchainPort,
    tracker: &mut Option<HeadTracker>,
) -> Result<Vec<ChainEvent>, ChainError> {
    match tracker {
        Some(tracker) => {
            let head = chain.head().await?;
            tracker.advance(chain, head).await
        }
        None => {
            if !chain.is_established().await? {
                return Ok(Vec::new());
            }
            let head = chain.head().await?;
            info!("Node established at {} height {}", head.hash(), head.height());
            *tracker = Some(HeadTracker::new(head));
            Ok(vec![ChainEvent::Established])
        }
    }
}
