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

//! Batched share persistence.
//!
//! Agents hand accepted shares to the [`ShareWriter`] and wait for the flush
//! that wrote them. A share arriving after a quiet period is written at once,
//! otherwise it joins the queue and goes out at most one insert interval
//! later. An in-memory set catches a share submitted twice before it reaches
//! the store, the store's own uniqueness check catches the rest.

use crate::chain::Hash;
use crate::store::{NewShare, StoreError, StoreHandle};
use crate::utils::time_provider::TimeProvider;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;
use tracing::{debug, error};

pub const INSERT_INTERVAL: Duration = Duration::from_secs(1);

/// Blocks below the head for which submitted share hashes are remembered.
pub const SEEN_RETENTION_BLOCKS: u32 = 10;

/// A share that passed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedShare {
    pub user_id: u64,
    pub device_id: u32,
    pub prev_hash: Hash,
    pub prev_height: u32,
    /// Seconds since epoch, from the prev block header
    pub prev_timestamp: u32,
    pub difficulty: Decimal,
    pub hash: Hash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SeenKey {
    prev_height: u32,
    user_id: u64,
    prev_hash: Hash,
    hash: Hash,
}

type FlushReply = oneshot::Sender<Result<(), StoreError>>;

#[derive(Default)]
struct WriterState {
    queue: Vec<(NewShare, FlushReply)>,
    seen: HashSet<SeenKey>,
    last_insert: Option<Instant>,
    flush_scheduled: bool,
    last_known_height: u32,
}

pub struct ShareWriter {
    store: StoreHandle,
    state: Mutex<WriterState>,
    /// Held for the duration of a flush so flushes never overlap.
    flush_lock: Mutex<()>,
    time_provider: Arc<dyn TimeProvider>,
}

impl ShareWriter {
    pub fn new(store: StoreHandle, time_provider: Arc<dyn TimeProvider>) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: Mutex::new(WriterState::default()),
            flush_lock: Mutex::new(()),
            time_provider,
        })
    }

    /// Queue a share and wait until it has been written.
    ///
    /// Returns [`StoreError::DuplicateShare`] if the same user already
    /// submitted this share, whether it is still queued or already stored.
    pub async fn submit(self: &Arc<Self>, share: AcceptedShare) -> Result<(), StoreError> {
        let key = SeenKey {
            prev_height: share.prev_height,
            user_id: share.user_id,
            prev_hash: share.prev_hash,
            hash: share.hash,
        };
        if !self.state.lock().await.seen.insert(key) {
            debug!("Share {} from user {} already seen", share.hash, share.user_id);
            return Err(StoreError::DuplicateShare);
        }

        let prev_block_id = match self.prev_block_id(&share).await {
            Ok(id) => id,
            Err(e) => {
                self.state.lock().await.seen.remove(&key);
                return Err(e);
            }
        };
        let new_share = NewShare {
            user_id: share.user_id,
            device_id: share.device_id,
            datetime: self.time_provider.millis_since_epoch(),
            prev_block_id,
            prev_block_height: share.prev_height,
            difficulty: share.difficulty,
            hash: share.hash,
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let flush_now = {
            let mut state = self.state.lock().await;
            state.queue.push((new_share, reply_tx));
            let now = Instant::now();
            match state.last_insert {
                None => true,
                Some(last) if now.duration_since(last) >= INSERT_INTERVAL => true,
                Some(last) => {
                    if !state.flush_scheduled {
                        state.flush_scheduled = true;
                        let writer = self.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep_until(last + INSERT_INTERVAL).await;
                            writer.flush().await;
                        });
                    }
                    false
                }
            }
        };
        if flush_now {
            self.flush().await;
        }

        reply_rx.await.map_err(|_| StoreError::ChannelClosed)?
    }

    /// Write everything queued in one batch and answer each waiting caller.
    pub async fn flush(&self) {
        let _flushing = self.flush_lock.lock().await;
        let queued = {
            let mut state = self.state.lock().await;
            state.last_insert = Some(Instant::now());
            state.flush_scheduled = false;
            std::mem::take(&mut state.queue)
        };
        if queued.is_empty() {
            return;
        }

        let (shares, replies): (Vec<NewShare>, Vec<FlushReply>) = queued.into_iter().unzip();
        debug!("Writing {} shares", shares.len());
        match self.store.add_shares(shares).await {
            Ok(written) => {
                for (reply, stored) in replies.into_iter().zip(written) {
                    let result = match stored {
                        true => Ok(()),
                        false => Err(StoreError::DuplicateShare),
                    };
                    let _ = reply.send(result);
                }
            }
            Err(e) => {
                error!("Failed to write shares: {e}");
                for reply in replies {
                    let _ = reply.send(Err(e.clone()));
                }
            }
        }
    }

    /// Forget share hashes mined on blocks below `height`.
    pub async fn forget_below(&self, height: u32) {
        self.state
            .lock()
            .await
            .seen
            .retain(|key| key.prev_height >= height);
    }

    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Store id of the share's parent block. Blocks above the highest one
    /// seen so far are created on the fly.
    async fn prev_block_id(&self, share: &AcceptedShare) -> Result<u64, StoreError> {
        let last_known_height = self.state.lock().await.last_known_height;
        if share.prev_height <= last_known_height {
            if let Some(block) = self.store.get_block_by_hash(&share.prev_hash)? {
                return Ok(block.id);
            }
        }
        let id = self
            .store
            .get_or_create_block(
                share.prev_hash,
                share.prev_height,
                u64::from(share.prev_timestamp),
            )
            .await?;
        let mut state = self.state.lock().await;
        state.last_known_height = state.last_known_height.max(share.prev_height);
        Ok(id)
    }
}
