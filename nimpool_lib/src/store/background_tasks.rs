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


use crate::chain::BlockchainPort;
use crate::store::StoreHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// What to keep when pruning shares.
#[derive(Debug, Clone, Copy)]
pub struct PruneSettings {
    pub frequency: Duration,
    pub payout_confirmations: u32,
    pub share_retention_blocks: u32,
    pub pplns_shares: usize,
}

/// Height below which shares can go. Shares must outlive the confirmation
/// depth and the retention depth, and nothing still inside the PPLNS
/// window at the head is ever removed.
pub fn prune_cutoff(
    head_height: u32,
    payout_confirmations: u32,
    share_retention_blocks: u32,
    window_oldest_height: Option<u32>,
) -> u32 {
    let by_depth = head_height.saturating_sub(payout_confirmations.max(share_retention_blocks));
    match window_oldest_height {
        Some(oldest) => by_depth.min(oldest),
        None => by_depth,
    }
}

/// Start a tokio task that prunes old shares every `frequency` until
/// shutdown is signalled.
pub fn start_background_tasks(
    store: StoreHandle,
    chain: Arc<dyn BlockchainPort>,
    settings: PruneSettings,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(settings.frequency);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("Stopping share pruning");
                    return;
                }
            }
            debug!("Running background cleanup tasks");
            if let Err(e) = prune_once(&store, chain.as_ref(), &settings).await {
                error!("Error running shares cleanup: {e}");
            }
        }
    })
}

async fn prune_once(
    store: &StoreHandle,
    chain: &dyn BlockchainPort,
    settings: &PruneSettings,
) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
    let head_height = chain.head_height().await?;
    let window = store.get_pplns_window(head_height, settings.pplns_shares)?;
    let cutoff = prune_cutoff(
        head_height,
        settings.payout_confirmations,
        settings.share_retention_blocks,
        window.oldest_height,
    );
    let removed = store.prune_shares(cutoff).await?;
    info!("Pruned {removed} shares below height {cutoff}");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::port::MockBlockchainPort;
    use crate::chain::{Hash, HASH_SIZE};
    use crate::store::{NewShare, Store};
    use rust_decimal_macros::dec;
    use tempfile::tempdir;

    #[test]
    fn test_prune_cutoff_keeps_confirmation_depth() {
        assert_eq!(prune_cutoff(100, 10, 20, None), 80);
        assert_eq!(prune_cutoff(100, 30, 20, None), 70);
        assert_eq!(prune_cutoff(5, 10, 20, None), 0);
    }

    #[test]
    fn test_prune_cutoff_keeps_pplns_window() {
        assert_eq!(prune_cutoff(100, 10, 20, Some(50)), 50);
        assert_eq!(prune_cutoff(100, 10, 20, Some(95)), 80);
    }

    #[tokio::test]
    async fn test_prune_once_removes_only_old_shares() {
        let temp_dir = tempdir().unwrap();
        let store = StoreHandle::spawn(Arc::new(
            Store::new(temp_dir.path().to_str().unwrap().to_string(), false).unwrap(),
        ));
        let mut shares = Vec::new();
        for height in [1u32, 50, 99] {
            let block_id = store
                .set_block_main_chain(Hash([height as u8; HASH_SIZE]), height, 0, true)
                .await
                .unwrap();
            shares.push(NewShare {
                user_id: 1,
                device_id: 0,
                datetime: 0,
                prev_block_id: block_id,
                prev_block_height: height,
                difficulty: dec!(1),
                hash: Hash([height as u8 + 100; HASH_SIZE]),
            });
        }
        store.add_shares(shares).await.unwrap();

        let mut chain = MockBlockchainPort::new();
        chain.expect_head_height().returning(|| Ok(100));
        let settings = PruneSettings {
            frequency: Duration::from_secs(60),
            payout_confirmations: 10,
            share_retention_blocks: 20,
            pplns_shares: 1,
        };
        assert_eq!(prune_once(&store, &chain, &settings).await.unwrap(), 2);
        assert!(store.contains_share(1, &Hash([199u8; HASH_SIZE])).unwrap());
        assert!(!store.contains_share(1, &Hash([150u8; HASH_SIZE])).unwrap());
    }
}
