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

//! Re-sends payouts whose transaction never made it onto the chain.

use super::payout::{PayoutError, PayoutSettings, SentPayout};
use crate::chain::BlockchainPort;
use crate::store::StoreHandle;
use crate::utils::time_provider::TimeProvider;
use std::sync::Arc;
use tracing::{info, warn};

pub struct PayoutValidator {
    chain: Arc<dyn BlockchainPort>,
    store: StoreHandle,
    settings: PayoutSettings,
    time_provider: Arc<dyn TimeProvider>,
}

impl PayoutValidator {
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

    /// Look up every recorded payout at the node. Each one the node does not
    /// know is paid again for the same amount, recorded anew and its old
    /// record dropped. Returns the replacement payouts.
    pub async fn run(&self) -> Result<Vec<SentPayout>, PayoutError> {
        let payouts = self.store.get_payouts()?;
        info!("Validating {} payouts", payouts.len());
        let head_height = self.chain.head_height().await?;
        let fee = self.settings.transaction_fee();
        let mut repaid = Vec::new();

        for payout in payouts {
            if self
                .chain
                .get_transaction_by_hash(&payout.transaction_hash)
                .await?
                .is_some()
            {
                continue;
            }
            let Some((_, address)) = self
                .store
                .get_addresses_for_user_ids(&[payout.user_id])?
                .into_iter()
                .next()
            else {
                warn!(
                    "Payout {} belongs to unknown user {}",
                    payout.id, payout.user_id
                );
                continue;
            };

            warn!(
                "Transaction {} for payout {} not found, paying {} to {address} again",
                payout.transaction_hash, payout.id, payout.amount
            );
            let transaction = self
                .chain
                .create_transaction(&address, payout.amount, fee, head_height)
                .await?;
            let transaction_hash = transaction.hash();
            self.store
                .add_payout(
                    payout.user_id,
                    payout.amount,
                    self.time_provider.millis_since_epoch(),
                    transaction_hash,
                )
                .await?;
            self.chain.push_transaction(&transaction).await?;
            self.store.remove_payout(payout.id).await?;

            repaid.push(SentPayout {
                user_id: payout.user_id,
                address,
                amount: payout.amount,
                value: payout.amount,
                transaction_hash,
            });
        }
        Ok(repaid)
    }
}
