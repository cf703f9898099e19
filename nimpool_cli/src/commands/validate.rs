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


use super::PayoutContext;
use nimpool_lib::accounting::payout::SentPayout;
use nimpool_lib::accounting::{PayoutSettings, PayoutValidator, wait_for_relays};
use nimpool_lib::utils::time_provider::SystemTimeProvider;
use std::error::Error;
use std::sync::Arc;
use tracing::info;

pub fn format_repaid(repaid: &[SentPayout]) -> String {
    let mut output = format!("Payouts re-sent ({}):\n", repaid.len());
    for sent in repaid {
        output.push_str(&format!(
            "user {} {} value {} tx {}\n",
            sent.user_id, sent.address, sent.value, sent.transaction_hash
        ));
    }
    output
}

/// Re-send payouts the node lost and wait for them to relay.
pub async fn execute(mut ctx: PayoutContext) -> Result<(), Box<dyn Error>> {
    let settings = PayoutSettings::from_config(&ctx.config);
    let validator = PayoutValidator::new(
        ctx.chain.clone(),
        ctx.store.clone(),
        settings.clone(),
        Arc::new(SystemTimeProvider),
    );

    let repaid = validator.run().await?;
    println!("{}", format_repaid(&repaid));
    if repaid.is_empty() {
        info!("All payouts are known to the node");
        return Ok(());
    }

    wait_for_relays(
        &mut ctx.relays,
        &settings.pool_address,
        settings.relay_grace,
        settings.relay_quiet,
    )
    .await;
    Ok(())
}
