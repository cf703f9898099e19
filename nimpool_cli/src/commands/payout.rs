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
use nimpool_lib::accounting::{PayoutEngine, PayoutReport, PayoutSettings, wait_for_relays};
use nimpool_lib::utils::time_provider::SystemTimeProvider;
use std::error::Error;
use std::sync::Arc;
use tracing::info;

/// Format a payout run as a human-readable summary.
pub fn format_report(report: &PayoutReport) -> String {
    let mut output = String::with_capacity(report.sent.len() * 100 + 200);

    output.push_str(&format!(
        "Payouts sent ({} automatic, {} requested):\n",
        report.auto_payouts, report.payout_requests
    ));
    output.push_str(&format!("{}\n", "=".repeat(72)));
    if report.sent.is_empty() {
        output.push_str("Nothing to pay\n");
    }
    for sent in &report.sent {
        output.push_str(&format!(
            "user {} {} amount {} value {} tx {}\n",
            sent.user_id, sent.address, sent.amount, sent.value, sent.transaction_hash
        ));
    }
    output.push_str(&format!("Operator residual: {}\n", report.operator_residual));
    output
}

/// Run one payout pass and wait for the node to relay what was sent.
pub async fn execute(mut ctx: PayoutContext) -> Result<(), Box<dyn Error>> {
    let settings = PayoutSettings::from_config(&ctx.config);
    let engine = PayoutEngine::new(
        ctx.chain.clone(),
        ctx.store.clone(),
        settings.clone(),
        Arc::new(SystemTimeProvider),
    );

    let report = engine.run().await?;
    println!("{}", format_report(&report));
    if report.is_empty() {
        info!("No payouts sent");
        return Ok(());
    }

    info!("Waiting for payout transactions to relay");
    wait_for_relays(
        &mut ctx.relays,
        &settings.pool_address,
        settings.relay_grace,
        settings.relay_quiet,
    )
    .await;
    info!("Payout run complete");
    Ok(())
}
