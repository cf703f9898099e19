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

use crate::chain::{Block, BlockchainPort, ChainError};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

/// Part of a block's reward the pool distributes:
/// `floor((1 - pool_fee) * (block_reward + fees))`.
pub fn payable_reward(block_reward: u64, fees: u64, pool_fee: Decimal) -> u64 {
    let total = Decimal::from(block_reward) + Decimal::from(fees);
    let keep = (Decimal::ONE - pool_fee).max(Decimal::ZERO);
    (total * keep).floor().to_u64().unwrap_or(0)
}

/// Payable reward of a full block, asking the node for the block reward at
/// its height.
pub async fn payable_block_reward(
    chain: &dyn BlockchainPort,
    block: &Block,
    pool_fee: Decimal,
) -> Result<u64, ChainError> {
    let block_reward = chain.block_reward_at(block.height()).await?;
    let fees = block.body.as_ref().map(|body| body.total_fees()).unwrap_or(0);
    Ok(payable_reward(block_reward, fees, pool_fee))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_payable_reward_rounds_down() {
        assert_eq!(payable_reward(1000, 0, dec!(0.01)), 990);
        assert_eq!(payable_reward(1001, 0, dec!(0.01)), 990);
        assert_eq!(payable_reward(1000, 500, dec!(0.01)), 1485);
    }

    #[test]
    fn test_payable_reward_edges() {
        assert_eq!(payable_reward(1000, 0, Decimal::ZERO), 1000);
        assert_eq!(payable_reward(1000, 0, Decimal::ONE), 0);
        assert_eq!(payable_reward(0, 0, dec!(0.01)), 0);
    }
}
