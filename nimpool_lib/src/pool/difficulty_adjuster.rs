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

//! Per connection variable difficulty.
//!
//! The adjuster counts shares since the last reset and compares the observed
//! share rate with the pool's desired shares per second. When the miner is
//! more than twice as fast the difficulty goes up by 20%, when it is more
//! than twice as slow (or silent) it comes down by 20%, never below the pool
//! floor and never above the optional ceiling.

use crate::chain::target::DIFFICULTY_SCALE;
use crate::utils::time_provider::TimeProvider;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::debug;

/// Factor applied on each step up or down.
pub const ADJUSTMENT_FACTOR: Decimal = dec!(1.2);

/// Shares required before the share path may trigger an early recalculation.
pub const MIN_SHARES_BEFORE_EARLY_ADJUST: u32 = 3;

pub struct DifficultyAdjuster {
    shares_since_reset: u32,
    /// Milliseconds since epoch of the last reset
    last_reset: u64,
    current_difficulty: Decimal,
    min_difficulty: Decimal,
    max_difficulty: Option<Decimal>,
    desired_sps: Decimal,
    time_provider: Arc<dyn TimeProvider>,
}

impl DifficultyAdjuster {
    pub fn new(
        start_difficulty: Decimal,
        min_difficulty: Decimal,
        max_difficulty: Option<Decimal>,
        desired_sps: Decimal,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let mut adjuster = Self {
            shares_since_reset: 0,
            last_reset: time_provider.millis_since_epoch(),
            current_difficulty: start_difficulty,
            min_difficulty,
            max_difficulty,
            desired_sps,
            time_provider,
        };
        adjuster.current_difficulty = adjuster.apply_difficulty_constraints(start_difficulty);
        adjuster
    }

    pub fn current_difficulty(&self) -> Decimal {
        self.current_difficulty
    }

    pub fn shares_since_reset(&self) -> u32 {
        self.shares_since_reset
    }

    /// Restart the measurement window without touching the difficulty.
    pub fn reset(&mut self) {
        self.shares_since_reset = 0;
        self.last_reset = self.time_provider.millis_since_epoch();
    }

    /// Observed shares per second since the last reset.
    pub fn shares_per_second(&self) -> Option<Decimal> {
        let elapsed = self
            .time_provider
            .millis_since_epoch()
            .abs_diff(self.last_reset);
        if elapsed == 0 {
            return None;
        }
        Some(Decimal::from(self.shares_since_reset) * dec!(1000) / Decimal::from(elapsed))
    }

    /// Count a share. Returns true when the miner is already running so fast
    /// that the difficulty should be recalculated now instead of on the timer.
    pub fn record_share(&mut self) -> bool {
        self.shares_since_reset += 1;
        if self.shares_since_reset <= MIN_SHARES_BEFORE_EARLY_ADJUST {
            return false;
        }
        match self.shares_per_second() {
            Some(sps) => sps > self.desired_sps * dec!(2),
            None => true,
        }
    }

    /// Recalculate the difficulty from the rate since the last reset, then
    /// reset. Returns the new difficulty if it changed.
    ///
    /// Right after a reset there is no rate to judge, so nothing changes and
    /// the window keeps running.
    pub fn recalculate(&mut self) -> Option<Decimal> {
        let sps = self.shares_per_second()?;
        debug!(
            "Shares per second {} at difficulty {}",
            sps.round_dp(2),
            self.current_difficulty
        );

        let next = if sps > self.desired_sps * dec!(2) {
            Some(self.current_difficulty * ADJUSTMENT_FACTOR)
        } else if sps.is_zero() || self.desired_sps > sps * dec!(2) {
            Some(self.current_difficulty / ADJUSTMENT_FACTOR)
        } else {
            None
        };
        self.reset();

        let next = self.apply_difficulty_constraints(next?);
        if next == self.current_difficulty {
            return None;
        }
        self.current_difficulty = next;
        Some(next)
    }

    fn apply_difficulty_constraints(&self, difficulty: Decimal) -> Decimal {
        let mut difficulty = difficulty.round_dp(DIFFICULTY_SCALE).max(self.min_difficulty);
        if let Some(max) = self.max_difficulty {
            difficulty = difficulty.min(max);
        }
        difficulty.normalize()
    }
}
