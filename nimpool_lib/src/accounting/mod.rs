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

//! Pool accounting: crediting block rewards to miners and paying them out.

pub mod payout;
pub mod pplns;
pub mod reward;
pub mod validate;

pub use payout::{PayoutEngine, PayoutError, PayoutReport, PayoutSettings, wait_for_relays};
pub use pplns::{Distribution, RewardDistributor};
pub use reward::payable_reward;
pub use validate::PayoutValidator;
