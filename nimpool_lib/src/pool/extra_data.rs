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

//! Extra data the pool asks each miner to put in its block body.
//!
//! The bytes identify the pool, the miner address, the session and the
//! difficulty the session was given, so a smart miner's share proves which
//! difficulty it was mined at.

use crate::chain::merkle::MerklePath;
use crate::chain::target::{difficulty_to_target, target_to_compact};
use crate::chain::{Address, Hash};
use rust_decimal::Decimal;

/// `pool_name || 0x00 || address || u32_be(session_nonce) || u32_be(compact(difficulty))`
pub fn build_extra_data(
    pool_name: &str,
    address: &Address,
    session_nonce: u32,
    difficulty: Decimal,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(pool_name.len() + 1 + address.as_bytes().len() + 8);
    out.extend_from_slice(pool_name.as_bytes());
    out.push(0);
    out.extend_from_slice(address.as_bytes());
    out.extend_from_slice(&session_nonce.to_be_bytes());
    out.extend_from_slice(&difficulty_compact(difficulty).to_be_bytes());
    out
}

pub fn difficulty_compact(difficulty: Decimal) -> u32 {
    target_to_compact(&difficulty_to_target(difficulty))
}

#[derive(Debug, Clone, PartialEq)]
struct Generation {
    extra_data: Vec<u8>,
    difficulty: Decimal,
}

/// The current settings and the ones they replaced.
///
/// Miners keep working on the previous settings until they pick up the new
/// ones, so shares against either generation are accepted. Anything older is
/// a mismatch.
#[derive(Debug, Clone, Default)]
pub struct ExtraDataWindow {
    current: Option<Generation>,
    previous: Option<Generation>,
}

impl ExtraDataWindow {
    /// Install new settings, keeping the current ones as the previous pair.
    pub fn rotate(&mut self, extra_data: Vec<u8>, difficulty: Decimal) {
        self.previous = self.current.take();
        self.current = Some(Generation {
            extra_data,
            difficulty,
        });
    }

    pub fn current(&self) -> Option<(&[u8], Decimal)> {
        self.current
            .as_ref()
            .map(|generation| (generation.extra_data.as_slice(), generation.difficulty))
    }

    /// Difficulty of the generation whose extra data `proof` leads to
    /// `body_hash`, trying the current one first.
    pub fn difficulty_for_proof(&self, proof: &MerklePath, body_hash: &Hash) -> Option<Decimal> {
        [&self.current, &self.previous]
            .into_iter()
            .flatten()
            .find(|generation| proof.compute_root(&generation.extra_data) == *body_hash)
            .map(|generation| generation.difficulty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::BlockBody;
    use rust_decimal_macros::dec;

    fn body_with(extra_data: Vec<u8>) -> BlockBody {
        BlockBody {
            miner_addr: Address([9u8; 20]),
            extra_data,
            transactions: vec![],
            pruned_accounts: vec![],
        }
    }

    fn proof_for(body: &BlockBody) -> MerklePath {
        MerklePath::compute(&body.merkle_leaves(), &body.extra_data)
    }

    #[test]
    fn test_extra_data_layout() {
        let address = Address([1u8; 20]);
        let extra = build_extra_data("pool", &address, 0xdeadbeef, dec!(1));
        assert_eq!(&extra[..4], b"pool");
        assert_eq!(extra[4], 0);
        assert_eq!(&extra[5..25], address.as_bytes());
        assert_eq!(&extra[25..29], &0xdeadbeefu32.to_be_bytes());
        assert_eq!(&extra[29..33], &0x1f010000u32.to_be_bytes());
        assert_eq!(extra.len(), 33);
    }

    #[test]
    fn test_current_and_previous_generations_accepted() {
        let address = Address([1u8; 20]);
        let mut window = ExtraDataWindow::default();

        let first = build_extra_data("pool", &address, 1, dec!(1));
        window.rotate(first.clone(), dec!(1));
        let second = build_extra_data("pool", &address, 1, dec!(1.2));
        window.rotate(second.clone(), dec!(1.2));

        let first_body = body_with(first.clone());
        let second_body = body_with(second.clone());
        assert_eq!(
            window.difficulty_for_proof(&proof_for(&second_body), &second_body.hash()),
            Some(dec!(1.2))
        );
        assert_eq!(
            window.difficulty_for_proof(&proof_for(&first_body), &first_body.hash()),
            Some(dec!(1))
        );

        // A third generation pushes the first one out
        let third = build_extra_data("pool", &address, 1, dec!(1.44));
        window.rotate(third, dec!(1.44));
        assert_eq!(
            window.difficulty_for_proof(&proof_for(&first_body), &first_body.hash()),
            None
        );
        assert_eq!(
            window.difficulty_for_proof(&proof_for(&second_body), &second_body.hash()),
            Some(dec!(1.2))
        );
    }

    #[test]
    fn test_empty_window_matches_nothing() {
        let window = ExtraDataWindow::default();
        let body = body_with(vec![1, 2, 3]);
        assert!(window.current().is_none());
        assert_eq!(window.difficulty_for_proof(&proof_for(&body), &body.hash()), None);
    }
}
