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

//! Share validation for the three agent modes.

use super::{Agent, CurrentWork};
use crate::chain::block::TIMESTAMP_DRIFT_MAX;
use crate::chain::merkle::MerklePath;
use crate::chain::target::{difficulty_to_target, is_proof_of_work};
use crate::chain::{Block, BlockHeader, Decode, Hash};
use crate::pool::error::{AgentError, ShareRejection};
use crate::pool::share_writer::AcceptedShare;
use crate::store::StoreError;
use rust_decimal::Decimal;
use tracing::{info, trace, warn};

fn required<'a>(field: &'a Option<String>, name: &str) -> Result<&'a str, AgentError> {
    field
        .as_deref()
        .ok_or_else(|| AgentError::Protocol(format!("share without {name}")))
}

impl Agent {
    pub(super) async fn on_smart_share(
        &mut self,
        block_header: Option<String>,
        miner_addr_proof: Option<String>,
        extra_data_proof: Option<String>,
        block: Option<String>,
    ) -> Result<(), AgentError> {
        let header = BlockHeader::from_base64(required(&block_header, "blockHeader")?)?;
        let miner_addr_proof = MerklePath::from_base64(required(&miner_addr_proof, "minerAddrProof")?)?;
        let extra_data_proof = MerklePath::from_base64(required(&extra_data_proof, "extraDataProof")?)?;
        let full_block = block.as_deref().map(Block::from_base64).transpose()?;

        let (difficulty, pow) = match self
            .validate_smart_share(&header, &miner_addr_proof, &extra_data_proof)
            .await?
        {
            Ok(valid) => valid,
            Err(rejection) => return self.reject(rejection),
        };
        let hash = header.hash();
        if full_block.as_ref().is_some_and(|block| block.hash() != hash) {
            return Err(AgentError::Protocol(
                "full block announced but mismatches".to_string(),
            ));
        }

        // Nobody should be mining on a block that already has a successor
        let prev_block = self.ctx.chain.get_block(&header.prev_hash, false).await?;
        if let Some(prev) = &prev_block {
            let successors = self.ctx.chain.get_successor_blocks(&prev.hash()).await?;
            if !successors.is_empty() {
                return self.reject(ShareRejection::ShareExpired);
            }

            let next_target = self.ctx.chain.get_next_target(&header.prev_hash).await?;
            if is_proof_of_work(&pow, &next_target) {
                if let Some(block) = &full_block {
                    if self.ctx.chain.push_block(block).await?.is_invalid() {
                        self.send_error("invalid block")?;
                        return Err(AgentError::Protocol("client sent invalid block".to_string()));
                    }
                }
                self.block_mined(&header).await;
            }
        }

        self.store_share(&header, prev_block.as_ref(), difficulty).await
    }

    /// Checks a smart share in order and returns the difficulty it was mined
    /// at together with its pow hash.
    async fn validate_smart_share(
        &self,
        header: &BlockHeader,
        miner_addr_proof: &MerklePath,
        extra_data_proof: &MerklePath,
    ) -> Result<Result<(Decimal, Hash), ShareRejection>, AgentError> {
        let pool_address = self.ctx.settings.pool_address;
        if miner_addr_proof.compute_root(pool_address.as_bytes()) != header.body_hash {
            return Ok(Err(ShareRejection::MinerAddressMismatch));
        }
        let Some(difficulty) = self
            .extra_data
            .difficulty_for_proof(extra_data_proof, &header.body_hash)
        else {
            return Ok(Err(ShareRejection::ExtraDataMismatch));
        };
        if self.timestamp_too_far_ahead(header).await? {
            return Ok(Err(ShareRejection::BadTimestamp));
        }
        let pow = self.ctx.chain.pow(header).await?;
        if !is_proof_of_work(&pow, &difficulty_to_target(difficulty)) {
            return Ok(Err(ShareRejection::InvalidPow));
        }
        Ok(Ok((difficulty, pow)))
    }

    pub(super) async fn on_nano_share(&mut self, block: Option<String>) -> Result<(), AgentError> {
        let light = Block::from_base64(required(&block, "block")?)?;
        let Some(work) = self.work.as_ref().map(CurrentWork::clone) else {
            return self.reject(ShareRejection::NoWork);
        };
        let block = light.to_full(work.job.body.clone());
        let difficulty = self.difficulty.current_difficulty();

        let pow = match self.validate_nano_share(&block, &work, difficulty).await? {
            Ok(pow) => pow,
            Err(rejection) => return self.reject(rejection),
        };

        let next_target = self.ctx.chain.get_next_target(&block.header.prev_hash).await?;
        if is_proof_of_work(&pow, &next_target) {
            let result = self.ctx.chain.push_block(&block).await?;
            if result.is_invalid() {
                warn!("Node refused block {} mined by nano miner", block.hash());
            }
            self.block_mined(&block.header).await;
        }

        self.store_share(&block.header, Some(&work.prev_block), difficulty)
            .await
    }

    async fn validate_nano_share(
        &self,
        block: &Block,
        work: &CurrentWork,
        difficulty: Decimal,
    ) -> Result<Result<Hash, ShareRejection>, AgentError> {
        let header = &block.header;
        if header.body_hash != work.job.header.body_hash {
            return Ok(Err(ShareRejection::WrongBodyHash));
        }
        if header.accounts_hash != work.job.header.accounts_hash {
            return Ok(Err(ShareRejection::WrongAccountsHash));
        }
        let pow = self.ctx.chain.pow(header).await?;
        if !is_proof_of_work(&pow, &difficulty_to_target(difficulty)) {
            return Ok(Err(ShareRejection::InvalidPow));
        }
        if self.timestamp_too_far_ahead(header).await? {
            return Ok(Err(ShareRejection::BadTimestamp));
        }
        if !block.verify_interlink() {
            return Ok(Err(ShareRejection::BadInterlink));
        }
        if !block.is_immediate_successor_of(&work.prev_block) {
            return Ok(Err(ShareRejection::BadPrev));
        }
        Ok(Ok(pow))
    }

    /// Dumb miners only send a nonce for the header they were last given.
    pub(super) async fn on_dumb_share(&mut self, nonce: Option<u32>) -> Result<(), AgentError> {
        let nonce = nonce.ok_or_else(|| AgentError::Protocol("share without nonce".to_string()))?;
        let Some(work) = self.work.as_ref().map(CurrentWork::clone) else {
            return self.reject(ShareRejection::NoWork);
        };
        let header = work.job.header.with_nonce(nonce);
        let difficulty = self.difficulty.current_difficulty();

        let pow = self.ctx.chain.pow(&header).await?;
        if !is_proof_of_work(&pow, &difficulty_to_target(difficulty)) {
            return self.reject(ShareRejection::InvalidPow);
        }

        self.store_share(&header, Some(&work.prev_block), difficulty)
            .await?;

        let next_target = self
            .ctx
            .chain
            .get_next_target(&work.prev_block.hash())
            .await?;
        if is_proof_of_work(&pow, &next_target) {
            let block = Block {
                header: header.clone(),
                interlink: work.job.interlink.clone(),
                body: Some(work.job.body.clone()),
            };
            if self.ctx.chain.push_block(&block).await?.is_invalid() {
                return self.send_error("invalid block");
            }
            self.block_mined(&header).await;
        }
        Ok(())
    }

    async fn timestamp_too_far_ahead(&self, header: &BlockHeader) -> Result<bool, AgentError> {
        let network_time_ms = self.ctx.chain.network_time_ms().await?;
        Ok(u64::from(header.timestamp) * 1000 > network_time_ms + TIMESTAMP_DRIFT_MAX * 1000)
    }

    /// Hand the share to the batched writer and wait for it to be stored.
    /// A share seen before ends the session.
    async fn store_share(
        &mut self,
        header: &BlockHeader,
        prev_block: Option<&Block>,
        difficulty: Decimal,
    ) -> Result<(), AgentError> {
        let Some(user_id) = self.user_id else {
            return Ok(());
        };
        let hash = header.hash();
        let share = AcceptedShare {
            user_id,
            device_id: self.device_id,
            prev_hash: header.prev_hash,
            prev_height: header.height.saturating_sub(1),
            prev_timestamp: prev_block
                .map(|prev| prev.header.timestamp)
                .unwrap_or(header.timestamp),
            difficulty,
            hash,
        };
        match self.ctx.share_writer.submit(share).await {
            Ok(()) => {}
            Err(StoreError::DuplicateShare) => {
                self.send_error("submitted share twice")?;
                return Err(StoreError::DuplicateShare.into());
            }
            Err(e) => return Err(e.into()),
        }

        trace!(
            "SHARE from {} ({}), prev {} : {hash}",
            self.address.map(|a| a.to_string()).unwrap_or_default(),
            self.mode,
            header.prev_hash
        );
        self.ctx.stats.record_share(difficulty).await;
        Ok(())
    }

    async fn block_mined(&self, header: &BlockHeader) {
        info!(
            "Block {} at height {} mined by {}",
            header.hash(),
            header.height,
            self.address.map(|a| a.to_string()).unwrap_or_default()
        );
        self.ctx.stats.record_block_mined().await;
    }
}
