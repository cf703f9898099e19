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


//! [`BlockchainPort`] over the node's JSON-RPC interface.
//!
//! Hashes and addresses travel as hex, blocks, headers and transactions as
//! base64 of their binary encoding, and targets as big endian hex.

use crate::NodeRpcClient;
use async_trait::async_trait;
use nimpool_lib::chain::{
    Address, Block, BlockHeader, BlockchainPort, ChainError, ChainEvent, Decode, Encode, Hash,
    PushResult, Transaction,
};
use num_bigint::BigUint;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The node as seen by the pool.
///
/// When built with [`NodeChain::with_relay_events`], every transaction the
/// node accepts is also reported as [`ChainEvent::TransactionRelayed`]. The
/// relay channel is unbounded: a payout run reports every transaction it
/// sends before anyone reads the reports.
#[derive(Clone)]
pub struct NodeChain {
    client: NodeRpcClient,
    relay_tx: Option<mpsc::UnboundedSender<ChainEvent>>,
}

impl NodeChain {
    pub fn new(client: NodeRpcClient) -> Self {
        Self {
            client,
            relay_tx: None,
        }
    }

    pub fn with_relay_events(mut self, relay_tx: mpsc::UnboundedSender<ChainEvent>) -> Self {
        self.relay_tx = Some(relay_tx);
        self
    }

    pub fn client(&self) -> &NodeRpcClient {
        &self.client
    }
}

fn parse_push_result(result: &str) -> Result<PushResult, ChainError> {
    match result {
        "extended" => Ok(PushResult::Extended),
        "rebranched" => Ok(PushResult::Rebranched),
        "forked" => Ok(PushResult::Forked),
        "known" => Ok(PushResult::Known),
        "orphan" => Ok(PushResult::Orphan),
        "invalid" => Ok(PushResult::Invalid),
        other => Err(ChainError::Rpc(format!("unknown push result {other}"))),
    }
}

fn parse_target(hex_target: &str) -> Result<BigUint, ChainError> {
    BigUint::parse_bytes(hex_target.trim_start_matches("0x").as_bytes(), 16)
        .ok_or_else(|| ChainError::Rpc(format!("invalid target {hex_target}")))
}

fn parse_hash(hex_hash: &str) -> Result<Hash, ChainError> {
    hex_hash.parse::<Hash>().map_err(ChainError::from)
}

#[async_trait]
impl BlockchainPort for NodeChain {
    async fn genesis_hash(&self) -> Result<Hash, ChainError> {
        let hash: String = self.client.request_value("getGenesisHash", vec![]).await?;
        parse_hash(&hash)
    }

    async fn head(&self) -> Result<Block, ChainError> {
        let head: String = self.client.request_value("getHead", vec![]).await?;
        Ok(Block::from_base64(&head)?)
    }

    async fn head_height(&self) -> Result<u32, ChainError> {
        Ok(self.head().await?.height())
    }

    async fn network_time_ms(&self) -> Result<u64, ChainError> {
        Ok(self.client.request_value("getNetworkTime", vec![]).await?)
    }

    async fn is_established(&self) -> Result<bool, ChainError> {
        Ok(self.client.request_value("isEstablished", vec![]).await?)
    }

    async fn get_block(
        &self,
        hash: &Hash,
        include_body: bool,
    ) -> Result<Option<Block>, ChainError> {
        let block: Option<String> = self
            .client
            .request("getBlockByHash", vec![json!(hash), json!(include_body)])
            .await?;
        block
            .map(|encoded| Block::from_base64(&encoded).map_err(ChainError::from))
            .transpose()
    }

    async fn get_next_target(&self, prev_hash: &Hash) -> Result<BigUint, ChainError> {
        let target: String = self
            .client
            .request_value("getNextTarget", vec![json!(prev_hash)])
            .await?;
        parse_target(&target)
    }

    async fn pow(&self, header: &BlockHeader) -> Result<Hash, ChainError> {
        let pow: String = self
            .client
            .request_value("getPowHash", vec![json!(header.to_base64())])
            .await?;
        parse_hash(&pow)
    }

    async fn push_block(&self, block: &Block) -> Result<PushResult, ChainError> {
        let result: String = self
            .client
            .request_value("pushBlock", vec![json!(block.to_base64())])
            .await?;
        debug!("Pushed block {}: {result}", block.hash());
        parse_push_result(&result)
    }

    async fn get_successor_blocks(&self, hash: &Hash) -> Result<Vec<Block>, ChainError> {
        let blocks: Vec<String> = self
            .client
            .request("getSuccessorBlocks", vec![json!(hash)])
            .await?
            .unwrap_or_default();
        blocks
            .iter()
            .map(|encoded| Block::from_base64(encoded).map_err(ChainError::from))
            .collect()
    }

    async fn block_reward_at(&self, height: u32) -> Result<u64, ChainError> {
        Ok(self
            .client
            .request_value("getBlockRewardAt", vec![json!(height)])
            .await?)
    }

    async fn get_next_block(&self) -> Result<Block, ChainError> {
        let template: String = self.client.request_value("getBlockTemplate", vec![]).await?;
        Ok(Block::from_base64(&template)?)
    }

    async fn create_transaction(
        &self,
        recipient: &Address,
        value: u64,
        fee: u64,
        validity_start_height: u32,
    ) -> Result<Transaction, ChainError> {
        let transaction: String = self
            .client
            .request_value(
                "createTransaction",
                vec![json!({
                    "recipient": recipient,
                    "value": value,
                    "fee": fee,
                    "validityStartHeight": validity_start_height,
                })],
            )
            .await?;
        Ok(Transaction::from_base64(&transaction)?)
    }

    async fn push_transaction(&self, transaction: &Transaction) -> Result<(), ChainError> {
        let _hash: Option<String> = self
            .client
            .request("sendTransaction", vec![json!(transaction.to_base64())])
            .await?;
        if let Some(relay_tx) = &self.relay_tx {
            if relay_tx
                .send(ChainEvent::TransactionRelayed(transaction.clone()))
                .is_err()
            {
                warn!("Relay listener went away");
            }
        }
        Ok(())
    }

    async fn get_transaction_by_hash(
        &self,
        hash: &Hash,
    ) -> Result<Option<Transaction>, ChainError> {
        let transaction: Option<String> = self
            .client
            .request("getTransactionByHash", vec![json!(hash)])
            .await?;
        transaction
            .map(|encoded| Transaction::from_base64(&encoded).map_err(ChainError::from))
            .transpose()
    }

    async fn balance(&self, address: &Address) -> Result<u64, ChainError> {
        Ok(self
            .client
            .request_value("getBalance", vec![json!(address)])
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{mock_method, mock_method_null, setup_mock_node_rpc};
    use nimpool_lib::test_utils::{test_block, test_transaction};
    use std::time::Duration;

    async fn chain() -> (wiremock::MockServer, NodeChain) {
        let (server, config) = setup_mock_node_rpc().await;
        let client = NodeRpcClient::new(&config.url, &config.username, &config.password).unwrap();
        (server, NodeChain::new(client))
    }

    #[tokio::test]
    async fn test_head_decodes_block() {
        let (server, chain) = chain().await;
        let head = test_block(120).to_light();
        mock_method(&server, "getHead", json!([]), json!(head.to_base64())).await;

        assert_eq!(chain.head().await.unwrap(), head);
        assert_eq!(chain.head_height().await.unwrap(), 120);
    }

    #[tokio::test]
    async fn test_missing_block_is_none() {
        let (server, chain) = chain().await;
        let hash = Hash([7; 32]);
        mock_method_null(&server, "getBlockByHash", json!([hash, true])).await;

        assert!(chain.get_block(&hash, true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_next_target_parses_hex() {
        let (server, chain) = chain().await;
        let prev = Hash([1; 32]);
        mock_method(&server, "getNextTarget", json!([prev]), json!("0x010000")).await;

        assert_eq!(
            chain.get_next_target(&prev).await.unwrap(),
            BigUint::from(0x010000u32)
        );
    }

    #[tokio::test]
    async fn test_push_block_maps_result() {
        let (server, chain) = chain().await;
        let block = test_block(10);
        mock_method(
            &server,
            "pushBlock",
            json!([block.to_base64()]),
            json!("invalid"),
        )
        .await;

        assert_eq!(chain.push_block(&block).await.unwrap(), PushResult::Invalid);
    }

    #[tokio::test]
    async fn test_push_transaction_reports_relay() {
        let (server, chain) = chain().await;
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let chain = chain.with_relay_events(relay_tx);
        let transaction = test_transaction(nimpool_lib::chain::Address([3; 20]), 500, 138);
        mock_method(
            &server,
            "sendTransaction",
            json!([transaction.to_base64()]),
            json!(transaction.hash()),
        )
        .await;

        chain.push_transaction(&transaction).await.unwrap();
        match relay_rx.recv().await {
            Some(ChainEvent::TransactionRelayed(relayed)) => assert_eq!(relayed, transaction),
            other => panic!("Expected a relay event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unread_relay_events_never_block_pushes() {
        let (server, chain) = chain().await;
        let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
        let chain = chain.with_relay_events(relay_tx);
        let transaction = test_transaction(nimpool_lib::chain::Address([3; 20]), 500, 138);
        mock_method(
            &server,
            "sendTransaction",
            json!([transaction.to_base64()]),
            json!(transaction.hash()),
        )
        .await;

        // More payouts than a bounded buffer of 1024 would hold, none read
        let pushes = 1100;
        tokio::time::timeout(Duration::from_secs(30), async {
            for _ in 0..pushes {
                chain.push_transaction(&transaction).await.unwrap();
            }
        })
        .await
        .expect("pushes blocked on unread relay events");

        let mut relayed = 0;
        while let Ok(ChainEvent::TransactionRelayed(_)) = relay_rx.try_recv() {
            relayed += 1;
        }
        assert_eq!(relayed, pushes);
    }

    #[test]
    fn test_unknown_push_result_is_an_error() {
        assert!(parse_push_result("exploded").is_err());
        assert_eq!(parse_push_result("extended").unwrap(), PushResult::Extended);
    }
}
