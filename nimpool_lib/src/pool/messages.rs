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

//! JSON messages exchanged with miners over the websocket.
//!
//! Every frame is an object tagged by its `message` field. Frames are decoded
//! once into [`ClientMessage`] and replies are built as [`ServerMessage`].

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "message", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Register {
        /// Base64 of the 20 byte address
        address: String,
        device_id: u32,
        mode: String,
        /// Base64 of the genesis block hash
        genesis_hash: String,
    },
    /// Fields depend on the mode the agent registered with.
    #[serde(rename_all = "camelCase")]
    Share {
        block_header: Option<String>,
        miner_addr_proof: Option<String>,
        extra_data_proof: Option<String>,
        block: Option<String>,
        nonce: Option<u32>,
    },
    Payout {
        proof: Option<String>,
    },
    BalanceRequest,
}

impl ClientMessage {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "message", rename_all = "kebab-case")]
pub enum ServerMessage {
    Registered,
    #[serde(rename_all = "camelCase")]
    Settings {
        address: String,
        extra_data: String,
        /// Decimal string, targets do not fit a JSON number
        target: String,
        target_compact: u32,
        nonce: u64,
    },
    Error {
        reason: String,
    },
    /// Nano agents get the body and accounts hash plus the parent block,
    /// dumb agents get the full header.
    #[serde(rename_all = "camelCase")]
    NewBlock {
        #[serde(skip_serializing_if = "Option::is_none")]
        body_hash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        accounts_hash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        previous_block: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        block_header: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Balance {
        balance: u64,
        confirmed_balance: u64,
        payout_request_active: bool,
    },
}

impl ServerMessage {
    pub fn error(reason: impl Into<String>) -> Self {
        ServerMessage::Error {
            reason: reason.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Every variant is plain strings and numbers, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
