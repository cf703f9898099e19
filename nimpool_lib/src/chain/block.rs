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

//! Block, header, body and transaction types with their binary layout.

use super::codec::{Decode, DecodeError, Encode, Reader, put_var_bytes_u16, put_var_bytes_u8};
use super::merkle;
use super::{Address, Hash};

pub const BLOCK_VERSION: u16 = 1;
pub const HEADER_SIZE: usize = 2 + 4 * 32 + 4 * 4;

/// Seconds a header timestamp may run ahead of network time.
pub const TIMESTAMP_DRIFT_MAX: u64 = 600;

/// Fixed size block header. Its hash is the block hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u16,
    pub prev_hash: Hash,
    pub interlink_hash: Hash,
    pub body_hash: Hash,
    pub accounts_hash: Hash,
    pub n_bits: u32,
    pub height: u32,
    pub timestamp: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash {
        Hash::compute(&self.to_bytes())
    }

    /// Copy of this header with a different nonce, as dumb miners only send
    /// the nonce back.
    pub fn with_nonce(&self, nonce: u32) -> Self {
        BlockHeader {
            nonce,
            ..self.clone()
        }
    }
}

impl Encode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_be_bytes());
        self.prev_hash.encode(out);
        self.interlink_hash.encode(out);
        self.body_hash.encode(out);
        self.accounts_hash.encode(out);
        out.extend_from_slice(&self.n_bits.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
    }
}

impl Decode for BlockHeader {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(BlockHeader {
            version: reader.read_u16()?,
            prev_hash: Hash::decode(reader)?,
            interlink_hash: Hash::decode(reader)?,
            body_hash: Hash::decode(reader)?,
            accounts_hash: Hash::decode(reader)?,
            n_bits: reader.read_u32()?,
            height: reader.read_u32()?,
            timestamp: reader.read_u32()?,
            nonce: reader.read_u32()?,
        })
    }
}

/// Hashes of the superblocks this block links to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockInterlink {
    pub hashes: Vec<Hash>,
}

impl BlockInterlink {
    pub fn hash(&self) -> Hash {
        let leaves: Vec<&[u8]> = self.hashes.iter().map(|h| h.as_bytes().as_slice()).collect();
        merkle::compute_root(&leaves)
    }
}

impl Encode for BlockInterlink {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.hashes.len() as u8);
        for hash in &self.hashes {
            hash.encode(out);
        }
    }
}

impl Decode for BlockInterlink {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = reader.read_u8()?;
        let hashes = (0..count)
            .map(|_| Hash::decode(reader))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockInterlink { hashes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub value: u64,
    pub fee: u64,
    pub validity_start_height: u32,
    pub network_id: u8,
    pub proof: Vec<u8>,
}

impl Transaction {
    fn encode_content(&self, out: &mut Vec<u8>) {
        self.sender.encode(out);
        self.recipient.encode(out);
        out.extend_from_slice(&self.value.to_be_bytes());
        out.extend_from_slice(&self.fee.to_be_bytes());
        out.extend_from_slice(&self.validity_start_height.to_be_bytes());
        out.push(self.network_id);
    }

    /// Hash over everything but the proof, so signing does not change it.
    pub fn hash(&self) -> Hash {
        let mut content = Vec::with_capacity(61);
        self.encode_content(&mut content);
        Hash::compute(&content)
    }
}

impl Encode for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        self.encode_content(out);
        put_var_bytes_u16(out, &self.proof);
    }
}

impl Decode for Transaction {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let sender = Address::decode(reader)?;
        let recipient = Address::decode(reader)?;
        let value = reader.read_u64()?;
        let fee = reader.read_u64()?;
        let validity_start_height = reader.read_u32()?;
        let network_id = reader.read_u8()?;
        let proof_len = reader.read_u16()? as usize;
        let proof = reader.read_bytes(proof_len)?.to_vec();
        Ok(Transaction {
            sender,
            recipient,
            value,
            fee,
            validity_start_height,
            network_id,
            proof,
        })
    }
}

/// Account removed from the accounts tree by this block, kept opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedAccount {
    pub address: Address,
    pub account: Vec<u8>,
}

impl Encode for PrunedAccount {
    fn encode(&self, out: &mut Vec<u8>) {
        self.address.encode(out);
        put_var_bytes_u16(out, &self.account);
    }
}

impl Decode for PrunedAccount {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let address = Address::decode(reader)?;
        let len = reader.read_u16()? as usize;
        Ok(PrunedAccount {
            address,
            account: reader.read_bytes(len)?.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBody {
    pub miner_addr: Address,
    pub extra_data: Vec<u8>,
    pub transactions: Vec<Transaction>,
    pub pruned_accounts: Vec<PrunedAccount>,
}

impl BlockBody {
    /// Leaves of the body Merkle tree. The miner address comes first and the
    /// extra data second, which is what miner proofs are checked against.
    pub fn merkle_leaves(&self) -> Vec<Vec<u8>> {
        let mut leaves = Vec::with_capacity(2 + self.transactions.len() + self.pruned_accounts.len());
        leaves.push(self.miner_addr.as_bytes().to_vec());
        leaves.push(self.extra_data.clone());
        leaves.extend(self.transactions.iter().map(Encode::to_bytes));
        leaves.extend(self.pruned_accounts.iter().map(Encode::to_bytes));
        leaves
    }

    pub fn hash(&self) -> Hash {
        merkle::compute_root(&self.merkle_leaves())
    }

    pub fn total_fees(&self) -> u64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }
}

impl Encode for BlockBody {
    fn encode(&self, out: &mut Vec<u8>) {
        self.miner_addr.encode(out);
        put_var_bytes_u8(out, &self.extra_data);
        out.extend_from_slice(&(self.transactions.len() as u16).to_be_bytes());
        for tx in &self.transactions {
            tx.encode(out);
        }
        out.extend_from_slice(&(self.pruned_accounts.len() as u16).to_be_bytes());
        for account in &self.pruned_accounts {
            account.encode(out);
        }
    }
}

impl Decode for BlockBody {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let miner_addr = Address::decode(reader)?;
        let extra_len = reader.read_u8()? as usize;
        let extra_data = reader.read_bytes(extra_len)?.to_vec();
        let tx_count = reader.read_u16()?;
        let transactions = (0..tx_count)
            .map(|_| Transaction::decode(reader))
            .collect::<Result<Vec<_>, _>>()?;
        let pruned_count = reader.read_u16()?;
        let pruned_accounts = (0..pruned_count)
            .map(|_| PrunedAccount::decode(reader))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(BlockBody {
            miner_addr,
            extra_data,
            transactions,
            pruned_accounts,
        })
    }
}

/// A block, light when `body` is `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub interlink: BlockInterlink,
    pub body: Option<BlockBody>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u32 {
        self.header.height
    }

    pub fn prev_hash(&self) -> &Hash {
        &self.header.prev_hash
    }

    pub fn is_full(&self) -> bool {
        self.body.is_some()
    }

    pub fn miner_addr(&self) -> Option<&Address> {
        self.body.as_ref().map(|body| &body.miner_addr)
    }

    pub fn to_light(&self) -> Block {
        Block {
            header: self.header.clone(),
            interlink: self.interlink.clone(),
            body: None,
        }
    }

    pub fn to_full(&self, body: BlockBody) -> Block {
        Block {
            header: self.header.clone(),
            interlink: self.interlink.clone(),
            body: Some(body),
        }
    }

    pub fn verify_interlink(&self) -> bool {
        self.header.interlink_hash == self.interlink.hash()
    }

    pub fn verify_body(&self) -> bool {
        match &self.body {
            Some(body) => self.header.body_hash == body.hash(),
            None => true,
        }
    }

    /// Height, parent hash and timestamp ordering fit directly on `prev`.
    pub fn is_immediate_successor_of(&self, prev: &Block) -> bool {
        self.header.height == prev.header.height.wrapping_add(1)
            && self.header.prev_hash == prev.hash()
            && self.header.timestamp >= prev.header.timestamp
    }
}

impl Encode for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        self.interlink.encode(out);
        match &self.body {
            Some(body) => {
                out.push(1);
                body.encode(out);
            }
            None => out.push(0),
        }
    }
}

impl Decode for Block {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let header = BlockHeader::decode(reader)?;
        let interlink = BlockInterlink::decode(reader)?;
        let body = match reader.read_u8()? {
            0 => None,
            1 => Some(BlockBody::decode(reader)?),
            other => return Err(DecodeError::Invalid(format!("body flag {other}"))),
        };
        Ok(Block {
            header,
            interlink,
            body,
        })
    }
}
