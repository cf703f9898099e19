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

//! Chain types the pool inspects.
//!
//! The pool never validates consensus itself. These types exist so it can
//! build block bodies with its own extra data, check Merkle proofs sent by
//! smart miners and hand full blocks to the node through [`BlockchainPort`].

pub mod block;
pub mod codec;
pub mod merkle;
pub mod port;
pub mod signature;
pub mod target;

pub use block::{Block, BlockBody, BlockHeader, BlockInterlink, PrunedAccount, Transaction};
pub use codec::{Decode, DecodeError, Encode, Reader};
pub use port::{BlockchainPort, ChainError, ChainEvent, PushResult};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

pub const HASH_SIZE: usize = 32;
pub const ADDRESS_SIZE: usize = 20;

/// 32 byte SHA-256 digest used for block, body and transaction hashes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; HASH_SIZE]);

impl Hash {
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut out = [0u8; HASH_SIZE];
        out.copy_from_slice(&digest);
        Hash(out)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let array: [u8; HASH_SIZE] = bytes
            .try_into()
            .map_err(|_| DecodeError::Invalid(format!("hash must be {HASH_SIZE} bytes")))?;
        Ok(Hash(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl Encode for Hash {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Decode for Hash {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Hash(reader.read_array()?))
    }
}

impl FromStr for Hash {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| DecodeError::Invalid(e.to_string()))?;
        Hash::from_slice(&bytes)
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// 20 byte account address. Printed and parsed as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let array: [u8; ADDRESS_SIZE] = bytes
            .try_into()
            .map_err(|_| DecodeError::Invalid(format!("address must be {ADDRESS_SIZE} bytes")))?;
        Ok(Address(array))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_SIZE] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim()).map_err(|e| DecodeError::Invalid(e.to_string()))?;
        Address::from_slice(&bytes)
    }
}

impl Encode for Address {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

impl Decode for Address {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Address(reader.read_array()?))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Address::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_compute_is_sha256() {
        let hash = Hash::compute(b"");
        assert_eq!(
            hash.to_string(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_address_parse_and_display() {
        let address: Address = "0102030405060708090a0b0c0d0e0f1011121314".parse().unwrap();
        assert_eq!(address.0[0], 1);
        assert_eq!(address.0[19], 0x14);
        assert_eq!(
            address.to_string(),
            "0102030405060708090a0b0c0d0e0f1011121314"
        );
    }

    #[test]
    fn test_address_rejects_wrong_length() {
        assert!("0102".parse::<Address>().is_err());
        assert!("zz".parse::<Address>().is_err());
    }

    #[test]
    fn test_address_serde_as_hex_string() {
        let address = Address([7u8; ADDRESS_SIZE]);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(ADDRESS_SIZE)));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }
}
