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

//! Signature proofs attached to payout requests.
//!
//! A proof is the signer's 33 byte compressed public key followed by a 64
//! byte compact ECDSA signature over the SHA-256 digest of the message.

use super::codec::{Decode, DecodeError, Encode, Reader};
use super::{ADDRESS_SIZE, Address, Hash};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, ecdsa::Signature};

pub const PUBLIC_KEY_SIZE: usize = 33;
pub const SIGNATURE_SIZE: usize = 64;

/// Prefix of the message a miner signs to request a payout.
pub const PAYOUT_MESSAGE_PREFIX: &[u8] = b"POOL_PAYOUT";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid public key")]
    PublicKey,
    #[error("invalid signature encoding")]
    Encoding,
    #[error("signature does not verify")]
    Verify,
}

impl Address {
    /// First 20 bytes of the SHA-256 digest of the compressed public key.
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        let digest = Hash::compute(&public_key.serialize());
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&digest.as_bytes()[..ADDRESS_SIZE]);
        Address(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureProof {
    pub public_key: [u8; PUBLIC_KEY_SIZE],
    pub signature: [u8; SIGNATURE_SIZE],
}

impl SignatureProof {
    pub fn sign(secret_key: &SecretKey, message: &[u8]) -> Self {
        let secp = Secp256k1::signing_only();
        let digest = Message::from_digest(*Hash::compute(message).as_bytes());
        let signature = secp.sign_ecdsa(&digest, secret_key);
        let public_key = PublicKey::from_secret_key(&secp, secret_key);
        SignatureProof {
            public_key: public_key.serialize(),
            signature: signature.serialize_compact(),
        }
    }

    /// Address of the key that made this proof.
    pub fn signer(&self) -> Result<Address, SignatureError> {
        let public_key =
            PublicKey::from_slice(&self.public_key).map_err(|_| SignatureError::PublicKey)?;
        Ok(Address::from_public_key(&public_key))
    }

    pub fn verify(&self, message: &[u8]) -> Result<(), SignatureError> {
        let public_key =
            PublicKey::from_slice(&self.public_key).map_err(|_| SignatureError::PublicKey)?;
        let signature =
            Signature::from_compact(&self.signature).map_err(|_| SignatureError::Encoding)?;
        let digest = Message::from_digest(*Hash::compute(message).as_bytes());
        Secp256k1::verification_only()
            .verify_ecdsa(&digest, &signature, &public_key)
            .map_err(|_| SignatureError::Verify)
    }

    /// Valid signature by the key behind `address`.
    pub fn is_signed_by(&self, address: &Address, message: &[u8]) -> bool {
        matches!(self.signer(), Ok(signer) if signer == *address) && self.verify(message).is_ok()
    }
}

impl Encode for SignatureProof {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
    }
}

impl Decode for SignatureProof {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(SignatureProof {
            public_key: reader.read_array()?,
            signature: reader.read_array()?,
        })
    }
}

/// `"POOL_PAYOUT" || u64_be(nonce)`
pub fn payout_message(nonce: u64) -> Vec<u8> {
    let mut message = PAYOUT_MESSAGE_PREFIX.to_vec();
    message.extend_from_slice(&nonce.to_be_bytes());
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    #[test]
    fn test_proof_verifies_for_signer() {
        let secret = key(1);
        let address = Address::from_public_key(&PublicKey::from_secret_key(
            &Secp256k1::new(),
            &secret,
        ));
        let message = payout_message(77);
        let proof = SignatureProof::sign(&secret, &message);
        assert!(proof.is_signed_by(&address, &message));
        assert!(!proof.is_signed_by(&address, &payout_message(78)));
    }

    #[test]
    fn test_proof_from_other_key_is_rejected() {
        let other = Address::from_public_key(&PublicKey::from_secret_key(
            &Secp256k1::new(),
            &key(2),
        ));
        let message = payout_message(1);
        let proof = SignatureProof::sign(&key(1), &message);
        assert!(proof.verify(&message).is_ok());
        assert!(!proof.is_signed_by(&other, &message));
    }

    #[test]
    fn test_proof_survives_base64() {
        let proof = SignatureProof::sign(&key(3), b"msg");
        let decoded = SignatureProof::from_base64(&proof.to_base64()).unwrap();
        assert_eq!(decoded, proof);
        assert!(SignatureProof::from_base64("AAAA").is_err());
    }

    #[test]
    fn test_garbage_public_key() {
        let proof = SignatureProof {
            public_key: [0u8; PUBLIC_KEY_SIZE],
            signature: [0u8; SIGNATURE_SIZE],
        };
        assert_eq!(proof.signer(), Err(SignatureError::PublicKey));
    }

    #[test]
    fn test_payout_message_layout() {
        let message = payout_message(0x0102);
        assert_eq!(&message[..11], b"POOL_PAYOUT");
        assert_eq!(&message[11..], &[0, 0, 0, 0, 0, 0, 1, 2]);
    }
}
