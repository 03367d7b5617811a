//! Ledger blocks and chain verification.

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use data_encoding::HEXLOWER;
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{canonical, ed25519_sign, ed25519_verify, sha256_hex, zero_hash_hex};

use super::election::ElectionId;

/// Index of the genesis block.
pub const GENESIS_INDEX: u64 = 0;

/// A signed, hash-linked ledger block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub election_id: ElectionId,
    pub index: u64,
    pub prev_hash: String,
    pub payload_hash: String,
    #[serde(with = "ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub block_hash: String,
    pub signature: String,
}

/// The fields a block hash covers.
#[derive(Debug, Serialize)]
struct HashedFields<'a> {
    election_id: ElectionId,
    index: u64,
    prev_hash: &'a str,
    payload_hash: &'a str,
    #[serde(with = "ts_milliseconds")]
    ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockFault {
    #[error("block belongs to election {0}")]
    WrongElection(ElectionId),
    #[error("expected index {expected}, found {found}")]
    Index { expected: u64, found: u64 },
    #[error("prev_hash does not link to the previous block")]
    Linkage,
    #[error("block_hash does not match block contents")]
    Hash,
    #[error("signature does not verify")]
    Signature,
}

impl Block {
    /// Build and sign a block.
    pub fn compose(
        election_id: ElectionId,
        index: u64,
        prev_hash: String,
        payload_hash: String,
        ts: DateTime<Utc>,
        key: &SigningKey,
    ) -> Result<Self, serde_json::Error> {
        let block_hash = block_hash(election_id, index, &prev_hash, &payload_hash, ts)?;
        let signature = sign_hash(&block_hash, key);
        Ok(Self {
            election_id,
            index,
            prev_hash,
            payload_hash,
            ts,
            block_hash,
            signature,
        })
    }

    /// Build the first block of an election's chain.
    pub fn genesis(
        election_id: ElectionId,
        payload_hash: String,
        ts: DateTime<Utc>,
        key: &SigningKey,
    ) -> Result<Self, serde_json::Error> {
        Self::compose(election_id, GENESIS_INDEX, zero_hash_hex(), payload_hash, ts, key)
    }

    /// Build the block following this one.
    pub fn next(&self, payload_hash: String, ts: DateTime<Utc>, key: &SigningKey) -> Result<Self, serde_json::Error> {
        Self::compose(self.election_id, self.index + 1, self.block_hash.clone(), payload_hash, ts, key)
    }

    /// Check this block's own hash and signature.
    pub fn verify_self(&self, key: &VerifyingKey) -> Result<(), BlockFault> {
        let expected = block_hash(self.election_id, self.index, &self.prev_hash, &self.payload_hash, self.ts)
            .map_err(|_| BlockFault::Hash)?;
        if expected != self.block_hash {
            return Err(BlockFault::Hash);
        }
        let hash_bytes = HEXLOWER
            .decode(self.block_hash.as_bytes())
            .map_err(|_| BlockFault::Hash)?;
        ed25519_verify(key, &hash_bytes, &self.signature).map_err(|_| BlockFault::Signature)
    }
}

/// The payload hash of a ballot block.
pub fn payload_hash(ballot_id: &str) -> String {
    sha256_hex(ballot_id.as_bytes())
}

fn block_hash(
    election_id: ElectionId,
    index: u64,
    prev_hash: &str,
    payload_hash: &str,
    ts: DateTime<Utc>,
) -> Result<String, serde_json::Error> {
    let fields = HashedFields {
        election_id,
        index,
        prev_hash,
        payload_hash,
        ts,
    };
    Ok(sha256_hex(canonical(&fields)?))
}

/// Sign the raw bytes of a hex block hash.
fn sign_hash(block_hash: &str, key: &SigningKey) -> String {
    // The hash is always produced by `sha256_hex`, so decoding cannot fail.
    let bytes = HEXLOWER.decode(block_hash.as_bytes()).unwrap_or_default();
    ed25519_sign(key, &bytes)
}

/// Outcome of verifying a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Number of blocks examined, including genesis.
    pub length: u64,
}

/// Verify a whole chain, given in index order starting at genesis.
pub fn verify_chain(election_id: ElectionId, blocks: &[Block], key: &VerifyingKey) -> ChainReport {
    let mut prev_hash = zero_hash_hex();
    for (position, block) in blocks.iter().enumerate() {
        let expected = position as u64;
        let fault = if block.election_id != election_id {
            Some(BlockFault::WrongElection(block.election_id))
        } else if block.index != expected {
            Some(BlockFault::Index {
                expected,
                found: block.index,
            })
        } else if block.prev_hash != prev_hash {
            Some(BlockFault::Linkage)
        } else {
            block.verify_self(key).err()
        };
        if let Some(fault) = fault {
            return ChainReport {
                ok: false,
                first_bad_index: Some(expected),
                reason: Some(fault.to_string()),
                length: blocks.len() as u64,
            };
        }
        prev_hash = block.block_hash.clone();
    }
    ChainReport {
        ok: true,
        first_bad_index: None,
        reason: None,
        length: blocks.len() as u64,
    }
}


#[cfg(test)]
mod tests {
    use super::{examples::chain, *};

    fn key() -> SigningKey {
        SigningKey::from_bytes(&[3; 32])
    }

    #[test]
    fn valid_chain_verifies() {
        let blocks = chain(1, 5, &key());
        let report = verify_chain(1, &blocks, &key().verifying_key());
        assert!(report.ok);
        assert_eq!(report.length, 6);
        assert_eq!(blocks[0].prev_hash, zero_hash_hex());
        for pair in blocks.windows(2) {
            assert_eq!(pair[1].prev_hash, pair[0].block_hash);
            assert_eq!(pair[1].index, pair[0].index + 1);
        }
    }

    #[test]
    fn empty_chain_is_ok() {
        assert!(verify_chain(1, &[], &key().verifying_key()).ok);
    }

    #[test]
    fn tampered_payload_is_detected() {
        let mut blocks = chain(1, 5, &key());
        blocks[3].payload_hash = payload_hash("forged");
        let report = verify_chain(1, &blocks, &key().verifying_key());
        assert!(!report.ok);
        assert_eq!(report.first_bad_index, Some(3));
    }

    #[test]
    fn rehashed_block_breaks_linkage() {
        let mut blocks = chain(1, 5, &key());
        // Re-sign block 2 after forging it: its own hash is valid, but block 3 no longer links.
        let forged = Block::compose(1, 2, blocks[2].prev_hash.clone(), payload_hash("forged"), blocks[2].ts, &key()).unwrap();
        blocks[2] = forged;
        let report = verify_chain(1, &blocks, &key().verifying_key());
        assert_eq!(report.first_bad_index, Some(3));
    }

    #[test]
    fn removed_block_is_detected() {
        let mut blocks = chain(1, 5, &key());
        blocks.remove(3);
        assert_eq!(verify_chain(1, &blocks, &key().verifying_key()).first_bad_index, Some(3));
    }

    #[test]
    fn foreign_signature_is_detected() {
        let mut blocks = chain(1, 2, &key());
        let other = SigningKey::from_bytes(&[4; 32]);
        blocks[1] = Block::compose(1, 1, blocks[0].block_hash.clone(), blocks[1].payload_hash.clone(), blocks[1].ts, &other).unwrap();
        let report = verify_chain(1, &blocks, &key().verifying_key());
        assert_eq!(report.first_bad_index, Some(1));
        assert_eq!(report.reason.as_deref(), Some("signature does not verify"));
    }
}
