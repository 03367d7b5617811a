//! Everything needed to check a tallied election offline.

use data_encoding::HEXLOWER_PERMISSIVE;
use ed25519_dalek::VerifyingKey;
use rsa::{
    pkcs8::{DecodePublicKey, EncodePublicKey},
    RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{canonical, fingerprint, merkle::merkle_root, rsa_pss_verify, PublicKeys};

use super::{
    ballot::BallotId,
    block::{payload_hash, verify_chain, Block},
    election::Election,
    tally::Tally,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionDump {
    pub election: Election,
    pub tally: Tally,
    pub blocks: Vec<Block>,
    /// In ledger order.
    pub ballot_ids: Vec<BallotId>,
    pub public_keys: PublicKeys,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DumpFault {
    #[error("Malformed public key: {0}")]
    BadKey(&'static str),
    #[error("Public keys do not match the election's parameters")]
    KeyMismatch,
    #[error("Proof bundle belongs to election {0}")]
    WrongElection(u32),
    #[error("Ledger is broken at block {index}: {reason}")]
    Chain { index: u64, reason: String },
    #[error("{ballots} ballot ids but {blocks} ballot blocks")]
    BallotCount { ballots: usize, blocks: usize },
    #[error("Ballot {0} is not recorded by its ledger block")]
    BallotNotRecorded(BallotId),
    #[error("Merkle root does not match the ballot ids")]
    MerkleRoot,
    #[error("Last block hash does not match the ledger tail")]
    LastBlock,
    #[error("Counts sum to {sum}, but {total} ballots were tallied")]
    Totals { sum: u64, total: u64 },
    #[error("Proof bundle signature does not verify")]
    Signature,
}

/// What a successful verification established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpSummary {
    pub blocks: u64,
    pub total: u64,
}

impl ElectionDump {
    /// Check the chain, the ballot ids, the Merkle root, the totals and the
    /// bundle signature, using only the published public keys.
    pub fn verify(&self) -> Result<DumpSummary, DumpFault> {
        let keys = &self.public_keys;
        let params = &self.election.params;
        let election_id = self.election.election_id;

        let ledger_bytes: [u8; 32] = HEXLOWER_PERMISSIVE
            .decode(keys.ledger_public_key.as_bytes())
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(DumpFault::BadKey("ledger"))?;
        let ledger_key = VerifyingKey::from_bytes(&ledger_bytes).map_err(|_| DumpFault::BadKey("ledger"))?;
        let receipt_key =
            RsaPublicKey::from_public_key_pem(&keys.receipt_public_key).map_err(|_| DumpFault::BadKey("receipt"))?;
        let receipt_der = receipt_key
            .to_public_key_der()
            .map_err(|_| DumpFault::BadKey("receipt"))?;
        if fingerprint(&ledger_bytes) != params.ledger_fingerprint
            || fingerprint(receipt_der.as_bytes()) != params.receipt_fingerprint
            || keys.paillier_n != params.paillier_n
        {
            return Err(DumpFault::KeyMismatch);
        }

        let bundle = &self.tally.bundle;
        if bundle.election_id != election_id {
            return Err(DumpFault::WrongElection(bundle.election_id));
        }

        let report = verify_chain(election_id, &self.blocks, &ledger_key);
        if !report.ok {
            return Err(DumpFault::Chain {
                index: report.first_bad_index.unwrap_or_default(),
                reason: report.reason.unwrap_or_default(),
            });
        }

        let ballot_blocks = self.blocks.len().saturating_sub(1);
        if self.ballot_ids.len() != ballot_blocks {
            return Err(DumpFault::BallotCount {
                ballots: self.ballot_ids.len(),
                blocks: ballot_blocks,
            });
        }
        for (ballot_id, block) in self.ballot_ids.iter().zip(self.blocks.iter().skip(1)) {
            if block.payload_hash != payload_hash(ballot_id) {
                return Err(DumpFault::BallotNotRecorded(ballot_id.clone()));
            }
        }

        if merkle_root(&self.ballot_ids) != bundle.merkle_root {
            return Err(DumpFault::MerkleRoot);
        }
        let tail_hash = self.blocks.last().map(|block| block.block_hash.as_str());
        if tail_hash != Some(bundle.last_block_hash.as_str()) {
            return Err(DumpFault::LastBlock);
        }

        let sum: u64 = bundle.counts.iter().map(|c| c.count).sum();
        if sum != bundle.total || bundle.total != ballot_blocks as u64 {
            return Err(DumpFault::Totals {
                sum,
                total: bundle.total,
            });
        }

        let message = canonical(bundle).map_err(|_| DumpFault::Signature)?;
        rsa_pss_verify(&receipt_key, &message, &self.tally.signature).map_err(|_| DumpFault::Signature)?;

        Ok(DumpSummary {
            blocks: self.blocks.len() as u64,
            total: bundle.total,
        })
    }
}
