use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{canonical, sha256_hex};

use super::{
    election::{CandidateId, ElectionId},
    token::TokenId,
};

pub type BallotId = String;

/// A ballot as submitted by a voter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBallot {
    pub election_id: ElectionId,
    pub candidate_id: CandidateId,
    /// Decimal Paillier ciphertext of the value 1.
    pub ciphertext: String,
    pub token_id: TokenId,
    pub token_signature: String,
}

/// The fields a ballot ID is the hash of.
#[derive(Debug, Serialize)]
struct BallotIdFields<'a> {
    election_id: ElectionId,
    candidate_id: CandidateId,
    ciphertext: &'a str,
    token_id: &'a str,
    #[serde(with = "ts_milliseconds")]
    ts: DateTime<Utc>,
}

/// Content hash identifying a ballot.
pub fn ballot_id(
    election_id: ElectionId,
    candidate_id: CandidateId,
    ciphertext: &str,
    token_id: &str,
    ts: DateTime<Utc>,
) -> Result<BallotId, serde_json::Error> {
    let fields = BallotIdFields {
        election_id,
        candidate_id,
        ciphertext,
        token_id,
        ts,
    };
    Ok(sha256_hex(canonical(&fields)?))
}

/// The receipt payload the server signs for an accepted ballot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptPayload {
    pub ballot_id: BallotId,
    pub election_id: ElectionId,
    #[serde(with = "ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub block_index: u64,
    pub block_hash: String,
}

/// A signed receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(flatten)]
    pub payload: ReceiptPayload,
    pub receipt_signature: String,
}

/// An accepted ballot. Carries no voter identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ballot {
    pub ballot_id: BallotId,
    pub election_id: ElectionId,
    pub candidate_id: CandidateId,
    pub ciphertext: String,
    pub token_id: TokenId,
    #[serde(with = "ts_milliseconds")]
    pub submitted_at: DateTime<Utc>,
    pub receipt: Receipt,
}
