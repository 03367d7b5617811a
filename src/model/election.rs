use std::collections::HashSet;
use std::fmt::{Display, Formatter};

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use mongodb::bson::Bson;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::{
    crypto::{paillier::biguint_decimal, KeyStore},
    error::{Code, Error, Result},
};

pub type ElectionId = u32;
pub type CandidateId = u32;

/// A candidate on an election's slate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: CandidateId,
    pub name: String,
    #[serde(default)]
    pub party: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElectionState {
    Draft,
    Open,
    Closed,
    Tallied,
    Archived,
}

impl ElectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "DRAFT",
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Tallied => "TALLIED",
            Self::Archived => "ARCHIVED",
        }
    }

    /// The single state each state may move to.
    pub fn successor(self) -> Option<Self> {
        match self {
            Self::Draft => Some(Self::Open),
            Self::Open => Some(Self::Closed),
            Self::Closed => Some(Self::Tallied),
            Self::Tallied => Some(Self::Archived),
            Self::Archived => None,
        }
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        self.successor() == Some(to)
    }

    /// Only drafts and archived elections may be deleted.
    pub fn is_deletable(self) -> bool {
        matches!(self, Self::Draft | Self::Archived)
    }
}

impl Display for ElectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ElectionState> for Bson {
    fn from(state: ElectionState) -> Self {
        Bson::String(state.as_str().to_string())
    }
}

/// The public parameters an election is bound to at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicParams {
    #[serde(with = "biguint_decimal")]
    pub paillier_n: BigUint,
    pub ovt_fingerprint: String,
    pub ledger_fingerprint: String,
    pub receipt_fingerprint: String,
}

impl PublicParams {
    pub fn from_keys(keys: &KeyStore) -> Self {
        let public = keys.public_keys();
        Self {
            paillier_n: public.paillier_n.clone(),
            ovt_fingerprint: public.ovt_fingerprint.clone(),
            ledger_fingerprint: public.ledger_fingerprint.clone(),
            receipt_fingerprint: public.receipt_fingerprint.clone(),
        }
    }
}

/// An election specification, as submitted by an administrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub candidates: Vec<Candidate>,
    #[serde(with = "ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub eligible_count: u32,
}

impl ElectionSpec {
    /// Check the election definition is well formed: a name, a nonempty slate with
    /// unique candidate IDs, and a schedule that ends after it starts.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| Err(Error::input(Code::InvalidSpec, message));
        if self.name.trim().is_empty() {
            return invalid("Election name must not be empty");
        }
        if self.candidates.is_empty() {
            return invalid("Candidate slate must not be empty");
        }
        let mut ids = HashSet::new();
        for candidate in &self.candidates {
            if candidate.name.trim().is_empty() {
                return invalid("Candidate names must not be empty");
            }
            if !ids.insert(candidate.candidate_id) {
                return Err(Error::input(
                    Code::InvalidSpec,
                    format!("Duplicate candidate ID {}", candidate.candidate_id),
                ));
            }
        }
        if self.end_time <= self.start_time {
            return invalid("Election must end after it starts");
        }
        Ok(())
    }
}

/// An election, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Election {
    pub election_id: ElectionId,
    pub name: String,
    pub description: String,
    pub candidates: Vec<Candidate>,
    #[serde(with = "ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    pub eligible_count: u32,
    pub state: ElectionState,
    pub params: PublicParams,
    /// Set when a fatal condition stops ballot acceptance until an administrator resumes it.
    #[serde(default)]
    pub suspended: Option<String>,
}

impl Election {
    pub fn new(election_id: ElectionId, spec: ElectionSpec, params: PublicParams) -> Self {
        Self {
            election_id,
            name: spec.name,
            description: spec.description,
            candidates: spec.candidates,
            start_time: spec.start_time,
            end_time: spec.end_time,
            eligible_count: spec.eligible_count,
            state: ElectionState::Draft,
            params,
            suspended: None,
        }
    }

    pub fn candidate(&self, candidate_id: CandidateId) -> Option<&Candidate> {
        self.candidates
            .iter()
            .find(|candidate| candidate.candidate_id == candidate_id)
    }

    /// Fail unless this election is currently accepting tokens and ballots.
    pub fn ensure_accepting(&self) -> Result<()> {
        if self.state != ElectionState::Open {
            return Err(Error::state(
                Code::ElectionNotOpen,
                format!("Election {} is {}, not OPEN", self.election_id, self.state),
            ));
        }
        if let Some(reason) = &self.suspended {
            return Err(Error::state(
                Code::ElectionSuspended,
                format!("Election {} is suspended: {reason}", self.election_id),
            ));
        }
        Ok(())
    }

    /// The parameters committed to by the genesis block.
    pub fn genesis_payload(&self) -> GenesisPayload<'_> {
        GenesisPayload {
            election_id: self.election_id,
            name: &self.name,
            candidates: &self.candidates,
            start_time: self.start_time,
            end_time: self.end_time,
            params: &self.params,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GenesisPayload<'a> {
    pub election_id: ElectionId,
    pub name: &'a str,
    pub candidates: &'a [Candidate],
    #[serde(with = "ts_milliseconds")]
    pub start_time: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub end_time: DateTime<Utc>,
    pub params: &'a PublicParams,
}
