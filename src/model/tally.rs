use chrono::{serde::ts_milliseconds, DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::election::{Candidate, CandidateId, ElectionId};

/// Homomorphic sum of the ciphertexts cast for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSum {
    pub candidate_id: CandidateId,
    pub ciphertext: String,
}

/// Decrypted count for one candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateCount {
    pub candidate_id: CandidateId,
    pub count: u64,
}

/// Everything a third party needs to check a tally, signed as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofBundle {
    pub election_id: ElectionId,
    pub slate: Vec<Candidate>,
    pub encrypted_sums: Vec<EncryptedSum>,
    pub counts: Vec<CandidateCount>,
    pub total: u64,
    pub merkle_root: String,
    pub last_block_hash: String,
    #[serde(with = "ts_milliseconds")]
    pub ts: DateTime<Utc>,
}

impl ProofBundle {
    /// Candidates with the highest count. Empty when no ballots were cast.
    pub fn winners(&self) -> Vec<CandidateId> {
        let max = self.counts.iter().map(|c| c.count).max().unwrap_or(0);
        if max == 0 {
            return Vec::new();
        }
        self.counts
            .iter()
            .filter(|c| c.count == max)
            .map(|c| c.candidate_id)
            .collect()
    }
}

/// The stored tally artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub bundle: ProofBundle,
    /// RSA-PSS signature over the canonical bundle.
    pub signature: String,
    pub winners: Vec<CandidateId>,
}

impl Tally {
    pub fn election_id(&self) -> ElectionId {
        self.bundle.election_id
    }
}

/// One line of published results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateResult {
    pub candidate_id: CandidateId,
    pub name: String,
    pub party: String,
    pub count: u64,
}

/// Published results of a tallied election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElectionResults {
    pub election_id: ElectionId,
    pub results: Vec<CandidateResult>,
    pub total: u64,
    pub winners: Vec<CandidateId>,
}

impl From<&Tally> for ElectionResults {
    fn from(tally: &Tally) -> Self {
        let bundle = &tally.bundle;
        let results = bundle
            .slate
            .iter()
            .map(|candidate| CandidateResult {
                candidate_id: candidate.candidate_id,
                name: candidate.name.clone(),
                party: candidate.party.clone(),
                count: bundle
                    .counts
                    .iter()
                    .find(|c| c.candidate_id == candidate.candidate_id)
                    .map_or(0, |c| c.count),
            })
            .collect();
        Self {
            election_id: bundle.election_id,
            results,
            total: bundle.total,
            winners: tally.winners.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(counts: &[u64]) -> ProofBundle {
        ProofBundle {
            election_id: 1,
            slate: (1..=counts.len() as u32)
                .map(|id| Candidate {
                    candidate_id: id,
                    name: format!("Candidate {id}"),
                    party: String::new(),
                })
                .collect(),
            encrypted_sums: vec![],
            counts: counts
                .iter()
                .enumerate()
                .map(|(i, count)| CandidateCount {
                    candidate_id: i as u32 + 1,
                    count: *count,
                })
                .collect(),
            total: counts.iter().sum(),
            merkle_root: String::new(),
            last_block_hash: String::new(),
            ts: Utc::now(),
        }
    }

    #[test]
    fn single_winner() {
        assert_eq!(bundle(&[6, 3, 1]).winners(), vec![1]);
    }

    #[test]
    fn ties_share_the_win() {
        assert_eq!(bundle(&[2, 5, 5]).winners(), vec![2, 3]);
    }

    #[test]
    fn no_ballots_no_winner() {
        assert!(bundle(&[0, 0]).winners().is_empty());
    }

    #[test]
    fn results_follow_slate_order() {
        let bundle = bundle(&[6, 3, 1]);
        let tally = Tally {
            winners: bundle.winners(),
            bundle,
            signature: String::new(),
        };
        let results = ElectionResults::from(&tally);
        let counts: Vec<u64> = results.results.iter().map(|r| r.count).collect();
        assert_eq!(counts, vec![6, 3, 1]);
        assert_eq!(results.total, 10);
    }
}
