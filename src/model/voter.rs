use std::collections::BTreeSet;

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};

use super::election::ElectionId;

pub type VoterId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentState {
    Pending,
    Approved,
    Blocked,
}

impl EnrollmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Approved => "APPROVED",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl From<EnrollmentState> for Bson {
    fn from(state: EnrollmentState) -> Self {
        Bson::String(state.as_str().to_string())
    }
}

/// A face template. Never leaves the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BiometricTemplate {
    pub vector: Vec<f64>,
    pub algorithm: String,
    pub quality: f64,
}

/// A registered voter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voter {
    pub voter_id: VoterId,
    pub name: String,
    pub contact: String,
    pub state: EnrollmentState,
    pub template: Option<BiometricTemplate>,
    #[serde(with = "ts_milliseconds")]
    pub enrolled_at: DateTime<Utc>,
    /// Elections this voter has cast a ballot in. Only ever grows.
    #[serde(default)]
    pub has_voted_for: BTreeSet<ElectionId>,
    /// Erased voters keep only their ID and voting history.
    #[serde(default)]
    pub erased: bool,
}

impl Voter {
    pub fn new(
        voter_id: VoterId,
        name: String,
        contact: String,
        template: BiometricTemplate,
        enrolled_at: DateTime<Utc>,
    ) -> Self {
        Self {
            voter_id,
            name,
            contact,
            state: EnrollmentState::Pending,
            template: Some(template),
            enrolled_at,
            has_voted_for: BTreeSet::new(),
            erased: false,
        }
    }

    pub fn has_voted(&self, election_id: ElectionId) -> bool {
        self.has_voted_for.contains(&election_id)
    }

    /// Destroy personal data, keeping the voting history as a tombstone.
    pub fn erase(&mut self) {
        self.name.clear();
        self.contact.clear();
        self.template = None;
        self.state = EnrollmentState::Blocked;
        self.erased = true;
    }
}

/// A voter as shown to administrators: everything except the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoterView {
    pub voter_id: VoterId,
    pub name: String,
    pub contact: String,
    pub state: EnrollmentState,
    pub has_template: bool,
    #[serde(with = "ts_milliseconds")]
    pub enrolled_at: DateTime<Utc>,
    pub has_voted_for: BTreeSet<ElectionId>,
    pub erased: bool,
}

impl From<Voter> for VoterView {
    fn from(voter: Voter) -> Self {
        Self {
            has_template: voter.template.is_some(),
            voter_id: voter.voter_id,
            name: voter.name,
            contact: voter.contact,
            state: voter.state,
            enrolled_at: voter.enrolled_at,
            has_voted_for: voter.has_voted_for,
            erased: voter.erased,
        }
    }
}
