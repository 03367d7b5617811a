//! Persistence. Every storage backend implements [`Store`]; the services
//! never see which one is in use.

use chrono::{DateTime, Utc};

use crate::{
    error::Result,
    model::{
        admin::Admin,
        audit::{AuditEvent, AuditFilter},
        ballot::Ballot,
        block::Block,
        election::{Election, ElectionId, ElectionState, PublicParams},
        tally::Tally,
        token::{Ovt, TokenId, TokenState},
        voter::{BiometricTemplate, EnrollmentState, Voter, VoterId},
    },
};

pub mod memory;
pub mod mongodb;

pub use self::memory::MemoryStore;
pub use self::mongodb::MongoStore;

/// Everything written when a ballot is accepted. Committed all or nothing.
#[derive(Debug, Clone)]
pub struct Submission {
    pub token_id: TokenId,
    pub voter_id: VoterId,
    pub election_id: ElectionId,
    pub ballot: Ballot,
    pub block: Block,
    /// The token must still be unexpired at this instant.
    pub now: DateTime<Utc>,
}

#[rocket::async_trait]
pub trait Store: Send + Sync {
    // Elections

    /// Atomically allocate the next election ID.
    async fn next_election_id(&self) -> Result<ElectionId>;
    async fn insert_election(&self, election: &Election) -> Result<()>;
    async fn get_election(&self, election_id: ElectionId) -> Result<Option<Election>>;
    async fn list_elections(&self) -> Result<Vec<Election>>;
    async fn elections_in_state(&self, state: ElectionState) -> Result<Vec<Election>>;
    /// Compare-and-set the election state. Returns false if the election was not in `from`.
    async fn transition_election(&self, election_id: ElectionId, from: ElectionState, to: ElectionState)
        -> Result<bool>;
    async fn set_suspended(&self, election_id: ElectionId, reason: Option<String>) -> Result<bool>;
    /// Remove an election together with its tokens, ballots, blocks and tally.
    async fn delete_election(&self, election_id: ElectionId) -> Result<bool>;

    // Voters

    /// Fails with `ALREADY_EXISTS` if the voter ID is taken.
    async fn insert_voter(&self, voter: &Voter) -> Result<()>;
    async fn get_voter(&self, voter_id: &str) -> Result<Option<Voter>>;
    async fn set_voter_state(&self, voter_id: &str, state: EnrollmentState) -> Result<bool>;
    async fn replace_template(&self, voter_id: &str, template: &BiometricTemplate) -> Result<bool>;
    /// Destroy a voter's personal data, keeping the voting history.
    async fn erase_voter(&self, voter_id: &str) -> Result<bool>;
    /// Record that a voter has voted. Fails with `ALREADY_VOTED` on a second call.
    async fn mark_voted(&self, voter_id: &str, election_id: ElectionId) -> Result<()>;

    // Tokens

    /// Fails with `OVT_OUTSTANDING` if an issued token exists for the same voter and election.
    async fn insert_token(&self, token: &Ovt) -> Result<()>;
    async fn get_token(&self, token_id: &str) -> Result<Option<Ovt>>;
    /// Compare-and-set the token state.
    async fn set_token_state(&self, token_id: &str, from: TokenState, to: TokenState) -> Result<bool>;
    async fn issued_token_for(&self, voter_id: &str, election_id: ElectionId) -> Result<Option<Ovt>>;
    /// Revoke every issued token held by a voter, returning their IDs.
    async fn revoke_tokens_for_voter(&self, voter_id: &str) -> Result<Vec<TokenId>>;

    // Ballots and blocks

    async fn ballot_by_token(&self, token_id: &str) -> Result<Option<Ballot>>;
    /// Ballots of an election in ledger order.
    async fn ballots_for_election(&self, election_id: ElectionId) -> Result<Vec<Ballot>>;
    /// Blocks of an election in index order, starting at `from`.
    async fn blocks(&self, election_id: ElectionId, from: u64, limit: Option<usize>) -> Result<Vec<Block>>;
    async fn tail_block(&self, election_id: ElectionId) -> Result<Option<Block>>;
    /// Append a block with no ballot, i.e. genesis.
    async fn append_block(&self, block: &Block) -> Result<()>;
    /// Consume the token, mark the voter as voted, and store the ballot and
    /// its block, all or nothing.
    async fn commit_submission(&self, submission: &Submission) -> Result<()>;

    // Tallies

    /// Move the election from CLOSED to TALLIED and store its tally, all or
    /// nothing. `false` when the election was not CLOSED; nothing is written.
    async fn publish_tally(&self, tally: &Tally) -> Result<bool>;
    async fn get_tally(&self, election_id: ElectionId) -> Result<Option<Tally>>;

    // Audit

    async fn append_audit(&self, event: &AuditEvent) -> Result<()>;
    /// Matching events, newest first.
    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>>;

    // Admins

    async fn get_admin(&self, username: &str) -> Result<Option<Admin>>;
    async fn list_admins(&self) -> Result<Vec<Admin>>;
    /// Fails with `ALREADY_EXISTS` if the username is taken.
    async fn insert_admin(&self, admin: &Admin) -> Result<()>;
    /// Fails with `LAST_ADMIN` rather than remove the only admin.
    async fn delete_admin(&self, username: &str) -> Result<()>;

    // System configuration

    async fn get_system_config(&self) -> Result<Option<PublicParams>>;
    async fn put_system_config(&self, params: &PublicParams) -> Result<()>;
}

/// Domain errors raised by every backend alike.
pub(crate) mod fail {
    use crate::{
        error::{Code, Error},
        model::election::ElectionId,
    };

    pub fn voter_exists(voter_id: &str) -> Error {
        Error::conflict(Code::AlreadyExists, format!("Voter {voter_id} already exists"))
    }

    pub fn admin_exists(username: &str) -> Error {
        Error::conflict(Code::AlreadyExists, format!("Admin username already in use: {username}"))
    }

    pub fn already_voted(voter_id: &str, election_id: ElectionId) -> Error {
        Error::conflict(
            Code::AlreadyVoted,
            format!("Voter {voter_id} has already voted in election {election_id}"),
        )
    }

    pub fn ovt_outstanding(voter_id: &str, election_id: ElectionId) -> Error {
        Error::conflict(
            Code::OvtOutstanding,
            format!("Voter {voter_id} already holds a token for election {election_id}"),
        )
    }

    pub fn token_unusable() -> Error {
        Error::auth(Code::TokenInvalid, "Token is not valid for submission")
    }

    pub fn last_admin() -> Error {
        Error::conflict(Code::LastAdmin, "Cannot delete last admin!")
    }

    pub fn block_taken(election_id: ElectionId, index: u64) -> Error {
        Error::Transient(format!("Block {index} of election {election_id} was written concurrently"))
    }
}
