//! An in-process store. All tables sit behind one lock, so every operation,
//! including a submission commit, is atomic.

use std::collections::{BTreeMap, HashMap};

use rocket::tokio::sync::RwLock;

use crate::{
    error::{Error, Result},
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

use super::{fail, Store, Submission};

#[derive(Default)]
struct Tables {
    next_election_id: ElectionId,
    elections: BTreeMap<ElectionId, Election>,
    voters: HashMap<VoterId, Voter>,
    tokens: HashMap<TokenId, Ovt>,
    /// In ledger order.
    ballots: Vec<Ballot>,
    blocks: HashMap<ElectionId, Vec<Block>>,
    tallies: HashMap<ElectionId, Tally>,
    audit: Vec<AuditEvent>,
    admins: BTreeMap<String, Admin>,
    config: Option<PublicParams>,
}

impl Tables {
    fn has_issued_token(&self, voter_id: &str, election_id: ElectionId) -> bool {
        self.tokens.values().any(|token| {
            token.voter_id == voter_id && token.election_id == election_id && token.state == TokenState::Issued
        })
    }

    fn next_block_index(&self, election_id: ElectionId) -> u64 {
        self.blocks.get(&election_id).map_or(0, |chain| chain.len() as u64)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    #[cfg(test)]
    audit_delay: std::sync::Mutex<Option<std::time::Duration>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables {
                next_election_id: 1,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[cfg(not(test))]
    async fn slow_audit(&self) {}
}

#[rocket::async_trait]
impl Store for MemoryStore {
    async fn next_election_id(&self) -> Result<ElectionId> {
        let mut tables = self.tables.write().await;
        let id = tables.next_election_id.max(1);
        tables.next_election_id = id + 1;
        Ok(id)
    }

    async fn insert_election(&self, election: &Election) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.elections.insert(election.election_id, election.clone());
        Ok(())
    }

    async fn get_election(&self, election_id: ElectionId) -> Result<Option<Election>> {
        Ok(self.tables.read().await.elections.get(&election_id).cloned())
    }

    async fn list_elections(&self) -> Result<Vec<Election>> {
        Ok(self.tables.read().await.elections.values().cloned().collect())
    }

    async fn elections_in_state(&self, state: ElectionState) -> Result<Vec<Election>> {
        let tables = self.tables.read().await;
        Ok(tables
            .elections
            .values()
            .filter(|election| election.state == state)
            .cloned()
            .collect())
    }

    async fn transition_election(
        &self,
        election_id: ElectionId,
        from: ElectionState,
        to: ElectionState,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.elections.get_mut(&election_id) {
            Some(election) if election.state == from => {
                election.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_suspended(&self, election_id: ElectionId, reason: Option<String>) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .elections
            .get_mut(&election_id)
            .map(|election| election.suspended = reason)
            .is_some())
    }

    async fn delete_election(&self, election_id: ElectionId) -> Result<bool> {
        let mut tables = self.tables.write().await;
        if tables.elections.remove(&election_id).is_none() {
            return Ok(false);
        }
        tables.tokens.retain(|_, token| token.election_id != election_id);
        tables.ballots.retain(|ballot| ballot.election_id != election_id);
        tables.blocks.remove(&election_id);
        tables.tallies.remove(&election_id);
        Ok(true)
    }

    async fn insert_voter(&self, voter: &Voter) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.voters.contains_key(&voter.voter_id) {
            return Err(fail::voter_exists(&voter.voter_id));
        }
        tables.voters.insert(voter.voter_id.clone(), voter.clone());
        Ok(())
    }

    async fn get_voter(&self, voter_id: &str) -> Result<Option<Voter>> {
        Ok(self.tables.read().await.voters.get(voter_id).cloned())
    }

    async fn set_voter_state(&self, voter_id: &str, state: EnrollmentState) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .voters
            .get_mut(voter_id)
            .filter(|voter| !voter.erased)
            .map(|voter| voter.state = state)
            .is_some())
    }

    async fn replace_template(&self, voter_id: &str, template: &BiometricTemplate) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .voters
            .get_mut(voter_id)
            .filter(|voter| !voter.erased)
            .map(|voter| voter.template = Some(template.clone()))
            .is_some())
    }

    async fn erase_voter(&self, voter_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.voters.get_mut(voter_id).map(Voter::erase).is_some())
    }

    async fn mark_voted(&self, voter_id: &str, election_id: ElectionId) -> Result<()> {
        let mut tables = self.tables.write().await;
        let voter = tables
            .voters
            .get_mut(voter_id)
            .ok_or_else(|| Error::not_found(format!("Voter {voter_id}")))?;
        if !voter.has_voted_for.insert(election_id) {
            return Err(fail::already_voted(voter_id, election_id));
        }
        Ok(())
    }

    async fn insert_token(&self, token: &Ovt) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.has_issued_token(&token.voter_id, token.election_id) {
            return Err(fail::ovt_outstanding(&token.voter_id, token.election_id));
        }
        tables.tokens.insert(token.token_id.clone(), token.clone());
        Ok(())
    }

    async fn get_token(&self, token_id: &str) -> Result<Option<Ovt>> {
        Ok(self.tables.read().await.tokens.get(token_id).cloned())
    }

    async fn set_token_state(&self, token_id: &str, from: TokenState, to: TokenState) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.tokens.get_mut(token_id) {
            Some(token) if token.state == from => {
                token.state = to;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn issued_token_for(&self, voter_id: &str, election_id: ElectionId) -> Result<Option<Ovt>> {
        let tables = self.tables.read().await;
        Ok(tables
            .tokens
            .values()
            .find(|token| {
                token.voter_id == voter_id
                    && token.election_id == election_id
                    && token.state == TokenState::Issued
            })
            .cloned())
    }

    async fn revoke_tokens_for_voter(&self, voter_id: &str) -> Result<Vec<TokenId>> {
        let mut tables = self.tables.write().await;
        let mut revoked = Vec::new();
        for token in tables.tokens.values_mut() {
            if token.voter_id == voter_id && token.state == TokenState::Issued {
                token.state = TokenState::Revoked;
                revoked.push(token.token_id.clone());
            }
        }
        Ok(revoked)
    }

    async fn ballot_by_token(&self, token_id: &str) -> Result<Option<Ballot>> {
        let tables = self.tables.read().await;
        Ok(tables
            .ballots
            .iter()
            .find(|ballot| ballot.token_id == token_id)
            .cloned())
    }

    async fn ballots_for_election(&self, election_id: ElectionId) -> Result<Vec<Ballot>> {
        let tables = self.tables.read().await;
        Ok(tables
            .ballots
            .iter()
            .filter(|ballot| ballot.election_id == election_id)
            .cloned()
            .collect())
    }

    async fn blocks(&self, election_id: ElectionId, from: u64, limit: Option<usize>) -> Result<Vec<Block>> {
        let tables = self.tables.read().await;
        let chain = match tables.blocks.get(&election_id) {
            Some(chain) => chain,
            None => return Ok(Vec::new()),
        };
        let from = usize::try_from(from).unwrap_or(usize::MAX).min(chain.len());
        let rest = &chain[from..];
        let limit = limit.unwrap_or(rest.len()).min(rest.len());
        Ok(rest[..limit].to_vec())
    }

    async fn tail_block(&self, election_id: ElectionId) -> Result<Option<Block>> {
        let tables = self.tables.read().await;
        Ok(tables.blocks.get(&election_id).and_then(|chain| chain.last().cloned()))
    }

    async fn append_block(&self, block: &Block) -> Result<()> {
        let mut tables = self.tables.write().await;
        if block.index != tables.next_block_index(block.election_id) {
            return Err(fail::block_taken(block.election_id, block.index));
        }
        tables.blocks.entry(block.election_id).or_default().push(block.clone());
        Ok(())
    }

    async fn commit_submission(&self, submission: &Submission) -> Result<()> {
        let mut tables = self.tables.write().await;
        let Submission {
            token_id,
            voter_id,
            election_id,
            ballot,
            block,
            now,
        } = submission;

        // Check everything before changing anything.
        let token_ok = tables
            .tokens
            .get(token_id)
            .map_or(false, |token| token.state == TokenState::Issued && !token.is_expired_at(*now));
        if !token_ok || tables.ballots.iter().any(|b| b.token_id == *token_id) {
            return Err(fail::token_unusable());
        }
        match tables.voters.get(voter_id) {
            Some(voter) if voter.has_voted(*election_id) => {
                return Err(fail::already_voted(voter_id, *election_id))
            }
            Some(_) => {}
            None => return Err(Error::not_found(format!("Voter {voter_id}"))),
        }
        if block.index != tables.next_block_index(*election_id) {
            return Err(fail::block_taken(*election_id, block.index));
        }

        if let Some(token) = tables.tokens.get_mut(token_id) {
            token.state = TokenState::Consumed;
        }
        if let Some(voter) = tables.voters.get_mut(voter_id) {
            voter.has_voted_for.insert(*election_id);
        }
        tables.ballots.push(ballot.clone());
        tables.blocks.entry(*election_id).or_default().push(block.clone());
        Ok(())
    }

    async fn publish_tally(&self, tally: &Tally) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.elections.get_mut(&tally.election_id()) {
            Some(election) if election.state == ElectionState::Closed => {
                election.state = ElectionState::Tallied;
            }
            _ => return Ok(false),
        }
        tables.tallies.insert(tally.election_id(), tally.clone());
        Ok(true)
    }

    async fn get_tally(&self, election_id: ElectionId) -> Result<Option<Tally>> {
        Ok(self.tables.read().await.tallies.get(&election_id).cloned())
    }

    async fn append_audit(&self, event: &AuditEvent) -> Result<()> {
        self.slow_audit().await;
        self.tables.write().await.audit.push(event.clone());
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .audit
            .iter()
            .rev()
            .filter(|event| filter.matches(event))
            .take(filter.limit())
            .cloned()
            .collect())
    }

    async fn get_admin(&self, username: &str) -> Result<Option<Admin>> {
        Ok(self.tables.read().await.admins.get(username).cloned())
    }

    async fn list_admins(&self) -> Result<Vec<Admin>> {
        Ok(self.tables.read().await.admins.values().cloned().collect())
    }

    async fn insert_admin(&self, admin: &Admin) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.admins.contains_key(&admin.username) {
            return Err(fail::admin_exists(&admin.username));
        }
        tables.admins.insert(admin.username.clone(), admin.clone());
        Ok(())
    }

    async fn delete_admin(&self, username: &str) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.admins.contains_key(username) {
            return Err(Error::not_found(format!("Admin {username}")));
        }
        if tables.admins.len() == 1 {
            return Err(fail::last_admin());
        }
        tables.admins.remove(username);
        Ok(())
    }

    async fn get_system_config(&self) -> Result<Option<PublicParams>> {
        Ok(self.tables.read().await.config.clone())
    }

    async fn put_system_config(&self, params: &PublicParams) -> Result<()> {
        self.tables.write().await.config = Some(params.clone());
        Ok(())
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Overwrite a stored block in place, bypassing every store operation.
    pub async fn tamper_block(&self, election_id: ElectionId, index: u64, tamper: impl FnOnce(&mut Block)) {
        let mut tables = self.tables.write().await;
        let block = tables
            .blocks
            .get_mut(&election_id)
            .and_then(|chain| chain.get_mut(index as usize))
            .expect("no such block");
        tamper(block);
    }

    /// Make every later audit write wait for `delay` first.
    pub fn delay_audit(&self, delay: Option<std::time::Duration>) {
        *self.audit_delay.lock().unwrap() = delay;
    }

    async fn slow_audit(&self) {
        let delay = *self.audit_delay.lock().unwrap();
        if let Some(delay) = delay {
            rocket::tokio::time::sleep(delay).await;
        }
    }
}
