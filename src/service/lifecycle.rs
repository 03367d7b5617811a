use std::sync::Arc;

use log::{info, warn};

use crate::{
    error::{Code, Error, Result},
    model::{
        audit::AuditEventType,
        dump::ElectionDump,
        election::{Election, ElectionId, ElectionSpec, ElectionState, PublicParams},
        tally::{ElectionResults, Tally},
    },
};

use super::{AuditLog, Context, KeyedLocks, Ledger};

/// Drives elections through DRAFT -> OPEN -> CLOSED -> TALLIED -> ARCHIVED.
///
/// Transitions of one election are serialized by its lifecycle lock, which is
/// shared with the tally engine.
#[derive(Clone)]
pub struct LifecycleController {
    ctx: Context,
    audit: AuditLog,
    ledger: Ledger,
    locks: Arc<KeyedLocks<ElectionId>>,
}

impl LifecycleController {
    pub fn new(ctx: Context, audit: AuditLog, ledger: Ledger, locks: Arc<KeyedLocks<ElectionId>>) -> Self {
        Self {
            ctx,
            audit,
            ledger,
            locks,
        }
    }

    /// Create a DRAFT election bound to the loaded keys.
    pub async fn create(&self, spec: ElectionSpec, actor: &str) -> Result<Election> {
        spec.validate()?;
        let election_id = self.ctx.store.next_election_id().await?;
        let election = Election::new(election_id, spec, PublicParams::from_keys(&self.ctx.keys));
        self.ctx.store.insert_election(&election).await?;
        info!("Created election {election_id} ({})", election.name);
        self.audit
            .record(self.audit.event(
                AuditEventType::AdminAction,
                actor,
                subject(election_id),
                format!("created \"{}\"", election.name),
            ))
            .await;
        Ok(election)
    }

    pub async fn get(&self, election_id: ElectionId) -> Result<Election> {
        self.ctx.election(election_id).await
    }

    pub async fn list(&self) -> Result<Vec<Election>> {
        self.ctx.store.list_elections().await
    }

    /// Open a DRAFT election and append its genesis block.
    pub async fn open(&self, election_id: ElectionId, actor: &str) -> Result<Election> {
        let _guard = self.locks.lock(&election_id).await;
        let mut election = self.ctx.election(election_id).await?;
        expect_state(&election, ElectionState::Draft, ElectionState::Open)?;
        if election.end_time <= self.ctx.now() {
            return Err(Error::input(
                Code::InvalidSpec,
                format!("Election {election_id} has already ended"),
            ));
        }
        self.ensure_bound(&election)?;

        self.ledger.append_genesis(&election).await?;
        self.transition(&mut election, ElectionState::Open, actor).await?;
        Ok(election)
    }

    /// Close an OPEN election. Waits for any in-flight ballot append, after
    /// which no further ballot is accepted.
    pub async fn close(&self, election_id: ElectionId, actor: &str) -> Result<Election> {
        let _guard = self.locks.lock(&election_id).await;
        let mut election = self.ctx.election(election_id).await?;
        expect_state(&election, ElectionState::Open, ElectionState::Closed)?;
        let _writer = self.ledger.lock(election_id).await;
        self.transition(&mut election, ElectionState::Closed, actor).await?;
        Ok(election)
    }

    pub async fn archive(&self, election_id: ElectionId, actor: &str) -> Result<Election> {
        let _guard = self.locks.lock(&election_id).await;
        let mut election = self.ctx.election(election_id).await?;
        expect_state(&election, ElectionState::Tallied, ElectionState::Archived)?;
        self.transition(&mut election, ElectionState::Archived, actor).await?;
        Ok(election)
    }

    /// Delete a DRAFT or ARCHIVED election together with everything recorded for it.
    pub async fn delete(&self, election_id: ElectionId, actor: &str) -> Result<()> {
        let _guard = self.locks.lock(&election_id).await;
        let election = self.ctx.election(election_id).await?;
        if !election.state.is_deletable() {
            return Err(Error::state(
                Code::IllegalTransition,
                format!("Election {election_id} is {}; only DRAFT or ARCHIVED elections can be deleted", election.state),
            ));
        }
        if !self.ctx.store.delete_election(election_id).await? {
            return Err(Error::not_found(format!("Election {election_id}")));
        }
        warn!("Deleted election {election_id}");
        self.audit
            .record(self.audit.event(
                AuditEventType::AdminAction,
                actor,
                subject(election_id),
                format!("deleted ({})", election.state),
            ))
            .await;
        Ok(())
    }

    /// Lift a suspension once the chain and the keys check out again.
    pub async fn resume(&self, election_id: ElectionId, actor: &str) -> Result<Election> {
        let _guard = self.locks.lock(&election_id).await;
        let mut election = self.ctx.election(election_id).await?;
        let Some(reason) = election.suspended.take() else {
            return Ok(election);
        };
        self.ensure_bound(&election)?;
        if election.state != ElectionState::Draft {
            self.ledger.verified_blocks(election_id).await?;
        }
        self.ctx.store.set_suspended(election_id, None).await?;
        info!("Resumed election {election_id}, suspended for: {reason}");
        self.audit
            .record(self.audit.event(
                AuditEventType::ElectionResumed,
                actor,
                subject(election_id),
                format!("was suspended: {reason}"),
            ))
            .await;
        Ok(election)
    }

    /// Published counts, available once the election is TALLIED.
    pub async fn results(&self, election_id: ElectionId) -> Result<ElectionResults> {
        Ok(ElectionResults::from(&self.proof(election_id).await?))
    }

    /// The signed proof bundle of a tallied election.
    pub async fn proof(&self, election_id: ElectionId) -> Result<Tally> {
        let election = self.ctx.election(election_id).await?;
        if !matches!(election.state, ElectionState::Tallied | ElectionState::Archived) {
            return Err(not_tallied(&election));
        }
        self.ctx
            .store
            .get_tally(election_id)
            .await?
            .ok_or_else(|| Error::Fatal(format!("Election {election_id} is {} but has no tally", election.state)))
    }

    /// Everything needed to verify a tallied election offline.
    pub async fn dump(&self, election_id: ElectionId) -> Result<ElectionDump> {
        let tally = self.proof(election_id).await?;
        let election = self.ctx.election(election_id).await?;
        let blocks = self.ctx.store.blocks(election_id, 0, None).await?;
        let mut ballots = self.ctx.store.ballots_for_election(election_id).await?;
        ballots.sort_by_key(|ballot| ballot.receipt.payload.block_index);
        Ok(ElectionDump {
            election,
            tally,
            blocks,
            ballot_ids: ballots.into_iter().map(|ballot| ballot.ballot_id).collect(),
            public_keys: self.ctx.keys.public_keys().clone(),
        })
    }

    /// OPEN elections, which need their closing rescheduled after a restart.
    pub async fn open_elections(&self) -> Result<Vec<Election>> {
        self.ctx.store.elections_in_state(ElectionState::Open).await
    }

    fn ensure_bound(&self, election: &Election) -> Result<()> {
        if election.params != PublicParams::from_keys(&self.ctx.keys) {
            return Err(Error::Fatal(format!(
                "Election {} is bound to keys that are not loaded",
                election.election_id
            )));
        }
        Ok(())
    }

    async fn transition(&self, election: &mut Election, to: ElectionState, actor: &str) -> Result<()> {
        let from = election.state;
        let election_id = election.election_id;
        if !self.ctx.store.transition_election(election_id, from, to).await? {
            return Err(Error::state(
                Code::IllegalTransition,
                format!("Election {election_id} changed state concurrently"),
            ));
        }
        election.state = to;
        info!("Election {election_id}: {from} -> {to}");
        self.audit
            .record(self.audit.event(
                AuditEventType::LifecycleTransition,
                actor,
                subject(election_id),
                format!("{from} -> {to}"),
            ))
            .await;
        Ok(())
    }
}

fn expect_state(election: &Election, from: ElectionState, to: ElectionState) -> Result<()> {
    if election.state != from {
        return Err(Error::state(
            Code::IllegalTransition,
            format!(
                "Election {} is {}; cannot move to {to}",
                election.election_id, election.state
            ),
        ));
    }
    Ok(())
}

fn not_tallied(election: &Election) -> Error {
    Error::state(
        Code::NotTallied,
        format!("Election {} is {}, not yet tallied", election.election_id, election.state),
    )
}

fn subject(election_id: ElectionId) -> String {
    format!("election:{election_id}")
}
