use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info};
use rocket::tokio::sync::OwnedMutexGuard;

use crate::{
    crypto::{canonical, sha256_hex},
    error::{Code, Error, Result},
    model::{
        audit::AuditEventType,
        block::{payload_hash, verify_chain, Block, ChainReport, GENESIS_INDEX},
        election::{Election, ElectionId},
    },
};

use super::{AuditLog, Context, KeyedLocks, SYSTEM_ACTOR};

/// Default and maximum number of blocks in one page.
pub const DEFAULT_PAGE: usize = 100;
pub const MAX_PAGE: usize = 1000;

/// The per-election hash chains. Appends to one election are serialized by
/// its writer lock; reads never take it.
#[derive(Clone)]
pub struct Ledger {
    ctx: Context,
    audit: AuditLog,
    writers: Arc<KeyedLocks<ElectionId>>,
}

impl Ledger {
    pub fn new(ctx: Context, audit: AuditLog) -> Self {
        Self {
            ctx,
            audit,
            writers: Arc::new(KeyedLocks::new()),
        }
    }

    /// Take the single-writer lock of an election's chain.
    pub async fn lock(&self, election_id: ElectionId) -> OwnedMutexGuard<()> {
        self.writers.lock(&election_id).await
    }

    /// Wait for every in-flight append to finish.
    pub async fn drain(&self) {
        self.writers.drain().await
    }

    /// Append block 0, committing to the election's parameters. Returns the
    /// existing genesis block if there already is one.
    pub async fn append_genesis(&self, election: &Election) -> Result<Block> {
        let _guard = self.lock(election.election_id).await;
        let election_id = election.election_id;
        if let Some(tail) = self.ctx.store.tail_block(election_id).await? {
            if tail.index != GENESIS_INDEX {
                return Err(Error::Fatal(format!(
                    "Election {election_id} already has {} ballot blocks",
                    tail.index
                )));
            }
            return Ok(tail);
        }

        let payload_hash = sha256_hex(canonical(&election.genesis_payload())?);
        let genesis = Block::genesis(election_id, payload_hash, self.ctx.now(), self.ctx.keys.ledger_signing())?;
        self.ctx.store.append_block(&genesis).await?;
        info!("Appended genesis block for election {election_id}");
        self.audit
            .record(
                self.audit
                    .event(AuditEventType::LedgerAppend, SYSTEM_ACTOR, subject(election_id), "genesis")
                    .at_block(GENESIS_INDEX),
            )
            .await;
        Ok(genesis)
    }

    /// The current tail, checked before anything is chained onto it.
    ///
    /// Must be called while holding the election's writer lock. A tail that
    /// fails verification is recorded as an integrity violation and reported
    /// as `FATAL`.
    pub async fn verified_tail(&self, election_id: ElectionId) -> Result<Block> {
        let tail = self
            .ctx
            .store
            .tail_block(election_id)
            .await?
            .ok_or_else(|| Error::Fatal(format!("Election {election_id}: ledger has no genesis block")))?;
        let fault = if tail.election_id != election_id {
            Some(format!("tail belongs to election {}", tail.election_id))
        } else {
            tail.verify_self(&self.ctx.keys.ledger_verifying())
                .err()
                .map(|fault| format!("tail block {} failed verification: {fault}", tail.index))
        };
        if let Some(reason) = fault {
            self.integrity_violation(election_id, SYSTEM_ACTOR, &reason, Some(tail.index))
                .await;
            return Err(Error::Fatal(format!("Election {election_id}: {reason}")));
        }
        Ok(tail)
    }

    /// Compose and sign the block recording `ballot_id` after `tail`.
    pub fn compose_next(&self, tail: &Block, ballot_id: &str, ts: DateTime<Utc>) -> Result<Block> {
        Ok(tail.next(payload_hash(ballot_id), ts, self.ctx.keys.ledger_signing())?)
    }

    /// Verify an election's whole chain. A broken chain is recorded as an
    /// integrity violation.
    pub async fn verify(&self, election_id: ElectionId) -> Result<ChainReport> {
        let (report, _) = self.load(election_id).await?;
        Ok(report)
    }

    /// Every block of a chain that verifies, or `CHAIN_BROKEN`.
    pub async fn verified_blocks(&self, election_id: ElectionId) -> Result<Vec<Block>> {
        let (report, blocks) = self.load(election_id).await?;
        if !report.ok {
            return Err(Error::integrity(
                Code::ChainBroken,
                format!(
                    "Ledger of election {election_id} is broken at block {}",
                    report.first_bad_index.unwrap_or_default()
                ),
            ));
        }
        Ok(blocks)
    }

    /// A page of blocks starting at index `from`.
    pub async fn blocks(&self, election_id: ElectionId, from: u64, limit: Option<usize>) -> Result<Vec<Block>> {
        self.ctx.election(election_id).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        self.ctx.store.blocks(election_id, from, Some(limit)).await
    }

    /// Refuse an administrative change to a ledger block. Always fails with
    /// `LEDGER_IMMUTABLE`; the attempt is recorded as an integrity violation.
    pub async fn reject_modification(
        &self,
        election_id: ElectionId,
        index: u64,
        action: &str,
        actor: &str,
    ) -> Error {
        let reason = format!("refused {action} of block {index}");
        self.integrity_violation(election_id, actor, &reason, Some(index))
            .await;
        Error::integrity(
            Code::LedgerImmutable,
            format!("Ledger blocks cannot be modified ({action} of block {index} in election {election_id})"),
        )
    }

    async fn load(&self, election_id: ElectionId) -> Result<(ChainReport, Vec<Block>)> {
        self.ctx.election(election_id).await?;
        let blocks = self.ctx.store.blocks(election_id, 0, None).await?;
        let report = verify_chain(election_id, &blocks, &self.ctx.keys.ledger_verifying());
        if report.ok {
            debug!("Ledger of election {election_id} verified, {} blocks", report.length);
        } else {
            let reason = format!(
                "chain verification failed: {}",
                report.reason.as_deref().unwrap_or("unknown fault")
            );
            self.integrity_violation(election_id, SYSTEM_ACTOR, &reason, report.first_bad_index)
                .await;
        }
        Ok((report, blocks))
    }

    async fn integrity_violation(&self, election_id: ElectionId, actor: &str, reason: &str, index: Option<u64>) {
        error!("Integrity violation on election {election_id}: {reason}");
        let mut event = self
            .audit
            .event(AuditEventType::IntegrityViolation, actor, subject(election_id), reason);
        event.block_index = index;
        self.audit.record(event).await;
    }
}

fn subject(election_id: ElectionId) -> String {
    format!("election:{election_id}")
}
