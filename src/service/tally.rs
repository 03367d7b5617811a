use std::sync::Arc;

use log::{error, info};
use num_traits::ToPrimitive;
use rocket::tokio::task;

use crate::{
    crypto::{
        canonical, merkle::merkle_root, paillier::encrypted_zero, paillier_add, paillier_decrypt, rsa_pss_sign,
        KeyStore,
    },
    error::{Code, Error, Result},
    model::{
        audit::AuditEventType,
        ballot::Ballot,
        block::{payload_hash, Block},
        election::{CandidateId, ElectionId, ElectionState, PublicParams},
        tally::{CandidateCount, EncryptedSum, ProofBundle, Tally},
    },
};

use super::{join_error, AuditLog, Context, KeyedLocks, Ledger};

/// Turns a closed election's ballots into signed results.
#[derive(Clone)]
pub struct TallyEngine {
    ctx: Context,
    audit: AuditLog,
    ledger: Ledger,
    election_locks: Arc<KeyedLocks<ElectionId>>,
}

impl TallyEngine {
    pub fn new(ctx: Context, audit: AuditLog, ledger: Ledger, election_locks: Arc<KeyedLocks<ElectionId>>) -> Self {
        Self {
            ctx,
            audit,
            ledger,
            election_locks,
        }
    }

    /// Tally a CLOSED election: aggregate and decrypt per candidate, check
    /// the totals against the ledger, sign the proof bundle and move the
    /// election to TALLIED.
    pub async fn tally(&self, election_id: ElectionId, actor: &str) -> Result<Tally> {
        let _guard = self.election_locks.lock(&election_id).await;
        let election = self.ctx.election(election_id).await?;
        if election.state != ElectionState::Closed {
            return Err(Error::state(
                Code::IllegalTransition,
                format!("Election {election_id} is {}; only CLOSED elections can be tallied", election.state),
            ));
        }
        if election.params != PublicParams::from_keys(&self.ctx.keys) {
            return Err(Error::Fatal(format!(
                "Election {election_id} is bound to keys that are no longer loaded"
            )));
        }

        let blocks = self.ledger.verified_blocks(election_id).await?;
        let ballots = self.ctx.store.ballots_for_election(election_id).await?;
        if let Err(reason) = check_ballots_on_ledger(&ballots, &blocks) {
            return Err(self.mismatch(election_id, reason).await);
        }

        let keys = self.ctx.keys.clone();
        let slate: Vec<CandidateId> = election.candidates.iter().map(|c| c.candidate_id).collect();
        let entries: Vec<(CandidateId, String)> = ballots
            .iter()
            .map(|ballot| (ballot.candidate_id, ballot.ciphertext.clone()))
            .collect();
        let (encrypted_sums, counts) = task::spawn_blocking(move || aggregate(&keys, &slate, &entries))
            .await
            .map_err(join_error)??;

        let total: u64 = counts.iter().map(|c| c.count).sum();
        let ballot_blocks = (blocks.len() as u64).saturating_sub(1);
        if total != ballots.len() as u64 || total != ballot_blocks {
            let reason = format!(
                "decrypted total {total}, {} ballots, {ballot_blocks} ballot blocks",
                ballots.len()
            );
            return Err(self.mismatch(election_id, reason).await);
        }

        let ballot_ids: Vec<&str> = ballots.iter().map(|b| b.ballot_id.as_str()).collect();
        let last_block_hash = blocks
            .last()
            .map(|block| block.block_hash.clone())
            .unwrap_or_default();
        let bundle = ProofBundle {
            election_id,
            slate: election.candidates.clone(),
            encrypted_sums,
            counts,
            total,
            merkle_root: merkle_root(&ballot_ids),
            last_block_hash,
            ts: self.ctx.now(),
        };
        let signature = rsa_pss_sign(self.ctx.keys.receipt_signing(), &canonical(&bundle)?)?;
        let tally = Tally {
            winners: bundle.winners(),
            bundle,
            signature,
        };

        if !self.ctx.store.publish_tally(&tally).await? {
            return Err(Error::Fatal(format!(
                "Election {election_id} left CLOSED while being tallied"
            )));
        }

        info!("Tallied election {election_id}: {total} ballots");
        self.audit
            .record(self.audit.event(
                AuditEventType::TallyPublished,
                actor,
                format!("election:{election_id}"),
                format!("total {total}, merkle root {}", tally.bundle.merkle_root),
            ))
            .await;
        self.audit
            .record(self.audit.event(
                AuditEventType::LifecycleTransition,
                actor,
                format!("election:{election_id}"),
                "CLOSED -> TALLIED",
            ))
            .await;
        Ok(tally)
    }

    async fn mismatch(&self, election_id: ElectionId, reason: String) -> Error {
        error!("Refusing to publish tally of election {election_id}: {reason}");
        self.audit
            .record(self.audit.event(
                AuditEventType::IntegrityViolation,
                super::SYSTEM_ACTOR,
                format!("election:{election_id}"),
                format!("tally mismatch: {reason}"),
            ))
            .await;
        Error::integrity(Code::TallyMismatch, format!("Tally of election {election_id} does not add up: {reason}"))
    }
}

/// Every ballot must be recorded by the block its receipt names.
fn check_ballots_on_ledger(ballots: &[Ballot], blocks: &[Block]) -> std::result::Result<(), String> {
    for ballot in ballots {
        let index = ballot.receipt.payload.block_index;
        let recorded = usize::try_from(index)
            .ok()
            .and_then(|i| blocks.get(i))
            .map_or(false, |block| block.payload_hash == payload_hash(&ballot.ballot_id));
        if !recorded {
            return Err(format!("ballot {} is not recorded at block {index}", ballot.ballot_id));
        }
    }
    Ok(())
}

/// Sum the ciphertexts of each candidate homomorphically and decrypt the sums.
fn aggregate(
    keys: &KeyStore,
    slate: &[CandidateId],
    ballots: &[(CandidateId, String)],
) -> Result<(Vec<EncryptedSum>, Vec<CandidateCount>)> {
    let public = keys.paillier_public();
    let mut sums = Vec::with_capacity(slate.len());
    let mut counts = Vec::with_capacity(slate.len());
    for &candidate_id in slate {
        let mut sum = encrypted_zero();
        for (_, ciphertext) in ballots.iter().filter(|(k, _)| *k == candidate_id) {
            sum = paillier_add(public, &sum, &public.parse_ciphertext(ciphertext)?);
        }
        let count = paillier_decrypt(keys.paillier(), &sum)?
            .to_u64()
            .ok_or_else(|| Error::integrity(Code::TallyMismatch, "Decrypted count does not fit in 64 bits"))?;
        sums.push(EncryptedSum {
            candidate_id,
            ciphertext: sum.to_string(),
        });
        counts.push(CandidateCount { candidate_id, count });
    }
    Ok((sums, counts))
}
