use log::{info, warn};
use num_bigint::BigUint;
use rocket::tokio::{sync::OwnedMutexGuard, time::timeout};

use crate::{
    crypto::{canonical, paillier::PaillierPublicKey, rsa_pss_sign},
    error::{Code, Error, Kind, Result},
    model::{
        audit::AuditEventType,
        ballot::{ballot_id, Ballot, Receipt, ReceiptPayload, SubmitBallot},
        election::Election,
    },
    store::Submission,
};

use super::{suspend, AuditLog, Context, Ledger, OvtService, SYSTEM_ACTOR};

/// Accepts encrypted ballots: checks them, spends the token, chains the
/// ballot onto the ledger and signs a receipt.
#[derive(Clone)]
pub struct BallotIngestor {
    ctx: Context,
    audit: AuditLog,
    ovts: OvtService,
    ledger: Ledger,
}

/// A checked ballot with its block and signed receipt, ready to commit.
/// Holds the election's writer lock until dropped.
struct Prepared {
    guard: OwnedMutexGuard<()>,
    commit: Submission,
    receipt: Receipt,
}

impl BallotIngestor {
    pub fn new(ctx: Context, audit: AuditLog, ovts: OvtService, ledger: Ledger) -> Self {
        Self {
            ctx,
            audit,
            ovts,
            ledger,
        }
    }

    /// Accept a ballot and return its signed receipt.
    ///
    /// A submission that has not reached its commit by the configured
    /// deadline is abandoned with `TRANSIENT_ERROR`; nothing has been written
    /// by then, so the token stays ISSUED and the client can retry. A `FATAL`
    /// error suspends the election.
    pub async fn submit(&self, submission: &SubmitBallot) -> Result<Receipt> {
        let result = self.accept(submission).await;

        if let Err(e) = &result {
            warn!(
                "Rejected ballot for election {} with token {}: {e}",
                submission.election_id, submission.token_id
            );
            if e.kind() == Kind::Fatal {
                suspend(&self.ctx, &self.audit, submission.election_id, &e.to_string()).await;
            }
            self.audit
                .record(self.audit.event(
                    AuditEventType::BallotRejected,
                    format!("token:{}", submission.token_id),
                    format!("election:{}", submission.election_id),
                    e.code().as_str(),
                ))
                .await;
        }
        result
    }

    async fn accept(&self, submission: &SubmitBallot) -> Result<Receipt> {
        let deadline = self.ctx.config.submission_deadline();
        let prepared = match timeout(deadline, self.prepare(submission)).await {
            Ok(prepared) => prepared?,
            Err(_) => {
                return Err(Error::Transient(format!(
                    "Submission to election {} did not reach its commit within {} ms",
                    submission.election_id,
                    deadline.as_millis()
                )))
            }
        };

        let Prepared { guard, commit, receipt } = prepared;
        // A failed commit is rolled back whole, so it can be retried as is.
        match self.ctx.store.commit_submission(&commit).await {
            Err(e) if e.is_transient() => {
                warn!("Transient failure committing ballot, retrying once: {e}");
                self.ctx.store.commit_submission(&commit).await?;
            }
            other => other?,
        }
        drop(guard);

        self.record_acceptance(&commit).await;
        Ok(receipt)
    }

    /// Check the ballot and token, then compose the block and receipt under
    /// the election's writer lock. Writes nothing.
    async fn prepare(&self, submission: &SubmitBallot) -> Result<Prepared> {
        let election = self.ctx.election(submission.election_id).await?;
        let ciphertext = check_ballot(&election, submission)?;

        let guard = self.ledger.lock(election.election_id).await;
        // The election may have closed while this submission waited for the writer lock.
        let election = self.ctx.election(submission.election_id).await?;
        election.ensure_accepting()?;
        let token = self
            .ovts
            .validate(&submission.token_id, &submission.token_signature, election.election_id)
            .await?;

        let tail = match self.ledger.verified_tail(election.election_id).await {
            Err(e) if e.is_transient() => {
                warn!("Transient failure reading ledger tail, retrying once: {e}");
                self.ledger.verified_tail(election.election_id).await?
            }
            other => other?,
        };

        let election_id = election.election_id;
        let now = self.ctx.now();
        let ballot_id = ballot_id(
            election_id,
            submission.candidate_id,
            &ciphertext,
            &token.token_id,
            now,
        )?;
        let block = self.ledger.compose_next(&tail, &ballot_id, now)?;

        let payload = ReceiptPayload {
            ballot_id: ballot_id.clone(),
            election_id,
            ts: now,
            block_index: block.index,
            block_hash: block.block_hash.clone(),
        };
        let receipt_signature = rsa_pss_sign(self.ctx.keys.receipt_signing(), &canonical(&payload)?)?;
        let receipt = Receipt {
            payload,
            receipt_signature,
        };

        let commit = Submission {
            token_id: token.token_id.clone(),
            voter_id: token.voter_id.clone(),
            election_id,
            ballot: Ballot {
                ballot_id,
                election_id,
                candidate_id: submission.candidate_id,
                ciphertext,
                token_id: token.token_id,
                submitted_at: now,
                receipt: receipt.clone(),
            },
            block,
            now,
        };
        Ok(Prepared {
            guard,
            commit,
            receipt,
        })
    }

    async fn record_acceptance(&self, commit: &Submission) {
        let ballot_id = &commit.ballot.ballot_id;
        let election_id = commit.election_id;
        let block_index = commit.block.index;
        info!("Accepted ballot {ballot_id} into election {election_id} at block {block_index}");

        let token_subject = format!("token:{}", commit.token_id);
        let election_subject = format!("election:{election_id}");
        self.audit
            .record(self.audit.event(
                AuditEventType::OvtConsumed,
                format!("voter:{}", commit.voter_id),
                token_subject.clone(),
                format!("ballot {ballot_id}"),
            ))
            .await;
        self.audit
            .record(
                self.audit
                    .event(
                        AuditEventType::BallotAccepted,
                        token_subject,
                        election_subject.clone(),
                        format!("ballot {ballot_id}"),
                    )
                    .at_block(block_index),
            )
            .await;
        self.audit
            .record(
                self.audit
                    .event(
                        AuditEventType::LedgerAppend,
                        SYSTEM_ACTOR,
                        election_subject,
                        format!("ballot {ballot_id}"),
                    )
                    .at_block(block_index),
            )
            .await;
    }
}

/// Check the parts of a submission that need no lock: the election accepts
/// ballots, the candidate is on the slate, and the ciphertext lies in
/// `[0, n²)`. Returns the ciphertext in canonical decimal form.
fn check_ballot(election: &Election, submission: &SubmitBallot) -> Result<String> {
    election.ensure_accepting()?;
    if election.candidate(submission.candidate_id).is_none() {
        return Err(Error::input(
            Code::BadCandidate,
            format!(
                "Candidate {} is not on the slate of election {}",
                submission.candidate_id, election.election_id
            ),
        ));
    }
    let key = PaillierPublicKey::new(election.params.paillier_n.clone());
    let ciphertext: BigUint = key
        .parse_ciphertext(&submission.ciphertext)
        .map_err(|e| Error::input(Code::BadCiphertext, e.to_string()))?;
    Ok(ciphertext.to_string())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration as StdDuration};

    use chrono::Duration;
    use num_bigint::BigUint;
    use rand::thread_rng;
    use rocket::tokio;
    use rsa::RsaPrivateKey;

    use crate::{
        config::Config,
        crypto::{paillier_encrypt, rsa_pss_verify, KeyStore},
        model::{
            audit::{AuditEventType, AuditFilter},
            block::payload_hash,
            election::ElectionId,
            token::{IssuedOvt, TokenState},
        },
        service::examples::Harness,
    };

    use super::*;

    fn vote(harness: &Harness, election_id: ElectionId, candidate_id: u32, token: &IssuedOvt) -> SubmitBallot {
        let keys = &harness.services.context().keys;
        let ciphertext = paillier_encrypt(keys.paillier_public(), &BigUint::from(1u32), &mut thread_rng()).unwrap();
        SubmitBallot {
            election_id,
            candidate_id,
            ciphertext: ciphertext.to_string(),
            token_id: token.token_id.clone(),
            token_signature: token.signature.clone(),
        }
    }

    async fn recorded(harness: &Harness, event_type: AuditEventType) -> usize {
        let filter = AuditFilter {
            event_type: Some(event_type),
            ..Default::default()
        };
        harness.services.audit.query(&filter).await.unwrap().len()
    }

    #[rocket::async_test]
    async fn accepted_ballot_is_chained_and_receipted() {
        let harness = Harness::new();
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;

        let receipt = harness.services.ingestor.submit(&vote(&harness, id, 1, &token)).await.unwrap();
        assert_eq!(receipt.payload.block_index, 1);

        let keys = &harness.services.context().keys;
        let message = canonical(&receipt.payload).unwrap();
        assert!(rsa_pss_verify(keys.receipt_verifying(), &message, &receipt.receipt_signature).is_ok());

        let blocks = harness.services.ledger.blocks(id, 0, None).await.unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].block_hash, receipt.payload.block_hash);
        assert_eq!(blocks[1].payload_hash, payload_hash(&receipt.payload.ballot_id));
        assert!(harness.services.ledger.verify(id).await.unwrap().ok);

        let voter = harness.store().get_voter("v1").await.unwrap().unwrap();
        assert!(voter.has_voted(id));
        let stored = harness.store().get_token(&token.token_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TokenState::Consumed);

        let filter = AuditFilter {
            event_type: Some(AuditEventType::BallotAccepted),
            ..Default::default()
        };
        let accepted = harness.services.audit.query(&filter).await.unwrap();
        assert_eq!(accepted[0].block_index, Some(1));
    }

    #[rocket::async_test]
    async fn replay_is_rejected_and_changes_nothing() {
        let harness = Harness::new();
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;
        let ballot = vote(&harness, id, 1, &token);
        harness.services.ingestor.submit(&ballot).await.unwrap();

        let err = harness.services.ingestor.submit(&ballot).await.unwrap_err();
        assert_eq!(err.code(), Code::TokenInvalid);
        assert_eq!(harness.services.ledger.blocks(id, 0, None).await.unwrap().len(), 2);
        let err = harness.services.ovts.issue("v1", id).await.unwrap_err();
        assert_eq!(err.code(), Code::AlreadyVoted);
    }

    #[rocket::async_test]
    async fn malformed_ballots_are_rejected_before_the_token_is_touched() {
        let harness = Harness::new();
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;
        let ingestor = &harness.services.ingestor;
        let n = harness.services.context().keys.paillier_public().n.clone();
        let n_squared = &n * &n;

        let mut ballot = vote(&harness, id, 9, &token);
        assert_eq!(ingestor.submit(&ballot).await.unwrap_err().code(), Code::BadCandidate);

        ballot.candidate_id = 1;
        ballot.ciphertext = n_squared.to_string();
        assert_eq!(ingestor.submit(&ballot).await.unwrap_err().code(), Code::BadCiphertext);
        ballot.ciphertext = "12ab".to_string();
        assert_eq!(ingestor.submit(&ballot).await.unwrap_err().code(), Code::BadCiphertext);

        let stored = harness.store().get_token(&token.token_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TokenState::Issued);

        // Both ends of the ciphertext range are accepted.
        ballot.ciphertext = (n_squared - 1u32).to_string();
        assert!(ingestor.submit(&ballot).await.is_ok());
        harness.approved_voter("v2").await;
        let token = harness.issue("v2", id).await;
        let mut ballot = vote(&harness, id, 2, &token);
        ballot.ciphertext = "0".to_string();
        assert!(ingestor.submit(&ballot).await.is_ok());
    }

    #[rocket::async_test]
    async fn expired_token_is_rejected_and_voter_may_retry() {
        let harness = Harness::new();
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;

        harness.clock.advance(Duration::seconds(301));
        let err = harness.services.ingestor.submit(&vote(&harness, id, 1, &token)).await.unwrap_err();
        assert_eq!(err.code(), Code::Expired);
        assert_eq!(err.status(), rocket::http::Status::Unauthorized);

        let fresh = harness.issue("v1", id).await;
        assert!(harness.services.ingestor.submit(&vote(&harness, id, 1, &fresh)).await.is_ok());
    }

    #[rocket::async_test]
    async fn concurrent_submissions_with_one_token_accept_exactly_one() {
        let harness = Arc::new(Harness::new());
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;
        let ballot = vote(&harness, id, 1, &token);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let (ingestor, ballot) = (harness.services.ingestor.clone(), ballot.clone());
            handles.push(tokio::spawn(async move { ingestor.submit(&ballot).await }));
        }
        let mut accepted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert!(matches!(e.code(), Code::TokenInvalid | Code::AlreadyVoted)),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(harness.services.ledger.blocks(id, 0, None).await.unwrap().len(), 2);
    }

    #[rocket::async_test]
    async fn tampered_tail_suspends_the_election() {
        let harness = Harness::new();
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        harness.approved_voter("v2").await;
        let first = harness.issue("v1", id).await;
        harness.services.ingestor.submit(&vote(&harness, id, 1, &first)).await.unwrap();

        harness
            .memory
            .tamper_block(id, 1, |block| block.payload_hash = "f".repeat(64))
            .await;
        let second = harness.issue("v2", id).await;
        let err = harness.services.ingestor.submit(&vote(&harness, id, 2, &second)).await.unwrap_err();
        assert_eq!(err.code(), Code::Fatal);

        let election = harness.services.context().election(id).await.unwrap();
        assert!(election.suspended.is_some());
        assert_eq!(recorded(&harness, AuditEventType::IntegrityViolation).await, 1);
        assert_eq!(recorded(&harness, AuditEventType::ElectionSuspended).await, 1);
        let stored = harness.store().get_token(&second.token_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TokenState::Issued);
        let err = harness.services.ovts.issue("v2", id).await.unwrap_err();
        assert_eq!(err.code(), Code::ElectionSuspended);
    }

    #[rocket::async_test]
    async fn slow_audit_after_commit_keeps_the_receipt() {
        let harness = Harness::with_config(Config::example().with_submission_deadline_ms(50));
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;

        harness.memory.delay_audit(Some(StdDuration::from_millis(100)));
        let result = harness.services.ingestor.submit(&vote(&harness, id, 1, &token)).await;
        harness.memory.delay_audit(None);
        let receipt = result.unwrap();
        assert_eq!(receipt.payload.block_index, 1);

        let stored = harness.store().get_token(&token.token_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TokenState::Consumed);
        assert_eq!(recorded(&harness, AuditEventType::OvtConsumed).await, 1);
        assert_eq!(recorded(&harness, AuditEventType::BallotAccepted).await, 1);
        assert_eq!(recorded(&harness, AuditEventType::LedgerAppend).await, 2);
        assert_eq!(recorded(&harness, AuditEventType::BallotRejected).await, 0);
    }

    #[rocket::async_test]
    async fn deadline_before_commit_leaves_the_token_issued() {
        let harness = Harness::with_config(Config::example().with_submission_deadline_ms(50));
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;
        let ballot = vote(&harness, id, 1, &token);

        let writer = harness.services.ledger.lock(id).await;
        let err = harness.services.ingestor.submit(&ballot).await.unwrap_err();
        assert_eq!(err.code(), Code::TransientError);
        drop(writer);

        let stored = harness.store().get_token(&token.token_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TokenState::Issued);
        assert_eq!(harness.services.ledger.blocks(id, 0, None).await.unwrap().len(), 1);
        let receipt = harness.services.ingestor.submit(&ballot).await.unwrap();
        assert_eq!(receipt.payload.block_index, 1);
    }

    #[rocket::async_test]
    async fn signing_failure_suspends_the_election() {
        // Too small for a PSS signature with a SHA-256 sized salt.
        let receipt_key = RsaPrivateKey::new(&mut thread_rng(), 512).unwrap();
        let keys = KeyStore::example().with_receipt_key(receipt_key);
        let harness = Harness::with_parts(Config::example(), keys);
        let id = harness.open_election().await.election_id;
        harness.approved_voter("v1").await;
        let token = harness.issue("v1", id).await;

        let err = harness.services.ingestor.submit(&vote(&harness, id, 1, &token)).await.unwrap_err();
        assert_eq!(err.code(), Code::Fatal);

        let election = harness.services.context().election(id).await.unwrap();
        assert!(election.suspended.is_some());
        let stored = harness.store().get_token(&token.token_id).await.unwrap().unwrap();
        assert_eq!(stored.state, TokenState::Issued);
        assert_eq!(harness.services.ledger.blocks(id, 0, None).await.unwrap().len(), 1);

        assert_eq!(recorded(&harness, AuditEventType::ElectionSuspended).await, 1);
    }
}
