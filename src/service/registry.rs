use std::sync::Arc;

use log::{info, warn};
use rocket::tokio::task;

use crate::{
    biometric::{BiometricMatcher, Capture, MatchResult},
    error::{Code, Error, Result},
    model::{
        audit::AuditEventType,
        election::ElectionId,
        voter::{EnrollmentState, Voter, VoterId},
    },
};

use super::{join_error, AuditLog, Context, KeyedLocks};

/// Enrolment, approval and biometric authentication of voters.
#[derive(Clone)]
pub struct VoterRegistry {
    ctx: Context,
    audit: AuditLog,
    matcher: Arc<BiometricMatcher>,
    locks: Arc<KeyedLocks<VoterId>>,
}

impl VoterRegistry {
    pub fn new(
        ctx: Context,
        audit: AuditLog,
        matcher: Arc<BiometricMatcher>,
        locks: Arc<KeyedLocks<VoterId>>,
    ) -> Self {
        Self {
            ctx,
            audit,
            matcher,
            locks,
        }
    }

    /// Register a new voter from an enrolment capture. New voters start PENDING.
    pub async fn enroll(
        &self,
        voter_id: &str,
        name: &str,
        contact: &str,
        capture: Capture,
        actor: &str,
    ) -> Result<Voter> {
        if voter_id.trim().is_empty() {
            return Err(Error::input(Code::BadRequest, "Voter ID must not be empty"));
        }
        let matcher = self.matcher.clone();
        let template = task::spawn_blocking(move || matcher.enroll(&capture))
            .await
            .map_err(join_error)??;

        let voter = Voter::new(
            voter_id.to_string(),
            name.to_string(),
            contact.to_string(),
            template,
            self.ctx.now(),
        );
        self.ctx.store.insert_voter(&voter).await?;
        self.audit
            .record(self.audit.event(AuditEventType::VoterEnrolled, actor, subject(voter_id), ""))
            .await;
        Ok(voter)
    }

    /// Replace a voter's template with one from a fresh capture.
    pub async fn reenroll(&self, voter_id: &str, capture: Capture, actor: &str) -> Result<()> {
        let _guard = self.locks.lock(&voter_id.to_string()).await;
        self.lookup(voter_id).await?;
        let matcher = self.matcher.clone();
        let template = task::spawn_blocking(move || matcher.enroll(&capture))
            .await
            .map_err(join_error)??;
        if !self.ctx.store.replace_template(voter_id, &template).await? {
            return Err(Error::not_found(format!("Voter {voter_id}")));
        }
        self.audit
            .record(self.audit.event(AuditEventType::VoterReenrolled, actor, subject(voter_id), ""))
            .await;
        Ok(())
    }

    pub async fn approve(&self, voter_id: &str, actor: &str) -> Result<Voter> {
        let _guard = self.locks.lock(&voter_id.to_string()).await;
        self.set_state(voter_id, EnrollmentState::Approved).await?;
        self.audit
            .record(self.audit.event(AuditEventType::VoterApproved, actor, subject(voter_id), ""))
            .await;
        self.lookup(voter_id).await
    }

    /// Block a voter and revoke every token they hold.
    pub async fn block(&self, voter_id: &str, actor: &str) -> Result<Voter> {
        let _guard = self.locks.lock(&voter_id.to_string()).await;
        self.set_state(voter_id, EnrollmentState::Blocked).await?;
        self.audit
            .record(self.audit.event(AuditEventType::VoterBlocked, actor, subject(voter_id), ""))
            .await;
        self.revoke_tokens(voter_id, actor).await?;
        self.lookup(voter_id).await
    }

    /// A voter that has not been erased.
    pub async fn lookup(&self, voter_id: &str) -> Result<Voter> {
        match self.ctx.store.get_voter(voter_id).await? {
            Some(voter) if !voter.erased => Ok(voter),
            _ => Err(Error::not_found(format!("Voter {voter_id}"))),
        }
    }

    /// Destroy a voter's personal data. The voting history is kept so the
    /// voter can never vote twice in the same election.
    pub async fn erase(&self, voter_id: &str, actor: &str) -> Result<()> {
        let _guard = self.locks.lock(&voter_id.to_string()).await;
        self.lookup(voter_id).await?;
        self.revoke_tokens(voter_id, actor).await?;
        if !self.ctx.store.erase_voter(voter_id).await? {
            return Err(Error::not_found(format!("Voter {voter_id}")));
        }
        self.audit
            .record(self.audit.event(AuditEventType::VoterErased, actor, subject(voter_id), ""))
            .await;
        Ok(())
    }

    /// Record a vote outside of a ballot submission. Fails with `ALREADY_VOTED` the second time.
    pub async fn mark_voted(&self, voter_id: &str, election_id: ElectionId) -> Result<()> {
        let _guard = self.locks.lock(&voter_id.to_string()).await;
        self.ctx.store.mark_voted(voter_id, election_id).await
    }

    /// Match a live capture against the voter's template.
    ///
    /// Unknown voters fail exactly like a mismatch so that the endpoint does
    /// not reveal who is enrolled.
    pub async fn authenticate(&self, voter_id: &str, capture: Capture) -> Result<MatchResult> {
        let template = match self.ctx.store.get_voter(voter_id).await? {
            Some(Voter {
                template: Some(template),
                erased: false,
                ..
            }) => template,
            _ => {
                self.auth_attempt(voter_id, "unknown voter").await;
                return Err(mismatch());
            }
        };

        let matcher = self.matcher.clone();
        let outcome = task::spawn_blocking(move || matcher.match_capture(&template, &capture))
            .await
            .map_err(join_error)?;
        match outcome {
            Ok(result) if result.matched => {
                self.auth_attempt(voter_id, &format!("matched score={:.3}", result.score))
                    .await;
                info!("Voter {voter_id} authenticated");
                Ok(result)
            }
            Ok(result) => {
                self.auth_attempt(voter_id, &format!("mismatch score={:.3}", result.score))
                    .await;
                Err(mismatch())
            }
            Err(e) => {
                self.auth_attempt(voter_id, &e.to_string()).await;
                Err(e.into())
            }
        }
    }

    async fn set_state(&self, voter_id: &str, state: EnrollmentState) -> Result<()> {
        if !self.ctx.store.set_voter_state(voter_id, state).await? {
            return Err(Error::not_found(format!("Voter {voter_id}")));
        }
        Ok(())
    }

    async fn revoke_tokens(&self, voter_id: &str, actor: &str) -> Result<()> {
        let revoked = self.ctx.store.revoke_tokens_for_voter(voter_id).await?;
        for token_id in revoked {
            warn!("Revoked token {token_id} of voter {voter_id}");
            self.audit
                .record(self.audit.event(
                    AuditEventType::OvtRevoked,
                    actor,
                    format!("token:{token_id}"),
                    format!("voter {voter_id} blocked"),
                ))
                .await;
        }
        Ok(())
    }

    async fn auth_attempt(&self, voter_id: &str, detail: &str) {
        self.audit
            .record(self.audit.event(
                AuditEventType::AuthAttempt,
                subject(voter_id),
                subject(voter_id),
                detail,
            ))
            .await;
    }
}

fn subject(voter_id: &str) -> String {
    format!("voter:{voter_id}")
}

fn mismatch() -> Error {
    Error::auth(Code::Mismatch, "Face does not match the enrolled template")
}
