use std::sync::Arc;

use log::{debug, info};
use rand::rngs::OsRng;

use crate::{
    crypto::{ed25519_sign, ed25519_verify},
    error::{Code, Error, Result},
    model::{
        audit::AuditEventType,
        ballot::Receipt,
        election::ElectionId,
        token::{Ovt, TokenState},
        voter::{EnrollmentState, VoterId},
    },
    store::fail,
};

use super::{AuditLog, Context, KeyedLocks};

/// Issues and validates one-time voting tokens.
#[derive(Clone)]
pub struct OvtService {
    ctx: Context,
    audit: AuditLog,
    voter_locks: Arc<KeyedLocks<VoterId>>,
}

impl OvtService {
    pub fn new(ctx: Context, audit: AuditLog, voter_locks: Arc<KeyedLocks<VoterId>>) -> Self {
        Self {
            ctx,
            audit,
            voter_locks,
        }
    }

    /// Issue a signed token for an approved voter who has not yet voted in an open election.
    pub async fn issue(&self, voter_id: &str, election_id: ElectionId) -> Result<Ovt> {
        let _guard = self.voter_locks.lock(&voter_id.to_string()).await;

        let voter = match self.ctx.store.get_voter(voter_id).await? {
            Some(voter) if !voter.erased => voter,
            _ => return Err(Error::not_found(format!("Voter {voter_id}"))),
        };
        if voter.state != EnrollmentState::Approved {
            return Err(Error::auth(
                Code::NotApproved,
                format!("Voter {voter_id} is {}, not APPROVED", voter.state.as_str()),
            ));
        }
        self.ctx.election(election_id).await?.ensure_accepting()?;
        if voter.has_voted(election_id) {
            return Err(fail::already_voted(voter_id, election_id));
        }

        let now = self.ctx.now();
        if let Some(existing) = self.ctx.store.issued_token_for(voter_id, election_id).await? {
            if !existing.is_expired_at(now) {
                return Err(fail::ovt_outstanding(voter_id, election_id));
            }
            self.expire(&existing).await?;
        }

        let mut token = Ovt {
            token_id: Ovt::generate_id(&mut OsRng),
            voter_id: voter_id.to_string(),
            election_id,
            issued_at: now,
            expires_at: now + self.ctx.config.ovt_ttl(),
            state: TokenState::Issued,
            signature: String::new(),
        };
        token.signature = ed25519_sign(self.ctx.keys.ovt_signing(), &token.signing_bytes()?);
        self.ctx.store.insert_token(&token).await?;

        info!("Issued token {} to voter {voter_id} for election {election_id}", token.token_id);
        self.audit
            .record(self.audit.event(
                AuditEventType::OvtIssued,
                format!("voter:{voter_id}"),
                format!("token:{}", token.token_id),
                format!("election {election_id}"),
            ))
            .await;
        Ok(token)
    }

    /// Check that a token may be spent on a ballot in `election_id`.
    ///
    /// This does not consume the token: consumption happens in the same
    /// commit as the ballot. An issued token found past its expiry is marked
    /// EXPIRED on the way out.
    pub async fn validate(&self, token_id: &str, signature: &str, election_id: ElectionId) -> Result<Ovt> {
        let token = self.verified(token_id, signature).await?;
        match token.state {
            TokenState::Consumed | TokenState::Revoked => {
                return Err(Error::auth(
                    Code::TokenInvalid,
                    format!("Token is {}", token.state.as_str()),
                ))
            }
            TokenState::Expired => return Err(expired()),
            TokenState::Issued => {}
        }
        if token.is_expired_at(self.ctx.now()) {
            self.expire(&token).await?;
            return Err(expired());
        }
        if token.election_id != election_id {
            return Err(Error::auth(
                Code::TokenInvalid,
                "Token was issued for a different election",
            ));
        }
        Ok(token)
    }

    /// Force an issued token to REVOKED. Revoking twice is harmless; spent
    /// or expired tokens cannot be revoked.
    pub async fn revoke(&self, token_id: &str, actor: &str) -> Result<Ovt> {
        let token = self
            .ctx
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| Error::not_found(format!("Token {token_id}")))?;
        match token.state {
            TokenState::Revoked => return Ok(token),
            TokenState::Issued => {}
            state => {
                return Err(Error::state(
                    Code::IllegalTransition,
                    format!("Token is {} and cannot be revoked", state.as_str()),
                ))
            }
        }
        if !self
            .ctx
            .store
            .set_token_state(token_id, TokenState::Issued, TokenState::Revoked)
            .await?
        {
            return Err(Error::state(
                Code::IllegalTransition,
                "Token changed state while being revoked",
            ));
        }
        self.audit
            .record(self.audit.event(
                AuditEventType::OvtRevoked,
                actor,
                format!("token:{token_id}"),
                format!("voter {} election {}", token.voter_id, token.election_id),
            ))
            .await;
        Ok(Ovt {
            state: TokenState::Revoked,
            ..token
        })
    }

    /// The receipt of the ballot a token was spent on.
    pub async fn receipt(&self, token_id: &str, signature: &str) -> Result<Receipt> {
        self.verified(token_id, signature).await?;
        self.ctx
            .store
            .ballot_by_token(token_id)
            .await?
            .map(|ballot| ballot.receipt)
            .ok_or_else(|| Error::not_found(format!("Ballot for token {token_id}")))
    }

    /// Load a token and check the presented signature against the signing key.
    async fn verified(&self, token_id: &str, signature: &str) -> Result<Ovt> {
        let token = self
            .ctx
            .store
            .get_token(token_id)
            .await?
            .ok_or_else(|| Error::auth(Code::TokenInvalid, "Unknown token"))?;
        ed25519_verify(&self.ctx.keys.ovt_verifying(), &token.signing_bytes()?, signature)
            .map_err(|_| Error::auth(Code::TokenInvalid, "Token signature does not verify"))?;
        Ok(token)
    }

    async fn expire(&self, token: &Ovt) -> Result<()> {
        if self
            .ctx
            .store
            .set_token_state(&token.token_id, TokenState::Issued, TokenState::Expired)
            .await?
        {
            debug!("Token {} expired", token.token_id);
            self.audit
                .record(self.audit.event(
                    AuditEventType::OvtExpired,
                    super::SYSTEM_ACTOR,
                    format!("token:{}", token.token_id),
                    format!("voter {} election {}", token.voter_id, token.election_id),
                ))
                .await;
        }
        Ok(())
    }
}

fn expired() -> Error {
    Error::auth(Code::Expired, "Token has expired")
}
