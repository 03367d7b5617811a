use std::str::FromStr;

use chrono::{serde::ts_milliseconds, DateTime, Utc};
use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};

/// Default and maximum number of events returned by a query.
pub const DEFAULT_AUDIT_LIMIT: usize = 100;
pub const MAX_AUDIT_LIMIT: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    AuthAttempt,
    AdminLogin,
    AdminAction,
    VoterEnrolled,
    VoterReenrolled,
    VoterApproved,
    VoterBlocked,
    VoterErased,
    OvtIssued,
    OvtConsumed,
    OvtExpired,
    OvtRevoked,
    BallotAccepted,
    BallotRejected,
    LedgerAppend,
    LifecycleTransition,
    ElectionSuspended,
    ElectionResumed,
    TallyPublished,
    IntegrityViolation,
}

impl AuditEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthAttempt => "AUTH_ATTEMPT",
            Self::AdminLogin => "ADMIN_LOGIN",
            Self::AdminAction => "ADMIN_ACTION",
            Self::VoterEnrolled => "VOTER_ENROLLED",
            Self::VoterReenrolled => "VOTER_REENROLLED",
            Self::VoterApproved => "VOTER_APPROVED",
            Self::VoterBlocked => "VOTER_BLOCKED",
            Self::VoterErased => "VOTER_ERASED",
            Self::OvtIssued => "OVT_ISSUED",
            Self::OvtConsumed => "OVT_CONSUMED",
            Self::OvtExpired => "OVT_EXPIRED",
            Self::OvtRevoked => "OVT_REVOKED",
            Self::BallotAccepted => "BALLOT_ACCEPTED",
            Self::BallotRejected => "BALLOT_REJECTED",
            Self::LedgerAppend => "LEDGER_APPEND",
            Self::LifecycleTransition => "LIFECYCLE_TRANSITION",
            Self::ElectionSuspended => "ELECTION_SUSPENDED",
            Self::ElectionResumed => "ELECTION_RESUMED",
            Self::TallyPublished => "TALLY_PUBLISHED",
            Self::IntegrityViolation => "INTEGRITY_VIOLATION",
        }
    }
}

impl AuditEventType {
    pub const ALL: [Self; 20] = [
        Self::AuthAttempt,
        Self::AdminLogin,
        Self::AdminAction,
        Self::VoterEnrolled,
        Self::VoterReenrolled,
        Self::VoterApproved,
        Self::VoterBlocked,
        Self::VoterErased,
        Self::OvtIssued,
        Self::OvtConsumed,
        Self::OvtExpired,
        Self::OvtRevoked,
        Self::BallotAccepted,
        Self::BallotRejected,
        Self::LedgerAppend,
        Self::LifecycleTransition,
        Self::ElectionSuspended,
        Self::ElectionResumed,
        Self::TallyPublished,
        Self::IntegrityViolation,
    ];
}

impl FromStr for AuditEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown audit event type {s:?}"))
    }
}

impl From<AuditEventType> for Bson {
    fn from(event_type: AuditEventType) -> Self {
        Bson::String(event_type.as_str().to_string())
    }
}

/// One record of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    #[serde(with = "ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub actor: String,
    pub subject: String,
    pub detail: String,
    /// The ledger block produced by the audited operation, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_index: Option<u64>,
}

impl AuditEvent {
    pub fn at_block(mut self, index: u64) -> Self {
        self.block_index = Some(index);
        self
    }
}

/// Filter for audit queries. Results are newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFilter {
    pub event_type: Option<AuditEventType>,
    pub subject: Option<String>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_AUDIT_LIMIT)
            .clamp(1, MAX_AUDIT_LIMIT)
    }

    pub fn matches(&self, event: &AuditEvent) -> bool {
        self.event_type.map_or(true, |t| t == event.event_type)
            && self.subject.as_ref().map_or(true, |s| *s == event.subject)
    }
}
