use std::fmt::{Display, Formatter};

use argon2::Error as Argon2Error;
use jsonwebtoken::errors::Error as JwtError;
use log::{error, warn};
use mongodb::error::Error as DbError;
use rocket::{
    http::Status,
    response::{self, Responder},
    serde::json::Json,
    Request,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{paillier::PaillierError, signing::SignatureError, KeyStoreError};

pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine readable error codes reported to API callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    // Input
    BadRequest,
    BadCiphertext,
    BadCandidate,
    InvalidSpec,
    NoFace,
    MultipleFaces,
    LowQuality,
    // Auth
    Unauthorized,
    Mismatch,
    LivenessFail,
    TokenInvalid,
    Expired,
    Forbidden,
    NotApproved,
    // State
    ElectionNotOpen,
    ElectionSuspended,
    IllegalTransition,
    NotTallied,
    // Conflict
    AlreadyVoted,
    OvtOutstanding,
    AlreadyExists,
    LastAdmin,
    // Integrity
    LedgerImmutable,
    ChainBroken,
    BadSignature,
    TallyMismatch,
    // Other
    NotFound,
    TransientError,
    Fatal,
}

impl Code {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadRequest => "BAD_REQUEST",
            Self::BadCiphertext => "BAD_CIPHERTEXT",
            Self::BadCandidate => "BAD_CANDIDATE",
            Self::InvalidSpec => "INVALID_SPEC",
            Self::NoFace => "NO_FACE",
            Self::MultipleFaces => "MULTIPLE_FACES",
            Self::LowQuality => "LOW_QUALITY",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Mismatch => "MISMATCH",
            Self::LivenessFail => "LIVENESS_FAIL",
            Self::TokenInvalid => "TOKEN_INVALID",
            Self::Expired => "EXPIRED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotApproved => "NOT_APPROVED",
            Self::ElectionNotOpen => "ELECTION_NOT_OPEN",
            Self::ElectionSuspended => "ELECTION_SUSPENDED",
            Self::IllegalTransition => "ILLEGAL_TRANSITION",
            Self::NotTallied => "NOT_TALLIED",
            Self::AlreadyVoted => "ALREADY_VOTED",
            Self::OvtOutstanding => "OVT_OUTSTANDING",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::LastAdmin => "LAST_ADMIN",
            Self::LedgerImmutable => "LEDGER_IMMUTABLE",
            Self::ChainBroken => "CHAIN_BROKEN",
            Self::BadSignature => "BAD_SIGNATURE",
            Self::TallyMismatch => "TALLY_MISMATCH",
            Self::NotFound => "NOT_FOUND",
            Self::TransientError => "TRANSIENT_ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl Display for Code {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of an error, which determines how it is handled and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Input,
    Auth,
    State,
    Conflict,
    Integrity,
    Transient,
    Fatal,
    NotFound,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{1}")]
    Input(Code, String),
    #[error("{1}")]
    Auth(Code, String),
    #[error("{1}")]
    State(Code, String),
    #[error("{1}")]
    Conflict(Code, String),
    #[error("{1}")]
    Integrity(Code, String),
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Jwt(#[from] JwtError),
    #[error(transparent)]
    Argon2(#[from] Argon2Error),
    #[error(transparent)]
    Signature(#[from] SignatureError),
    #[error(transparent)]
    Paillier(#[from] PaillierError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Keys(#[from] KeyStoreError),
}

impl Error {
    pub fn input(code: Code, message: impl Into<String>) -> Self {
        Self::Input(code, message.into())
    }

    pub fn auth(code: Code, message: impl Into<String>) -> Self {
        Self::Auth(code, message.into())
    }

    pub fn state(code: Code, message: impl Into<String>) -> Self {
        Self::State(code, message.into())
    }

    pub fn conflict(code: Code, message: impl Into<String>) -> Self {
        Self::Conflict(code, message.into())
    }

    pub fn integrity(code: Code, message: impl Into<String>) -> Self {
        Self::Integrity(code, message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn kind(&self) -> Kind {
        match self {
            Self::Input(..) => Kind::Input,
            Self::Auth(..) | Self::Jwt(_) => Kind::Auth,
            Self::State(..) => Kind::State,
            Self::Conflict(..) => Kind::Conflict,
            Self::Integrity(..) => Kind::Integrity,
            Self::Transient(_) | Self::Db(_) => Kind::Transient,
            Self::NotFound(_) => Kind::NotFound,
            Self::Paillier(PaillierError::InvalidKey(_)) => Kind::Fatal,
            Self::Paillier(_) => Kind::Input,
            Self::Fatal(_) | Self::Argon2(_) | Self::Signature(_) | Self::Json(_) | Self::Keys(_) => {
                Kind::Fatal
            }
        }
    }

    pub fn code(&self) -> Code {
        match self {
            Self::Input(code, _)
            | Self::Auth(code, _)
            | Self::State(code, _)
            | Self::Conflict(code, _)
            | Self::Integrity(code, _) => *code,
            Self::Transient(_) | Self::Db(_) => Code::TransientError,
            Self::NotFound(_) => Code::NotFound,
            Self::Jwt(_) => Code::Unauthorized,
            Self::Paillier(PaillierError::InvalidKey(_)) => Code::Fatal,
            Self::Paillier(_) => Code::BadCiphertext,
            Self::Fatal(_) | Self::Argon2(_) | Self::Signature(_) | Self::Json(_) | Self::Keys(_) => {
                Code::Fatal
            }
        }
    }

    /// Retryable errors.
    pub fn is_transient(&self) -> bool {
        self.kind() == Kind::Transient
    }

    pub fn status(&self) -> Status {
        match self.code() {
            Code::NotApproved | Code::LedgerImmutable | Code::Forbidden => return Status::Forbidden,
            _ => {}
        }
        match self.kind() {
            Kind::Input => Status::BadRequest,
            Kind::Auth => Status::Unauthorized,
            Kind::State | Kind::Conflict | Kind::Integrity => Status::Conflict,
            Kind::NotFound => Status::NotFound,
            Kind::Transient => Status::ServiceUnavailable,
            Kind::Fatal => Status::InternalServerError,
        }
    }

    /// The message shown to API callers. Internal details of storage and
    /// server-side failures are only logged.
    fn public_message(&self) -> String {
        match self.kind() {
            Kind::Transient => "Storage temporarily unavailable, please retry".to_string(),
            Kind::Fatal => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

/// The JSON body of every error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: Code,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let status = self.status();
        match self.kind() {
            Kind::Integrity | Kind::Fatal => error!("{}: {self}", self.code()),
            _ => warn!("{}: {self}", self.code()),
        }
        let body = ErrorBody::new(self.code(), self.public_message());
        (status, Json(body)).respond_to(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_follow_kinds() {
        assert_eq!(Error::input(Code::BadCiphertext, "x").status(), Status::BadRequest);
        assert_eq!(Error::auth(Code::TokenInvalid, "x").status(), Status::Unauthorized);
        assert_eq!(Error::state(Code::ElectionNotOpen, "x").status(), Status::Conflict);
        assert_eq!(Error::conflict(Code::AlreadyVoted, "x").status(), Status::Conflict);
        assert_eq!(Error::Transient("x".into()).status(), Status::ServiceUnavailable);
        assert_eq!(Error::Fatal("x".into()).status(), Status::InternalServerError);
        assert_eq!(Error::not_found("x").status(), Status::NotFound);
    }

    #[test]
    fn forbidden_codes_override_kind() {
        assert_eq!(Error::auth(Code::NotApproved, "x").status(), Status::Forbidden);
        assert_eq!(Error::integrity(Code::LedgerImmutable, "x").status(), Status::Forbidden);
    }

    #[test]
    fn codes_serialize_screaming_snake() {
        for code in [Code::TokenInvalid, Code::OvtOutstanding, Code::LedgerImmutable, Code::NoFace] {
            assert_eq!(serde_json::to_value(code).unwrap(), code.as_str());
        }
    }

    #[test]
    fn fatal_messages_are_not_exposed() {
        let err = Error::Fatal("key file /secret/path unreadable".into());
        assert_eq!(err.public_message(), "Internal server error");
        let err = Error::Paillier(PaillierError::OutOfRange);
        assert_eq!(err.code(), Code::BadCiphertext);
        assert_eq!(err.status(), Status::BadRequest);
    }
}
