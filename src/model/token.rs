use chrono::{serde::ts_milliseconds, DateTime, Utc};
use data_encoding::HEXLOWER;
use mongodb::bson::Bson;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::canonical;

use super::{election::ElectionId, voter::VoterId};

/// Bytes of randomness in a token ID.
pub const TOKEN_ID_BYTES: usize = 16;

pub type TokenId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TokenState {
    Issued,
    Consumed,
    Expired,
    Revoked,
}

impl TokenState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Issued => "ISSUED",
            Self::Consumed => "CONSUMED",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
        }
    }
}

impl From<TokenState> for Bson {
    fn from(state: TokenState) -> Self {
        Bson::String(state.as_str().to_string())
    }
}

/// A one-time voting token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ovt {
    pub token_id: TokenId,
    pub voter_id: VoterId,
    pub election_id: ElectionId,
    #[serde(with = "ts_milliseconds")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub state: TokenState,
    pub signature: String,
}

/// The immutable fields of a token, which its signature covers.
#[derive(Debug, Serialize)]
pub struct SignedTokenFields<'a> {
    pub token_id: &'a str,
    pub voter_id: &'a str,
    pub election_id: ElectionId,
    #[serde(with = "ts_milliseconds")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
}

impl Ovt {
    /// Generate a fresh 128-bit token ID.
    pub fn generate_id<R: RngCore + CryptoRng>(rng: &mut R) -> TokenId {
        let mut bytes = [0u8; TOKEN_ID_BYTES];
        rng.fill_bytes(&mut bytes);
        HEXLOWER.encode(&bytes)
    }

    pub fn signed_fields(&self) -> SignedTokenFields<'_> {
        SignedTokenFields {
            token_id: &self.token_id,
            voter_id: &self.voter_id,
            election_id: self.election_id,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
        }
    }

    /// The canonical bytes the token signature is computed over.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical(&self.signed_fields())
    }

    /// A token is expired from `expires_at` onwards.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The token as returned to the voter on issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedOvt {
    pub token_id: TokenId,
    pub voter_id: VoterId,
    pub election_id: ElectionId,
    #[serde(with = "ts_milliseconds")]
    pub issued_at: DateTime<Utc>,
    #[serde(with = "ts_milliseconds")]
    pub expires_at: DateTime<Utc>,
    pub signature: String,
}

impl From<Ovt> for IssuedOvt {
    fn from(token: Ovt) -> Self {
        Self {
            token_id: token.token_id,
            voter_id: token.voter_id,
            election_id: token.election_id,
            issued_at: token.issued_at,
            expires_at: token.expires_at,
            signature: token.signature,
        }
    }
}

#[cfg(test)]
pub(crate) mod examples {
    use chrono::Duration;

    use super::*;

    impl Ovt {
        /// An unsigned, issued token valid for five minutes from `now`.
        pub fn example(token_id: &str, voter_id: &str, election_id: ElectionId, now: DateTime<Utc>) -> Self {
            Self {
                token_id: token_id.to_string(),
                voter_id: voter_id.to_string(),
                election_id,
                issued_at: now,
                expires_at: now + Duration::minutes(5),
                state: TokenState::Issued,
                signature: String::new(),
            }
        }
    }
}
