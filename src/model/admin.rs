use argon2::Config;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Code, Error, Result};

pub const MIN_PASSWORD_LENGTH: usize = 8;

/// An admin user, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Admin {
    pub username: String,
    pub password_hash: String,
}

impl Admin {
    /// Check whether the given password is correct. A malformed stored hash never verifies.
    pub fn verify_password<T: AsRef<[u8]>>(&self, password: T) -> bool {
        argon2::verify_encoded(&self.password_hash, password.as_ref()).unwrap_or(false)
    }
}

/// Raw admin credentials, received from a user. These are never stored directly,
/// since the password is in plaintext.
#[derive(Clone, Deserialize, Serialize)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

impl TryFrom<AdminCredentials> for Admin {
    type Error = Error;

    /// Convert [`AdminCredentials`] to a new [`Admin`] by hashing the password.
    /// This enforces that the username is non-empty, and the password meets minimum length.
    fn try_from(cred: AdminCredentials) -> Result<Self> {
        if cred.username.trim().is_empty() || cred.password.len() < MIN_PASSWORD_LENGTH {
            return Err(Error::input(
                Code::BadRequest,
                format!("Username must be non-empty and password at least {MIN_PASSWORD_LENGTH} characters"),
            ));
        }

        let mut salt = [0_u8; 16];
        rand::thread_rng().fill(&mut salt);
        let password_hash = argon2::hash_encoded(cred.password.as_bytes(), &salt, &Config::default())?;
        Ok(Self {
            username: cred.username,
            password_hash,
        })
    }
}
