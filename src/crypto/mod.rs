//! Cryptographic primitives façade.
//!
//! Every signature and hash computed by the server goes through this module,
//! and always over [`canonical`] bytes.

use data_encoding::HEXLOWER;
use sha2::{Digest, Sha256};

pub mod canonical;
pub mod keys;
pub mod merkle;
pub mod paillier;
pub mod signing;

pub use canonical::canonical;
pub use keys::{KeyStore, KeyStoreError, PublicKeys};
pub use paillier::{paillier_add, paillier_decrypt, paillier_encrypt};
pub use signing::{ed25519_sign, ed25519_verify, fingerprint, rsa_pss_sign, rsa_pss_verify};

/// Length of a SHA-256 digest in bytes.
pub const HASH_LEN: usize = 32;

/// SHA-256 of the given bytes.
pub fn sha256(bytes: impl AsRef<[u8]>) -> [u8; HASH_LEN] {
    Sha256::digest(bytes.as_ref()).into()
}

/// SHA-256 of the given bytes, as lowercase hex.
pub fn sha256_hex(bytes: impl AsRef<[u8]>) -> String {
    HEXLOWER.encode(&sha256(bytes))
}

/// The all-zero hash, used as the genesis `prev_hash` and the empty Merkle root.
pub fn zero_hash_hex() -> String {
    "0".repeat(HASH_LEN * 2)
}
