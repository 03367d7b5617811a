//! The read-only key store, loaded once at startup.

use std::{
    fs,
    path::{Path, PathBuf},
};

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use ed25519_dalek::{SigningKey, VerifyingKey, SECRET_KEY_LENGTH};
use log::debug;
use rsa::{
    pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding},
    RsaPrivateKey, RsaPublicKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    paillier::{biguint_decimal, PaillierError, PaillierKeyFile, PaillierPrivateKey, PaillierPublicKey},
    signing::fingerprint,
};

pub const PAILLIER_FILE: &str = "paillier.json";
pub const OVT_KEY_FILE: &str = "ovt_ed25519.hex";
pub const LEDGER_KEY_FILE: &str = "ledger_ed25519.hex";
pub const RECEIPT_KEY_FILE: &str = "receipt_rsa.pem";

#[derive(Debug, Error)]
pub enum KeyStoreError {
    #[error("Failed to read key file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Malformed Paillier key file: {0}")]
    PaillierFormat(#[from] serde_json::Error),
    #[error(transparent)]
    Paillier(#[from] PaillierError),
    #[error("Ed25519 seed in {0:?} must be 32 hex-encoded bytes")]
    Ed25519Seed(PathBuf),
    #[error("Invalid receipt RSA key: {0}")]
    Rsa(#[from] rsa::pkcs8::Error),
    #[error("Failed to encode receipt RSA public key: {0}")]
    RsaPublic(#[from] rsa::pkcs8::spki::Error),
}

/// Every private key the server holds.
pub struct KeyStore {
    paillier: PaillierPrivateKey,
    ovt: SigningKey,
    ledger: SigningKey,
    receipt: RsaPrivateKey,
    receipt_public: RsaPublicKey,
    public_keys: PublicKeys,
}

/// The public halves of the key store, as published to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeys {
    #[serde(with = "biguint_decimal")]
    pub paillier_n: num_bigint::BigUint,
    pub ovt_public_key: String,
    pub ovt_fingerprint: String,
    pub ledger_public_key: String,
    pub ledger_fingerprint: String,
    pub receipt_public_key: String,
    pub receipt_fingerprint: String,
}

impl KeyStore {
    /// Load all keys from the given directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, KeyStoreError> {
        let dir = dir.as_ref();
        debug!("Loading keys from {}", dir.display());

        let paillier_file: PaillierKeyFile = serde_json::from_str(&read(dir.join(PAILLIER_FILE))?)?;
        let paillier = PaillierPrivateKey::from_key_file(&paillier_file)?;
        let ovt = read_ed25519(dir.join(OVT_KEY_FILE))?;
        let ledger = read_ed25519(dir.join(LEDGER_KEY_FILE))?;
        let receipt = RsaPrivateKey::from_pkcs8_pem(&read(dir.join(RECEIPT_KEY_FILE))?)?;

        Self::from_parts(paillier, ovt, ledger, receipt)
    }

    /// Assemble a key store from already-parsed keys.
    pub fn from_parts(
        paillier: PaillierPrivateKey,
        ovt: SigningKey,
        ledger: SigningKey,
        receipt: RsaPrivateKey,
    ) -> Result<Self, KeyStoreError> {
        let receipt_public = receipt.to_public_key();
        let receipt_der = receipt_public.to_public_key_der()?;
        let public_keys = PublicKeys {
            paillier_n: paillier.public().n.clone(),
            ovt_public_key: HEXLOWER.encode(ovt.verifying_key().as_bytes()),
            ovt_fingerprint: fingerprint(ovt.verifying_key().as_bytes()),
            ledger_public_key: HEXLOWER.encode(ledger.verifying_key().as_bytes()),
            ledger_fingerprint: fingerprint(ledger.verifying_key().as_bytes()),
            receipt_public_key: receipt_public.to_public_key_pem(LineEnding::LF)?,
            receipt_fingerprint: fingerprint(receipt_der.as_bytes()),
        };
        Ok(Self {
            paillier,
            ovt,
            ledger,
            receipt,
            receipt_public,
            public_keys,
        })
    }

    pub fn paillier(&self) -> &PaillierPrivateKey {
        &self.paillier
    }

    pub fn paillier_public(&self) -> &PaillierPublicKey {
        self.paillier.public()
    }

    pub fn ovt_signing(&self) -> &SigningKey {
        &self.ovt
    }

    pub fn ovt_verifying(&self) -> VerifyingKey {
        self.ovt.verifying_key()
    }

    pub fn ledger_signing(&self) -> &SigningKey {
        &self.ledger
    }

    pub fn ledger_verifying(&self) -> VerifyingKey {
        self.ledger.verifying_key()
    }

    pub fn receipt_signing(&self) -> &RsaPrivateKey {
        &self.receipt
    }

    pub fn receipt_verifying(&self) -> &RsaPublicKey {
        &self.receipt_public
    }

    pub fn public_keys(&self) -> &PublicKeys {
        &self.public_keys
    }
}

fn read(path: PathBuf) -> Result<String, KeyStoreError> {
    fs::read_to_string(&path).map_err(|source| KeyStoreError::Io { path, source })
}

fn read_ed25519(path: PathBuf) -> Result<SigningKey, KeyStoreError> {
    let hex = read(path.clone())?;
    let seed: [u8; SECRET_KEY_LENGTH] = HEXLOWER_PERMISSIVE
        .decode(hex.trim().as_bytes())
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(KeyStoreError::Ed25519Seed(path))?;
    Ok(SigningKey::from_bytes(&seed))
}


#[cfg(test)]
mod tests {
    use super::{examples::dev_key_dir, *};

    #[test]
    fn load_dev_keys() {
        let keys = KeyStore::example();
        let public = keys.public_keys();
        assert_eq!(public.paillier_n, keys.paillier_public().n);
        assert_eq!(public.ovt_public_key.len(), 64);
        assert_ne!(public.ovt_fingerprint, public.ledger_fingerprint);
        assert!(public.receipt_public_key.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(public.receipt_fingerprint.len(), 64);
    }

    #[test]
    fn missing_directory_is_an_error() {
        let result = KeyStore::load(dev_key_dir().join("does-not-exist"));
        assert!(matches!(result, Err(KeyStoreError::Io { .. })));
    }

    #[test]
    fn public_keys_serialize_n_as_decimal() {
        let keys = KeyStore::example();
        let json = serde_json::to_value(keys.public_keys()).unwrap();
        assert_eq!(json["paillier_n"], keys.paillier_public().n.to_str_radix(10));
    }
}
