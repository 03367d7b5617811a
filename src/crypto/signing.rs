//! Ed25519 and RSA-PSS signatures, with base64 encoded signature strings.

use data_encoding::BASE64;
use ed25519_dalek::{Signature as EdSignature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::thread_rng;
use rsa::{
    pss::{BlindedSigningKey, Signature as PssSignature, VerifyingKey as PssVerifyingKey},
    signature::{RandomizedSigner, SignatureEncoding},
    RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use thiserror::Error;

use super::sha256_hex;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Signature is not valid base64")]
    Encoding,
    #[error("Signature does not verify")]
    Invalid,
    #[error(transparent)]
    Rsa(#[from] rsa::signature::Error),
}

/// Sign `message` with Ed25519, returning the base64 signature.
pub fn ed25519_sign(key: &SigningKey, message: &[u8]) -> String {
    BASE64.encode(&key.sign(message).to_bytes())
}

/// Verify a base64 Ed25519 signature over `message`.
pub fn ed25519_verify(key: &VerifyingKey, message: &[u8], signature: &str) -> Result<(), SignatureError> {
    let bytes = BASE64
        .decode(signature.as_bytes())
        .map_err(|_| SignatureError::Encoding)?;
    let signature = EdSignature::from_slice(&bytes).map_err(|_| SignatureError::Encoding)?;
    key.verify(message, &signature)
        .map_err(|_| SignatureError::Invalid)
}

/// Sign `message` with RSA-PSS over SHA-256, returning the base64 signature.
pub fn rsa_pss_sign(key: &RsaPrivateKey, message: &[u8]) -> Result<String, SignatureError> {
    let signing_key = BlindedSigningKey::<Sha256>::new(key.clone());
    let signature = signing_key.try_sign_with_rng(&mut thread_rng(), message)?;
    Ok(BASE64.encode(&signature.to_bytes()))
}

/// Verify a base64 RSA-PSS signature over `message`.
pub fn rsa_pss_verify(key: &RsaPublicKey, message: &[u8], signature: &str) -> Result<(), SignatureError> {
    let bytes = BASE64
        .decode(signature.as_bytes())
        .map_err(|_| SignatureError::Encoding)?;
    let signature = PssSignature::try_from(bytes.as_slice()).map_err(|_| SignatureError::Encoding)?;
    PssVerifyingKey::<Sha256>::new(key.clone())
        .verify(message, &signature)
        .map_err(|_| SignatureError::Invalid)
}

/// Fingerprint of a public key: the SHA-256 of its encoded bytes, as hex.
pub fn fingerprint(public_key_bytes: &[u8]) -> String {
    sha256_hex(public_key_bytes)
}

#[cfg(test)]
mod tests {
    use rsa::pkcs8::DecodePrivateKey;

    use super::*;

    fn ed_key() -> SigningKey {
        SigningKey::from_bytes(&[7; 32])
    }

    fn rsa_key() -> RsaPrivateKey {
        let pem = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/keys/dev/receipt_rsa.pem")).unwrap();
        RsaPrivateKey::from_pkcs8_pem(&pem).unwrap()
    }

    #[test]
    fn ed25519_sign_verify() {
        let key = ed_key();
        let signature = ed25519_sign(&key, b"block");
        assert!(ed25519_verify(&key.verifying_key(), b"block", &signature).is_ok());
    }

    #[test]
    fn ed25519_detects_tampering() {
        let key = ed_key();
        let signature = ed25519_sign(&key, b"block");
        assert!(matches!(
            ed25519_verify(&key.verifying_key(), b"bl0ck", &signature),
            Err(SignatureError::Invalid)
        ));
        assert!(matches!(
            ed25519_verify(&key.verifying_key(), b"block", "not base64!"),
            Err(SignatureError::Encoding)
        ));
    }

    #[test]
    fn ed25519_rejects_wrong_key() {
        let signature = ed25519_sign(&ed_key(), b"block");
        let other = SigningKey::from_bytes(&[8; 32]);
        assert!(ed25519_verify(&other.verifying_key(), b"block", &signature).is_err());
    }

    #[test]
    fn rsa_pss_sign_verify() {
        let key = rsa_key();
        let signature = rsa_pss_sign(&key, b"tally").unwrap();
        let public = key.to_public_key();
        assert!(rsa_pss_verify(&public, b"tally", &signature).is_ok());
        assert!(rsa_pss_verify(&public, b"tallx", &signature).is_err());
    }

    #[test]
    fn fingerprints_are_hex_sha256() {
        let fp = fingerprint(ed_key().verifying_key().as_bytes());
        assert_eq!(fp.len(), 64);
        assert_ne!(fp, fingerprint(SigningKey::from_bytes(&[8; 32]).verifying_key().as_bytes()));
    }
}
