//! Additively homomorphic Paillier encryption with `g = n + 1`.

use num_bigint::{BigInt, BigUint, RandBigInt};
use num_integer::Integer;
use num_traits::{One, Zero};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PaillierError {
    #[error("Ciphertext is not a decimal integer")]
    Malformed,
    #[error("Ciphertext is outside the range [0, n^2)")]
    OutOfRange,
    #[error("Plaintext is outside the range [0, n)")]
    PlaintextTooLarge,
    #[error("Invalid private key: {0}")]
    InvalidKey(&'static str),
}

/// Paillier public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaillierPublicKey {
    #[serde(with = "biguint_decimal")]
    pub n: BigUint,
    #[serde(skip)]
    n_squared: BigUint,
}

impl PaillierPublicKey {
    pub fn new(n: BigUint) -> Self {
        let n_squared = &n * &n;
        Self { n, n_squared }
    }

    pub fn n_squared(&self) -> &BigUint {
        &self.n_squared
    }

    /// Parse a decimal ciphertext and check it lies in `[0, n^2)`.
    pub fn parse_ciphertext(&self, ciphertext: &str) -> Result<BigUint, PaillierError> {
        let ciphertext = ciphertext.trim();
        if ciphertext.is_empty() || !ciphertext.bytes().all(|b| b.is_ascii_digit()) {
            return Err(PaillierError::Malformed);
        }
        let value = BigUint::parse_bytes(ciphertext.as_bytes(), 10).ok_or(PaillierError::Malformed)?;
        if value >= self.n_squared {
            return Err(PaillierError::OutOfRange);
        }
        Ok(value)
    }
}

/// Paillier private key, holding the primes and the derived `λ` and `μ`.
#[derive(Debug, Clone)]
pub struct PaillierPrivateKey {
    public: PaillierPublicKey,
    lambda: BigUint,
    mu: BigUint,
}

/// On-disk form of a Paillier key pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaillierKeyFile {
    #[serde(with = "biguint_decimal")]
    pub p: BigUint,
    #[serde(with = "biguint_decimal")]
    pub q: BigUint,
}

impl PaillierPrivateKey {
    /// Derive the key pair from two distinct primes.
    pub fn from_primes(p: &BigUint, q: &BigUint) -> Result<Self, PaillierError> {
        let one = BigUint::one();
        if p == q {
            return Err(PaillierError::InvalidKey("primes must be distinct"));
        }
        if *p <= one || *q <= one {
            return Err(PaillierError::InvalidKey("primes must be greater than one"));
        }
        let n = p * q;
        let phi = (p - &one) * (q - &one);
        if !n.gcd(&phi).is_one() {
            return Err(PaillierError::InvalidKey("gcd(n, phi(n)) must be one"));
        }
        let lambda = (p - &one).lcm(&(q - &one));
        let mu = mod_inverse(&lambda, &n).ok_or(PaillierError::InvalidKey("lambda is not invertible mod n"))?;
        Ok(Self {
            public: PaillierPublicKey::new(n),
            lambda,
            mu,
        })
    }

    pub fn from_key_file(file: &PaillierKeyFile) -> Result<Self, PaillierError> {
        Self::from_primes(&file.p, &file.q)
    }

    pub fn public(&self) -> &PaillierPublicKey {
        &self.public
    }
}

/// Encrypt `m` under `key` with fresh randomness drawn from `rng`.
pub fn paillier_encrypt<R: RngCore + CryptoRng>(
    key: &PaillierPublicKey,
    m: &BigUint,
    rng: &mut R,
) -> Result<BigUint, PaillierError> {
    if *m >= key.n {
        return Err(PaillierError::PlaintextTooLarge);
    }
    let n = &key.n;
    let r = loop {
        let candidate = rng.gen_biguint_below(n);
        if !candidate.is_zero() && candidate.gcd(n).is_one() {
            break candidate;
        }
    };
    // (n + 1)^m = 1 + m n (mod n^2)
    let g_m = (BigUint::one() + m * n) % key.n_squared();
    let r_n = r.modpow(n, key.n_squared());
    Ok((g_m * r_n) % key.n_squared())
}

/// Homomorphic addition: the product of two ciphertexts modulo `n^2`.
pub fn paillier_add(key: &PaillierPublicKey, c1: &BigUint, c2: &BigUint) -> BigUint {
    (c1 * c2) % key.n_squared()
}

/// Decrypt `c`, rejecting ciphertexts outside `[0, n^2)`.
pub fn paillier_decrypt(key: &PaillierPrivateKey, c: &BigUint) -> Result<BigUint, PaillierError> {
    let public = &key.public;
    if c >= public.n_squared() {
        return Err(PaillierError::OutOfRange);
    }
    let u = c.modpow(&key.lambda, public.n_squared());
    let l = (u - BigUint::one()) / &public.n;
    Ok((l * &key.mu) % &public.n)
}

/// The encryption of zero with randomness one, the identity for [`paillier_add`].
pub fn encrypted_zero() -> BigUint {
    BigUint::one()
}

fn mod_inverse(a: &BigUint, modulus: &BigUint) -> Option<BigUint> {
    let a = BigInt::from(a.clone());
    let m = BigInt::from(modulus.clone());
    let egcd = a.extended_gcd(&m);
    if !egcd.gcd.is_one() {
        return None;
    }
    egcd.x.mod_floor(&m).to_biguint()
}

/// Serialize big integers as decimal strings.
pub mod biguint_decimal {
    use num_bigint::BigUint;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(s.as_bytes(), 10)
            .ok_or_else(|| D::Error::custom(format!("invalid decimal integer: {s}")))
    }
}

impl<'de> Deserialize<'de> for PaillierPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(with = "biguint_decimal")]
            n: BigUint,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(Self::new(raw.n))
    }
}
