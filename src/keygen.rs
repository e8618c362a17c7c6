//! Deterministic PRNG + host-key derivation (C2).
//!
//! Host keys are normally random; the daemon instead derives them from an
//! operator-supplied seed string so that re-launching with the same seed
//! reproduces the same identity (useful for tests and for pinning a known
//! fingerprint across restarts). `DeterministicRng` feeds a seeded CSPRNG
//! to `russh::keys::PrivateKey` generation - the same key-generation paths
//! `ssh-keygen`/`russh` use, just with the entropy source swapped out.

use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use russh::keys::{Algorithm, PrivateKey};
use sha2::{Digest, Sha256};

use crate::error::{Result, ServerError};

/// Which key algorithm to derive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KeyAlgorithm {
    Rsa2048,
    Ed25519,
}

/// A stable identity for the daemon's lifetime: private key, public key and
/// the fingerprint an operator would compare against `ssh-keyscan` output.
#[derive(Clone)]
pub struct HostIdentity {
    key: PrivateKey,
    fingerprint: String,
}

impl HostIdentity {
    /// Derive a host identity from `seed` using `algorithm`. Byte-identical
    /// across calls for the same `(seed, algorithm)` pair (Scenario 6).
    pub fn from_seed(seed: &str, algorithm: KeyAlgorithm) -> Result<Self> {
        let mut rng = DeterministicRng::from_seed_str(seed);

        let key = match algorithm {
            KeyAlgorithm::Ed25519 => PrivateKey::random(&mut rng, Algorithm::Ed25519)
                .map_err(|e| ServerError::Config(format!("ed25519 keygen failed: {e}")))?,
            KeyAlgorithm::Rsa2048 => PrivateKey::random(
                &mut rng,
                Algorithm::Rsa { hash: None },
            )
            .map_err(|e| ServerError::Config(format!("rsa keygen failed: {e}")))?,
        };

        let fingerprint = key.public_key().fingerprint(Default::default()).to_string();

        Ok(Self { key, fingerprint })
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.key
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Debug for HostIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostIdentity")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// A `CryptoRng` seeded deterministically from an arbitrary-length string.
///
/// The seed string is hashed with SHA-256 to produce the 32-byte seed
/// `ChaCha20Rng` requires; two distinct seed strings are vanishingly
/// unlikely to collide, and the same seed string always yields the same
/// stream.
struct DeterministicRng(ChaCha20Rng);

impl DeterministicRng {
    fn from_seed_str(seed: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        Self(ChaCha20Rng::from_seed(digest))
    }
}

impl RngCore for DeterministicRng {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> std::result::Result<(), rand::Error> {
        self.0.try_fill_bytes(dest)
    }
}

impl CryptoRng for DeterministicRng {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_key() {
        let a = HostIdentity::from_seed("s", KeyAlgorithm::Ed25519).unwrap();
        let b = HostIdentity::from_seed("s", KeyAlgorithm::Ed25519).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn different_seed_different_key() {
        let a = HostIdentity::from_seed("s", KeyAlgorithm::Ed25519).unwrap();
        let b = HostIdentity::from_seed("t", KeyAlgorithm::Ed25519).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
