//! Hash, HMAC and randomness abstraction.
//!
//! The original core reaches every digest, HMAC and random byte through a
//! vendored crypto library (`CryptStartHash`, `CryptComputeHMAC`,
//! `CryptGenerateRandom`, …) that sits outside this distillation's scope.
//! [`Crypto`] and [`Rng`] are the seams the pipeline and audit subsystem
//! program against instead of a concrete library, and [`sim`] is a small,
//! real backend for tests and the demo binary.

use tpm2_call::Algorithm;

/// The hash algorithms this crate's simulation actually implements. The
/// protocol names many more (`TPM_ALG_SM3_256`, `TPM_ALG_SHA3_256`, …); a
/// real TPM core would route each through the vendored library, but a
/// from-scratch simulation only needs enough variety to exercise multi-hash
/// session and audit logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlg {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlg {
    #[must_use]
    pub fn digest_size(self) -> usize {
        match self {
            HashAlg::Sha1 => 20,
            HashAlg::Sha256 => 32,
            HashAlg::Sha384 => 48,
            HashAlg::Sha512 => 64,
        }
    }

    /// Converts from the wire `TPM_ALG_ID`. Returns `None` for `TPM_ALG_NULL`
    /// (meaning "no hash", handled by the caller) or any algorithm this
    /// simulation does not implement.
    #[must_use]
    pub fn from_wire(alg: &Algorithm) -> Option<HashAlg> {
        match alg {
            Algorithm::Sha1 => Some(HashAlg::Sha1),
            Algorithm::Sha256 => Some(HashAlg::Sha256),
            Algorithm::Sha384 => Some(HashAlg::Sha384),
            Algorithm::Sha512 => Some(HashAlg::Sha512),
            _ => None,
        }
    }
}

/// Digest and HMAC operations, keyed by [`HashAlg`] so callers never need to
/// know which concrete implementation backs a given algorithm.
pub trait Crypto {
    fn hash(&self, alg: HashAlg, data: &[u8]) -> Vec<u8>;

    /// Incremental digest over several chunks, used by audit digest
    /// accumulation and cpHash/rpHash computation alike.
    fn hash_chunks(&self, alg: HashAlg, chunks: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        for chunk in chunks {
            buf.extend_from_slice(chunk);
        }
        self.hash(alg, &buf)
    }

    fn hmac(&self, alg: HashAlg, key: &[u8], data: &[u8]) -> Vec<u8>;

    /// An HMAC-DRBG-style keystream: `HMAC(key, iv || counter)` blocks
    /// concatenated and truncated to `len`, the same construction
    /// `CryptGenerateRandom` itself uses internally to stretch a seed into
    /// arbitrary-length output.
    fn keystream(&self, alg: HashAlg, key: &[u8], iv: &[u8], len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut counter: u32 = 0;
        while out.len() < len {
            let mut block_input = iv.to_vec();
            block_input.extend_from_slice(&counter.to_be_bytes());
            out.extend_from_slice(&self.hmac(alg, key, &block_input));
            counter += 1;
        }
        out.truncate(len);
        out
    }

    /// Parameter encryption for `decrypt`/`encrypt` sessions. The original
    /// routes this through whichever symmetric algorithm the session
    /// negotiated (`CryptAES(...)` in CFB mode); this simulation has no
    /// block-cipher primitive to reach for, so it derives a keystream from
    /// the session's own HMAC algorithm and XORs it against the parameter
    /// bytes. Encryption and decryption are therefore the same operation.
    fn encrypt(&self, alg: HashAlg, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        let ks = self.keystream(alg, key, iv, data.len());
        data.iter().zip(ks.iter()).map(|(d, k)| d ^ k).collect()
    }

    fn decrypt(&self, alg: HashAlg, key: &[u8], iv: &[u8], data: &[u8]) -> Vec<u8> {
        self.encrypt(alg, key, iv, data)
    }
}

/// A source of fresh random bytes, standing in for `CryptGenerateRandom`.
pub trait Rng {
    fn fill(&mut self, buf: &mut [u8]);

    fn nonce(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.fill(&mut buf);
        buf
    }
}

/// Concrete `sha2`/`hmac`/`rand`-backed implementations, sufficient for the
/// demo binary and for every test in this crate.
pub mod sim {
    use hmac::{Hmac, Mac};
    use rand::RngCore;
    use sha1::Sha1;
    use sha2::{Digest, Sha256, Sha384, Sha512};

    use super::{Crypto, HashAlg, Rng};

    #[derive(Debug, Clone, Copy, Default)]
    pub struct SimCrypto;

    impl Crypto for SimCrypto {
        fn hash(&self, alg: HashAlg, data: &[u8]) -> Vec<u8> {
            match alg {
                HashAlg::Sha1 => Sha1::digest(data).to_vec(),
                HashAlg::Sha256 => Sha256::digest(data).to_vec(),
                HashAlg::Sha384 => Sha384::digest(data).to_vec(),
                HashAlg::Sha512 => Sha512::digest(data).to_vec(),
            }
        }

        fn hmac(&self, alg: HashAlg, key: &[u8], data: &[u8]) -> Vec<u8> {
            fn run(mut mac: impl Mac, data: &[u8]) -> Vec<u8> {
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            match alg {
                HashAlg::Sha1 => run(Hmac::<Sha1>::new_from_slice(key).expect("hmac accepts any key length"), data),
                HashAlg::Sha256 => {
                    run(Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length"), data)
                }
                HashAlg::Sha384 => {
                    run(Hmac::<Sha384>::new_from_slice(key).expect("hmac accepts any key length"), data)
                }
                HashAlg::Sha512 => {
                    run(Hmac::<Sha512>::new_from_slice(key).expect("hmac accepts any key length"), data)
                }
            }
        }
    }

    #[derive(Debug, Default)]
    pub struct SimRng(rand::rngs::ThreadRng);

    impl Rng for SimRng {
        fn fill(&mut self, buf: &mut [u8]) {
            self.0.fill_bytes(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimCrypto;
    use super::*;

    #[test]
    fn sha256_digest_has_the_expected_size() {
        let crypto = SimCrypto;
        let digest = crypto.hash(HashAlg::Sha256, b"tpm");
        assert_eq!(digest.len(), HashAlg::Sha256.digest_size());
    }

    #[test]
    fn hash_chunks_matches_a_single_concatenated_hash() {
        let crypto = SimCrypto;
        let chunked = crypto.hash_chunks(HashAlg::Sha1, &[b"ab", b"cd"]);
        let flat = crypto.hash(HashAlg::Sha1, b"abcd");
        assert_eq!(chunked, flat);
    }

    #[test]
    fn hmac_is_sensitive_to_the_key() {
        let crypto = SimCrypto;
        let mac1 = crypto.hmac(HashAlg::Sha256, b"key-a", b"message");
        let mac2 = crypto.hmac(HashAlg::Sha256, b"key-b", b"message");
        assert_ne!(mac1, mac2);
    }

    #[test]
    fn from_wire_rejects_unimplemented_algorithms() {
        assert_eq!(HashAlg::from_wire(&Algorithm::Null), None);
        assert_eq!(HashAlg::from_wire(&Algorithm::Rsa), None);
        assert_eq!(HashAlg::from_wire(&Algorithm::Sha256), Some(HashAlg::Sha256));
    }
}
