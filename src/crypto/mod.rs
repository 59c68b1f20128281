//! Cryptographic primitives for the tunnel engine
//!
//! This module provides:
//! - Secure random number generation
//! - The TLS 1.0 pseudo-random function used for the key schedule
//! - Bulk data ciphers (AES-GCM and AES-CBC with HMAC)
//! - PKCS#7 padding

mod cipher;
mod prf;

pub use cipher::{
    pkcs7_pad, pkcs7_unpad, AuthDigest, CipherMode, DataCipher, AEAD_TAG_LEN, CBC_BLOCK_SIZE,
    GCM_NONCE_LEN,
};
pub use prf::prf;

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("unsupported cipher suite: {0}")]
    UnsupportedCipher(String),

    #[error("unsupported auth digest: {0}")]
    UnsupportedDigest(String),

    #[error("invalid key size")]
    InvalidKeySize,

    #[error("wrong size for iv: {0}")]
    BadIv(usize),

    #[error("encryption failed")]
    Seal,

    #[error("decryption failed")]
    Open,

    #[error("hmac verification failed")]
    BadMac,

    #[error("padding error")]
    Padding,
}

/// Fills `buf` with cryptographically secure random bytes.
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system CSPRNG unavailable");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1);
        random_bytes(&mut buf2);
        assert_ne!(buf1, buf2);
    }
}
