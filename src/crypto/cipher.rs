//! Bulk data ciphers
//!
//! The data channel negotiates one of `AES-{128,192,256}-{CBC,GCM}` plus
//! an HMAC digest (used for packet authentication in CBC mode and for
//! nonce material in GCM mode). Key material always comes from the key
//! schedule's fixed-width slots, so the cipher takes exactly the first
//! `key_len()` bytes of whatever slice it is handed.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes192;
use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use hmac::{Mac, SimpleHmac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};

use super::CryptoError;

/// AES block size, also the CBC IV length.
pub const CBC_BLOCK_SIZE: usize = 16;

/// GCM nonce length (packet id plus implicit salt).
pub const GCM_NONCE_LEN: usize = 12;

/// GCM authentication tag length.
pub const AEAD_TAG_LEN: usize = 16;

type Aes192Gcm = AesGcm<Aes192, U12>;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Cipher mode of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// CBC with a separate HMAC.
    Cbc,
    /// AEAD.
    Gcm,
}

/// A negotiated bulk cipher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataCipher {
    key_bytes: usize,
    mode: CipherMode,
}

impl DataCipher {
    /// Looks up a cipher by its negotiated suite name, e.g. `AES-256-GCM`.
    pub fn from_suite(name: &str) -> Result<Self, CryptoError> {
        let (key_bytes, mode) = match name.to_ascii_uppercase().as_str() {
            "AES-128-CBC" => (16, CipherMode::Cbc),
            "AES-192-CBC" => (24, CipherMode::Cbc),
            "AES-256-CBC" => (32, CipherMode::Cbc),
            "AES-128-GCM" => (16, CipherMode::Gcm),
            "AES-192-GCM" => (24, CipherMode::Gcm),
            "AES-256-GCM" => (32, CipherMode::Gcm),
            _ => return Err(CryptoError::UnsupportedCipher(name.to_string())),
        };
        Ok(DataCipher { key_bytes, mode })
    }

    pub fn key_len(&self) -> usize {
        self.key_bytes
    }

    pub fn mode(&self) -> CipherMode {
        self.mode
    }

    pub fn is_aead(&self) -> bool {
        self.mode == CipherMode::Gcm
    }

    pub fn block_size(&self) -> usize {
        CBC_BLOCK_SIZE
    }

    /// Encrypts `plaintext`. The key slice may be longer than needed; only
    /// the first `key_len()` bytes are used. For CBC the plaintext must
    /// already be padded to the block size and `ad` is ignored; for GCM
    /// the returned ciphertext carries the 16-byte tag appended.
    pub fn encrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        plaintext: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if key.len() < self.key_bytes {
            return Err(CryptoError::InvalidKeySize);
        }
        let key = &key[..self.key_bytes];

        match self.mode {
            CipherMode::Cbc => {
                if iv.len() != CBC_BLOCK_SIZE {
                    return Err(CryptoError::BadIv(iv.len()));
                }
                if plaintext.len() % CBC_BLOCK_SIZE != 0 {
                    return Err(CryptoError::Padding);
                }
                let ct = match self.key_bytes {
                    16 => Aes128CbcEnc::new_from_slices(key, iv)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .encrypt_padded_vec_mut::<NoPadding>(plaintext),
                    24 => Aes192CbcEnc::new_from_slices(key, iv)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .encrypt_padded_vec_mut::<NoPadding>(plaintext),
                    _ => Aes256CbcEnc::new_from_slices(key, iv)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .encrypt_padded_vec_mut::<NoPadding>(plaintext),
                };
                Ok(ct)
            }
            CipherMode::Gcm => {
                if iv.len() != GCM_NONCE_LEN {
                    return Err(CryptoError::BadIv(iv.len()));
                }
                let nonce = Nonce::from_slice(iv);
                let payload = Payload { msg: plaintext, aad: ad };
                let ct = match self.key_bytes {
                    16 => Aes128Gcm::new_from_slice(key)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .encrypt(nonce, payload),
                    24 => Aes192Gcm::new_from_slice(key)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .encrypt(nonce, payload),
                    _ => Aes256Gcm::new_from_slice(key)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .encrypt(nonce, payload),
                };
                ct.map_err(|_| CryptoError::Seal)
            }
        }
    }

    /// The inverse of [`encrypt`](Self::encrypt). CBC output keeps its
    /// padding (the caller strips it after checking the HMAC); GCM input
    /// is ciphertext with the tag appended.
    pub fn decrypt(
        &self,
        key: &[u8],
        iv: &[u8],
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if key.len() < self.key_bytes {
            return Err(CryptoError::InvalidKeySize);
        }
        let key = &key[..self.key_bytes];

        match self.mode {
            CipherMode::Cbc => {
                if iv.len() != CBC_BLOCK_SIZE {
                    return Err(CryptoError::BadIv(iv.len()));
                }
                if ciphertext.is_empty() || ciphertext.len() % CBC_BLOCK_SIZE != 0 {
                    return Err(CryptoError::Open);
                }
                let pt = match self.key_bytes {
                    16 => Aes128CbcDec::new_from_slices(key, iv)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
                    24 => Aes192CbcDec::new_from_slices(key, iv)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
                    _ => Aes256CbcDec::new_from_slices(key, iv)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .decrypt_padded_vec_mut::<NoPadding>(ciphertext),
                };
                pt.map_err(|_| CryptoError::Open)
            }
            CipherMode::Gcm => {
                if iv.len() != GCM_NONCE_LEN {
                    return Err(CryptoError::BadIv(iv.len()));
                }
                let nonce = Nonce::from_slice(iv);
                let payload = Payload { msg: ciphertext, aad: ad };
                let pt = match self.key_bytes {
                    16 => Aes128Gcm::new_from_slice(key)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .decrypt(nonce, payload),
                    24 => Aes192Gcm::new_from_slice(key)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .decrypt(nonce, payload),
                    _ => Aes256Gcm::new_from_slice(key)
                        .map_err(|_| CryptoError::InvalidKeySize)?
                        .decrypt(nonce, payload),
                };
                pt.map_err(|_| CryptoError::Open)
            }
        }
    }
}

/// Packet authentication digest for CBC mode; its output also feeds the
/// GCM nonce salt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDigest {
    Sha1,
    Sha256,
    Sha512,
}

impl AuthDigest {
    /// Looks up a digest by its negotiated name, e.g. `SHA1`.
    pub fn from_name(name: &str) -> Result<Self, CryptoError> {
        match name.to_ascii_lowercase().as_str() {
            "sha1" => Ok(AuthDigest::Sha1),
            "sha256" => Ok(AuthDigest::Sha256),
            "sha512" => Ok(AuthDigest::Sha512),
            _ => Err(CryptoError::UnsupportedDigest(name.to_string())),
        }
    }

    pub fn output_len(&self) -> usize {
        match self {
            AuthDigest::Sha1 => 20,
            AuthDigest::Sha256 => 32,
            AuthDigest::Sha512 => 64,
        }
    }

    /// Computes HMAC over the concatenation of `parts`.
    pub fn hmac(&self, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
        fn run<D>(key: &[u8], parts: &[&[u8]]) -> Vec<u8>
        where
            D: hmac::digest::Digest + hmac::digest::core_api::BlockSizeUser,
        {
            let mut mac =
                <SimpleHmac<D> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
            for part in parts {
                mac.update(part);
            }
            mac.finalize().into_bytes().to_vec()
        }
        match self {
            AuthDigest::Sha1 => run::<Sha1>(key, parts),
            AuthDigest::Sha256 => run::<Sha256>(key, parts),
            AuthDigest::Sha512 => run::<Sha512>(key, parts),
        }
    }

    /// Constant-time verification of `tag` against HMAC over `parts`.
    pub fn verify(&self, key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
        fn run<D>(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError>
        where
            D: hmac::digest::Digest + hmac::digest::core_api::BlockSizeUser,
        {
            let mut mac =
                <SimpleHmac<D> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
            for part in parts {
                mac.update(part);
            }
            mac.verify_slice(tag).map_err(|_| CryptoError::BadMac)
        }
        match self {
            AuthDigest::Sha1 => run::<Sha1>(key, parts, tag),
            AuthDigest::Sha256 => run::<Sha256>(key, parts, tag),
            AuthDigest::Sha512 => run::<Sha512>(key, parts, tag),
        }
    }
}

/// PKCS#7 padding: appends `n` bytes of value `n` where
/// `n = block_size - len % block_size` (a full block when already aligned).
pub fn pkcs7_pad(buf: &[u8], block_size: usize) -> Result<Vec<u8>, CryptoError> {
    if block_size == 0 || block_size > u8::MAX as usize {
        return Err(CryptoError::Padding);
    }
    let padding = block_size - buf.len() % block_size;
    let mut out = Vec::with_capacity(buf.len() + padding);
    out.extend_from_slice(buf);
    out.resize(buf.len() + padding, padding as u8);
    Ok(out)
}

/// Strict PKCS#7 unpadding: rejects zero padding, padding beyond the
/// block size, and inconsistent padding bytes.
pub fn pkcs7_unpad(buf: &[u8], block_size: usize) -> Result<Vec<u8>, CryptoError> {
    if block_size == 0 || block_size > u8::MAX as usize || buf.is_empty() {
        return Err(CryptoError::Padding);
    }
    let padding = buf[buf.len() - 1] as usize;
    if padding == 0 || padding > block_size || padding > buf.len() {
        return Err(CryptoError::Padding);
    }
    if buf[buf.len() - padding..].iter().any(|&b| b as usize != padding) {
        return Err(CryptoError::Padding);
    }
    Ok(buf[..buf.len() - padding].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_suite() {
        let c = DataCipher::from_suite("AES-128-GCM").unwrap();
        assert_eq!(c.key_len(), 16);
        assert!(c.is_aead());

        let c = DataCipher::from_suite("aes-256-cbc").unwrap();
        assert_eq!(c.key_len(), 32);
        assert!(!c.is_aead());

        assert_eq!(
            DataCipher::from_suite("BF-CBC"),
            Err(CryptoError::UnsupportedCipher("BF-CBC".to_string()))
        );
    }

    #[test]
    fn test_gcm_roundtrip_all_key_sizes() {
        for suite in ["AES-128-GCM", "AES-192-GCM", "AES-256-GCM"] {
            let c = DataCipher::from_suite(suite).unwrap();
            let key = vec![0x42u8; 64]; // oversized slot, truncated by the cipher
            let iv = [0x24u8; GCM_NONCE_LEN];
            let ad = [0x00, 0x00, 0x00, 0x01];

            let ct = c.encrypt(&key, &iv, b"hello tunnel", &ad).unwrap();
            assert_eq!(ct.len(), b"hello tunnel".len() + AEAD_TAG_LEN);

            let pt = c.decrypt(&key, &iv, &ct, &ad).unwrap();
            assert_eq!(pt, b"hello tunnel");
        }
    }

    #[test]
    fn test_gcm_rejects_tampered_ciphertext() {
        let c = DataCipher::from_suite("AES-128-GCM").unwrap();
        let key = [7u8; 16];
        let iv = [1u8; GCM_NONCE_LEN];
        let mut ct = c.encrypt(&key, &iv, b"payload", b"ad").unwrap();
        ct[0] ^= 0xff;
        assert_eq!(c.decrypt(&key, &iv, &ct, b"ad"), Err(CryptoError::Open));
    }

    #[test]
    fn test_gcm_rejects_wrong_ad() {
        let c = DataCipher::from_suite("AES-128-GCM").unwrap();
        let key = [7u8; 16];
        let iv = [1u8; GCM_NONCE_LEN];
        let ct = c.encrypt(&key, &iv, b"payload", b"ad").unwrap();
        assert_eq!(c.decrypt(&key, &iv, &ct, b"da"), Err(CryptoError::Open));
    }

    #[test]
    fn test_cbc_roundtrip_all_key_sizes() {
        for suite in ["AES-128-CBC", "AES-192-CBC", "AES-256-CBC"] {
            let c = DataCipher::from_suite(suite).unwrap();
            let key = vec![0x13u8; 64];
            let iv = [0x55u8; CBC_BLOCK_SIZE];

            let padded = pkcs7_pad(b"ip packet bytes", CBC_BLOCK_SIZE).unwrap();
            let ct = c.encrypt(&key, &iv, &padded, &[]).unwrap();
            assert_eq!(ct.len() % CBC_BLOCK_SIZE, 0);
            assert_ne!(ct, padded);

            let pt = c.decrypt(&key, &iv, &ct, &[]).unwrap();
            assert_eq!(pkcs7_unpad(&pt, CBC_BLOCK_SIZE).unwrap(), b"ip packet bytes");
        }
    }

    #[test]
    fn test_cbc_rejects_bad_iv_and_unaligned_input() {
        let c = DataCipher::from_suite("AES-128-CBC").unwrap();
        let key = [0u8; 16];
        assert_eq!(
            c.encrypt(&key, &[0u8; 8], &[0u8; 16], &[]),
            Err(CryptoError::BadIv(8))
        );
        assert_eq!(
            c.encrypt(&key, &[0u8; 16], &[0u8; 15], &[]),
            Err(CryptoError::Padding)
        );
    }

    #[test]
    fn test_hmac_digest_lengths_and_verify() {
        for (name, len) in [("SHA1", 20), ("SHA256", 32), ("SHA512", 64)] {
            let d = AuthDigest::from_name(name).unwrap();
            assert_eq!(d.output_len(), len);

            let tag = d.hmac(b"key", &[b"part one ", b"part two"]);
            assert_eq!(tag.len(), len);
            assert_eq!(tag, d.hmac(b"key", &[b"part one part two"]));

            d.verify(b"key", &[b"part one part two"], &tag).unwrap();
            assert_eq!(
                d.verify(b"other", &[b"part one part two"], &tag),
                Err(CryptoError::BadMac)
            );
        }
        assert!(AuthDigest::from_name("md4").is_err());
    }

    #[test]
    fn test_pkcs7_roundtrip() {
        for len in 0..33 {
            let data: Vec<u8> = (0..len as u8).collect();
            let padded = pkcs7_pad(&data, 16).unwrap();
            assert_eq!(padded.len() % 16, 0);
            assert!(padded.len() > data.len());
            assert_eq!(pkcs7_unpad(&padded, 16).unwrap(), data);
        }
    }

    #[test]
    fn test_pkcs7_full_block_when_aligned() {
        let padded = pkcs7_pad(&[0xde, 0xad, 0xbe, 0xef], 4).unwrap();
        assert_eq!(padded, [0xde, 0xad, 0xbe, 0xef, 0x04, 0x04, 0x04, 0x04]);
    }

    #[test]
    fn test_pkcs7_unpad_rejects_malformed() {
        // zero padding byte
        assert_eq!(pkcs7_unpad(&[0x61, 0x61, 0x00, 0x00], 2), Err(CryptoError::Padding));
        // padding larger than block size
        assert_eq!(pkcs7_unpad(&[0x61, 0x61, 0x03, 0x03], 2), Err(CryptoError::Padding));
        // inconsistent padding bytes
        assert_eq!(pkcs7_unpad(&[0x61, 0x02, 0x03, 0x03], 4), Err(CryptoError::Padding));
        // empty input and oversized block size
        assert_eq!(pkcs7_unpad(&[], 2), Err(CryptoError::Padding));
        assert_eq!(pkcs7_unpad(&[0x01], 256), Err(CryptoError::Padding));
        assert_eq!(pkcs7_pad(&[0x00], 256), Err(CryptoError::Padding));
    }
}
