//! TLS 1.0 pseudo-random function
//!
//! The key schedule derives the master secret and the data-channel key
//! block with the PRF from RFC 2246, Section 5: the secret is split in
//! two overlapping halves, `P_MD5` and `P_SHA1` are run over
//! `label || seed`, and the two outputs are XORed together.

use hmac::{Mac, SimpleHmac};
use md5::Md5;
use sha1::Sha1;

/// Derives `out_len` bytes from `secret` and the concatenated seed
/// material. Empty seed components are skipped.
pub fn prf(
    secret: &[u8],
    label: &[u8],
    client_seed: &[u8],
    server_seed: &[u8],
    client_sid: &[u8],
    server_sid: &[u8],
    out_len: usize,
) -> Vec<u8> {
    let mut seed = Vec::with_capacity(
        client_seed.len() + server_seed.len() + client_sid.len() + server_sid.len(),
    );
    seed.extend_from_slice(client_seed);
    seed.extend_from_slice(server_seed);
    seed.extend_from_slice(client_sid);
    seed.extend_from_slice(server_sid);

    prf10(secret, label, &seed, out_len)
}

/// The TLS 1.0 PRF proper: `P_MD5(s1) XOR P_SHA1(s2)` over `label || seed`.
fn prf10(secret: &[u8], label: &[u8], seed: &[u8], out_len: usize) -> Vec<u8> {
    let mut label_and_seed = Vec::with_capacity(label.len() + seed.len());
    label_and_seed.extend_from_slice(label);
    label_and_seed.extend_from_slice(seed);

    let (s1, s2) = split_secret(secret);

    let mut result = vec![0u8; out_len];
    p_hash::<Md5>(&mut result, s1, &label_and_seed);

    let mut result2 = vec![0u8; out_len];
    p_hash::<Sha1>(&mut result2, s2, &label_and_seed);

    for (r, b) in result.iter_mut().zip(result2) {
        *r ^= b;
    }
    result
}

/// Splits the secret in two halves per RFC 4346, Section 5. For odd
/// lengths the halves overlap by one byte.
fn split_secret(secret: &[u8]) -> (&[u8], &[u8]) {
    (&secret[..(secret.len() + 1) / 2], &secret[secret.len() / 2..])
}

/// The `P_hash` expansion from RFC 4346, Section 5:
/// `A(0) = seed; A(i) = HMAC(secret, A(i-1))`,
/// `output = HMAC(secret, A(1) || seed) || HMAC(secret, A(2) || seed) || …`
fn p_hash<D>(result: &mut [u8], secret: &[u8], seed: &[u8])
where
    D: hmac::digest::Digest + hmac::digest::core_api::BlockSizeUser,
{
    let hmac = |key: &[u8], parts: &[&[u8]]| -> Vec<u8> {
        let mut mac =
            <SimpleHmac<D> as Mac>::new_from_slice(key).expect("hmac accepts any key length");
        for part in parts {
            mac.update(part);
        }
        mac.finalize().into_bytes().to_vec()
    };

    let mut a = hmac(secret, &[seed]);
    let mut j = 0;
    while j < result.len() {
        let b = hmac(secret, &[&a, seed]);
        let n = b.len().min(result.len() - j);
        result[j..j + n].copy_from_slice(&b[..n]);
        j += n;
        a = hmac(secret, &[&a]);
    }
}
