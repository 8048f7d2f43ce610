//! Password and session key derivation.

use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::CryptoError;

/// HKDF context label for AEAD session subkeys.
pub const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Stretches `password` into `key_len` bytes the way OpenSSL's `EVP_BytesToKey` does
/// with MD5 and a single round: `D_i = MD5(D_{i-1} || password)`, concatenated and
/// truncated. Used both as the legacy stream key and as the AEAD master key.
pub fn bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len);
    let mut last_digest: Vec<u8> = Vec::new();

    while key.len() < key_len {
        let mut m = Md5::new();
        m.update(&last_digest);
        m.update(password);
        last_digest = m.finalize().to_vec();

        let amt = std::cmp::min(key_len - key.len(), last_digest.len());
        key.extend_from_slice(&last_digest[..amt]);
    }
    key
}

/// Derives the per-session AEAD subkey from the master key and the session salt.
/// The subkey has the same length as the master key.
pub fn derive_subkey(master_key: &[u8], salt: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut okm = vec![0u8; master_key.len()];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(okm)
}
