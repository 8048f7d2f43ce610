#![forbid(unsafe_code)]

//! Symmetric primitives for the relay: password key derivation, AEAD chunk framing and
//! the legacy stream cipher mode.
//!
//! [`CipherKey`] is built once from a password and a method name. Every connection then
//! takes its own [`Encryptor`] and [`Decryptor`] from it, so salts, subkeys, IVs and
//! nonce counters are never shared between connections.

pub mod aead;
pub mod kdf;
pub mod method;
pub mod stream;
pub mod traits;

pub use self::method::CipherMethod;
pub use self::traits::*;

use std::fmt;
use std::sync::Arc;

use self::aead::{AeadDecoder, AeadEncoder};
use self::stream::{StreamDecryptor, StreamEncryptor};

/// A cipher method together with the master key derived from the password.
#[derive(Clone)]
pub struct CipherKey {
    method: CipherMethod,
    key: Arc<[u8]>,
}

impl CipherKey {
    /// Resolves `method` and stretches `password` to the method's key length.
    pub fn new(method: &str, password: &str) -> Result<CipherKey, CryptoError> {
        let method: CipherMethod = method.parse()?;
        let key = kdf::bytes_to_key(password.as_bytes(), method.key_len());
        Ok(CipherKey {
            method,
            key: key.into(),
        })
    }

    pub fn method(&self) -> CipherMethod {
        self.method
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// A new encrypting half with a fresh salt or IV.
    pub fn encryptor(&self) -> Result<Encryptor, CryptoError> {
        if self.method.is_aead() {
            Ok(Encryptor::Aead(AeadEncoder::new(self.method, &self.key)?))
        } else {
            Ok(Encryptor::Stream(StreamEncryptor::new(self.method, &self.key)?))
        }
    }

    /// A new decrypting half waiting for the peer's salt or IV.
    pub fn decryptor(&self) -> Result<Decryptor, CryptoError> {
        if self.method.is_aead() {
            Ok(Decryptor::Aead(AeadDecoder::new(self.method, &self.key)?))
        } else {
            Ok(Decryptor::Stream(StreamDecryptor::new(self.method, &self.key)?))
        }
    }
}

// Keeps the master key out of logs.
impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherKey")
            .field("method", &self.method)
            .finish()
    }
}

pub enum Encryptor {
    Aead(AeadEncoder),
    Stream(StreamEncryptor),
}

impl Encrypt for Encryptor {
    fn take_preamble(&mut self) -> Option<Vec<u8>> {
        match self {
            Encryptor::Aead(e) => e.take_preamble(),
            Encryptor::Stream(e) => e.take_preamble(),
        }
    }

    fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        match self {
            Encryptor::Aead(e) => e.encrypt(plaintext, out),
            Encryptor::Stream(e) => e.encrypt(plaintext, out),
        }
    }
}

pub enum Decryptor {
    Aead(AeadDecoder),
    Stream(StreamDecryptor),
}

impl Decrypt for Decryptor {
    fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        match self {
            Decryptor::Aead(d) => d.decrypt(ciphertext, out),
            Decryptor::Stream(d) => d.decrypt(ciphertext, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_sized_by_method() {
        let k = CipherKey::new("aes-128-gcm", "qwe123").unwrap();
        assert_eq!(k.key().len(), 16);
        let k = CipherKey::new("chacha20-ietf-poly1305", "qwe123").unwrap();
        assert_eq!(k.key().len(), 32);
        assert_eq!(format!("{:?}", k), "CipherKey { method: ChaCha20Poly1305 }");
    }

    #[test]
    fn unsupported_method_fails_construction() {
        assert_eq!(
            CipherKey::new("bf-cfb", "qwe123").unwrap_err(),
            CryptoError::UnsupportedMethod("bf-cfb".to_string())
        );
    }

    #[test]
    fn halves_interoperate() {
        for method in ["aes-256-gcm", "aes-128-gcm", "chacha20-ietf-poly1305", "aes-256-cfb"] {
            let key = CipherKey::new(method, "qwe123").unwrap();
            let mut enc = key.encryptor().unwrap();
            let mut dec = key.decryptor().unwrap();

            let mut wire = enc.take_preamble().unwrap_or_default();
            enc.encrypt(b"ping", &mut wire).unwrap();
            enc.encrypt(b"pong", &mut wire).unwrap();

            let mut plain = Vec::new();
            dec.decrypt(&wire, &mut plain).unwrap();
            assert_eq!(plain, b"pingpong".to_vec(), "{}", method);
        }
    }

    #[test]
    fn every_encryptor_uses_fresh_salt() {
        let key = CipherKey::new("aes-256-gcm", "qwe123").unwrap();
        let mut a = Vec::new();
        let mut b = Vec::new();
        key.encryptor().unwrap().encrypt(b"x", &mut a).unwrap();
        key.encryptor().unwrap().encrypt(b"x", &mut b).unwrap();
        assert_ne!(a[..32], b[..32]);
    }
}
