//! Legacy stream cipher mode: `[iv][ciphertext...]` per direction, no framing and no
//! integrity. A corrupted byte decrypts to garbage instead of failing.

use aes::{Aes128, Aes256};
use cfb_mode::cipher::KeyIvInit;
use cfb_mode::{BufDecryptor, BufEncryptor};
use rand::RngCore;

use crate::{CipherMethod, CryptoError, Decrypt, Encrypt};

enum CfbEncryptor {
    Aes128(BufEncryptor<Aes128>),
    Aes256(BufEncryptor<Aes256>),
}

enum CfbDecryptor {
    Aes128(BufDecryptor<Aes128>),
    Aes256(BufDecryptor<Aes256>),
}

impl CfbEncryptor {
    fn new(method: CipherMethod, key: &[u8], iv: &[u8]) -> Result<CfbEncryptor, CryptoError> {
        let c = match method {
            CipherMethod::Aes128Cfb => CfbEncryptor::Aes128(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherMethod::Aes256Cfb => CfbEncryptor::Aes256(
                BufEncryptor::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            m => return Err(CryptoError::UnsupportedMethod(m.name().to_string())),
        };
        Ok(c)
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CfbEncryptor::Aes128(c) => c.encrypt(data),
            CfbEncryptor::Aes256(c) => c.encrypt(data),
        }
    }
}

impl CfbDecryptor {
    fn new(method: CipherMethod, key: &[u8], iv: &[u8]) -> Result<CfbDecryptor, CryptoError> {
        let c = match method {
            CipherMethod::Aes128Cfb => CfbDecryptor::Aes128(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherMethod::Aes256Cfb => CfbDecryptor::Aes256(
                BufDecryptor::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            m => return Err(CryptoError::UnsupportedMethod(m.name().to_string())),
        };
        Ok(c)
    }

    fn apply(&mut self, data: &mut [u8]) {
        match self {
            CfbDecryptor::Aes128(c) => c.decrypt(data),
            CfbDecryptor::Aes256(c) => c.decrypt(data),
        }
    }
}

/// Encrypting side of a legacy stream. The running cipher is keyed once.
pub struct StreamEncryptor {
    cipher: CfbEncryptor,
    iv: Option<Vec<u8>>,
}

impl StreamEncryptor {
    /// Creates an encryptor with a fresh random IV.
    pub fn new(method: CipherMethod, key: &[u8]) -> Result<StreamEncryptor, CryptoError> {
        let mut iv = vec![0u8; method.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);
        StreamEncryptor::with_iv(method, key, iv)
    }

    pub fn with_iv(
        method: CipherMethod,
        key: &[u8],
        iv: Vec<u8>,
    ) -> Result<StreamEncryptor, CryptoError> {
        Ok(StreamEncryptor {
            cipher: CfbEncryptor::new(method, key, &iv)?,
            iv: Some(iv),
        })
    }
}

impl Encrypt for StreamEncryptor {
    fn take_preamble(&mut self) -> Option<Vec<u8>> {
        self.iv.take()
    }

    fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if let Some(iv) = self.iv.take() {
            out.extend_from_slice(&iv);
        }
        let start = out.len();
        out.extend_from_slice(plaintext);
        self.cipher.apply(&mut out[start..]);
        Ok(())
    }
}

/// Decrypting side of a legacy stream. The IV is taken from the first message.
pub struct StreamDecryptor {
    method: CipherMethod,
    key: Vec<u8>,
    cipher: Option<CfbDecryptor>,
}

impl StreamDecryptor {
    pub fn new(method: CipherMethod, key: &[u8]) -> Result<StreamDecryptor, CryptoError> {
        if method.is_aead() {
            return Err(CryptoError::UnsupportedMethod(method.name().to_string()));
        }
        if key.len() != method.key_len() {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(StreamDecryptor {
            method,
            key: key.to_vec(),
            cipher: None,
        })
    }
}

impl Decrypt for StreamDecryptor {
    fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        let mut body = ciphertext;
        if self.cipher.is_none() {
            let iv_len = self.method.iv_len();
            if ciphertext.len() < iv_len {
                return Err(CryptoError::ShortIv {
                    got: ciphertext.len(),
                    need: iv_len,
                });
            }
            let (iv, rest) = ciphertext.split_at(iv_len);
            self.cipher = Some(CfbDecryptor::new(self.method, &self.key, iv)?);
            body = rest;
        }

        let start = out.len();
        out.extend_from_slice(body);
        if let Some(cipher) = self.cipher.as_mut() {
            cipher.apply(&mut out[start..]);
        }
        Ok(())
    }
}
