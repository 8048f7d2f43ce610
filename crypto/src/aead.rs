//! AEAD chunk framing.
//!
//! Every direction of a stream starts with a random salt, followed by any number of
//! frames:
//!
//! ```text
//! [salt] ([encrypted length (2)][tag (16)] [encrypted payload][tag (16)])*
//! ```
//!
//! The subkey is derived from the master key and the salt, and every seal or open
//! operation uses a 12 byte nonce counter that starts at zero and is incremented
//! after each operation, so one frame consumes two nonces.

use aes_gcm::aead::{Aead, KeyInit, Nonce as AeadNonce};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;

use crate::kdf::derive_subkey;
use crate::{CipherMethod, CryptoError, Decrypt, Encrypt};

pub const TAG_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
/// Largest payload a single frame can describe.
pub const MAX_PAYLOAD_LEN: usize = 0xFFFF;
/// Largest payload the encoder puts in one frame when splitting a write. Standard
/// clients reject frames above this size.
pub const MAX_CHUNK_LEN: usize = 0x3FFF;

const LEN_FIELD: usize = 2;

/// Little-endian 96 bit counter.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    pub fn new() -> Nonce {
        Nonce([0u8; NONCE_LEN])
    }

    /// Adds one with byte carry. Wraps to zero once every byte overflows.
    pub fn increment(&mut self) {
        for b in self.0.iter_mut() {
            *b = b.wrapping_add(1);
            if *b != 0 {
                break;
            }
        }
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

#[allow(clippy::large_enum_variant)]
enum AeadCipher {
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

impl AeadCipher {
    fn new(method: CipherMethod, key: &[u8]) -> Result<AeadCipher, CryptoError> {
        let cipher = match method {
            CipherMethod::Aes128Gcm => AeadCipher::Aes128Gcm(
                Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherMethod::Aes256Gcm => AeadCipher::Aes256Gcm(
                Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            CipherMethod::ChaCha20Poly1305 => AeadCipher::ChaCha20Poly1305(
                ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?,
            ),
            m => return Err(CryptoError::UnsupportedMethod(m.name().to_string())),
        };
        Ok(cipher)
    }

    /// Returns ciphertext with the tag appended.
    fn seal(&self, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            AeadCipher::Aes128Gcm(c) => seal_with(c, nonce, plaintext),
            AeadCipher::Aes256Gcm(c) => seal_with(c, nonce, plaintext),
            AeadCipher::ChaCha20Poly1305(c) => seal_with(c, nonce, plaintext),
        }
    }

    /// `ciphertext` must carry its tag at the end.
    fn open(&self, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            AeadCipher::Aes128Gcm(c) => open_with(c, nonce, ciphertext),
            AeadCipher::Aes256Gcm(c) => open_with(c, nonce, ciphertext),
            AeadCipher::ChaCha20Poly1305(c) => open_with(c, nonce, ciphertext),
        }
    }
}

fn seal_with<C: Aead>(cipher: &C, nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    cipher
        .encrypt(AeadNonce::<C>::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| CryptoError::InvalidChunkLength(plaintext.len()))
}

fn open_with<C: Aead>(cipher: &C, nonce: &Nonce, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    cipher
        .decrypt(AeadNonce::<C>::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| CryptoError::FrameAuth)
}

/// Encrypting side of an AEAD stream.
pub struct AeadEncoder {
    cipher: AeadCipher,
    nonce: Nonce,
    /// Pending until the first frame is written.
    salt: Option<Vec<u8>>,
}

impl AeadEncoder {
    /// Creates an encoder with a fresh random salt.
    pub fn new(method: CipherMethod, master_key: &[u8]) -> Result<AeadEncoder, CryptoError> {
        let mut salt = vec![0u8; method.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        AeadEncoder::with_salt(method, master_key, salt)
    }

    pub fn with_salt(
        method: CipherMethod,
        master_key: &[u8],
        salt: Vec<u8>,
    ) -> Result<AeadEncoder, CryptoError> {
        if salt.len() != method.salt_len() || master_key.len() != method.key_len() {
            return Err(CryptoError::InvalidKeyLength);
        }
        let subkey = derive_subkey(master_key, &salt)?;
        Ok(AeadEncoder {
            cipher: AeadCipher::new(method, &subkey)?,
            nonce: Nonce::new(),
            salt: Some(salt),
        })
    }

    /// Appends one frame carrying `chunk` to `out`, preceded by the salt if this is the
    /// first frame of the stream.
    pub fn encode_chunk(&mut self, chunk: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if chunk.is_empty() || chunk.len() > MAX_PAYLOAD_LEN {
            return Err(CryptoError::InvalidChunkLength(chunk.len()));
        }

        let len = (chunk.len() as u16).to_be_bytes();
        let enc_len = self.cipher.seal(&self.nonce, &len)?;
        self.nonce.increment();
        let enc_payload = self.cipher.seal(&self.nonce, chunk)?;
        self.nonce.increment();

        if let Some(salt) = self.salt.take() {
            out.extend_from_slice(&salt);
        }
        out.extend_from_slice(&enc_len);
        out.extend_from_slice(&enc_payload);
        Ok(())
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

impl Encrypt for AeadEncoder {
    fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        for chunk in plaintext.chunks(MAX_CHUNK_LEN) {
            self.encode_chunk(chunk, out)?;
        }
        Ok(())
    }
}

/// What the decoder needs next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeStage {
    AwaitingSalt,
    AwaitingLength,
    AwaitingPayload(usize),
    /// A block failed authentication; the stream cannot be resynchronized.
    Failed,
}

/// Decrypting side of an AEAD stream. Bytes may be fed in fragments of any size.
pub struct AeadDecoder {
    method: CipherMethod,
    master_key: Vec<u8>,
    cipher: Option<AeadCipher>,
    nonce: Nonce,
    stage: DecodeStage,
    buf: Vec<u8>,
    pos: usize,
}

impl AeadDecoder {
    pub fn new(method: CipherMethod, master_key: &[u8]) -> Result<AeadDecoder, CryptoError> {
        if !method.is_aead() {
            return Err(CryptoError::UnsupportedMethod(method.name().to_string()));
        }
        if master_key.len() != method.key_len() {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(AeadDecoder {
            method,
            master_key: master_key.to_vec(),
            cipher: None,
            nonce: Nonce::new(),
            stage: DecodeStage::AwaitingSalt,
            buf: Vec::new(),
            pos: 0,
        })
    }

    /// Appends `data` to the backlog and decodes every complete unit, returning the
    /// plaintext of all payloads decoded by this call. Incomplete units stay buffered.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut out = Vec::new();
        self.feed_into(data, &mut out)?;
        Ok(out)
    }

    fn feed_into(&mut self, data: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.stage == DecodeStage::Failed {
            return Err(CryptoError::FrameAuth);
        }
        self.buf.extend_from_slice(data);

        let res = self.decode_available(out);
        if res.is_err() {
            self.stage = DecodeStage::Failed;
        }

        // Drop consumed bytes so the backlog only holds the incomplete unit.
        self.buf.drain(..self.pos);
        self.pos = 0;
        res
    }

    fn decode_available(&mut self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        loop {
            let available = self.buf.len() - self.pos;
            match self.stage {
                DecodeStage::AwaitingSalt => {
                    let salt_len = self.method.salt_len();
                    if available < salt_len {
                        return Ok(());
                    }
                    let salt = &self.buf[self.pos..self.pos + salt_len];
                    let subkey = derive_subkey(&self.master_key, salt)?;
                    self.cipher = Some(AeadCipher::new(self.method, &subkey)?);
                    self.pos += salt_len;
                    self.stage = DecodeStage::AwaitingLength;
                }
                DecodeStage::AwaitingLength => {
                    let need = LEN_FIELD + TAG_LEN;
                    if available < need {
                        return Ok(());
                    }
                    let len = self.open(need)?;
                    let len = u16::from_be_bytes([len[0], len[1]]) as usize;
                    self.stage = DecodeStage::AwaitingPayload(len);
                }
                DecodeStage::AwaitingPayload(len) => {
                    let need = len + TAG_LEN;
                    if available < need {
                        return Ok(());
                    }
                    let payload = self.open(need)?;
                    out.extend_from_slice(&payload);
                    self.stage = DecodeStage::AwaitingLength;
                }
                DecodeStage::Failed => return Err(CryptoError::FrameAuth),
            }
        }
    }

    /// Opens the next `need` buffered bytes and advances cursor and nonce.
    fn open(&mut self, need: usize) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::FrameAuth)?;
        let plain = cipher.open(&self.nonce, &self.buf[self.pos..self.pos + need])?;
        self.nonce.increment();
        self.pos += need;
        Ok(plain)
    }

    pub fn stage(&self) -> DecodeStage {
        self.stage
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }

    /// Number of received bytes not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl Decrypt for AeadDecoder {
    fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError> {
        self.feed_into(ciphertext, out)
    }
}
