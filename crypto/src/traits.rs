//! This module provides the common error type and the capability traits shared by the
//! AEAD and stream cipher codecs.

use thiserror::Error;

/// An error type for cipher construction and framing failures.
///
/// `UnsupportedMethod` is only produced while building key material, every other
/// variant is produced while a session is running and is fatal for that session.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// The cipher method name is not one of the supported methods.
    #[error("unsupported cipher method: {0}")]
    UnsupportedMethod(String),
    /// Key material does not have the size the cipher expects.
    #[error("invalid key length")]
    InvalidKeyLength,
    /// An AEAD length or payload block failed authentication.
    #[error("frame authentication failed")]
    FrameAuth,
    /// A chunk handed to the AEAD encoder is empty or longer than a frame can carry.
    #[error("invalid chunk length: {0}")]
    InvalidChunkLength(usize),
    /// The first message of a legacy stream is shorter than its IV.
    #[error("first message is {got} bytes, shorter than the {need} byte iv")]
    ShortIv { got: usize, need: usize },
}

/// The encrypting half of a cipher session.
pub trait Encrypt: Send {
    /// Bytes the peer must receive before any ciphertext, handed out at most once.
    ///
    /// Stream ciphers return their IV here so it can be sent as soon as the remote
    /// side is connected. AEAD encoders emit their salt lazily with the first frame.
    fn take_preamble(&mut self) -> Option<Vec<u8>> {
        None
    }

    /// Encrypts `plaintext`, appending everything the peer must receive to `out`.
    fn encrypt(&mut self, plaintext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError>;
}

/// The decrypting half of a cipher session.
pub trait Decrypt: Send {
    /// Feeds inbound bytes and appends all plaintext that became available to `out`.
    fn decrypt(&mut self, ciphertext: &[u8], out: &mut Vec<u8>) -> Result<(), CryptoError>;
}
