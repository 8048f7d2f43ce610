//! Supported cipher methods and their key, salt and IV sizes.

use std::fmt;
use std::str::FromStr;

use crate::CryptoError;

/// A cipher method, selected once from its name when key material is built.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CipherMethod {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
    /// Legacy AES-128 in 128 bit cipher feedback mode, no integrity.
    Aes128Cfb,
    /// Legacy AES-256 in 128 bit cipher feedback mode, no integrity.
    Aes256Cfb,
}

impl CipherMethod {
    pub fn name(&self) -> &'static str {
        match self {
            CipherMethod::Aes128Gcm => "aes-128-gcm",
            CipherMethod::Aes256Gcm => "aes-256-gcm",
            CipherMethod::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
            CipherMethod::Aes128Cfb => "aes-128-cfb",
            CipherMethod::Aes256Cfb => "aes-256-cfb",
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherMethod::Aes128Gcm | CipherMethod::Aes128Cfb => 16,
            CipherMethod::Aes256Gcm | CipherMethod::ChaCha20Poly1305 | CipherMethod::Aes256Cfb => {
                32
            }
        }
    }

    pub fn is_aead(&self) -> bool {
        matches!(
            self,
            CipherMethod::Aes128Gcm | CipherMethod::Aes256Gcm | CipherMethod::ChaCha20Poly1305
        )
    }

    /// Salt length of an AEAD method; it always equals the key length.
    pub fn salt_len(&self) -> usize {
        self.key_len()
    }

    /// IV length of a stream method. Both CFB variants use the AES block size.
    pub fn iv_len(&self) -> usize {
        16
    }
}

impl FromStr for CipherMethod {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherMethod::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherMethod::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherMethod::ChaCha20Poly1305),
            "aes-128-cfb" => Ok(CipherMethod::Aes128Cfb),
            "aes-256-cfb" => Ok(CipherMethod::Aes256Cfb),
            _ => Err(CryptoError::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_known_methods() {
        let m: CipherMethod = "AES-256-GCM".parse().unwrap();
        assert_eq!(m, CipherMethod::Aes256Gcm);
        assert_eq!(m.key_len(), 32);
        assert_eq!(m.salt_len(), 32);
        assert!(m.is_aead());

        let m: CipherMethod = "aes-128-gcm".parse().unwrap();
        assert_eq!(m.salt_len(), 16);

        let m: CipherMethod = "aes-256-cfb".parse().unwrap();
        assert!(!m.is_aead());
        assert_eq!(m.key_len(), 32);
        assert_eq!(m.iv_len(), 16);
        assert_eq!(m.to_string(), "aes-256-cfb");
    }

    #[test]
    fn reject_unknown_method() {
        assert_eq!(
            "rc4-md5".parse::<CipherMethod>(),
            Err(CryptoError::UnsupportedMethod("rc4-md5".to_string()))
        );
    }
}
