use std::io;

use crypto::CryptoError;
use thiserror::Error;

use crate::socks::AddressError;

/// Everything that ends a single proxied connection. None of these reach the listener.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("bad target address: {0}")]
    AddressParse(#[from] AddressError),
    #[error("cipher: {0}")]
    Crypto(#[from] CryptoError),
    #[error("connect to {target} failed: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("authentication failed for user {0:?}")]
    AuthFailed(String),
    #[error("idle for {0} seconds")]
    IdleTimeout(u64),
    #[error("{event} is not valid while {stage}")]
    InvalidTransition { stage: &'static str, event: &'static str },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SessionError {
    pub fn violation(desc: impl Into<String>) -> SessionError {
        SessionError::ProtocolViolation(desc.into())
    }
}
