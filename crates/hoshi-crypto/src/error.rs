//! Error types for crypto operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing {kind} key for generation {generation}")]
    MissingKey {
        kind: &'static str,
        generation: u8,
    },

    #[error("Missing header key")]
    MissingHeaderKey,

    #[error("Unknown signature key generation {0}")]
    UnknownSignatureKeyGeneration(u8),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Buffer length {0} is not a multiple of the AES block size")]
    UnalignedLength(usize),

    #[error("RSA key rejected: {0}")]
    RsaKey(#[from] rsa::Error),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
