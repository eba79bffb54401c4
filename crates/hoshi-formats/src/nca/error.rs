//! Error types for content archive parsing and reading

use thiserror::Error;

use crate::ncz::NczError;
use hoshi_crypto::CryptoError;

#[derive(Error, Debug)]
pub enum NcaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive smaller than its header: {actual} < {expected} bytes")]
    InvalidReadSize { expected: u64, actual: u64 },

    #[error("Invalid archive magic {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("Unknown key area index {0}")]
    InvalidKeyAreaIndex(u8),

    #[error("Unknown section encryption type {0}")]
    InvalidEncryptionType(u8),

    #[error("Section {0} not present in the archive")]
    SectionOutOfRange(usize),

    #[error("Read past the end of section {section}: offset {offset} + {length} > {size}")]
    ReadOutOfRange {
        section: usize,
        offset: u64,
        length: u64,
        size: u64,
    },

    #[error("Archive declares a rights ID but no title key was resolved")]
    MissingTitleKey,

    #[error("Header parse error: {0}")]
    Parse(#[from] binrw::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Ncz(#[from] NczError),
}

pub type Result<T> = std::result::Result<T, NcaError>;
