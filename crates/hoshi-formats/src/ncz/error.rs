//! Error types for the block-compressed archive variant

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NczError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No compressed section covers offset {0:#x}")]
    SectionNotFound(u64),

    #[error("Compressed archive declares zero sections")]
    InvalidSectionCount,

    #[error("Block {0} missing from the compressed payload")]
    BlockNotFound(u32),

    #[error("Unsupported block version {0} (supported: 2)")]
    InvalidBlockVersion(u8),

    #[error("Unsupported block type {0} (supported: 1)")]
    InvalidBlockType(u8),

    #[error("Block table declares zero blocks")]
    InvalidBlockTotal,

    #[error("Block size exponent {0} outside 14..=32")]
    InvalidBlockSizeExponent(u8),

    #[error("Decompression failed: {0}")]
    Decompression(String),

    #[error("Header parse error: {0}")]
    Parse(#[from] binrw::Error),

    #[error(transparent)]
    Crypto(#[from] hoshi_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, NczError>;
