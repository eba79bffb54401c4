//! The install pipeline's flat error space.
//!
//! Every distinct failure condition gets its own variant; no variant
//! is reused for two conditions, so a caller (or a log line) can tell
//! exactly which check rejected a title. Format-layer errors are
//! mapped onto these variants at the crate boundary.

use thiserror::Error;

use hoshi_crypto::CryptoError;
use hoshi_formats::cert::CertError;
use hoshi_formats::cnmt::CnmtError;
use hoshi_formats::nca::NcaError;
use hoshi_formats::ncz::NczError;
use hoshi_formats::pfs::PfsError;
use hoshi_formats::ticket::TicketError;

#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Input is not a recognized container")]
    ContainerNotFound,

    #[error("Install cancelled")]
    Cancelled,

    #[error("Archive {0} named by the manifest is missing from the container")]
    NcaNotFound(String),

    #[error("Archive shorter than its declared size")]
    InvalidNcaReadSize,

    #[error("No fixed key for signature key generation {0}")]
    InvalidNcaSigKeyGen(u8),

    #[error("Bad archive magic")]
    InvalidNcaMagic,

    #[error("Archive header fixed-key signature rejected")]
    InvalidNcaSignature0,

    #[error("Archive meta signature rejected")]
    InvalidNcaSignature1,

    #[error("Archive {0} does not match its manifest digest")]
    InvalidNcaSha256(String),

    #[error("Archive is a game-card dump")]
    InvalidNcaDistributionBit,

    #[error("No compressed section covers the requested range")]
    NczSectionNotFound,

    #[error("Compressed archive declares zero sections")]
    InvalidNczSectionCount,

    #[error("Block {0} missing from the compressed payload")]
    NczBlockNotFound(u32),

    #[error("Unsupported compressed-block version {0}")]
    InvalidNczBlockVersion(u8),

    #[error("Unsupported compressed-block type {0}")]
    InvalidNczBlockType(u8),

    #[error("Compressed block table declares zero blocks")]
    InvalidNczBlockTotal,

    #[error("Compressed block size exponent {0} outside 14..=32")]
    InvalidNczBlockSizeExponent(u8),

    #[error("Block decompression failed: {0}")]
    NczDecompression(String),

    #[error("No ticket for rights ID {0}")]
    TicketNotFound(String),

    #[error("Ticket rights ID does not match the ID it is filed under")]
    InvalidTicketRightsId,

    #[error("Unsupported ticket format version {0}")]
    InvalidTicketVersion(u8),

    #[error("Unsupported ticket key type {0}")]
    InvalidTicketKeyType(u8),

    #[error("Ticket key revision {ticket} does not cover archive key generation {archive}")]
    InvalidTicketKeyRevision { ticket: u8, archive: u8 },

    #[error("No certificate chain for the ticket issuer")]
    CertNotFound,

    #[error("Title database header corrupt")]
    DbCorruptHeader,

    #[error("Title database records corrupt")]
    DbCorruptInfos,

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(CryptoError),
}

pub type Result<T> = std::result::Result<T, InstallError>;

impl From<CryptoError> for InstallError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnknownSignatureKeyGeneration(generation) => {
                Self::InvalidNcaSigKeyGen(generation)
            }
            CryptoError::Io(err) => Self::Io(err),
            other => Self::Crypto(other),
        }
    }
}

impl From<NczError> for InstallError {
    fn from(err: NczError) -> Self {
        match err {
            NczError::Io(err) => Self::Io(err),
            NczError::SectionNotFound(_) => Self::NczSectionNotFound,
            NczError::InvalidSectionCount => Self::InvalidNczSectionCount,
            NczError::BlockNotFound(index) => Self::NczBlockNotFound(index),
            NczError::InvalidBlockVersion(version) => Self::InvalidNczBlockVersion(version),
            NczError::InvalidBlockType(block_type) => Self::InvalidNczBlockType(block_type),
            NczError::InvalidBlockTotal => Self::InvalidNczBlockTotal,
            NczError::InvalidBlockSizeExponent(exp) => Self::InvalidNczBlockSizeExponent(exp),
            NczError::Decompression(msg) => Self::NczDecompression(msg),
            NczError::Parse(err) => Self::Malformed(err.to_string()),
            NczError::Crypto(err) => err.into(),
        }
    }
}

impl From<NcaError> for InstallError {
    fn from(err: NcaError) -> Self {
        match err {
            NcaError::Io(err) => Self::Io(err),
            NcaError::InvalidReadSize { .. } => Self::InvalidNcaReadSize,
            NcaError::InvalidMagic(_) => Self::InvalidNcaMagic,
            // An archive declaring a rights ID with no matching ticket
            // available.
            NcaError::MissingTitleKey => Self::TicketNotFound(String::new()),
            NcaError::Ncz(err) => err.into(),
            NcaError::Crypto(err) => err.into(),
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl From<TicketError> for InstallError {
    fn from(err: TicketError) -> Self {
        match err {
            TicketError::Io(err) => Self::Io(err),
            other => Self::Malformed(other.to_string()),
        }
    }
}

impl From<CertError> for InstallError {
    fn from(err: CertError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<CnmtError> for InstallError {
    fn from(err: CnmtError) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl From<PfsError> for InstallError {
    fn from(err: PfsError) -> Self {
        match err {
            PfsError::Io(err) => Self::Io(err),
            PfsError::InvalidMagic(_) => Self::ContainerNotFound,
            other => Self::Malformed(other.to_string()),
        }
    }
}
