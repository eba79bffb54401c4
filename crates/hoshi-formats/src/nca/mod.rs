//! Content archive (NCA) parsing, reading and building.
//!
//! An archive is a fixed 0xC00-byte header followed by up to four
//! sections. The header is XTS-encrypted with the console header key
//! and carries two RSA-2048 signatures, the section table, per-section
//! FS headers and the wrapped key area. Section bodies are AES-CTR
//! encrypted with a key resolved from the key area (standard crypto)
//! or from a ticket (title-key crypto).

mod builder;
mod error;
mod header;
mod reader;

pub use builder::NcaBuilder;
pub use error::{NcaError, Result};
pub use header::{
    ContentType, DistributionType, EncryptionType, FS_HEADER_SIZE, HEADER_SIZE, MEDIA_UNIT,
    NCA_MAGIC, NcaHeader, RightsId, SECTION_COUNT, SIGNED_HEADER_RANGE, SectionInfo,
};
pub use reader::NcaReader;
