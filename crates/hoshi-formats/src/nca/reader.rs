//! Random-access reads over a content archive.
//!
//! The reader hides three things from callers: header XTS crypto,
//! per-section body crypto, and the compressed archive variant. Reads
//! never require rewinding the source; hash verification can stream
//! sequentially while install writes chunk differently.

use tracing::{debug, trace};

use super::error::{NcaError, Result};
use super::header::{EncryptionType, HEADER_SIZE, NcaHeader, SectionInfo};
use crate::io::{ReadAt, SharedSource};
use crate::ncz::{HEADER_REGION, NczArchive};
use hoshi_crypto::resolver::{KeyResolver, ResolvedKeys};
use hoshi_crypto::{KeySet, aes};

/// Reader over one content archive.
pub struct NcaReader {
    source: SharedSource,
    header: NcaHeader,
    resolved: ResolvedKeys,
    compressed: Option<NczArchive>,
}

impl std::fmt::Debug for NcaReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NcaReader")
            .field("header", &self.header)
            .field("compressed", &self.compressed.is_some())
            .finish_non_exhaustive()
    }
}

impl NcaReader {
    /// Parse and decrypt only the header, without resolving content
    /// keys. Used to learn the rights ID before a ticket lookup.
    pub fn peek_header(source: &SharedSource, keys: &KeySet) -> Result<NcaHeader> {
        let len = source.len()?;
        if len < HEADER_SIZE as u64 {
            return Err(NcaError::InvalidReadSize {
                expected: HEADER_SIZE as u64,
                actual: len,
            });
        }
        let mut encrypted = vec![0u8; HEADER_SIZE];
        source.read_at(0, &mut encrypted)?;
        NcaHeader::parse_encrypted(&encrypted, keys)
    }

    /// Open an archive. `title_key` must be provided when the header
    /// declares a rights ID; standard-crypto archives resolve their
    /// key area from `keys`.
    pub fn new(source: SharedSource, keys: &KeySet, title_key: Option<[u8; 16]>) -> Result<Self> {
        let header = Self::peek_header(&source, keys)?;

        let resolved = if header.rights_id().is_zero() {
            let resolver = KeyResolver::new(keys);
            resolver.resolve_standard(
                header.encrypted_key_area(),
                header.key_area_index()?,
                header.key_generation(),
            )?
        } else {
            let body_key = title_key.ok_or(NcaError::MissingTitleKey)?;
            ResolvedKeys {
                key_area: [[0; 16]; 4],
                body_key,
                title_key_crypto: true,
            }
        };

        let compressed = NczArchive::detect(source.clone())?;
        if compressed.is_some() {
            debug!(program_id = header.program_id(), "archive is block-compressed");
        }

        Ok(Self {
            source,
            header,
            resolved,
            compressed,
        })
    }

    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut NcaHeader {
        &mut self.header
    }

    pub fn resolved_keys(&self) -> &ResolvedKeys {
        &self.resolved
    }

    pub fn is_compressed(&self) -> bool {
        self.compressed.is_some()
    }

    pub fn compression(&self) -> Option<&NczArchive> {
        self.compressed.as_ref()
    }

    /// Declared size of the (reconstructed) archive image.
    pub fn content_size(&self) -> u64 {
        self.header.content_size()
    }

    /// Read decrypted bytes from one section at a section-relative
    /// offset. Random access: any offset, any length within bounds.
    pub fn read_decrypted(
        &mut self,
        section_index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let section = *self.header.section(section_index)?;
        let length = buf.len() as u64;
        if offset + length > section.size {
            return Err(NcaError::ReadOutOfRange {
                section: section_index,
                offset,
                length,
                size: section.size,
            });
        }

        let mut absolute = section.offset + offset;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self.read_decrypted_span(&section, absolute, &mut buf[filled..])?;
            filled += n;
            absolute += n as u64;
        }
        Ok(())
    }

    /// Read one span without crossing the compressed-region boundary.
    fn read_decrypted_span(
        &mut self,
        section: &SectionInfo,
        absolute: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        if let Some(ncz) = self.compressed.as_mut() {
            if absolute >= HEADER_REGION {
                // Compressed payload holds plaintext already.
                ncz.read_decompressed(absolute, buf)?;
                return Ok(buf.len());
            }
            let take = buf.len().min((HEADER_REGION - absolute) as usize);
            Self::read_source_decrypted(
                &self.source,
                &self.resolved,
                section,
                absolute,
                &mut buf[..take],
            )?;
            return Ok(take);
        }

        Self::read_source_decrypted(&self.source, &self.resolved, section, absolute, buf)?;
        Ok(buf.len())
    }

    /// Read encrypted bytes from the source and decrypt them per the
    /// section's scheme, handling cipher-block alignment.
    fn read_source_decrypted(
        source: &SharedSource,
        resolved: &ResolvedKeys,
        section: &SectionInfo,
        absolute: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        match section.encryption {
            EncryptionType::None => {
                source.read_at(absolute, buf)?;
            }
            EncryptionType::Ctr => {
                let aligned = absolute & !0xF;
                let lead = (absolute - aligned) as usize;
                let mut span = vec![0u8; lead + buf.len()];
                source.read_at(aligned, &mut span)?;
                aes::ctr_apply(&resolved.body_key, &section.nonce, aligned, &mut span)?;
                buf.copy_from_slice(&span[lead..]);
            }
            EncryptionType::Xts => {
                let sector_size = aes::XTS_SECTOR_SIZE as u64;
                let relative = absolute - section.offset;
                let first_sector = relative / sector_size;
                let aligned = section.offset + first_sector * sector_size;
                let lead = (absolute - aligned) as usize;
                let span_len = (lead + buf.len()).div_ceil(aes::XTS_SECTOR_SIZE)
                    * aes::XTS_SECTOR_SIZE;
                let mut span = vec![0u8; span_len];
                source.read_at(aligned, &mut span)?;
                let mut key = [0u8; 32];
                key[..16].copy_from_slice(&resolved.key_area[0]);
                key[16..].copy_from_slice(&resolved.key_area[1]);
                aes::xts_decrypt(&key, &mut span, u128::from(first_sector))?;
                buf.copy_from_slice(&span[lead..lead + buf.len()]);
            }
        }
        trace!(absolute, len = buf.len(), "decrypted section read");
        Ok(())
    }

    /// Read bytes of the archive image in its on-disk (encrypted)
    /// form. For plain archives this is a passthrough; for compressed
    /// ones the image is reconstructed by re-encrypting decompressed
    /// payload bytes. `offset` must be 16-byte aligned when it falls
    /// inside the compressed payload.
    pub fn read_raw(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let Some(_) = self.compressed else {
            self.source.read_at(offset, buf)?;
            return Ok(());
        };

        let mut pos = offset;
        let mut filled = 0usize;
        while filled < buf.len() {
            let remaining = &mut buf[filled..];
            let n = if pos < HEADER_REGION {
                let take = remaining.len().min((HEADER_REGION - pos) as usize);
                self.source.read_at(pos, &mut remaining[..take])?;
                take
            } else {
                // Safe: checked above that compression is present.
                let ncz = self
                    .compressed
                    .as_mut()
                    .ok_or(NcaError::SectionOutOfRange(0))?;
                ncz.read_decompressed(pos, remaining)?;
                ncz.reencrypt(pos, remaining)?;
                remaining.len()
            };
            filled += n;
            pos += n as u64;
        }
        Ok(())
    }
}
