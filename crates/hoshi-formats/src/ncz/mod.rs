//! Block-compressed archive variant (NCZ).
//!
//! A compressed archive keeps the first 0x4000 bytes of the original
//! archive verbatim, then replaces the rest with a section header, an
//! optional block table and a zstd payload:
//!
//! ```text
//! 0x0000  original archive bytes (header region, still encrypted)
//! 0x4000  "NCZSECTN" + section records (crypto per original range)
//!         "NCZBLOCK" + block table          (block form only)
//!         zstd payload: independent frames per block, or one stream
//! ```
//!
//! The payload decompresses to the *decrypted* bytes of the original
//! archive from 0x4000 onward; the section records carry the keys and
//! counters needed to re-encrypt them on install. Block form allows
//! random access (one frame per fixed-size block); stream form is
//! sequential and the decoder restarts on backward seeks.

mod error;

use std::io::{BufReader, Cursor, Read};

use binrw::{BinRead, BinWrite, binrw};
use tracing::{debug, trace};

use crate::io::{ReadAt, RegionReader, SharedSource};
pub use error::{NczError, Result};
use hoshi_crypto::aes;

/// Bytes of the original archive kept verbatim at the front.
pub const HEADER_REGION: u64 = 0x4000;

/// Section header magic.
pub const SECTION_MAGIC: [u8; 8] = *b"NCZSECTN";

/// Block table magic.
pub const BLOCK_MAGIC: [u8; 8] = *b"NCZBLOCK";

/// The one block-table version this implementation understands.
pub const SUPPORTED_BLOCK_VERSION: u8 = 2;

/// The one block type this implementation understands.
pub const SUPPORTED_BLOCK_TYPE: u8 = 1;

/// Inclusive bounds for the block-size exponent.
pub const MIN_BLOCK_EXPONENT: u8 = 14;
pub const MAX_BLOCK_EXPONENT: u8 = 32;

/// Section crypto scheme identifiers used in section records.
pub const SECTION_CRYPTO_NONE: u64 = 1;
pub const SECTION_CRYPTO_CTR: u64 = 3;

#[binrw]
#[brw(little, magic = b"NCZSECTN")]
struct RawSectionHeader {
    count: u64,
    #[br(count = count)]
    sections: Vec<RawNczSection>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct RawNczSection {
    offset: u64,
    size: u64,
    crypto_type: u64,
    padding: u64,
    key: [u8; 0x20],
    counter: [u8; 0x10],
}

#[binrw]
#[brw(little, magic = b"NCZBLOCK")]
struct RawBlockHeader {
    version: u8,
    block_type: u8,
    unused: u8,
    block_size_exponent: u8,
    block_count: u32,
    decompressed_size: u64,
    #[br(count = block_count)]
    compressed_sizes: Vec<u32>,
}

/// Crypto description for one range of the original archive.
#[derive(Debug, Clone)]
pub struct NczSection {
    /// Absolute offset of the range in the original archive.
    pub offset: u64,
    /// Length of the range in bytes.
    pub size: u64,
    pub crypto_type: u64,
    key: [u8; 0x20],
    counter: [u8; 0x10],
}

impl NczSection {
    pub fn new_ctr(offset: u64, size: u64, key: [u8; 16], nonce: [u8; 8]) -> Self {
        let mut key_block = [0u8; 0x20];
        key_block[..16].copy_from_slice(&key);
        let mut counter = [0u8; 0x10];
        counter[..8].copy_from_slice(&nonce);
        Self {
            offset,
            size,
            crypto_type: SECTION_CRYPTO_CTR,
            key: key_block,
            counter,
        }
    }

    pub fn new_plain(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            crypto_type: SECTION_CRYPTO_NONE,
            key: [0; 0x20],
            counter: [0; 0x10],
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto_type == SECTION_CRYPTO_CTR
    }

    pub fn key16(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.key[..16]);
        key
    }

    pub fn nonce(&self) -> [u8; 8] {
        let mut nonce = [0u8; 8];
        nonce.copy_from_slice(&self.counter[..8]);
        nonce
    }

    fn to_raw(&self) -> RawNczSection {
        RawNczSection {
            offset: self.offset,
            size: self.size,
            crypto_type: self.crypto_type,
            padding: 0,
            key: self.key,
            counter: self.counter,
        }
    }

    fn from_raw(raw: &RawNczSection) -> Self {
        Self {
            offset: raw.offset,
            size: raw.size,
            crypto_type: raw.crypto_type,
            key: raw.key,
            counter: raw.counter,
        }
    }
}

/// Validated block table for one compressed payload.
#[derive(Debug, Clone)]
pub struct NczBlockTable {
    pub block_size_exponent: u8,
    pub decompressed_size: u64,
    pub compressed_sizes: Vec<u32>,
    /// Absolute source offset of each block's compressed bytes.
    block_offsets: Vec<u64>,
}

impl NczBlockTable {
    /// Validate the raw table fields in declaration order: version,
    /// type, count, exponent. All checks run before any payload byte
    /// is touched.
    fn validate(raw: &RawBlockHeader) -> Result<()> {
        if raw.version != SUPPORTED_BLOCK_VERSION {
            return Err(NczError::InvalidBlockVersion(raw.version));
        }
        if raw.block_type != SUPPORTED_BLOCK_TYPE {
            return Err(NczError::InvalidBlockType(raw.block_type));
        }
        if raw.block_count == 0 {
            return Err(NczError::InvalidBlockTotal);
        }
        if !(MIN_BLOCK_EXPONENT..=MAX_BLOCK_EXPONENT).contains(&raw.block_size_exponent) {
            return Err(NczError::InvalidBlockSizeExponent(raw.block_size_exponent));
        }
        Ok(())
    }

    fn from_raw(raw: RawBlockHeader, data_start: u64, source_len: u64) -> Result<Self> {
        Self::validate(&raw)?;

        let mut block_offsets = Vec::with_capacity(raw.compressed_sizes.len());
        let mut offset = data_start;
        for (index, &size) in raw.compressed_sizes.iter().enumerate() {
            let end = offset + u64::from(size);
            if end > source_len {
                return Err(NczError::BlockNotFound(index as u32));
            }
            block_offsets.push(offset);
            offset = end;
        }
        if offset != source_len {
            // Payload bytes not claimed by any block.
            return Err(NczError::InvalidBlockTotal);
        }

        Ok(Self {
            block_size_exponent: raw.block_size_exponent,
            decompressed_size: raw.decompressed_size,
            compressed_sizes: raw.compressed_sizes,
            block_offsets,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.compressed_sizes.len() as u32
    }

    /// Nominal decompressed size of one block.
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_size_exponent
    }

    /// Actual decompressed size of block `index` (the last block may
    /// be short).
    fn decompressed_block_size(&self, index: u32) -> u64 {
        let start = u64::from(index) * self.block_size();
        self.block_size().min(self.decompressed_size - start)
    }
}

enum Payload {
    Blocks {
        table: NczBlockTable,
        /// Most recently decompressed block, for sequential reads.
        cache: Option<(u32, Vec<u8>)>,
    },
    Stream {
        data_start: u64,
        decoder: Option<zstd::stream::read::Decoder<'static, BufReader<RegionReader>>>,
        /// Decompressed payload position of the decoder.
        pos: u64,
    },
}

/// A parsed compressed archive with random-access decompression.
pub struct NczArchive {
    source: SharedSource,
    source_len: u64,
    sections: Vec<NczSection>,
    payload: Payload,
}

impl std::fmt::Debug for NczArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NczArchive")
            .field("source_len", &self.source_len)
            .field("sections", &self.sections)
            .field("blocked", &matches!(self.payload, Payload::Blocks { .. }))
            .finish_non_exhaustive()
    }
}

impl NczArchive {
    /// Probe `source` for the section magic at the header-region
    /// boundary. Returns `Ok(None)` for ordinary uncompressed
    /// archives.
    pub fn detect(source: SharedSource) -> Result<Option<Self>> {
        let source_len = source.len()?;
        if source_len < HEADER_REGION + SECTION_MAGIC.len() as u64 {
            return Ok(None);
        }
        let mut magic = [0u8; 8];
        source.read_at(HEADER_REGION, &mut magic)?;
        if magic != SECTION_MAGIC {
            return Ok(None);
        }
        Self::parse(source, source_len).map(Some)
    }

    fn parse(source: SharedSource, source_len: u64) -> Result<Self> {
        // Section and block headers are small; read a bounded window
        // and parse from memory.
        let window = (source_len - HEADER_REGION).min(1 << 20) as usize;
        let mut head = vec![0u8; window];
        source.read_at(HEADER_REGION, &mut head)?;
        let mut cursor = Cursor::new(head.as_slice());

        let raw_sections = RawSectionHeader::read(&mut cursor)?;
        if raw_sections.sections.is_empty() {
            return Err(NczError::InvalidSectionCount);
        }
        let sections: Vec<NczSection> = raw_sections
            .sections
            .iter()
            .map(NczSection::from_raw)
            .collect();

        // Block table is optional; stream form goes straight to the
        // zstd payload.
        let mut magic = [0u8; 8];
        let table_pos = cursor.position() as usize;
        let has_blocks = head
            .get(table_pos..table_pos + 8)
            .is_some_and(|bytes| {
                magic.copy_from_slice(bytes);
                magic == BLOCK_MAGIC
            });

        let payload = if has_blocks {
            let raw_table = RawBlockHeader::read(&mut cursor)?;
            let data_start = HEADER_REGION + cursor.position();
            let table = NczBlockTable::from_raw(raw_table, data_start, source_len)?;
            debug!(
                blocks = table.block_count(),
                exponent = table.block_size_exponent,
                "parsed block-compressed archive"
            );
            Payload::Blocks { table, cache: None }
        } else {
            let data_start = HEADER_REGION + cursor.position();
            debug!(data_start, "parsed stream-compressed archive");
            Payload::Stream {
                data_start,
                decoder: None,
                pos: 0,
            }
        };

        Ok(Self {
            source,
            source_len,
            sections,
            payload,
        })
    }

    pub fn sections(&self) -> &[NczSection] {
        &self.sections
    }

    pub fn block_table(&self) -> Option<&NczBlockTable> {
        match &self.payload {
            Payload::Blocks { table, .. } => Some(table),
            Payload::Stream { .. } => None,
        }
    }

    /// Read decompressed (decrypted) archive bytes at an absolute
    /// archive offset at or past the header region.
    pub fn read_decompressed(&mut self, archive_offset: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert!(archive_offset >= HEADER_REGION);
        let mut pos = archive_offset - HEADER_REGION;
        let mut filled = 0usize;
        let block_form = matches!(self.payload, Payload::Blocks { .. });

        while filled < buf.len() {
            let n = if block_form {
                self.read_block_payload(pos, &mut buf[filled..])?
            } else {
                self.read_stream_payload(pos, &mut buf[filled..])?
            };
            filled += n;
            pos += n as u64;
        }
        Ok(())
    }

    fn read_block_payload(&mut self, payload_pos: u64, buf: &mut [u8]) -> Result<usize> {
        let Payload::Blocks { table, cache } = &mut self.payload else {
            return Err(NczError::SectionNotFound(payload_pos));
        };

        let index64 = payload_pos >> table.block_size_exponent;
        if index64 >= u64::from(table.block_count()) || payload_pos >= table.decompressed_size {
            return Err(NczError::BlockNotFound(
                index64.min(u64::from(u32::MAX)) as u32,
            ));
        }
        let index = index64 as u32;

        let cached = match cache {
            Some((cached_index, data)) if *cached_index == index => data,
            _ => {
                let data = Self::decompress_block(&self.source, table, index)?;
                *cache = Some((index, data));
                match cache {
                    Some((_, data)) => data,
                    // Unreachable: just assigned.
                    None => return Err(NczError::BlockNotFound(index)),
                }
            }
        };

        let inside = (payload_pos - (u64::from(index) << table.block_size_exponent)) as usize;
        let take = buf.len().min(cached.len() - inside);
        buf[..take].copy_from_slice(&cached[inside..inside + take]);
        trace!(block = index, inside, take, "served block read");
        Ok(take)
    }

    fn decompress_block(
        source: &SharedSource,
        table: &NczBlockTable,
        index: u32,
    ) -> Result<Vec<u8>> {
        let compressed_size = u64::from(table.compressed_sizes[index as usize]);
        let offset = table.block_offsets[index as usize];
        let expected = table.decompressed_block_size(index);

        // A block stored at exactly its decompressed size is raw.
        if compressed_size == expected {
            let mut data = vec![0u8; expected as usize];
            source.read_at(offset, &mut data)?;
            return Ok(data);
        }

        let reader = RegionReader::new(source.clone(), offset, offset + compressed_size);
        let data = zstd::stream::decode_all(reader)
            .map_err(|e| NczError::Decompression(e.to_string()))?;
        if data.len() as u64 != expected {
            return Err(NczError::Decompression(format!(
                "block {index} decompressed to {} bytes, expected {expected}",
                data.len()
            )));
        }
        Ok(data)
    }

    fn read_stream_payload(&mut self, payload_pos: u64, buf: &mut [u8]) -> Result<usize> {
        let Payload::Stream {
            data_start,
            decoder,
            pos,
        } = &mut self.payload
        else {
            return Err(NczError::SectionNotFound(payload_pos));
        };

        // Zstd streams only move forward; a backward seek restarts
        // decompression from the top.
        if decoder.is_none() || payload_pos < *pos {
            let reader = RegionReader::new(self.source.clone(), *data_start, self.source_len);
            *decoder = Some(
                zstd::stream::read::Decoder::new(reader)
                    .map_err(|e| NczError::Decompression(e.to_string()))?,
            );
            *pos = 0;
        }
        let Some(stream) = decoder.as_mut() else {
            return Err(NczError::SectionNotFound(payload_pos));
        };

        let mut scratch = [0u8; 16 * 1024];
        while *pos < payload_pos {
            let skip = scratch
                .len()
                .min(usize::try_from(payload_pos - *pos).unwrap_or(scratch.len()));
            stream
                .read_exact(&mut scratch[..skip])
                .map_err(|e| NczError::Decompression(e.to_string()))?;
            *pos += skip as u64;
        }

        stream
            .read_exact(buf)
            .map_err(|e| NczError::Decompression(e.to_string()))?;
        *pos += buf.len() as u64;
        Ok(buf.len())
    }

    /// Re-encrypt decompressed bytes back to their on-archive form,
    /// using the section records. `archive_offset` must be 16-byte
    /// aligned.
    pub fn reencrypt(&self, archive_offset: u64, data: &mut [u8]) -> Result<()> {
        let mut pos = archive_offset;
        let end = archive_offset + data.len() as u64;

        while pos < end {
            let section = self
                .sections
                .iter()
                .find(|s| pos >= s.offset && pos < s.offset + s.size)
                .ok_or(NczError::SectionNotFound(pos))?;
            let span_end = end.min(section.offset + section.size);
            let range = (pos - archive_offset) as usize..(span_end - archive_offset) as usize;

            if section.is_encrypted() {
                aes::ctr_apply(&section.key16(), &section.nonce(), pos, &mut data[range])?;
            }
            pos = span_end;
        }
        Ok(())
    }
}

/// Builds compressed archives, mainly so the pipeline can be tested
/// against streams it produced itself.
pub struct NczBuilder {
    sections: Vec<NczSection>,
    block_size_exponent: Option<u8>,
    level: i32,
}

impl NczBuilder {
    pub fn new(sections: Vec<NczSection>) -> Self {
        Self {
            sections,
            block_size_exponent: None,
            level: 3,
        }
    }

    /// Use the block form with the given size exponent.
    pub fn with_blocks(mut self, exponent: u8) -> Self {
        self.block_size_exponent = Some(exponent);
        self
    }

    /// Compress a full archive image. The image's header region is
    /// copied verbatim; the remainder is decrypted per the section
    /// records and compressed.
    pub fn build(&self, archive: &[u8]) -> Result<Vec<u8>> {
        let mut payload = archive[HEADER_REGION as usize..].to_vec();

        // Decrypt in place so the payload compresses as plaintext.
        for section in &self.sections {
            if !section.is_encrypted() {
                continue;
            }
            let start = section.offset.max(HEADER_REGION);
            let stop = (section.offset + section.size).min(archive.len() as u64);
            if start >= stop {
                continue;
            }
            let range = (start - HEADER_REGION) as usize..(stop - HEADER_REGION) as usize;
            aes::ctr_apply(
                &section.key16(),
                &section.nonce(),
                start,
                &mut payload[range],
            )?;
        }

        let mut out = Cursor::new(archive[..HEADER_REGION as usize].to_vec());
        out.set_position(HEADER_REGION);
        let raw_sections = RawSectionHeader {
            count: self.sections.len() as u64,
            sections: self.sections.iter().map(NczSection::to_raw).collect(),
        };
        raw_sections.write(&mut out)?;

        match self.block_size_exponent {
            Some(exponent) => {
                let block_size = 1usize << exponent;
                let mut compressed_sizes = Vec::new();
                let mut blocks = Vec::new();
                for chunk in payload.chunks(block_size) {
                    let mut frame = zstd::stream::encode_all(chunk, self.level)
                        .map_err(|e| NczError::Decompression(e.to_string()))?;
                    if frame.len() >= chunk.len() {
                        // Incompressible blocks are stored raw.
                        frame = chunk.to_vec();
                    }
                    compressed_sizes.push(frame.len() as u32);
                    blocks.push(frame);
                }
                let header = RawBlockHeader {
                    version: SUPPORTED_BLOCK_VERSION,
                    block_type: SUPPORTED_BLOCK_TYPE,
                    unused: 0,
                    block_size_exponent: exponent,
                    block_count: compressed_sizes.len() as u32,
                    decompressed_size: payload.len() as u64,
                    compressed_sizes,
                };
                header.write(&mut out)?;
                let mut bytes = out.into_inner();
                for block in blocks {
                    bytes.extend_from_slice(&block);
                }
                Ok(bytes)
            }
            None => {
                let frame = zstd::stream::encode_all(payload.as_slice(), self.level)
                    .map_err(|e| NczError::Decompression(e.to_string()))?;
                let mut bytes = out.into_inner();
                bytes.extend_from_slice(&frame);
                Ok(bytes)
            }
        }
    }
}
