//! Title tickets.
//!
//! A common ticket is a fixed 0x2C0-byte blob: an RSA-2048 signature
//! block, then the signed body starting at the issuer field. The body
//! carries the wrapped title key, the rights ID and the key revision
//! needed to unwrap it. Field validation is left to the install
//! policy layer; parsing only fixes the layout.

use std::io::Cursor;

use binrw::{BinRead, BinWrite, binrw};
use thiserror::Error;
use tracing::trace;

use crate::nca::RightsId;

/// Size of a common ticket.
pub const TICKET_SIZE: usize = 0x2C0;

/// Offset of the signed body (everything after the signature block).
pub const TICKET_BODY_OFFSET: usize = 0x140;

/// RSA-2048 with SHA-256, the only signature type common tickets use.
pub const SIGNATURE_TYPE_RSA2048_SHA256: u32 = 0x10004;

/// Ticket format version understood by the pipeline.
pub const SUPPORTED_FORMAT_VERSION: u8 = 2;

#[derive(Error, Debug)]
pub enum TicketError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ticket is {0} bytes, expected {TICKET_SIZE}")]
    InvalidSize(usize),

    #[error("Unsupported signature type {0:#x}")]
    UnsupportedSignatureType(u32),

    #[error("Ticket parse error: {0}")]
    Parse(#[from] binrw::Error),
}

pub type Result<T> = std::result::Result<T, TicketError>;

/// Title-key ownership class declared by a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TitleKeyType {
    /// Wrapped with a titlekek; installable anywhere.
    Common = 0,
    /// Wrapped with console-unique material.
    Personalized = 1,
}

#[binrw]
#[brw(little)]
#[derive(Clone)]
struct RawTicket {
    signature_type: u32,
    signature: [u8; 0x100],
    sig_padding: [u8; 0x3C],
    issuer: [u8; 0x40],
    title_key_block: [u8; 0x100],
    format_version: u8,
    title_key_type: u8,
    ticket_version: u16,
    license_type: u8,
    master_key_revision: u8,
    properties: u16,
    reserved: [u8; 8],
    ticket_id: u64,
    device_id: u64,
    rights_id: [u8; 0x10],
    account_id: u32,
    sect_total_size: u32,
    sect_header_offset: u32,
    sect_count: u16,
    sect_entry_size: u16,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self {
            signature_type: SIGNATURE_TYPE_RSA2048_SHA256,
            signature: [0; 0x100],
            sig_padding: [0; 0x3C],
            issuer: [0; 0x40],
            title_key_block: [0; 0x100],
            format_version: SUPPORTED_FORMAT_VERSION,
            title_key_type: TitleKeyType::Common as u8,
            ticket_version: 0,
            license_type: 0,
            master_key_revision: 0,
            properties: 0,
            reserved: [0; 8],
            ticket_id: 0,
            device_id: 0,
            rights_id: [0; 0x10],
            account_id: 0,
            sect_total_size: 0,
            sect_header_offset: 0x2C0,
            sect_count: 0,
            sect_entry_size: 0,
        }
    }
}

/// Parsed ticket plus its original bytes (kept for re-emission and
/// signature checks).
#[derive(Clone)]
pub struct Ticket {
    raw: RawTicket,
    bytes: Vec<u8>,
}

impl Ticket {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TICKET_SIZE {
            return Err(TicketError::InvalidSize(bytes.len()));
        }
        let raw = RawTicket::read(&mut Cursor::new(bytes))?;
        if raw.signature_type != SIGNATURE_TYPE_RSA2048_SHA256 {
            return Err(TicketError::UnsupportedSignatureType(raw.signature_type));
        }
        trace!(
            rights_id = %RightsId(raw.rights_id),
            revision = raw.master_key_revision,
            "parsed ticket"
        );
        Ok(Self {
            raw,
            bytes: bytes[..TICKET_SIZE].to_vec(),
        })
    }

    pub fn rights_id(&self) -> RightsId {
        RightsId(self.raw.rights_id)
    }

    /// Title key still wrapped with the titlekek of
    /// [`master_key_revision`](Self::master_key_revision).
    pub fn wrapped_title_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.raw.title_key_block[..16]);
        key
    }

    pub fn format_version(&self) -> u8 {
        self.raw.format_version
    }

    pub fn title_key_type(&self) -> Option<TitleKeyType> {
        match self.raw.title_key_type {
            0 => Some(TitleKeyType::Common),
            1 => Some(TitleKeyType::Personalized),
            _ => None,
        }
    }

    pub fn title_key_type_byte(&self) -> u8 {
        self.raw.title_key_type
    }

    pub fn master_key_revision(&self) -> u8 {
        self.raw.master_key_revision
    }

    /// Issuer string, e.g. `Root-CA00000003-XS00000020`.
    pub fn issuer(&self) -> String {
        c_string(&self.raw.issuer)
    }

    pub fn signature(&self) -> &[u8; 0x100] {
        &self.raw.signature
    }

    /// The bytes the signature covers.
    pub fn signed_body(&self) -> &[u8] {
        &self.bytes[TICKET_BODY_OFFSET..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticket")
            .field("rights_id", &self.rights_id())
            .field("issuer", &self.issuer())
            .field("master_key_revision", &self.raw.master_key_revision)
            .field("title_key_type", &self.raw.title_key_type)
            .finish_non_exhaustive()
    }
}

fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Fabricates tickets, primarily for tests and repackaging.
pub struct TicketBuilder {
    raw: RawTicket,
}

impl Default for TicketBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketBuilder {
    pub fn new() -> Self {
        Self {
            raw: RawTicket::default(),
        }
    }

    pub fn rights_id(mut self, rights_id: RightsId) -> Self {
        self.raw.rights_id = *rights_id.as_bytes();
        self
    }

    pub fn wrapped_title_key(mut self, key: [u8; 16]) -> Self {
        self.raw.title_key_block[..16].copy_from_slice(&key);
        self
    }

    pub fn master_key_revision(mut self, revision: u8) -> Self {
        self.raw.master_key_revision = revision;
        self
    }

    pub fn format_version(mut self, version: u8) -> Self {
        self.raw.format_version = version;
        self
    }

    pub fn title_key_type(mut self, type_byte: u8) -> Self {
        self.raw.title_key_type = type_byte;
        self
    }

    pub fn issuer(mut self, issuer: &str) -> Self {
        self.raw.issuer = [0; 0x40];
        let len = issuer.len().min(0x3F);
        self.raw.issuer[..len].copy_from_slice(&issuer.as_bytes()[..len]);
        self
    }

    pub fn signature(mut self, signature: [u8; 0x100]) -> Self {
        self.raw.signature = signature;
        self
    }

    pub fn build(self) -> Result<Ticket> {
        let mut cursor = Cursor::new(Vec::with_capacity(TICKET_SIZE));
        self.raw.write(&mut cursor)?;
        Ticket::parse(&cursor.into_inner())
    }
}
