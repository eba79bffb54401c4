//! Console key-set loading and lookup.
//!
//! Keys are loaded from the usual `name = hex` key-file format, one
//! entry per line. Indexed entries carry a two-digit hex generation
//! suffix (`key_area_key_application_03`). Unknown names are skipped
//! with a warning so newer dumps keep loading.

use std::fs;
use std::path::Path;

use rsa::RsaPublicKey;
use tracing::{debug, info, warn};

use crate::error::{CryptoError, Result};
use crate::rsa_verify::public_key_from_modulus;

/// Highest master-key generation slot the set can hold.
pub const MAX_KEY_GENERATIONS: usize = 32;

/// Which key-area encryption key family a section key slot uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KeyAreaIndex {
    Application = 0,
    Ocean = 1,
    System = 2,
}

impl KeyAreaIndex {
    /// Parse from the header's key-area-encryption-key-index byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Application),
            1 => Some(Self::Ocean),
            2 => Some(Self::System),
            _ => None,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Application => "key_area_key_application",
            Self::Ocean => "key_area_key_ocean",
            Self::System => "key_area_key_system",
        }
    }
}

/// Console key material needed by the install pipeline.
pub struct KeySet {
    header_key: Option<[u8; 32]>,
    key_area_keys: [[Option<[u8; 16]>; MAX_KEY_GENERATIONS]; 3],
    titlekeks: [Option<[u8; 16]>; MAX_KEY_GENERATIONS],
    /// Fixed header-signature keys, indexed by signature key generation.
    header_signature_keys: Vec<RsaPublicKey>,
    /// Fixed key backing the meta (NPDM) signature check.
    meta_signature_key: Option<RsaPublicKey>,
}

impl Default for KeySet {
    fn default() -> Self {
        Self::new()
    }
}

impl KeySet {
    /// Create an empty key set.
    pub fn new() -> Self {
        Self {
            header_key: None,
            key_area_keys: [[None; MAX_KEY_GENERATIONS]; 3],
            titlekeks: [None; MAX_KEY_GENERATIONS],
            header_signature_keys: Vec::new(),
            meta_signature_key: None,
        }
    }

    /// Load a key set from a `prod.keys`-style file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let mut set = Self::new();
        let loaded = set.merge_text(&content)?;
        info!("Loaded {} keys from {}", loaded, path.display());
        Ok(set)
    }

    /// Merge `name = hex` lines into the set, returning how many
    /// entries were accepted.
    pub fn merge_text(&mut self, content: &str) -> Result<usize> {
        let mut loaded = 0;

        for (line_num, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                warn!("Skipping malformed key line {}: {}", line_num + 1, line);
                continue;
            };
            let name = name.trim();
            let value = value.trim();

            match self.merge_entry(name, value) {
                Ok(true) => loaded += 1,
                Ok(false) => debug!("Ignoring unrecognized key name {name}"),
                Err(e) => warn!("Bad key value on line {}: {}", line_num + 1, e),
            }
        }

        Ok(loaded)
    }

    fn merge_entry(&mut self, name: &str, value: &str) -> Result<bool> {
        if name == "header_key" {
            self.header_key = Some(parse_key::<32>(value)?);
            return Ok(true);
        }
        if let Some(gen) = indexed_name(name, "titlekek") {
            self.set_titlekek(gen, parse_key::<16>(value)?);
            return Ok(true);
        }
        for index in [
            KeyAreaIndex::Application,
            KeyAreaIndex::Ocean,
            KeyAreaIndex::System,
        ] {
            if let Some(gen) = indexed_name(name, index.name()) {
                self.set_key_area_key(index, gen, parse_key::<16>(value)?);
                return Ok(true);
            }
        }
        if let Some(gen) = indexed_name(name, "header_signature_key") {
            let key = public_key_from_modulus(&parse_hex(value)?)?;
            self.set_header_signature_key(gen, key);
            return Ok(true);
        }
        if name == "meta_signature_key" {
            self.meta_signature_key = Some(public_key_from_modulus(&parse_hex(value)?)?);
            return Ok(true);
        }
        Ok(false)
    }

    pub fn set_header_key(&mut self, key: [u8; 32]) {
        self.header_key = Some(key);
    }

    pub fn set_key_area_key(&mut self, index: KeyAreaIndex, generation: u8, key: [u8; 16]) {
        if let Some(slot) = self.key_area_keys[index as usize]
            .get_mut(generation as usize)
        {
            *slot = Some(key);
        }
    }

    pub fn set_titlekek(&mut self, generation: u8, key: [u8; 16]) {
        if let Some(slot) = self.titlekeks.get_mut(generation as usize) {
            *slot = Some(key);
        }
    }

    /// Install the fixed header-signature key for one signature key
    /// generation. Generations are small and contiguous.
    pub fn set_header_signature_key(&mut self, generation: u8, key: RsaPublicKey) {
        let index = generation as usize;
        while self.header_signature_keys.len() <= index {
            // Placeholder slots are filled with the new key and then
            // overwritten as the real ones arrive; lookups go through
            // header_signature_key() which bounds-checks.
            self.header_signature_keys.push(key.clone());
        }
        self.header_signature_keys[index] = key;
    }

    pub fn set_meta_signature_key(&mut self, key: RsaPublicKey) {
        self.meta_signature_key = Some(key);
    }

    pub fn header_key(&self) -> Result<&[u8; 32]> {
        self.header_key.as_ref().ok_or(CryptoError::MissingHeaderKey)
    }

    pub fn key_area_key(&self, index: KeyAreaIndex, generation: u8) -> Result<&[u8; 16]> {
        self.key_area_keys[index as usize]
            .get(generation as usize)
            .and_then(Option::as_ref)
            .ok_or(CryptoError::MissingKey {
                kind: "key area",
                generation,
            })
    }

    pub fn titlekek(&self, generation: u8) -> Result<&[u8; 16]> {
        self.titlekeks
            .get(generation as usize)
            .and_then(Option::as_ref)
            .ok_or(CryptoError::MissingKey {
                kind: "titlekek",
                generation,
            })
    }

    /// Fixed key for the archive header signature, selected by the
    /// header's declared signature key generation.
    pub fn header_signature_key(&self, generation: u8) -> Result<&RsaPublicKey> {
        self.header_signature_keys
            .get(generation as usize)
            .ok_or(CryptoError::UnknownSignatureKeyGeneration(generation))
    }

    pub fn meta_signature_key(&self) -> Option<&RsaPublicKey> {
        self.meta_signature_key.as_ref()
    }

    /// Whether the set holds key-area material for `generation`.
    pub fn has_generation(&self, index: KeyAreaIndex, generation: u8) -> bool {
        self.key_area_keys[index as usize]
            .get(generation as usize)
            .is_some_and(Option::is_some)
    }
}

/// Split `key_area_key_application_03` into its base name and index.
fn indexed_name(name: &str, base: &str) -> Option<u8> {
    let rest = name.strip_prefix(base)?.strip_prefix('_')?;
    u8::from_str_radix(rest, 16).ok()
}

fn parse_hex(value: &str) -> Result<Vec<u8>> {
    hex::decode(value).map_err(|e| CryptoError::InvalidKeyFormat(e.to_string()))
}

fn parse_key<const N: usize>(value: &str) -> Result<[u8; N]> {
    let bytes = parse_hex(value)?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        CryptoError::InvalidKeyFormat(format!("expected {} bytes, got {}", N, b.len()))
    })
}
