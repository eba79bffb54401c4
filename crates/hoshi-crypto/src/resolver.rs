//! Content key resolution.
//!
//! An archive's section keys come from one of two places:
//!
//! - standard crypto: the header's 4-slot key area, wrapped with the
//!   key-area encryption key selected by (family index, generation);
//! - title-key crypto: a ticket's title key, wrapped with the
//!   titlekek of the ticket's key revision.
//!
//! The resolver also re-wraps key areas under a different generation,
//! which is how `convert_to_standard_crypto` and `lower_master_key`
//! produce installed archives that no longer need a ticket.

use tracing::debug;

use crate::aes;
use crate::error::Result;
use crate::keys::{KeyAreaIndex, KeySet};

/// Key-area slot holding the AES-CTR body key.
pub const KEY_AREA_CTR_SLOT: usize = 2;

/// Map a header key-generation byte to a master-key index.
///
/// Generations 0 and 1 both mean the first master key; later values
/// are offset by one.
pub fn master_key_index(key_generation: u8) -> u8 {
    key_generation.saturating_sub(1)
}

/// Keys resolved for one archive.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedKeys {
    /// Decrypted key area (all four slots).
    pub key_area: [[u8; 16]; 4],
    /// Key applied to section bodies (CTR slot, or the title key).
    pub body_key: [u8; 16],
    /// Whether the body key came from a ticket.
    pub title_key_crypto: bool,
}

/// Derives and re-wraps content keys against one [`KeySet`].
pub struct KeyResolver<'a> {
    keys: &'a KeySet,
}

impl<'a> KeyResolver<'a> {
    pub fn new(keys: &'a KeySet) -> Self {
        Self { keys }
    }

    pub fn key_set(&self) -> &KeySet {
        self.keys
    }

    /// Decrypt a header key area with the keak for (index, generation).
    pub fn resolve_standard(
        &self,
        encrypted_key_area: &[[u8; 16]; 4],
        index: KeyAreaIndex,
        key_generation: u8,
    ) -> Result<ResolvedKeys> {
        let generation = master_key_index(key_generation);
        let kaek = self.keys.key_area_key(index, generation)?;

        let mut key_area = *encrypted_key_area;
        for slot in &mut key_area {
            aes::ecb_decrypt(kaek, slot)?;
        }

        debug!(?index, generation, "resolved standard-crypto key area");
        Ok(ResolvedKeys {
            key_area,
            body_key: key_area[KEY_AREA_CTR_SLOT],
            title_key_crypto: false,
        })
    }

    /// Decrypt a ticket's title key with the titlekek of its revision.
    pub fn resolve_title_key(
        &self,
        wrapped_title_key: &[u8; 16],
        key_revision: u8,
    ) -> Result<[u8; 16]> {
        let titlekek = self.keys.titlekek(master_key_index(key_revision))?;
        let mut key = *wrapped_title_key;
        aes::ecb_decrypt(titlekek, &mut key)?;
        debug!(key_revision, "resolved title key");
        Ok(key)
    }

    /// Wrap a plaintext key area under `target_generation`.
    ///
    /// Used when converting title-key crypto to standard crypto (the
    /// title key lands in the CTR slot) and when lowering the master
    /// key, where the target is generation 0 so any firmware can
    /// unwrap the result.
    pub fn reencrypt_key_area(
        &self,
        plain_key_area: &[[u8; 16]; 4],
        index: KeyAreaIndex,
        target_key_generation: u8,
    ) -> Result<[[u8; 16]; 4]> {
        let generation = master_key_index(target_key_generation);
        let kaek = self.keys.key_area_key(index, generation)?;

        let mut key_area = *plain_key_area;
        for slot in &mut key_area {
            aes::ecb_encrypt(kaek, slot)?;
        }

        debug!(?index, generation, "re-wrapped key area");
        Ok(key_area)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_keys() -> KeySet {
        let mut set = KeySet::new();
        set.set_key_area_key(KeyAreaIndex::Application, 0, [0xA0; 16]);
        set.set_key_area_key(KeyAreaIndex::Application, 4, [0xA4; 16]);
        set.set_titlekek(0, [0xB0; 16]);
        set.set_titlekek(4, [0xB4; 16]);
        set
    }

    #[test]
    fn master_key_index_offsets_by_one() {
        assert_eq!(master_key_index(0), 0);
        assert_eq!(master_key_index(1), 0);
        assert_eq!(master_key_index(5), 4);
    }

    #[test]
    fn standard_key_area_round_trips() {
        let keys = test_keys();
        let resolver = KeyResolver::new(&keys);

        let plain = [[0x11; 16], [0x22; 16], [0x33; 16], [0x44; 16]];
        let wrapped = resolver
            .reencrypt_key_area(&plain, KeyAreaIndex::Application, 5)
            .unwrap();
        assert_ne!(wrapped, plain);

        let resolved = resolver
            .resolve_standard(&wrapped, KeyAreaIndex::Application, 5)
            .unwrap();
        assert_eq!(resolved.key_area, plain);
        assert_eq!(resolved.body_key, plain[KEY_AREA_CTR_SLOT]);
        assert!(!resolved.title_key_crypto);
    }

    #[test]
    fn lowering_rewraps_under_generation_zero() {
        let keys = test_keys();
        let resolver = KeyResolver::new(&keys);

        let plain = [[0x55; 16]; 4];
        let wrapped_high = resolver
            .reencrypt_key_area(&plain, KeyAreaIndex::Application, 5)
            .unwrap();
        let wrapped_low = resolver
            .reencrypt_key_area(&plain, KeyAreaIndex::Application, 0)
            .unwrap();
        assert_ne!(wrapped_high, wrapped_low);

        // The lowered copy unwraps with generation 0 material only.
        let resolved = resolver
            .resolve_standard(&wrapped_low, KeyAreaIndex::Application, 0)
            .unwrap();
        assert_eq!(resolved.key_area, plain);
    }

    #[test]
    fn title_key_unwraps_with_matching_revision() {
        let keys = test_keys();
        let resolver = KeyResolver::new(&keys);

        // Wrap a known title key with titlekek 4 by encrypting.
        let title_key = [0x77u8; 16];
        let mut wrapped = title_key;
        crate::aes::ecb_encrypt(keys.titlekek(4).unwrap(), &mut wrapped).unwrap();

        let resolved = resolver.resolve_title_key(&wrapped, 5).unwrap();
        assert_eq!(resolved, title_key);
    }

    #[test]
    fn missing_generation_is_an_error() {
        let keys = test_keys();
        let resolver = KeyResolver::new(&keys);
        let area = [[0u8; 16]; 4];
        assert!(
            resolver
                .resolve_standard(&area, KeyAreaIndex::Application, 9)
                .is_err()
        );
    }
}
