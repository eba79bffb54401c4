//! Construction of complete archive images.
//!
//! The builder lays out sections after the fixed header, encrypts
//! bodies per scheme, wraps the key area and emits the XTS-encrypted
//! header. The install pipeline uses it when converting crypto (the
//! rewritten header is produced the same way); tests use it to
//! fabricate archives with known plaintext.

use std::io::Cursor;

use binrw::BinWrite;
use rsa::pss::Pss;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::error::Result;
use super::header::{
    ContentType, DistributionType, EncryptionType, HEADER_SIZE, MEDIA_UNIT, NcaHeader,
    RawFsHeader, RawNcaHeader, RawSectionEntry, RightsId, SECTION_COUNT,
};
use hoshi_crypto::keys::{KeyAreaIndex, KeySet};
use hoshi_crypto::resolver::{KEY_AREA_CTR_SLOT, KeyResolver};
use hoshi_crypto::aes;

struct PendingSection {
    payload: Vec<u8>,
    encryption: EncryptionType,
}

/// Builds an archive image from plaintext section payloads.
pub struct NcaBuilder {
    content_type: ContentType,
    distribution: DistributionType,
    program_id: u64,
    sdk_version: u32,
    key_generation: u8,
    signature_key_generation: u8,
    key_area_index: KeyAreaIndex,
    body_key: [u8; 16],
    rights_id: RightsId,
    title_key: Option<[u8; 16]>,
    sections: Vec<PendingSection>,
}

impl Default for NcaBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NcaBuilder {
    pub fn new() -> Self {
        Self {
            content_type: ContentType::Data,
            distribution: DistributionType::Download,
            program_id: 0,
            sdk_version: 0,
            key_generation: 0,
            signature_key_generation: 0,
            key_area_index: KeyAreaIndex::Application,
            body_key: [0xA5; 16],
            rights_id: RightsId::ZERO,
            title_key: None,
            sections: Vec::new(),
        }
    }

    pub fn content_type(mut self, content_type: ContentType) -> Self {
        self.content_type = content_type;
        self
    }

    pub fn program_id(mut self, program_id: u64) -> Self {
        self.program_id = program_id;
        self
    }

    pub fn key_generation(mut self, generation: u8) -> Self {
        self.key_generation = generation;
        self
    }

    pub fn signature_key_generation(mut self, generation: u8) -> Self {
        self.signature_key_generation = generation;
        self
    }

    pub fn key_area_index(mut self, index: KeyAreaIndex) -> Self {
        self.key_area_index = index;
        self
    }

    /// Body key placed in the key area's CTR slot (standard crypto).
    pub fn body_key(mut self, key: [u8; 16]) -> Self {
        self.body_key = key;
        self
    }

    /// Mark the image as a game-card dump.
    pub fn gamecard(mut self) -> Self {
        self.distribution = DistributionType::GameCard;
        self
    }

    /// Switch to title-key crypto: the header carries `rights_id`, the
    /// key area is left zeroed and bodies are encrypted with
    /// `title_key` (its plaintext form).
    pub fn rights_id(mut self, rights_id: RightsId, title_key: [u8; 16]) -> Self {
        self.rights_id = rights_id;
        self.title_key = Some(title_key);
        self
    }

    /// Append an AES-CTR encrypted section.
    pub fn add_section(mut self, payload: Vec<u8>) -> Self {
        self.sections.push(PendingSection {
            payload,
            encryption: EncryptionType::Ctr,
        });
        self
    }

    /// Append an unencrypted section.
    pub fn add_plain_section(mut self, payload: Vec<u8>) -> Self {
        self.sections.push(PendingSection {
            payload,
            encryption: EncryptionType::None,
        });
        self
    }

    /// Build the image with zeroed signature fields.
    pub fn build(self, keys: &KeySet) -> Result<Vec<u8>> {
        let (raw, image) = self.layout(keys)?;
        finalize(raw, image, keys)
    }

    /// Build the image and sign the header: the fixed-key signature
    /// with PSS, the meta signature with PKCS1-v1.5.
    pub fn build_signed<R>(
        self,
        keys: &KeySet,
        rng: &mut R,
        fixed_key: &RsaPrivateKey,
        meta_key: &RsaPrivateKey,
    ) -> Result<Vec<u8>>
    where
        R: rsa::rand_core::CryptoRngCore,
    {
        let (mut raw, image) = self.layout(keys)?;

        let header = NcaHeader::from_raw(raw.clone())?;
        let signed = header.signed_bytes()?;
        let digest = Sha256::digest(&signed);
        let fixed_sig = fixed_key
            .sign_with_rng(rng, Pss::new::<Sha256>(), &digest)
            .map_err(hoshi_crypto::CryptoError::from)?;
        let meta_sig = meta_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map_err(hoshi_crypto::CryptoError::from)?;
        raw.fixed_key_signature.copy_from_slice(&fixed_sig);
        raw.meta_signature.copy_from_slice(&meta_sig);

        finalize(raw, image, keys)
    }

    /// Lay out sections and the unsigned header.
    fn layout(self, keys: &KeySet) -> Result<(RawNcaHeader, Vec<u8>)> {
        assert!(self.sections.len() <= SECTION_COUNT, "too many sections");

        let body_key = match self.title_key {
            Some(title_key) => title_key,
            None => self.body_key,
        };

        let mut raw = RawNcaHeader {
            content_type: self.content_type as u8,
            distribution_type: self.distribution as u8,
            program_id: self.program_id,
            sdk_version: self.sdk_version,
            key_generation_old: self.key_generation.min(2),
            key_generation: self.key_generation,
            signature_key_generation: self.signature_key_generation,
            key_area_index: self.key_area_index as u8,
            rights_id: *self.rights_id.as_bytes(),
            ..RawNcaHeader::default()
        };

        if self.title_key.is_none() {
            let mut plain_area = [[0u8; 16]; 4];
            plain_area[KEY_AREA_CTR_SLOT] = body_key;
            let resolver = KeyResolver::new(keys);
            raw.encrypted_key_area = resolver.reencrypt_key_area(
                &plain_area,
                self.key_area_index,
                self.key_generation,
            )?;
        }

        // Lay out sections after the header, media-unit aligned.
        let mut image = vec![0u8; HEADER_SIZE];
        for (index, section) in self.sections.iter().enumerate() {
            let offset = image.len() as u64;
            let padded = (section.payload.len() as u64).div_ceil(MEDIA_UNIT) * MEDIA_UNIT;

            let fs_header = RawFsHeader {
                encryption_type: section.encryption as u8,
                generation: 1,
                secure_value: index as u32 + 1,
                ..RawFsHeader::default()
            };
            let nonce = fs_header.ctr_nonce();

            let mut body = section.payload.clone();
            body.resize(padded as usize, 0);
            if section.encryption == EncryptionType::Ctr {
                aes::ctr_apply(&body_key, &nonce, offset, &mut body)?;
            }
            image.extend_from_slice(&body);

            let fs_bytes = {
                let mut cursor = Cursor::new(Vec::new());
                fs_header.write(&mut cursor)?;
                cursor.into_inner()
            };
            raw.section_hashes[index] = Sha256::digest(&fs_bytes).into();
            raw.fs_headers[index] = fs_header;
            raw.section_entries[index] = RawSectionEntry {
                media_start: (offset / MEDIA_UNIT) as u32,
                media_end: ((offset + padded) / MEDIA_UNIT) as u32,
                reserved: [0; 8],
            };
        }
        raw.content_size = image.len() as u64;

        debug!(
            sections = self.sections.len(),
            size = image.len(),
            "laid out archive image"
        );
        Ok((raw, image))
    }
}

/// Encrypt the header into place and hand back the finished image.
fn finalize(raw: RawNcaHeader, mut image: Vec<u8>, keys: &KeySet) -> Result<Vec<u8>> {
    let header = NcaHeader::from_raw(raw)?;
    let encrypted = header.to_encrypted_bytes(keys)?;
    image[..HEADER_SIZE].copy_from_slice(&encrypted);
    Ok(image)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::nca::NcaError;
    use hoshi_crypto::rsa_verify;
    use pretty_assertions::assert_eq;
    use rsa::RsaPublicKey;

    fn test_keys() -> KeySet {
        let mut keys = KeySet::new();
        keys.set_header_key([0x10; 32]);
        keys.set_key_area_key(KeyAreaIndex::Application, 0, [0x20; 16]);
        keys
    }

    #[test]
    fn built_image_parses_back() {
        let keys = test_keys();
        let image = NcaBuilder::new()
            .content_type(ContentType::Program)
            .program_id(0x0100_0000_0000_2000)
            .add_section(vec![0xAB; 0x500])
            .build(&keys)
            .unwrap();

        assert_eq!(image.len(), HEADER_SIZE + 0x600);

        let header = NcaHeader::parse_encrypted(&image, &keys).unwrap();
        assert_eq!(header.content_type(), Some(ContentType::Program));
        assert_eq!(header.content_size(), image.len() as u64);
        assert_eq!(header.sections().len(), 1);
        let section = header.section(0).unwrap();
        assert_eq!(section.offset, HEADER_SIZE as u64);
        assert_eq!(section.size, 0x600);
        assert!(section.fs_header_hash_ok);
    }

    #[test]
    fn ctr_bodies_are_not_plaintext() {
        let keys = test_keys();
        let payload = vec![0x5A; 0x200];
        let image = NcaBuilder::new()
            .add_section(payload.clone())
            .build(&keys)
            .unwrap();
        assert_ne!(image[HEADER_SIZE..HEADER_SIZE + 0x200], payload[..]);

        let plain = NcaBuilder::new()
            .add_plain_section(payload.clone())
            .build(&keys)
            .unwrap();
        assert_eq!(plain[HEADER_SIZE..HEADER_SIZE + 0x200], payload[..]);
    }

    #[test]
    fn signed_header_verifies() {
        let keys = test_keys();
        let mut rng = rand::thread_rng();
        let fixed = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let meta = RsaPrivateKey::new(&mut rng, 2048).unwrap();

        let image = NcaBuilder::new()
            .add_section(vec![1; 0x100])
            .build_signed(&keys, &mut rng, &fixed, &meta)
            .unwrap();

        let header = NcaHeader::parse_encrypted(&image, &keys).unwrap();
        let signed = header.signed_bytes().unwrap();
        assert!(rsa_verify::verify_pss_sha256(
            &RsaPublicKey::from(&fixed),
            &signed,
            header.fixed_key_signature(),
        ));
        assert!(rsa_verify::verify_pkcs1v15_sha256(
            &RsaPublicKey::from(&meta),
            &signed,
            header.meta_signature(),
        ));
        // Cross-checking the keys must fail.
        assert!(!rsa_verify::verify_pss_sha256(
            &RsaPublicKey::from(&meta),
            &signed,
            header.fixed_key_signature(),
        ));
    }

    #[test]
    fn missing_key_area_key_fails() {
        let mut keys = KeySet::new();
        keys.set_header_key([0x10; 32]);
        let err = NcaBuilder::new()
            .key_generation(5)
            .add_section(vec![0; 16])
            .build(&keys)
            .unwrap_err();
        assert!(matches!(err, NcaError::Crypto(_)));
    }
}
