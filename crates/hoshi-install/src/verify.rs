//! Trust-chain verification.
//!
//! One verifier instance checks every archive of a job against the
//! resolved policy: header fixed-key signature (selected by the
//! header's signature key generation), meta signature, FS-header
//! digests, full-archive SHA-256 against the manifest, the
//! distribution bit, and ticket/certificate checks for rights-ID
//! archives. Each check is independently skippable; a skipped check
//! marks the archive unverified but does not block the install.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::Policy;
use crate::error::{InstallError, Result};
use crate::progress::ProgressSink;
use hoshi_crypto::resolver::master_key_index;
use hoshi_crypto::{KeySet, rsa_verify};
use hoshi_formats::cert::CertChain;
use hoshi_formats::nca::{ContentType, NcaReader, RightsId};
use hoshi_formats::ticket::{SUPPORTED_FORMAT_VERSION, Ticket, TitleKeyType};

use crate::CHUNK_SIZE;

/// Verifies archives and tickets against one policy.
pub struct TrustChainVerifier<'a> {
    keys: &'a KeySet,
    policy: &'a Policy,
}

impl<'a> TrustChainVerifier<'a> {
    pub fn new(keys: &'a KeySet, policy: &'a Policy) -> Self {
        Self { keys, policy }
    }

    /// Run every archive check. Returns `true` when the archive passed
    /// the full chain, `false` when one or more checks were skipped by
    /// policy.
    pub fn verify_archive(
        &self,
        reader: &mut NcaReader,
        name: &str,
        expected_hash: Option<&[u8; 0x20]>,
        progress: &dyn ProgressSink,
    ) -> Result<bool> {
        let mut verified = true;

        if reader.header().is_gamecard() {
            if self.policy.ignore_distribution_bit {
                warn!(name, "accepting game-card archive by policy");
                verified = false;
            } else {
                return Err(InstallError::InvalidNcaDistributionBit);
            }
        }

        if self.policy.skip_rsa_header_fixed_key_verify {
            verified = false;
        } else {
            let generation = reader.header().signature_key_generation();
            let key = self.keys.header_signature_key(generation)?;
            let signed = reader.header().signed_bytes().map_err(InstallError::from)?;
            if !rsa_verify::verify_pss_sha256(key, &signed, reader.header().fixed_key_signature()) {
                return Err(InstallError::InvalidNcaSignature0);
            }
        }

        if reader.header().content_type() == Some(ContentType::Program) {
            if self.policy.skip_rsa_npdm_fixed_key_verify {
                verified = false;
            } else if let Some(key) = self.keys.meta_signature_key() {
                let signed = reader.header().signed_bytes().map_err(InstallError::from)?;
                if !rsa_verify::verify_pkcs1v15_sha256(key, &signed, reader.header().meta_signature())
                {
                    return Err(InstallError::InvalidNcaSignature1);
                }
            } else {
                warn!(name, "no meta signature key loaded, check skipped");
                verified = false;
            }
        }

        if self.policy.skip_nca_hash_verify {
            verified = false;
        } else {
            for section in reader.header().sections() {
                if !section.fs_header_hash_ok {
                    return Err(InstallError::InvalidNcaSha256(name.to_string()));
                }
            }
            if let Some(expected) = expected_hash {
                self.verify_content_hash(reader, name, expected, progress)?;
            }
        }

        debug!(name, verified, "archive verification complete");
        Ok(verified)
    }

    /// SHA-256 over the archive's on-disk image, which for compressed
    /// input means the reconstructed encrypted bytes.
    fn verify_content_hash(
        &self,
        reader: &mut NcaReader,
        name: &str,
        expected: &[u8; 0x20],
        progress: &dyn ProgressSink,
    ) -> Result<()> {
        let total = reader.content_size();
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < total {
            if progress.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let take = buf.len().min((total - offset) as usize);
            reader.read_raw(offset, &mut buf[..take])?;
            hasher.update(&buf[..take]);
            offset += take as u64;
        }
        let digest: [u8; 0x20] = hasher.finalize().into();
        if digest != *expected {
            return Err(InstallError::InvalidNcaSha256(name.to_string()));
        }
        Ok(())
    }

    /// Validate a ticket against the rights ID it is filed under, the
    /// archive that needs it, and its certificate chain.
    pub fn verify_ticket(
        &self,
        ticket: &Ticket,
        filed_rights_id: RightsId,
        archive_key_generation: u8,
        certs: Option<&CertChain>,
    ) -> Result<()> {
        if ticket.rights_id() != filed_rights_id {
            return Err(InstallError::InvalidTicketRightsId);
        }
        if ticket.format_version() != SUPPORTED_FORMAT_VERSION {
            return Err(InstallError::InvalidTicketVersion(ticket.format_version()));
        }
        if ticket.title_key_type() != Some(TitleKeyType::Common) {
            return Err(InstallError::InvalidTicketKeyType(
                ticket.title_key_type_byte(),
            ));
        }
        if master_key_index(ticket.master_key_revision())
            != master_key_index(archive_key_generation)
        {
            return Err(InstallError::InvalidTicketKeyRevision {
                ticket: ticket.master_key_revision(),
                archive: archive_key_generation,
            });
        }

        let chain = certs.ok_or(InstallError::CertNotFound)?;
        if !chain.verify(None) || !chain.verify_ticket(ticket) {
            return Err(InstallError::Malformed(
                "ticket signature rejected by certificate chain".into(),
            ));
        }
        Ok(())
    }
}
