//! Install planning.
//!
//! The planner turns one container into per-title plans: it finds the
//! meta archives, reads their manifests, applies the policy's
//! per-type skip switches and the already-installed/downgrade gates,
//! locates every required archive, and matches tickets to rights IDs.
//! It opens archives only far enough to read headers and manifests;
//! verification and writing belong to the executor.

use tracing::{debug, info, warn};

use crate::config::Policy;
use crate::container::Container;
use crate::db::{InstallState, TitleDb};
use crate::error::{InstallError, Result};
use hoshi_crypto::resolver::master_key_index;
use hoshi_crypto::{KeyResolver, KeySet};
use hoshi_formats::cert::CertChain;
use hoshi_formats::cnmt::{Cnmt, MetaType};
use hoshi_formats::io::ReadAt;
use hoshi_formats::nca::{NcaReader, RightsId};
use hoshi_formats::pfs::Pfs;
use hoshi_formats::ticket::Ticket;

/// One archive the executor must verify and write.
#[derive(Debug, Clone)]
pub struct PlannedContent {
    /// Name inside the container (may be the compressed variant).
    pub entry_name: String,
    /// Name the archive is stored under.
    pub store_name: String,
    pub content_id: [u8; 16],
    /// Manifest digest; absent for the meta archive itself.
    pub expected_hash: Option<[u8; 0x20]>,
    pub rights_id: RightsId,
    pub key_generation: u8,
}

/// Everything the executor needs for one title.
pub struct InstallPlan {
    pub title_id: u64,
    pub version: u32,
    pub meta_type: MetaType,
    pub cnmt: Cnmt,
    /// Meta archive first, then the content archives.
    pub contents: Vec<PlannedContent>,
    pub rights_id: Option<RightsId>,
    pub ticket: Option<Ticket>,
    pub certs: Option<CertChain>,
    pub cert_bytes: Option<Vec<u8>>,
    /// Plaintext title key resolved from the ticket.
    pub title_key: Option<[u8; 16]>,
    /// Rewrite title-key archives to standard crypto.
    pub convert: bool,
}

impl InstallPlan {
    /// Content IDs the title database must hold for the title to
    /// count as installed.
    pub fn required_content_ids(&self) -> Vec<[u8; 16]> {
        self.contents.iter().map(|c| c.content_id).collect()
    }

    /// Whether the ticket is installed alongside the content.
    /// Conversion removes the need for one, except for add-on
    /// content, which is never converted.
    pub fn installs_ticket(&self, policy: &Policy) -> bool {
        self.ticket.is_some()
            && !policy.skip_ticket
            && (self.meta_type == MetaType::AddOnContent || !self.convert)
    }
}

/// Plans titles out of one container.
pub struct InstallPlanner<'a> {
    keys: &'a KeySet,
    policy: &'a Policy,
}

impl<'a> InstallPlanner<'a> {
    pub fn new(keys: &'a KeySet, policy: &'a Policy) -> Self {
        Self { keys, policy }
    }

    /// Names of the meta archives in the container, one per title.
    pub fn meta_entries(&self, container: &dyn Container) -> Vec<String> {
        let mut names = container.entry_names_with_suffix(".cnmt.nca");
        names.extend(container.entry_names_with_suffix(".cnmt.ncz"));
        names
    }

    /// Build the plan for one title. `Ok(None)` means the title is
    /// skipped by policy (type switch, already installed, downgrade).
    pub fn plan_title(
        &self,
        container: &dyn Container,
        db: &dyn TitleDb,
        meta_name: &str,
    ) -> Result<Option<InstallPlan>> {
        let meta_source = container
            .open(meta_name)
            .ok_or_else(|| InstallError::NcaNotFound(meta_name.to_string()))?;
        let mut meta_reader = NcaReader::new(meta_source, self.keys, None)?;
        let cnmt = read_manifest(&mut meta_reader)?;

        if self.type_skipped(cnmt.meta_type()) {
            info!(meta_name, meta_type = ?cnmt.meta_type(), "title type skipped by policy");
            return Ok(None);
        }

        let mut contents = vec![PlannedContent {
            entry_name: meta_name.to_string(),
            store_name: format!("{}.cnmt.nca", entry_stem(meta_name)),
            content_id: parse_content_id(meta_name)?,
            expected_hash: None,
            rights_id: meta_reader.header().rights_id(),
            key_generation: meta_reader.header().key_generation(),
        }];

        for record in cnmt.installable_records() {
            let stem = record.content_id_hex();
            let entry_name = [format!("{stem}.nca"), format!("{stem}.ncz")]
                .into_iter()
                .find(|name| container.open(name).is_some())
                .ok_or_else(|| InstallError::NcaNotFound(format!("{stem}.nca")))?;

            let source = container
                .open(&entry_name)
                .ok_or_else(|| InstallError::NcaNotFound(entry_name.clone()))?;
            let header = NcaReader::peek_header(&source, self.keys)?;

            contents.push(PlannedContent {
                entry_name,
                store_name: format!("{stem}.nca"),
                content_id: record.content_id,
                expected_hash: Some(record.hash),
                rights_id: header.rights_id(),
                key_generation: header.key_generation(),
            });
        }

        if self.gated_out(db, &cnmt, &contents)? {
            return Ok(None);
        }

        let rights = contents.iter().find(|c| !c.rights_id.is_zero());
        let rights_id = rights.map(|c| c.rights_id);
        let (ticket, certs, cert_bytes, title_key) = match rights {
            Some(content) => {
                self.resolve_ticket(container, content.rights_id, content.key_generation)?
            }
            None => (None, None, None, None),
        };

        let convert = self.policy.convert_to_standard_crypto
            && cnmt.meta_type() != MetaType::AddOnContent
            && rights_id.is_some();

        debug!(
            title_id = format!("{:016x}", cnmt.title_id()),
            contents = contents.len(),
            has_ticket = ticket.is_some(),
            convert,
            "planned title"
        );
        Ok(Some(InstallPlan {
            title_id: cnmt.title_id(),
            version: cnmt.version(),
            meta_type: cnmt.meta_type(),
            cnmt,
            contents,
            rights_id,
            ticket,
            certs,
            cert_bytes,
            title_key,
            convert,
        }))
    }

    fn type_skipped(&self, meta_type: MetaType) -> bool {
        match meta_type {
            MetaType::Application => self.policy.skip_base,
            MetaType::Patch => self.policy.skip_patch,
            MetaType::AddOnContent => self.policy.skip_addon,
            MetaType::DataPatch => self.policy.skip_data_patch,
            // Standalone deltas are never installed.
            MetaType::Delta => true,
        }
    }

    /// Already-installed and downgrade gates. `true` skips the title.
    fn gated_out(
        &self,
        db: &dyn TitleDb,
        cnmt: &Cnmt,
        contents: &[PlannedContent],
    ) -> Result<bool> {
        let required: Vec<[u8; 16]> = contents.iter().map(|c| c.content_id).collect();

        if self.policy.skip_if_already_installed
            && db.state(cnmt.title_id(), &required)? == InstallState::Installed
        {
            info!(
                title_id = format!("{:016x}", cnmt.title_id()),
                "already installed, skipping"
            );
            return Ok(true);
        }

        if !self.policy.allow_downgrade {
            if let Some(installed) = db.installed_version(cnmt.title_id()) {
                if installed > cnmt.version() {
                    warn!(
                        title_id = format!("{:016x}", cnmt.title_id()),
                        installed,
                        offered = cnmt.version(),
                        "refusing downgrade"
                    );
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn resolve_ticket(
        &self,
        container: &dyn Container,
        rights_id: RightsId,
        archive_generation: u8,
    ) -> Result<(
        Option<Ticket>,
        Option<CertChain>,
        Option<Vec<u8>>,
        Option<[u8; 16]>,
    )> {
        let ticket_name = format!("{rights_id}.tik");
        let source = container
            .open(&ticket_name)
            .ok_or_else(|| InstallError::TicketNotFound(rights_id.to_string()))?;
        let mut bytes = vec![0u8; source.len()? as usize];
        source.read_at(0, &mut bytes)?;
        let ticket = Ticket::parse(&bytes)?;

        let cert_name = format!("{rights_id}.cert");
        let (certs, cert_bytes) = match container.open(&cert_name) {
            Some(source) => {
                let mut bytes = vec![0u8; source.len()? as usize];
                source.read_at(0, &mut bytes)?;
                (Some(CertChain::parse(&bytes)?), Some(bytes))
            }
            None => (None, None),
        };

        // Gate the revision before touching the key set, so a ticket
        // cut for the wrong key generation reports as a ticket problem
        // rather than a missing key.
        let revision = ticket.master_key_revision();
        if master_key_index(revision) != master_key_index(archive_generation) {
            return Err(InstallError::InvalidTicketKeyRevision {
                ticket: revision,
                archive: archive_generation,
            });
        }

        let resolver = KeyResolver::new(self.keys);
        let title_key = resolver.resolve_title_key(&ticket.wrapped_title_key(), revision)?;

        Ok((Some(ticket), certs, cert_bytes, Some(title_key)))
    }
}

/// Pull the manifest out of a meta archive: its single section is a
/// partition holding one `.cnmt` file.
fn read_manifest(reader: &mut NcaReader) -> Result<Cnmt> {
    let section = *reader
        .header()
        .section(0)
        .map_err(InstallError::from)?;
    let mut section_bytes = vec![0u8; section.size as usize];
    reader.read_decrypted(0, 0, &mut section_bytes)?;

    let pfs = Pfs::parse(std::sync::Arc::new(section_bytes))?;
    let entry = pfs
        .entries()
        .iter()
        .find(|e| e.name.ends_with(".cnmt"))
        .cloned()
        .ok_or_else(|| InstallError::Malformed("meta archive holds no manifest".into()))?;
    let bytes = pfs.read_entry(&entry)?;
    Ok(Cnmt::parse(&bytes)?)
}

fn entry_stem(name: &str) -> &str {
    name.split('.').next().unwrap_or(name)
}

fn parse_content_id(name: &str) -> Result<[u8; 16]> {
    hex::decode(entry_stem(name))
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| InstallError::Malformed(format!("entry {name} is not named by content ID")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stems_and_content_ids() {
        assert_eq!(entry_stem("00aa.cnmt.nca"), "00aa");
        let id = parse_content_id("000102030405060708090a0b0c0d0e0f.cnmt.nca").unwrap();
        assert_eq!(id[1], 0x01);
        assert!(parse_content_id("not-hex.nca").is_err());
    }
}
