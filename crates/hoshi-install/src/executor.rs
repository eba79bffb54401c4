//! Install execution.
//!
//! One executor run drives every title in a container through the
//! state machine: Planning, Verifying, Converting, Writing,
//! Committing. Cancellation and failure can interrupt from any state;
//! writes are staged, so an interrupted title leaves nothing behind
//! and commits only happen after every archive of a title is in final
//! storage. A failing title is recorded and the batch moves on.

use tracing::{debug, info, warn};

use crate::CHUNK_SIZE;
use crate::config::Policy;
use crate::container::Container;
use crate::db::{TitleDb, TitleRecord};
use crate::error::{InstallError, Result};
use crate::planner::{InstallPlan, InstallPlanner};
use crate::progress::ProgressSink;
use crate::storage::{ContentStorage, StorageTarget};
use crate::verify::TrustChainVerifier;
use hoshi_crypto::{KeyResolver, KeySet};
use hoshi_formats::cnmt::MetaType;
use hoshi_formats::nca::{HEADER_SIZE, NcaReader};

/// Phase of one title's install, for logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStep {
    Planning,
    Verifying,
    Converting,
    Writing,
    Committing,
    Done,
}

/// Terminal state of one title.
#[derive(Debug)]
pub enum TitleStatus {
    Installed { verified: bool },
    Skipped,
    Failed(InstallError),
    Cancelled,
}

#[derive(Debug)]
pub struct TitleOutcome {
    /// Container entry the title was planned from.
    pub meta_entry: String,
    pub title_id: Option<u64>,
    pub status: TitleStatus,
}

/// Result of one executor run over a container.
#[derive(Debug, Default)]
pub struct InstallReport {
    pub outcomes: Vec<TitleOutcome>,
}

impl InstallReport {
    pub fn installed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TitleStatus::Installed { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, TitleStatus::Failed(_)))
            .count()
    }

    pub fn cancelled(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.status, TitleStatus::Cancelled))
    }

    pub fn merge(&mut self, other: InstallReport) {
        self.outcomes.extend(other.outcomes);
    }
}

/// Drives installs against one key set and policy.
pub struct InstallExecutor<'a> {
    keys: &'a KeySet,
    policy: Policy,
}

impl<'a> InstallExecutor<'a> {
    pub fn new(keys: &'a KeySet, policy: Policy) -> Self {
        Self { keys, policy }
    }

    /// Install every title the container holds.
    pub fn run(
        &self,
        container: &dyn Container,
        db: &mut dyn TitleDb,
        storage: &mut dyn ContentStorage,
        progress: &dyn ProgressSink,
    ) -> Result<InstallReport> {
        let planner = InstallPlanner::new(self.keys, &self.policy);
        let metas = planner.meta_entries(container);
        if metas.is_empty() {
            warn!("container holds no titles");
        }

        let mut report = InstallReport::default();
        for meta_entry in metas {
            if progress.is_cancelled() {
                report.outcomes.push(TitleOutcome {
                    meta_entry,
                    title_id: None,
                    status: TitleStatus::Cancelled,
                });
                break;
            }

            debug!(meta_entry, step = ?InstallStep::Planning, "title start");
            let outcome = match planner.plan_title(container, db, &meta_entry) {
                Ok(None) => TitleOutcome {
                    meta_entry,
                    title_id: None,
                    status: TitleStatus::Skipped,
                },
                Ok(Some(plan)) => {
                    let title_id = plan.title_id;
                    let status =
                        match self.install_title(container, &plan, db, storage, progress) {
                            Ok(verified) => {
                                info!(
                                    title_id = format!("{title_id:016x}"),
                                    verified, "title installed"
                                );
                                TitleStatus::Installed { verified }
                            }
                            Err(InstallError::Cancelled) => TitleStatus::Cancelled,
                            Err(err) => {
                                warn!(title_id = format!("{title_id:016x}"), %err, "title failed");
                                TitleStatus::Failed(err)
                            }
                        };
                    TitleOutcome {
                        meta_entry,
                        title_id: Some(title_id),
                        status,
                    }
                }
                Err(err) => {
                    warn!(meta_entry, %err, "planning failed");
                    TitleOutcome {
                        meta_entry,
                        title_id: None,
                        status: TitleStatus::Failed(err),
                    }
                }
            };

            let stop = matches!(outcome.status, TitleStatus::Cancelled);
            report.outcomes.push(outcome);
            if stop {
                break;
            }
        }
        Ok(report)
    }

    fn install_title(
        &self,
        container: &dyn Container,
        plan: &InstallPlan,
        db: &mut dyn TitleDb,
        storage: &mut dyn ContentStorage,
        progress: &dyn ProgressSink,
    ) -> Result<bool> {
        let result = self.install_title_inner(container, plan, db, storage, progress);
        if result.is_err() {
            // No partial title: drop everything still staged.
            storage.discard_all()?;
        }
        result
    }

    fn install_title_inner(
        &self,
        container: &dyn Container,
        plan: &InstallPlan,
        db: &mut dyn TitleDb,
        storage: &mut dyn ContentStorage,
        progress: &dyn ProgressSink,
    ) -> Result<bool> {
        let target = if self.policy.sd_card_install {
            StorageTarget::Removable
        } else {
            StorageTarget::Internal
        };
        let verifier = TrustChainVerifier::new(self.keys, &self.policy);

        debug!(step = ?InstallStep::Verifying, "title state");
        if let (Some(ticket), Some(rights_id)) = (&plan.ticket, plan.rights_id) {
            let archive_generation = plan
                .contents
                .iter()
                .find(|c| !c.rights_id.is_zero())
                .map_or(0, |c| c.key_generation);
            verifier.verify_ticket(ticket, rights_id, archive_generation, plan.certs.as_ref())?;
        }

        if self.policy.ticket_only {
            let staged = self.stage_ticket_files(plan, storage, target)?;
            for name in &staged {
                storage.finish(name)?;
            }
            return Ok(true);
        }

        let mut readers = Vec::with_capacity(plan.contents.len());
        let mut verified = true;
        for content in &plan.contents {
            if progress.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let source = container
                .open(&content.entry_name)
                .ok_or_else(|| InstallError::NcaNotFound(content.entry_name.clone()))?;
            let title_key = if content.rights_id.is_zero() {
                None
            } else {
                plan.title_key
            };
            let mut reader = NcaReader::new(source, self.keys, title_key)?;
            verified &= verifier.verify_archive(
                &mut reader,
                &content.store_name,
                content.expected_hash.as_ref(),
                progress,
            )?;
            readers.push(reader);
        }

        debug!(step = ?InstallStep::Converting, "title state");
        let mut manifest = plan.cnmt.clone();
        if self.policy.lower_system_version {
            let floor = manifest.required_system_version().unwrap_or(0);
            manifest.set_required_system_version(0);
            let max_generation = plan
                .contents
                .iter()
                .map(|c| c.key_generation)
                .max()
                .unwrap_or(0);
            if floor != 0 && !self.policy.lower_master_key && max_generation > 1 {
                warn!(
                    floor,
                    max_generation,
                    "system version lowered but archives still need a newer master key"
                );
            }
        }
        for reader in &mut readers {
            self.convert_archive(reader, plan)?;
        }

        debug!(step = ?InstallStep::Writing, "title state");
        let total: u64 = readers.iter().map(NcaReader::content_size).sum();
        let mut done = 0u64;
        let mut staged = Vec::with_capacity(plan.contents.len() + 2);
        for (content, reader) in plan.contents.iter().zip(readers.iter_mut()) {
            self.write_archive(
                reader, &content.store_name, storage, target, progress, &mut done, total,
            )?;
            staged.push(content.store_name.clone());
        }

        if plan.installs_ticket(&self.policy) {
            staged.extend(self.stage_ticket_files(plan, storage, target)?);
        }

        debug!(step = ?InstallStep::Committing, "title state");
        // Nothing reaches final storage until every file of the title
        // is fully staged; an earlier failure discards them all.
        for name in &staged {
            storage.finish(name)?;
        }
        db.commit(TitleRecord {
            title_id: plan.title_id,
            version: manifest.version(),
            meta_type: plan.meta_type,
            content_ids: plan.required_content_ids(),
            verified,
        })?;
        debug!(step = ?InstallStep::Done, "title state");
        Ok(verified)
    }

    /// Rewrite an archive's header according to the conversion policy:
    /// title-key crypto to standard crypto, master-key lowering, and
    /// distribution-bit normalization. Section bodies never change —
    /// the body key stays the same, only its wrapping does.
    fn convert_archive(&self, reader: &mut NcaReader, plan: &InstallPlan) -> Result<()> {
        let resolver = KeyResolver::new(self.keys);
        let resolved = *reader.resolved_keys();
        let header = reader.header();

        let strip_rights = plan.convert && !header.rights_id().is_zero();
        let lower = self.policy.lower_master_key && plan.meta_type != MetaType::AddOnContent;
        let normalize_distribution =
            header.is_gamecard() && self.policy.ignore_distribution_bit;
        if !strip_rights && !lower && !normalize_distribution {
            return Ok(());
        }

        let index = header.key_area_index().map_err(InstallError::from)?;
        let target_generation = if lower { 0 } else { header.key_generation() };

        if strip_rights || lower {
            let mut plain_area = resolved.key_area;
            if resolved.title_key_crypto {
                plain_area = [[0; 16]; 4];
                plain_area[hoshi_crypto::resolver::KEY_AREA_CTR_SLOT] = resolved.body_key;
            }
            let wrapped = resolver.reencrypt_key_area(&plain_area, index, target_generation)?;

            let header = reader.header_mut();
            header.set_encrypted_key_area(wrapped);
            header.set_key_generation(target_generation);
            if strip_rights {
                header.clear_rights_id();
            }
            debug!(target_generation, strip_rights, "archive crypto converted");
        }
        if normalize_distribution {
            reader.header_mut().set_distribution_download();
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn write_archive(
        &self,
        reader: &mut NcaReader,
        store_name: &str,
        storage: &mut dyn ContentStorage,
        target: StorageTarget,
        progress: &dyn ProgressSink,
        done: &mut u64,
        total: u64,
    ) -> Result<()> {
        // The (possibly rewritten) header is emitted from the parsed
        // form; everything after it streams from the source image.
        let header_bytes = reader
            .header()
            .to_encrypted_bytes(self.keys)
            .map_err(InstallError::from)?;
        let size = reader.content_size();

        storage.begin(target, store_name)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        while offset < size {
            if progress.is_cancelled() {
                return Err(InstallError::Cancelled);
            }
            let take = buf.len().min((size - offset) as usize);
            if offset < HEADER_SIZE as u64 {
                let head = take.min(HEADER_SIZE - offset as usize);
                buf[..head].copy_from_slice(&header_bytes[offset as usize..offset as usize + head]);
                if take > head {
                    reader.read_raw(offset + head as u64, &mut buf[head..take])?;
                }
            } else {
                reader.read_raw(offset, &mut buf[..take])?;
            }
            storage.write(store_name, &buf[..take])?;
            offset += take as u64;
            *done += take as u64;
            progress.report(*done, total);
        }
        debug!(store_name, size, "archive staged");
        Ok(())
    }

    /// Stage the ticket (and certificate chain, when present) without
    /// finishing them; returns the staged names.
    fn stage_ticket_files(
        &self,
        plan: &InstallPlan,
        storage: &mut dyn ContentStorage,
        target: StorageTarget,
    ) -> Result<Vec<String>> {
        let (Some(ticket), Some(rights_id)) = (&plan.ticket, plan.rights_id) else {
            return Ok(Vec::new());
        };
        let mut staged = Vec::with_capacity(2);
        let name = format!("{rights_id}.tik");
        storage.begin(target, &name)?;
        storage.write(&name, ticket.as_bytes())?;
        staged.push(name);

        if let Some(cert_bytes) = &plan.cert_bytes {
            let name = format!("{rights_id}.cert");
            storage.begin(target, &name)?;
            storage.write(&name, cert_bytes)?;
            staged.push(name);
        }
        debug!(%rights_id, "ticket staged");
        Ok(staged)
    }
}
