//! Containers holding a title's files.
//!
//! A container maps entry names to byte sources. The concrete shape
//! the file entry point auto-detects is the PFS0 package; anything
//! else (directories, network listings) can implement [`Container`]
//! outside this crate.

use tracing::trace;

use crate::error::Result;
use hoshi_formats::io::SharedSource;
use hoshi_formats::pfs::Pfs;

/// One named file inside a container.
#[derive(Clone)]
pub struct ContainerEntry {
    pub name: String,
    pub size: u64,
}

/// Read-only view of a title package.
pub trait Container {
    fn entries(&self) -> Vec<ContainerEntry>;

    /// Byte source for one entry, `None` when absent.
    fn open(&self, name: &str) -> Option<SharedSource>;

    fn entry_names_with_suffix(&self, suffix: &str) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.name.ends_with(suffix))
            .map(|e| e.name)
            .collect()
    }
}

/// PFS0-backed container.
pub struct PfsContainer {
    pfs: Pfs,
}

impl std::fmt::Debug for PfsContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PfsContainer")
            .field("entries", &self.pfs.entries().len())
            .finish()
    }
}

impl PfsContainer {
    /// Parse the package at the start of `source`. A missing magic
    /// maps to [`InstallError::ContainerNotFound`], which is how the
    /// auto-detecting entry point reports unrecognized input.
    pub fn parse(source: SharedSource) -> Result<Self> {
        let pfs = Pfs::parse(source)?;
        trace!(entries = pfs.entries().len(), "opened package container");
        Ok(Self { pfs })
    }
}

impl Container for PfsContainer {
    fn entries(&self) -> Vec<ContainerEntry> {
        self.pfs
            .entries()
            .iter()
            .map(|e| ContainerEntry {
                name: e.name.clone(),
                size: e.size,
            })
            .collect()
    }

    fn open(&self, name: &str) -> Option<SharedSource> {
        let entry = self.pfs.find(name)?;
        Some(self.pfs.entry_source(entry))
    }
}

/// Pre-resolved group of containers for the batch entry point. Each
/// member installs independently; one failing title does not abort
/// the rest.
#[derive(Default)]
pub struct Collections {
    containers: Vec<Box<dyn Container>>,
}

impl Collections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, container: Box<dyn Container>) {
        self.containers.push(container);
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Container> {
        self.containers.iter().map(Box::as_ref)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::InstallError;
    use hoshi_formats::io::ReadAt;
    use hoshi_formats::pfs::PfsBuilder;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn sample_container() -> PfsContainer {
        let image = PfsBuilder::new()
            .add_file("0011223344556677889900112233445566.nca", vec![1; 32])
            .add_file("title.tik", vec![2; 16])
            .add_file("title.cert", vec![3; 16])
            .build()
            .unwrap();
        PfsContainer::parse(Arc::new(image)).unwrap()
    }

    #[test]
    fn lists_and_opens_entries() {
        let container = sample_container();
        assert_eq!(container.entries().len(), 3);

        let tickets = container.entry_names_with_suffix(".tik");
        assert_eq!(tickets, vec!["title.tik".to_string()]);

        let source = container.open("title.tik").unwrap();
        let mut buf = [0u8; 16];
        source.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [2; 16]);

        assert!(container.open("absent.nca").is_none());
    }

    #[test]
    fn non_container_input_is_rejected() {
        let err = PfsContainer::parse(Arc::new(vec![0u8; 64])).unwrap_err();
        assert!(matches!(err, InstallError::ContainerNotFound));
    }
}
