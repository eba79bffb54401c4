//! Title install pipeline.
//!
//! Takes a title package (a PFS0 container holding content archives,
//! a manifest, and optionally a ticket and certificate chain),
//! verifies the trust chain, optionally converts archive crypto, and
//! streams the content into staged storage with an atomic per-title
//! commit into the title database.
//!
//! The four entry points differ only in how the container arrives:
//!
//! - [`install_from_file`]: open a package file, auto-detect it.
//! - [`install_from_source`]: any [`ReadAt`] source, auto-detected.
//! - [`install_from_container`]: a pre-opened [`Container`].
//! - [`install_from_collections`]: a batch of containers; each title
//!   installs independently and one failure never aborts the rest.
//!
//! ```no_run
//! use std::path::Path;
//! use hoshi_crypto::KeySet;
//! use hoshi_install::{
//!     Config, ConfigOverride, DirStorage, MemoryTitleDb, NullProgress, install_from_file,
//! };
//!
//! # fn main() -> Result<(), hoshi_install::InstallError> {
//! let keys = KeySet::load(Path::new("prod.keys"))?;
//! let mut db = MemoryTitleDb::new();
//! let mut storage = DirStorage::new("/data/contents");
//! let report = install_from_file(
//!     Path::new("title.nsp"),
//!     &keys,
//!     &Config::default(),
//!     &ConfigOverride::default(),
//!     &mut db,
//!     &mut storage,
//!     &NullProgress,
//! )?;
//! println!("{} installed, {} failed", report.installed(), report.failed());
//! # Ok(())
//! # }
//! ```

use std::path::Path;

pub mod config;
pub mod container;
pub mod db;
pub mod error;
pub mod executor;
pub mod planner;
pub mod progress;
pub mod source;
pub mod storage;
pub mod verify;

pub use config::{Config, ConfigOverride, Policy};
pub use container::{Collections, Container, ContainerEntry, PfsContainer};
pub use db::{InstallState, MemoryTitleDb, TitleDb, TitleRecord};
pub use error::{InstallError, Result};
pub use executor::{InstallExecutor, InstallReport, InstallStep, TitleOutcome, TitleStatus};
pub use planner::{InstallPlan, InstallPlanner, PlannedContent};
pub use progress::{NullProgress, ProgressSink, ProgressState};
pub use source::{FileSource, MemorySource};
pub use storage::{ContentStorage, DirStorage, StorageTarget};
pub use verify::TrustChainVerifier;

use hoshi_crypto::KeySet;
use hoshi_formats::io::{ReadAt, SharedSource};

/// Streaming chunk size for hashing and writes.
pub(crate) const CHUNK_SIZE: usize = 256 * 1024;

/// Install every title in the package file at `path`.
#[allow(clippy::too_many_arguments)]
pub fn install_from_file(
    path: &Path,
    keys: &KeySet,
    config: &Config,
    overrides: &ConfigOverride,
    db: &mut dyn TitleDb,
    storage: &mut dyn ContentStorage,
    progress: &dyn ProgressSink,
) -> Result<InstallReport> {
    let source = FileSource::open(path)?;
    install_from_source(source, keys, config, overrides, db, storage, progress)
}

/// Install from any byte source. The container format is
/// auto-detected; unrecognized input fails with
/// [`InstallError::ContainerNotFound`].
#[allow(clippy::too_many_arguments)]
pub fn install_from_source(
    source: SharedSource,
    keys: &KeySet,
    config: &Config,
    overrides: &ConfigOverride,
    db: &mut dyn TitleDb,
    storage: &mut dyn ContentStorage,
    progress: &dyn ProgressSink,
) -> Result<InstallReport> {
    if source.len()? < 4 {
        return Err(InstallError::ContainerNotFound);
    }
    let container = PfsContainer::parse(source)?;
    install_from_container(&container, keys, config, overrides, db, storage, progress)
}

/// Install every title in a pre-opened container.
#[allow(clippy::too_many_arguments)]
pub fn install_from_container(
    container: &dyn Container,
    keys: &KeySet,
    config: &Config,
    overrides: &ConfigOverride,
    db: &mut dyn TitleDb,
    storage: &mut dyn ContentStorage,
    progress: &dyn ProgressSink,
) -> Result<InstallReport> {
    let policy = Policy::resolve(config, overrides);
    let executor = InstallExecutor::new(keys, policy);
    executor.run(container, db, storage, progress)
}

/// Install a batch of containers. Per-title failures are recorded in
/// the merged report; only cancellation stops the batch early.
#[allow(clippy::too_many_arguments)]
pub fn install_from_collections(
    collections: &Collections,
    keys: &KeySet,
    config: &Config,
    overrides: &ConfigOverride,
    db: &mut dyn TitleDb,
    storage: &mut dyn ContentStorage,
    progress: &dyn ProgressSink,
) -> Result<InstallReport> {
    let policy = Policy::resolve(config, overrides);
    let executor = InstallExecutor::new(keys, policy);

    let mut report = InstallReport::default();
    for container in collections.iter() {
        report.merge(executor.run(container, db, storage, progress)?);
        if report.cancelled() {
            break;
        }
    }
    Ok(report)
}
