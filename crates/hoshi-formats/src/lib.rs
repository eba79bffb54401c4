//! Binary formats for the hoshi install pipeline.
//!
//! Everything between "raw bytes from a container" and "bytes safe to
//! persist" is parsed here:
//!
//! - [`nca`]: content archives — header, section table, random-access
//!   decrypted reads, and a builder for re-encrypted output.
//! - [`ncz`]: the block-compressed archive variant and its
//!   random-access decompressor.
//! - [`ticket`]: title-key tickets.
//! - [`cert`]: the certificate chains backing ticket signatures.
//! - [`cnmt`]: packaged content-meta manifests.
//! - [`pfs`]: the PFS0 file-system container the install entry points
//!   auto-detect.
//!
//! All parsers read from a [`io::ReadAt`] source, so file, memory and
//! network-backed inputs go through the same code path.

pub mod cert;
pub mod cnmt;
pub mod io;
pub mod nca;
pub mod ncz;
pub mod pfs;
pub mod ticket;

pub use io::{ReadAt, SharedSource, SliceRegion};
