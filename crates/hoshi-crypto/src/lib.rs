//! Cryptographic operations for the hoshi install pipeline.
//!
//! This crate owns everything key-related:
//!
//! - [`KeySet`]: console key material (header key, key-area encryption
//!   keys, titlekeks, fixed RSA verification keys), loadable from the
//!   usual `name = hex` key-file format.
//! - [`aes`]: thin AES-128 ECB/XTS/CTR wrappers shaped for content
//!   archives (Nintendo XTS tweak, offset-derived CTR counters).
//! - [`rsa_verify`]: RSA-2048 PSS / PKCS1-v1.5 verification over raw
//!   modulus constants.
//! - [`KeyResolver`]: derives the per-section content keys for an
//!   archive, either from the header key area (standard crypto) or
//!   from a ticket's title key (title-key crypto), and re-encrypts
//!   key areas when an install converts crypto or lowers the master
//!   key generation.

pub mod aes;
pub mod error;
pub mod keys;
pub mod resolver;
pub mod rsa_verify;

pub use error::{CryptoError, Result};
pub use keys::{KeyAreaIndex, KeySet};
pub use resolver::{KeyResolver, ResolvedKeys};
