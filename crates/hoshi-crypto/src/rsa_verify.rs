//! RSA-2048 signature verification over raw modulus material.
//!
//! Archive headers carry two RSA-2048-PSS signatures; tickets and
//! certificates use RSA PKCS1-v1.5. All keys arrive as raw big-endian
//! moduli with exponent 0x10001, never as DER blobs.

use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey, pss::Pss};
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Public exponent used by every key in the trust chain.
pub const PUBLIC_EXPONENT: u32 = 0x10001;

/// Build an [`RsaPublicKey`] from a raw big-endian modulus.
pub fn public_key_from_modulus(modulus: &[u8]) -> Result<RsaPublicKey> {
    let n = BigUint::from_bytes_be(modulus);
    let e = BigUint::from(PUBLIC_EXPONENT);
    Ok(RsaPublicKey::new(n, e)?)
}

/// Verify an RSA-2048-PSS signature over `message` with SHA-256.
pub fn verify_pss_sha256(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    key.verify(Pss::new::<Sha256>(), &digest, signature).is_ok()
}

/// Verify an RSA PKCS1-v1.5 signature over `message` with SHA-256.
pub fn verify_pkcs1v15_sha256(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let digest = Sha256::digest(message);
    key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .is_ok()
}
