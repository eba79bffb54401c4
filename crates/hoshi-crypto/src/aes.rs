//! AES-128 primitives shaped for content archives.
//!
//! Three modes are used by the archive format:
//!
//! - ECB for key-area and title-key wrapping (16-byte blocks, no IV).
//! - XTS with the Nintendo tweak (big-endian sector number) for the
//!   archive header, 0x200-byte sectors.
//! - CTR for section bodies, with the counter derived from the section
//!   nonce and the absolute byte offset.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use xts_mode::Xts128;

use crate::error::{CryptoError, Result};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Sector size used for header XTS crypto.
pub const XTS_SECTOR_SIZE: usize = 0x200;

/// Decrypt `data` in place with AES-128-ECB.
pub fn ecb_decrypt(key: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedLength(data.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// Encrypt `data` in place with AES-128-ECB.
pub fn ecb_encrypt(key: &[u8; 16], data: &mut [u8]) -> Result<()> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::UnalignedLength(data.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.encrypt_block(GenericArray::from_mut_slice(block));
    }
    Ok(())
}

/// The tweak is the sector number as a big-endian 128-bit value, not
/// the little-endian tweak regular XTS uses.
fn nintendo_tweak(sector: u128) -> [u8; 16] {
    sector.to_be_bytes()
}

fn xts_cipher(key: &[u8; 32]) -> Xts128<Aes128> {
    let crypt = Aes128::new(GenericArray::from_slice(&key[..16]));
    let tweak = Aes128::new(GenericArray::from_slice(&key[16..]));
    Xts128::new(crypt, tweak)
}

/// Decrypt an XTS area in place, starting at `first_sector`.
pub fn xts_decrypt(key: &[u8; 32], data: &mut [u8], first_sector: u128) -> Result<()> {
    if data.len() % XTS_SECTOR_SIZE != 0 {
        return Err(CryptoError::UnalignedLength(data.len()));
    }
    xts_cipher(key).decrypt_area(data, XTS_SECTOR_SIZE, first_sector, nintendo_tweak);
    Ok(())
}

/// Encrypt an XTS area in place, starting at `first_sector`.
pub fn xts_encrypt(key: &[u8; 32], data: &mut [u8], first_sector: u128) -> Result<()> {
    if data.len() % XTS_SECTOR_SIZE != 0 {
        return Err(CryptoError::UnalignedLength(data.len()));
    }
    xts_cipher(key).encrypt_area(data, XTS_SECTOR_SIZE, first_sector, nintendo_tweak);
    Ok(())
}

/// Apply AES-128-CTR keystream to `data` in place.
///
/// The 128-bit counter is `nonce || offset / 16`, both big-endian, so
/// any 16-byte-aligned offset can be decrypted without touching the
/// bytes before it. `offset` must be block aligned; callers that need
/// unaligned reads decrypt the surrounding blocks and slice.
pub fn ctr_apply(key: &[u8; 16], nonce: &[u8; 8], offset: u64, data: &mut [u8]) -> Result<()> {
    if offset % BLOCK_SIZE as u64 != 0 {
        return Err(CryptoError::UnalignedLength(offset as usize));
    }
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(nonce);
    iv[8..].copy_from_slice(&(offset / BLOCK_SIZE as u64).to_be_bytes());
    let mut cipher = Aes128Ctr::new(key.into(), (&iv).into());
    cipher.apply_keystream(data);
    Ok(())
}
