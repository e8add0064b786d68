//! AES-128 primitives in the three modes Switch content uses.
//!
//! * **XTS** over 0x200-byte sectors decrypts NCA headers. The tweak is the
//!   console's non-standard variant: the sector index is encoded big-endian
//!   across the whole tweak block rather than IEEE 1619's little-endian
//!   layout.
//! * **CTR** decrypts section bodies. The 128-bit counter is big-endian; the
//!   upper half comes from the section's FS header, the lower half is the
//!   absolute byte offset divided by 0x10.
//! * **ECB** unwraps the encrypted key area and title keys, one independent
//!   16-byte key per block.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes128;
use ctr::Ctr128BE;
use xts_mode::Xts128;

/// Sector size of every XTS-encrypted region in an NCA.
pub const XTS_SECTOR_SIZE: usize = 0x200;

/// AES-128 in CTR mode with a 128-bit big-endian counter.
pub type Aes128Ctr = Ctr128BE<Aes128>;

/// Tweak for the given sector index, big-endian across the full block.
#[must_use]
pub fn nintendo_tweak(sector_index: u128) -> [u8; 16] {
    sector_index.to_be_bytes()
}

/// Build an XTS context from the two 16-byte subkeys.
///
/// `data_key` encrypts the sector contents, `tweak_key` only ever encrypts
/// the sector index into the whitening value.
#[must_use]
pub fn xts_context(data_key: &[u8; 16], tweak_key: &[u8; 16]) -> Xts128<Aes128> {
    let cipher_1 = Aes128::new(GenericArray::from_slice(data_key));
    let cipher_2 = Aes128::new(GenericArray::from_slice(tweak_key));
    Xts128::new(cipher_1, cipher_2)
}

/// Decrypt whole sectors in place.
///
/// `data` must be a multiple of `sector_size` bytes long; `first_sector` is
/// the tweak index of the first sector in the buffer.
pub fn xts_decrypt(
    data_key: &[u8; 16],
    tweak_key: &[u8; 16],
    data: &mut [u8],
    sector_size: usize,
    first_sector: u128,
) {
    xts_context(data_key, tweak_key).decrypt_area(data, sector_size, first_sector, nintendo_tweak);
}

/// Encrypt whole sectors in place. Counterpart of [`xts_decrypt`].
pub fn xts_encrypt(
    data_key: &[u8; 16],
    tweak_key: &[u8; 16],
    data: &mut [u8],
    sector_size: usize,
    first_sector: u128,
) {
    xts_context(data_key, tweak_key).encrypt_area(data, sector_size, first_sector, nintendo_tweak);
}

/// Apply the CTR keystream in place.
///
/// CTR is symmetric; the same call encrypts and decrypts. `counter` is the
/// value for the first 16-byte block of `data`.
pub fn ctr_apply(key: &[u8; 16], counter: &[u8; 16], data: &mut [u8]) {
    let mut cipher = Aes128Ctr::new(
        GenericArray::from_slice(key),
        GenericArray::from_slice(counter),
    );
    cipher.apply_keystream(data);
}

/// Assemble the 128-bit counter for a section read.
///
/// Bytes [0..4) carry `ctr_high`, [4..8) carry `ctr_low` (both big-endian),
/// and [8..16) carry `nca_offset / 0x10` big-endian. `nca_offset` must be
/// 0x10-aligned. Patched sections re-enter here with `ctr_low` replaced by
/// the covering subsection's counter value.
#[must_use]
pub fn section_counter(ctr_high: u32, ctr_low: u32, nca_offset: u64) -> [u8; 16] {
    let mut ctr = [0u8; 16];
    ctr[0..4].copy_from_slice(&ctr_high.to_be_bytes());
    ctr[4..8].copy_from_slice(&ctr_low.to_be_bytes());
    ctr[8..16].copy_from_slice(&(nca_offset >> 4).to_be_bytes());
    ctr
}

/// Decrypt a single 16-byte block in place (ECB).
pub fn ecb_decrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.decrypt_block(GenericArray::from_mut_slice(block));
}

/// Encrypt a single 16-byte block in place (ECB).
pub fn ecb_encrypt_block(key: &[u8; 16], block: &mut [u8; 16]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    cipher.encrypt_block(GenericArray::from_mut_slice(block));
}

/// Unwrap all four entries of an NCA key area in place.
pub fn ecb_decrypt_key_area(key: &[u8; 16], area: &mut [[u8; 16]; 4]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for entry in area.iter_mut() {
        cipher.decrypt_block(GenericArray::from_mut_slice(entry));
    }
}

/// Wrap all four entries of an NCA key area in place.
pub fn ecb_encrypt_key_area(key: &[u8; 16], area: &mut [[u8; 16]; 4]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for entry in area.iter_mut() {
        cipher.encrypt_block(GenericArray::from_mut_slice(entry));
    }
}
