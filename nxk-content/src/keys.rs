//! Key provisioning for content decryption.
//!
//! The decoder never embeds key material; everything is supplied through the
//! [`KeyStore`] capability. [`KeySet`] is the bundled implementation, a plain
//! data container with loaders for the well-known `prod.keys` / `title.keys`
//! text format (`name = hexvalue`, one entry per line, `;` comments).

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{KeyKind, NcaError, Result};

/// Highest master key generation understood by this crate.
pub const MAX_KEY_GENERATION: usize = 0x20;

/// Which key-area encryption key chain an NCA uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum KaekIndex {
    /// Application content (most titles).
    Application = 0,
    /// Ocean content.
    Ocean = 1,
    /// System content.
    System = 2,
}

/// Key material the decoder consumes.
pub trait KeyStore {
    /// The header XTS key pair: `(data_key, tweak_key)`.
    ///
    /// # Errors
    ///
    /// [`NcaError::MissingKey`] when the key is not provisioned.
    fn header_key_pair(&self) -> Result<([u8; 16], [u8; 16])>;

    /// The key-area encryption key for `index` at `generation`.
    ///
    /// # Errors
    ///
    /// [`NcaError::MissingKey`] when the key is not provisioned.
    fn application_key(&self, index: KaekIndex, generation: u8) -> Result<[u8; 16]>;

    /// The title-key encryption key at `master_key_rev`.
    ///
    /// # Errors
    ///
    /// [`NcaError::MissingKey`] when the key is not provisioned.
    fn titlekey_kek(&self, master_key_rev: u8) -> Result<[u8; 16]>;
}

/// Plain-data key container.
#[derive(Debug, Clone, Default)]
pub struct KeySet {
    header_key: Option<[u8; 32]>,
    kaek: [[Option<[u8; 16]>; MAX_KEY_GENERATION]; 3],
    titlekek: [Option<[u8; 16]>; MAX_KEY_GENERATION],
    title_keys: HashMap<[u8; 16], [u8; 16]>,
}

impl KeySet {
    /// An empty key set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the 32-byte header key (XTS data half first).
    pub fn set_header_key(&mut self, key: [u8; 32]) {
        self.header_key = Some(key);
    }

    /// Set a key-area encryption key.
    pub fn set_application_key(&mut self, index: KaekIndex, generation: u8, key: [u8; 16]) {
        if (generation as usize) < MAX_KEY_GENERATION {
            self.kaek[index as usize][generation as usize] = Some(key);
        }
    }

    /// Set a title-key encryption key.
    pub fn set_titlekey_kek(&mut self, master_key_rev: u8, key: [u8; 16]) {
        if (master_key_rev as usize) < MAX_KEY_GENERATION {
            self.titlekek[master_key_rev as usize] = Some(key);
        }
    }

    /// Register a pre-decrypted title key for a rights ID.
    pub fn insert_title_key(&mut self, rights_id: [u8; 16], key: [u8; 16]) {
        self.title_keys.insert(rights_id, key);
    }

    /// Look up a pre-decrypted title key by rights ID.
    #[must_use]
    pub fn title_key(&self, rights_id: &[u8; 16]) -> Option<[u8; 16]> {
        self.title_keys.get(rights_id).copied()
    }

    /// Load keys from a `prod.keys`-style reader.
    ///
    /// Recognised names: `header_key`,
    /// `key_area_key_{application,ocean,system}_XX` and `titlekek_XX` (XX is
    /// a hex generation). Unknown names are skipped so newer key files keep
    /// loading.
    ///
    /// # Errors
    ///
    /// Only I/O failures from the reader; malformed lines are skipped.
    pub fn load_prod_keys<R: Read>(&mut self, reader: R) -> Result<()> {
        for line in BufReader::new(reader).lines() {
            let line = line.map_err(NcaError::Io)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim());

            if name == "header_key" {
                if let Some(key) = decode_hex::<32>(value) {
                    self.header_key = Some(key);
                }
                continue;
            }

            if let Some(gen_str) = name.strip_prefix("titlekek_") {
                if let (Ok(generation), Some(key)) =
                    (u8::from_str_radix(gen_str, 16), decode_hex::<16>(value))
                {
                    self.set_titlekey_kek(generation, key);
                }
                continue;
            }

            for (index, prefix) in [
                (KaekIndex::Application, "key_area_key_application_"),
                (KaekIndex::Ocean, "key_area_key_ocean_"),
                (KaekIndex::System, "key_area_key_system_"),
            ] {
                if let Some(gen_str) = name.strip_prefix(prefix) {
                    if let (Ok(generation), Some(key)) =
                        (u8::from_str_radix(gen_str, 16), decode_hex::<16>(value))
                    {
                        self.set_application_key(index, generation, key);
                    }
                }
            }
        }
        Ok(())
    }

    /// Load title keys from a `title.keys`-style reader.
    ///
    /// Each line: `<32-hex rights_id> = <32-hex title_key>`.
    ///
    /// # Errors
    ///
    /// Only I/O failures from the reader; malformed lines are skipped.
    pub fn load_title_keys<R: Read>(&mut self, reader: R) -> Result<()> {
        for line in BufReader::new(reader).lines() {
            let line = line.map_err(NcaError::Io)?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            let Some((rights, key)) = line.split_once('=') else {
                continue;
            };
            if let (Some(rights), Some(key)) =
                (decode_hex::<16>(rights.trim()), decode_hex::<16>(key.trim()))
            {
                self.title_keys.insert(rights, key);
            }
        }
        Ok(())
    }
}

impl KeyStore for KeySet {
    fn header_key_pair(&self) -> Result<([u8; 16], [u8; 16])> {
        let key = self.header_key.ok_or(NcaError::MissingKey {
            kind: KeyKind::Header,
            index: 0,
        })?;
        let mut data = [0u8; 16];
        let mut tweak = [0u8; 16];
        data.copy_from_slice(&key[..16]);
        tweak.copy_from_slice(&key[16..]);
        Ok((data, tweak))
    }

    fn application_key(&self, index: KaekIndex, generation: u8) -> Result<[u8; 16]> {
        self.kaek[index as usize]
            .get(generation as usize)
            .copied()
            .flatten()
            .ok_or(NcaError::MissingKey {
                kind: KeyKind::Application,
                index: generation,
            })
    }

    fn titlekey_kek(&self, master_key_rev: u8) -> Result<[u8; 16]> {
        self.titlekek
            .get(master_key_rev as usize)
            .copied()
            .flatten()
            .ok_or(NcaError::MissingKey {
                kind: KeyKind::TitlekeyKek,
                index: master_key_rev,
            })
    }
}

fn decode_hex<const N: usize>(s: &str) -> Option<[u8; N]> {
    if s.len() != N * 2 || !s.is_ascii() {
        return None;
    }
    let mut out = [0u8; N];
    for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
        let hi = hex_nibble(chunk[0])?;
        let lo = hex_nibble(chunk[1])?;
        out[i] = (hi << 4) | lo;
    }
    Some(out)
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_prod_keys_text() {
        let text = "\
; comment line
header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f

key_area_key_application_00 = aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa
key_area_key_ocean_03       = bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb
titlekek_01                 = cccccccccccccccccccccccccccccccc
some_future_key             = dddddddddddddddddddddddddddddddd
not a key line
";
        let mut keys = KeySet::new();
        keys.load_prod_keys(text.as_bytes()).unwrap();

        let (data, tweak) = keys.header_key_pair().unwrap();
        assert_eq!(data[0], 0x00);
        assert_eq!(data[15], 0x0F);
        assert_eq!(tweak[0], 0x10);
        assert_eq!(tweak[15], 0x1F);

        assert_eq!(
            keys.application_key(KaekIndex::Application, 0).unwrap(),
            [0xAA; 16]
        );
        assert_eq!(keys.application_key(KaekIndex::Ocean, 3).unwrap(), [0xBB; 16]);
        assert_eq!(keys.titlekey_kek(1).unwrap(), [0xCC; 16]);

        assert!(matches!(
            keys.application_key(KaekIndex::System, 0),
            Err(NcaError::MissingKey {
                kind: KeyKind::Application,
                index: 0,
            })
        ));
    }

    #[test]
    fn loads_title_keys_text() {
        let text = "00112233445566778899aabbccddeeff = ffeeddccbbaa99887766554433221100\n";
        let mut keys = KeySet::new();
        keys.load_title_keys(text.as_bytes()).unwrap();

        let rights_id = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xAA, 0xBB, 0xCC, 0xDD,
            0xEE, 0xFF,
        ];
        let key = keys.title_key(&rights_id).unwrap();
        assert_eq!(key[0], 0xFF);
        assert_eq!(key[15], 0x00);
    }
}
