//! On-read integrity verification for section data.
//!
//! RomFS-flavored sections carry a multi-level IVFC hash tree; PFS0-flavored
//! sections carry a single hash table plus a master hash. Both are verified
//! lazily: only the blocks covering the bytes a consumer actually reads are
//! hashed, and recently verified blocks are remembered in a small LRU so
//! repeated reads of hot regions do not re-hash.
//!
//! Verifiers never read storage themselves; the caller supplies a fetch
//! callback yielding decrypted (but unverified) section bytes.

use std::collections::VecDeque;
use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};

use nxk_secure::hash::sha256;

use crate::error::{NcaError, Result};

/// Magic of the IVFC header.
pub const IVFC_MAGIC: [u8; 4] = *b"IVFC";

/// Number of level descriptors in the IVFC header.
pub const IVFC_MAX_LEVELS: usize = 6;

/// Size of one hash-table entry.
const HASH_SIZE: u64 = 0x20;

/// Capacity of the verified-block cache.
const VERIFIED_CACHE_SIZE: usize = 16;

/// Fetches `len` decrypted bytes at a section-relative offset.
pub type FetchFn<'a> = dyn FnMut(u64, usize) -> Result<Vec<u8>> + 'a;

/// One IVFC level descriptor.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct IvfcLevel {
    /// Section-relative offset of the level's data.
    pub logical_offset: u64,
    /// Size of the level's data in bytes.
    pub hash_data_size: u64,
    /// Hash block size in bytes.
    #[br(pad_after = 4)]
    pub block_size: u32,
}

/// The 0xE0-byte IVFC header as stored in a RomFS/BKTR superblock.
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct IvfcHeader {
    /// `"IVFC"`.
    pub magic: [u8; 4],
    /// Format identifier.
    pub id: u32,
    /// Size of the master hash (0x20).
    pub master_hash_size: u32,
    /// Number of populated levels, data level included.
    pub num_levels: u32,
    /// Level descriptors; entries past `num_levels` are unused.
    pub levels: [IvfcLevel; IVFC_MAX_LEVELS],
    /// Root of the tree: hash of level 0's data.
    #[br(pad_before = 0x20)]
    pub master_hash: [u8; 0x20],
}

impl IvfcHeader {
    /// Parse the header from the start of a superblock blob.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] when the bytes do not form a usable
    /// IVFC header.
    pub fn parse(bytes: &[u8], nca_offset: u64) -> Result<Self> {
        let header: IvfcHeader =
            Cursor::new(bytes)
                .read_le()
                .map_err(|_| NcaError::MalformedHeader {
                    offset: nca_offset,
                    reason: "unreadable IVFC header",
                })?;
        if header.magic != IVFC_MAGIC {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "bad IVFC magic",
            });
        }
        if header.master_hash_size != 0x20 {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "unexpected IVFC master hash size",
            });
        }
        let num_levels = header.num_levels as usize;
        if !(2..=IVFC_MAX_LEVELS).contains(&num_levels) {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "IVFC level count out of range",
            });
        }
        for level in &header.levels[..num_levels] {
            if level.block_size == 0 {
                return Err(NcaError::MalformedHeader {
                    offset: nca_offset,
                    reason: "IVFC level with zero block size",
                });
            }
        }
        Ok(header)
    }
}

/// LRU set of already verified blocks, keyed by `(level, block_index)`.
#[derive(Debug, Default)]
struct VerifiedCache {
    entries: VecDeque<(u32, u64)>,
}

impl VerifiedCache {
    fn contains(&self, level: u32, block: u64) -> bool {
        self.entries.contains(&(level, block))
    }

    fn insert(&mut self, level: u32, block: u64) {
        if let Some(pos) = self.entries.iter().position(|&e| e == (level, block)) {
            self.entries.remove(pos);
        } else if self.entries.len() >= VERIFIED_CACHE_SIZE {
            self.entries.pop_front();
        }
        self.entries.push_back((level, block));
    }
}

/// Lazy verifier for an IVFC tree.
#[derive(Debug)]
pub struct IvfcVerifier {
    header: IvfcHeader,
    cache: VerifiedCache,
}

impl IvfcVerifier {
    /// Wrap a parsed header.
    #[must_use]
    pub fn new(header: IvfcHeader) -> Self {
        Self {
            header,
            cache: VerifiedCache::default(),
        }
    }

    /// Index of the data level (the deepest one).
    #[must_use]
    pub fn data_level(&self) -> usize {
        self.header.num_levels as usize - 1
    }

    /// Section-relative offset of the verified data region.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.header.levels[self.data_level()].logical_offset
    }

    /// Size of the verified data region.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.header.levels[self.data_level()].hash_data_size
    }

    /// Verify every block of the data level covering `[offset, offset+len)`,
    /// materializing parent blocks up to the master hash as needed.
    /// `offset` is relative to the data level's start.
    ///
    /// # Errors
    ///
    /// [`NcaError::IntegrityFailure`] naming the level and the failing
    /// block's section-relative start; fetch errors pass through.
    pub fn verify_data(
        &mut self,
        section: usize,
        offset: u64,
        len: u64,
        fetch: &mut FetchFn<'_>,
    ) -> Result<()> {
        self.verify_level(section, self.data_level(), offset, len, fetch)
    }

    fn verify_level(
        &mut self,
        section: usize,
        level: usize,
        offset: u64,
        len: u64,
        fetch: &mut FetchFn<'_>,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let descriptor = self.header.levels[level];
        let block_size = u64::from(descriptor.block_size);

        if level == 0 {
            if self.cache.contains(0, 0) {
                return Ok(());
            }
            let size = usize::try_from(descriptor.hash_data_size).map_err(|_| {
                NcaError::MalformedHeader {
                    offset: descriptor.logical_offset,
                    reason: "oversized IVFC level",
                }
            })?;
            let mut data = fetch(descriptor.logical_offset, size)?;
            data.resize(padded_len(size as u64, block_size), 0);
            if sha256(&data) != self.header.master_hash {
                return Err(NcaError::IntegrityFailure {
                    section,
                    level: 0,
                    offset: descriptor.logical_offset,
                });
            }
            self.cache.insert(0, 0);
            return Ok(());
        }

        let first = offset / block_size;
        let last = (offset + len - 1) / block_size;
        for block in first..=last {
            if self.cache.contains(level as u32, block) {
                continue;
            }

            // The parent entry itself must be trusted before it is compared
            // against.
            let entry_offset = block * HASH_SIZE;
            self.verify_level(section, level - 1, entry_offset, HASH_SIZE, fetch)?;

            let parent = self.header.levels[level - 1];
            let expected = fetch(parent.logical_offset + entry_offset, HASH_SIZE as usize)?;

            let start = block * block_size;
            let remaining = descriptor.hash_data_size.saturating_sub(start);
            if remaining == 0 {
                return Err(NcaError::OutOfRange {
                    section,
                    offset: start,
                    length: len,
                    size: descriptor.hash_data_size,
                });
            }
            let chunk = remaining.min(block_size) as usize;
            let mut data = fetch(descriptor.logical_offset + start, chunk)?;
            data.resize(block_size as usize, 0);

            if sha256(&data)[..] != expected[..] {
                return Err(NcaError::IntegrityFailure {
                    section,
                    level: level as u32,
                    offset: descriptor.logical_offset + start,
                });
            }
            self.cache.insert(level as u32, block);
        }
        Ok(())
    }
}

/// Lazy verifier for the PFS0 hash-table scheme: a master hash over the
/// table, the table's entries over fixed-size data blocks.
#[derive(Debug)]
pub struct HashTableVerifier {
    master_hash: [u8; 0x20],
    block_size: u32,
    hash_table_offset: u64,
    hash_table_size: u64,
    data_offset: u64,
    data_size: u64,
    table_verified: bool,
    cache: VerifiedCache,
}

impl HashTableVerifier {
    /// Build a verifier from superblock fields.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on a zero block size.
    pub fn new(
        master_hash: [u8; 0x20],
        block_size: u32,
        hash_table_offset: u64,
        hash_table_size: u64,
        data_offset: u64,
        data_size: u64,
    ) -> Result<Self> {
        if block_size == 0 {
            return Err(NcaError::MalformedHeader {
                offset: hash_table_offset,
                reason: "hash table with zero block size",
            });
        }
        Ok(Self {
            master_hash,
            block_size,
            hash_table_offset,
            hash_table_size,
            data_offset,
            data_size,
            table_verified: false,
            cache: VerifiedCache::default(),
        })
    }

    /// Section-relative offset of the verified data region.
    #[must_use]
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Size of the verified data region.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Verify the blocks covering `[offset, offset+len)` of the data region.
    /// `offset` is relative to the data region's start.
    ///
    /// # Errors
    ///
    /// [`NcaError::IntegrityFailure`] with level 0 for a corrupt hash table,
    /// level 1 for a corrupt data block.
    pub fn verify_data(
        &mut self,
        section: usize,
        offset: u64,
        len: u64,
        fetch: &mut FetchFn<'_>,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }

        if !self.table_verified {
            let size = usize::try_from(self.hash_table_size).map_err(|_| {
                NcaError::MalformedHeader {
                    offset: self.hash_table_offset,
                    reason: "oversized hash table",
                }
            })?;
            let table = fetch(self.hash_table_offset, size)?;
            if sha256(&table) != self.master_hash {
                return Err(NcaError::IntegrityFailure {
                    section,
                    level: 0,
                    offset: self.hash_table_offset,
                });
            }
            self.table_verified = true;
        }

        let block_size = u64::from(self.block_size);
        let first = offset / block_size;
        let last = (offset + len - 1) / block_size;
        for block in first..=last {
            if self.cache.contains(1, block) {
                continue;
            }
            let expected = fetch(self.hash_table_offset + block * HASH_SIZE, HASH_SIZE as usize)?;

            let start = block * block_size;
            let remaining = self.data_size.saturating_sub(start);
            if remaining == 0 {
                return Err(NcaError::OutOfRange {
                    section,
                    offset: start,
                    length: len,
                    size: self.data_size,
                });
            }
            let chunk = remaining.min(block_size) as usize;
            let mut data = fetch(self.data_offset + start, chunk)?;
            data.resize(block_size as usize, 0);

            if sha256(&data)[..] != expected[..] {
                return Err(NcaError::IntegrityFailure {
                    section,
                    level: 1,
                    offset: self.data_offset + start,
                });
            }
            self.cache.insert(1, block);
        }
        Ok(())
    }
}

/// Integrity state attached to an open section.
#[derive(Debug)]
pub(crate) enum SectionIntegrity {
    /// PFS0 hash-table scheme.
    HashTable(HashTableVerifier),
    /// IVFC tree.
    Ivfc(IvfcVerifier),
}

impl SectionIntegrity {
    /// `(offset, size)` of the verified data region within the section.
    pub(crate) fn data_region(&self) -> (u64, u64) {
        match self {
            SectionIntegrity::HashTable(v) => (v.data_offset(), v.data_size()),
            SectionIntegrity::Ivfc(v) => (v.data_offset(), v.data_size()),
        }
    }

    /// Verify the data-region bytes `[offset, offset+len)` (data-relative).
    pub(crate) fn verify_data(
        &mut self,
        section: usize,
        offset: u64,
        len: u64,
        fetch: &mut FetchFn<'_>,
    ) -> Result<()> {
        match self {
            SectionIntegrity::HashTable(v) => v.verify_data(section, offset, len, fetch),
            SectionIntegrity::Ivfc(v) => v.verify_data(section, offset, len, fetch),
        }
    }
}

fn padded_len(len: u64, block_size: u64) -> usize {
    let blocks = len.div_ceil(block_size).max(1);
    (blocks * block_size) as usize
}
