//! Bucket-tree relocation and subsection blocks.
//!
//! Both blocks share one shape: a 0x4000-byte header
//! `{u32 reserved, u32 num_buckets, u64 total_size, u64 bucket_offsets[…]}`
//! followed by `num_buckets` fixed 0x4000-byte buckets
//! `{u32 reserved, u32 num_entries, u64 end_offset, entries…}`.
//! Relocation entries are 0x14 bytes (`u64 virt, u64 phys, u32 is_patch`),
//! subsection entries 0x10 bytes (`u64 offset, u32 reserved, u32 ctr_val`).
//!
//! Entries within a bucket are sorted ascending; bucket `k`'s end offset is
//! the first entry offset of bucket `k+1`. Violations fail at parse time.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{NcaError, Result};

/// Size of a block header and of every bucket.
pub const BKTR_BLOCK_ALIGN: usize = 0x4000;

/// Capacity of the bucket-offset array in a block header.
pub const BKTR_MAX_BUCKETS: usize = 0x3FF0 / 8;

/// Relocation entries per bucket.
pub const RELOCATION_BUCKET_CAPACITY: usize = 0x3FF0 / 0x14;

/// Subsection entries per bucket.
pub const SUBSECTION_BUCKET_CAPACITY: usize = 0x3FF;

/// One relocation: a run of virtual offsets and where it is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelocationEntry {
    /// First virtual offset the entry covers.
    pub virt_offset: u64,
    /// Matching physical offset in the source.
    pub phys_offset: u64,
    /// Source: `true` = patch section, `false` = base RomFS.
    pub is_patch: bool,
}

/// One bucket of relocation entries.
#[derive(Debug, Clone)]
pub struct RelocationBucket {
    /// One past the last virtual offset this bucket covers.
    pub end_offset: u64,
    /// Entries sorted ascending by `virt_offset`.
    pub entries: Vec<RelocationEntry>,
}

/// The parsed relocation block.
#[derive(Debug, Clone)]
pub struct RelocationBlock {
    /// Size of the virtual space the block maps.
    pub total_size: u64,
    /// First virtual offset of each bucket, for the bucket search.
    pub bucket_starts: Vec<u64>,
    /// The buckets themselves.
    pub buckets: Vec<RelocationBucket>,
}

/// One subsection: a run of patch-physical offsets sharing a counter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubsectionEntry {
    /// First physical offset the entry covers.
    pub offset: u64,
    /// Replaces the low half of the counter's upper 64 bits.
    pub ctr_val: u32,
}

/// One bucket of subsection entries.
#[derive(Debug, Clone)]
pub struct SubsectionBucket {
    /// One past the last physical offset this bucket covers.
    pub end_offset: u64,
    /// Entries sorted ascending by `offset`.
    pub entries: Vec<SubsectionEntry>,
}

/// The parsed subsection block.
#[derive(Debug, Clone)]
pub struct SubsectionBlock {
    /// Size of the physical space the block covers.
    pub total_size: u64,
    /// First physical offset of each bucket.
    pub bucket_starts: Vec<u64>,
    /// The buckets themselves.
    pub buckets: Vec<SubsectionBucket>,
}

fn malformed(nca_offset: u64, reason: &'static str) -> NcaError {
    NcaError::MalformedHeader {
        offset: nca_offset,
        reason,
    }
}

/// Common block-header parse: bucket count, total size, bucket offsets.
fn parse_block_header(
    bytes: &[u8],
    nca_offset: u64,
) -> Result<(usize, u64, Vec<u64>)> {
    if bytes.len() < BKTR_BLOCK_ALIGN {
        return Err(malformed(nca_offset, "truncated bucket block header"));
    }
    let mut cursor = Cursor::new(bytes);
    let _reserved = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed(nca_offset, "truncated bucket block header"))?;
    let num_buckets = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| malformed(nca_offset, "truncated bucket block header"))?
        as usize;
    let total_size = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| malformed(nca_offset, "truncated bucket block header"))?;

    if num_buckets == 0 || num_buckets > BKTR_MAX_BUCKETS {
        return Err(malformed(nca_offset, "bucket count out of range"));
    }
    if bytes.len() < BKTR_BLOCK_ALIGN * (1 + num_buckets) {
        return Err(malformed(nca_offset, "bucket block shorter than its bucket count"));
    }

    let mut starts = Vec::with_capacity(num_buckets);
    for _ in 0..num_buckets {
        starts.push(
            cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated bucket offset table"))?,
        );
    }
    if starts.windows(2).any(|w| w[0] >= w[1]) {
        return Err(malformed(nca_offset, "bucket offsets are not ascending"));
    }
    Ok((num_buckets, total_size, starts))
}

impl RelocationBlock {
    /// Parse a relocation block from its raw (decrypted) bytes.
    ///
    /// `nca_offset` locates the owning FS header for error reporting.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on truncation, capacity overflow, or
    /// non-monotonic offsets.
    pub fn parse(bytes: &[u8], nca_offset: u64) -> Result<Self> {
        let (num_buckets, total_size, bucket_starts) = parse_block_header(bytes, nca_offset)?;

        let mut buckets = Vec::with_capacity(num_buckets);
        for bucket_index in 0..num_buckets {
            let base = BKTR_BLOCK_ALIGN * (1 + bucket_index);
            let mut cursor = Cursor::new(&bytes[base..base + BKTR_BLOCK_ALIGN]);
            let _reserved = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated relocation bucket"))?;
            let num_entries = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated relocation bucket"))?
                as usize;
            let end_offset = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated relocation bucket"))?;

            if num_entries == 0 || num_entries > RELOCATION_BUCKET_CAPACITY {
                return Err(malformed(nca_offset, "relocation entry count out of range"));
            }

            let mut entries = Vec::with_capacity(num_entries);
            for _ in 0..num_entries {
                let virt_offset = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| malformed(nca_offset, "truncated relocation entry"))?;
                let phys_offset = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| malformed(nca_offset, "truncated relocation entry"))?;
                let is_patch = match cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| malformed(nca_offset, "truncated relocation entry"))?
                {
                    0 => false,
                    1 => true,
                    _ => return Err(malformed(nca_offset, "relocation source out of domain")),
                };
                entries.push(RelocationEntry {
                    virt_offset,
                    phys_offset,
                    is_patch,
                });
            }

            if entries.windows(2).any(|w| w[0].virt_offset >= w[1].virt_offset) {
                return Err(malformed(nca_offset, "relocation entries are not ascending"));
            }
            if entries[0].virt_offset != bucket_starts[bucket_index] {
                return Err(malformed(nca_offset, "bucket start disagrees with first entry"));
            }
            if end_offset <= entries[entries.len() - 1].virt_offset {
                return Err(malformed(nca_offset, "bucket end precedes its last entry"));
            }

            buckets.push(RelocationBucket {
                end_offset,
                entries,
            });
        }

        Ok(Self {
            total_size,
            bucket_starts,
            buckets,
        })
    }

    /// Locate the entry covering `virt` and the end of its covered span.
    ///
    /// # Errors
    ///
    /// [`NcaError::OutOfRange`] when `virt` falls outside the mapped space.
    pub fn lookup(&self, section: usize, virt: u64) -> Result<(RelocationEntry, u64)> {
        if virt >= self.total_size {
            return Err(NcaError::OutOfRange {
                section,
                offset: virt,
                length: 0,
                size: self.total_size,
            });
        }
        let bucket_index = self
            .bucket_starts
            .partition_point(|&start| start <= virt)
            .saturating_sub(1);
        let bucket = &self.buckets[bucket_index];
        let entry_index = bucket
            .entries
            .partition_point(|e| e.virt_offset <= virt)
            .saturating_sub(1);
        let entry = bucket.entries[entry_index];
        let span_end = bucket
            .entries
            .get(entry_index + 1)
            .map_or(bucket.end_offset.min(self.total_size), |e| e.virt_offset);
        if virt < entry.virt_offset || virt >= span_end {
            return Err(NcaError::OutOfRange {
                section,
                offset: virt,
                length: 0,
                size: self.total_size,
            });
        }
        Ok((entry, span_end))
    }
}

impl SubsectionBlock {
    /// Parse a subsection block from its raw (decrypted) bytes.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on truncation, capacity overflow, or
    /// non-monotonic offsets.
    pub fn parse(bytes: &[u8], nca_offset: u64) -> Result<Self> {
        let (num_buckets, total_size, bucket_starts) = parse_block_header(bytes, nca_offset)?;

        let mut buckets = Vec::with_capacity(num_buckets);
        for bucket_index in 0..num_buckets {
            let base = BKTR_BLOCK_ALIGN * (1 + bucket_index);
            let mut cursor = Cursor::new(&bytes[base..base + BKTR_BLOCK_ALIGN]);
            let _reserved = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated subsection bucket"))?;
            let num_entries = cursor
                .read_u32::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated subsection bucket"))?
                as usize;
            let end_offset = cursor
                .read_u64::<LittleEndian>()
                .map_err(|_| malformed(nca_offset, "truncated subsection bucket"))?;

            if num_entries == 0 || num_entries > SUBSECTION_BUCKET_CAPACITY {
                return Err(malformed(nca_offset, "subsection entry count out of range"));
            }

            let mut entries = Vec::with_capacity(num_entries);
            for _ in 0..num_entries {
                let offset = cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| malformed(nca_offset, "truncated subsection entry"))?;
                let _reserved = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| malformed(nca_offset, "truncated subsection entry"))?;
                let ctr_val = cursor
                    .read_u32::<LittleEndian>()
                    .map_err(|_| malformed(nca_offset, "truncated subsection entry"))?;
                entries.push(SubsectionEntry { offset, ctr_val });
            }

            if entries.windows(2).any(|w| w[0].offset >= w[1].offset) {
                return Err(malformed(nca_offset, "subsection entries are not ascending"));
            }
            if entries[0].offset != bucket_starts[bucket_index] {
                return Err(malformed(nca_offset, "bucket start disagrees with first entry"));
            }
            if end_offset <= entries[entries.len() - 1].offset {
                return Err(malformed(nca_offset, "bucket end precedes its last entry"));
            }

            buckets.push(SubsectionBucket {
                end_offset,
                entries,
            });
        }

        Ok(Self {
            total_size,
            bucket_starts,
            buckets,
        })
    }

    /// Locate the entry covering `phys` and the end of its covered span.
    ///
    /// # Errors
    ///
    /// [`NcaError::OutOfRange`] when `phys` falls outside the covered space.
    pub fn lookup(&self, section: usize, phys: u64) -> Result<(SubsectionEntry, u64)> {
        if phys >= self.total_size {
            return Err(NcaError::OutOfRange {
                section,
                offset: phys,
                length: 0,
                size: self.total_size,
            });
        }
        let bucket_index = self
            .bucket_starts
            .partition_point(|&start| start <= phys)
            .saturating_sub(1);
        let bucket = &self.buckets[bucket_index];
        let entry_index = bucket
            .entries
            .partition_point(|e| e.offset <= phys)
            .saturating_sub(1);
        let entry = bucket.entries[entry_index];
        let span_end = bucket
            .entries
            .get(entry_index + 1)
            .map_or(bucket.end_offset.min(self.total_size), |e| e.offset);
        if phys < entry.offset || phys >= span_end {
            return Err(NcaError::OutOfRange {
                section,
                offset: phys,
                length: 0,
                size: self.total_size,
            });
        }
        Ok((entry, span_end))
    }
}
