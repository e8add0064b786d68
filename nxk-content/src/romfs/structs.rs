//! RomFS on-disk structures.
//!
//! The 0x50-byte header is ten u64 fields locating the two hash tables, the
//! two metadata tables, and the file data region. Directory and file entries
//! are variable length: fixed fields followed by the name, padded to a
//! 4-byte boundary. `0xFFFFFFFF` terminates every chain.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{NcaError, Result};

/// Size of the RomFS header.
pub const ROMFS_HEADER_SIZE: u64 = 0x50;

/// Chain terminator / empty hash bucket.
pub const ROMFS_ENTRY_NONE: u32 = 0xFFFF_FFFF;

/// Fixed-field size of a directory entry (name excluded).
pub const ROMFS_DIR_ENTRY_SIZE: usize = 0x18;

/// Fixed-field size of a file entry (name excluded).
pub const ROMFS_FILE_ENTRY_SIZE: usize = 0x20;

/// The RomFS header; offsets are relative to the image start.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct RomfsHeader {
    /// Header size, 0x50.
    pub header_size: u64,
    /// Directory hash-bucket table.
    pub dir_hash_table_offset: u64,
    /// Size of the directory hash-bucket table.
    pub dir_hash_table_size: u64,
    /// Directory metadata table.
    pub dir_table_offset: u64,
    /// Size of the directory metadata table.
    pub dir_table_size: u64,
    /// File hash-bucket table.
    pub file_hash_table_offset: u64,
    /// Size of the file hash-bucket table.
    pub file_hash_table_size: u64,
    /// File metadata table.
    pub file_table_offset: u64,
    /// Size of the file metadata table.
    pub file_table_size: u64,
    /// File data region.
    pub file_data_offset: u64,
}

impl RomfsHeader {
    /// Parse and sanity-check the header.
    ///
    /// `nca_offset` locates the image for error reporting.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on an unexpected shape.
    pub fn parse(bytes: &[u8], nca_offset: u64) -> Result<Self> {
        let header: RomfsHeader =
            Cursor::new(bytes)
                .read_le()
                .map_err(|_| NcaError::MalformedHeader {
                    offset: nca_offset,
                    reason: "truncated RomFS header",
                })?;
        if header.header_size != ROMFS_HEADER_SIZE {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "unexpected RomFS header size",
            });
        }
        if header.dir_hash_table_size % 4 != 0 || header.file_hash_table_size % 4 != 0 {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "RomFS hash table size not a bucket multiple",
            });
        }
        Ok(header)
    }
}

/// A directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomfsDirEntry {
    /// Offset of this entry within the directory table.
    pub offset: u32,
    /// Offset of the parent directory entry.
    pub parent: u32,
    /// Next sibling directory, or [`ROMFS_ENTRY_NONE`].
    pub sibling: u32,
    /// First child directory, or [`ROMFS_ENTRY_NONE`].
    pub child_dir: u32,
    /// First child file, or [`ROMFS_ENTRY_NONE`].
    pub child_file: u32,
    /// Next entry in the same hash bucket, or [`ROMFS_ENTRY_NONE`].
    pub hash_sibling: u32,
    /// Entry name; empty for the root.
    pub name: String,
}

/// A file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomfsFileEntry {
    /// Offset of this entry within the file table.
    pub offset: u32,
    /// Offset of the parent directory entry.
    pub parent: u32,
    /// Next sibling file, or [`ROMFS_ENTRY_NONE`].
    pub sibling: u32,
    /// Payload offset relative to the file data region.
    pub data_offset: u64,
    /// Payload size in bytes.
    pub data_size: u64,
    /// Next entry in the same hash bucket, or [`ROMFS_ENTRY_NONE`].
    pub hash_sibling: u32,
    /// Entry name.
    pub name: String,
}

/// The on-disk name hash: seed with the parent entry offset, then rotate
/// and fold in each name byte.
#[must_use]
pub fn entry_hash(parent: u32, name: &[u8]) -> u32 {
    let mut hash = parent ^ 123_456_789;
    for &byte in name {
        hash = hash.rotate_right(5);
        hash ^= u32::from(byte);
    }
    hash
}

fn parse_name(
    table: &[u8],
    name_offset: usize,
    name_length: usize,
    nca_offset: u64,
) -> Result<String> {
    let end = name_offset.checked_add(name_length).filter(|&e| e <= table.len());
    let Some(end) = end else {
        return Err(NcaError::MalformedHeader {
            offset: nca_offset,
            reason: "entry name runs past its table",
        });
    };
    String::from_utf8(table[name_offset..end].to_vec()).map_err(|_| NcaError::MalformedHeader {
        offset: nca_offset,
        reason: "entry name is not valid UTF-8",
    })
}

/// Parse the directory entry at `offset` within the directory table.
///
/// # Errors
///
/// [`NcaError::MalformedHeader`] on truncation or a bad name.
pub fn parse_dir_entry(table: &[u8], offset: u32, nca_offset: u64) -> Result<RomfsDirEntry> {
    let start = offset as usize;
    if start + ROMFS_DIR_ENTRY_SIZE > table.len() {
        return Err(NcaError::MalformedHeader {
            offset: nca_offset,
            reason: "directory entry outside its table",
        });
    }
    let mut cursor = Cursor::new(&table[start..]);
    let parent = cursor.read_u32::<LittleEndian>()?;
    let sibling = cursor.read_u32::<LittleEndian>()?;
    let child_dir = cursor.read_u32::<LittleEndian>()?;
    let child_file = cursor.read_u32::<LittleEndian>()?;
    let hash_sibling = cursor.read_u32::<LittleEndian>()?;
    let name_length = cursor.read_u32::<LittleEndian>()? as usize;
    let name = parse_name(table, start + ROMFS_DIR_ENTRY_SIZE, name_length, nca_offset)?;

    Ok(RomfsDirEntry {
        offset,
        parent,
        sibling,
        child_dir,
        child_file,
        hash_sibling,
        name,
    })
}

/// Parse the file entry at `offset` within the file table.
///
/// # Errors
///
/// [`NcaError::MalformedHeader`] on truncation or a bad name.
pub fn parse_file_entry(table: &[u8], offset: u32, nca_offset: u64) -> Result<RomfsFileEntry> {
    let start = offset as usize;
    if start + ROMFS_FILE_ENTRY_SIZE > table.len() {
        return Err(NcaError::MalformedHeader {
            offset: nca_offset,
            reason: "file entry outside its table",
        });
    }
    let mut cursor = Cursor::new(&table[start..]);
    let parent = cursor.read_u32::<LittleEndian>()?;
    let sibling = cursor.read_u32::<LittleEndian>()?;
    let data_offset = cursor.read_u64::<LittleEndian>()?;
    let data_size = cursor.read_u64::<LittleEndian>()?;
    let hash_sibling = cursor.read_u32::<LittleEndian>()?;
    let name_length = cursor.read_u32::<LittleEndian>()? as usize;
    let name = parse_name(table, start + ROMFS_FILE_ENTRY_SIZE, name_length, nca_offset)?;

    Ok(RomfsFileEntry {
        offset,
        parent,
        sibling,
        data_offset,
        data_size,
        hash_sibling,
        name,
    })
}
