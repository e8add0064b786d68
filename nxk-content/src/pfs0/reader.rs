//! PFS0 view over an archive section.

use std::io::Cursor;

use binrw::BinReaderExt;

use crate::error::{NcaError, Result};
use crate::nca::reader::ContentArchive;
use crate::nca::structs::Superblock;
use crate::storage::ContentStorage;

use super::structs::{Pfs0Entry, Pfs0Header, RawPfs0Entry, PFS0_ENTRY_SIZE, PFS0_HEADER_SIZE};

/// A parsed partition file system inside one NCA section.
///
/// Every payload read goes through the owning archive's section reader, so
/// bytes are decrypted and integrity-checked on the way out.
pub struct Pfs0View<'a, S: ContentStorage> {
    archive: &'a mut ContentArchive<S>,
    section: usize,
    entries: Vec<Pfs0Entry>,
    /// Section-relative start of the data region.
    data_offset: u64,
    /// Size of the data region in bytes.
    data_size: u64,
}

impl<'a, S: ContentStorage> Pfs0View<'a, S> {
    pub(crate) fn open(archive: &'a mut ContentArchive<S>, section: usize) -> Result<Self> {
        let (pfs0_offset, pfs0_size, nca_offset) = {
            let state = archive.section_state(section)?;
            let Superblock::Pfs0(sb) = &state.superblock else {
                return Err(NcaError::UnsupportedArchive {
                    reason: "section is not a partition file system",
                });
            };
            (sb.pfs0_offset, sb.pfs0_size, state.nca_offset)
        };
        let image_offset = nca_offset + pfs0_offset;

        let header_bytes =
            archive.read_section(section, pfs0_offset, PFS0_HEADER_SIZE as usize)?;
        let header: Pfs0Header =
            Cursor::new(&header_bytes)
                .read_le()
                .map_err(|_| {
                    archive.mark_poisoned();
                    NcaError::MalformedHeader {
                        offset: image_offset,
                        reason: "bad PFS0 magic",
                    }
                })?;

        let file_count = u64::from(header.file_count);
        let string_table_size = u64::from(header.string_table_size);
        let tables_size = PFS0_HEADER_SIZE + file_count * PFS0_ENTRY_SIZE + string_table_size;
        if tables_size > pfs0_size {
            archive.mark_poisoned();
            return Err(NcaError::MalformedHeader {
                offset: image_offset,
                reason: "PFS0 tables larger than the image",
            });
        }

        let entry_bytes = archive.read_section(
            section,
            pfs0_offset + PFS0_HEADER_SIZE,
            (file_count * PFS0_ENTRY_SIZE) as usize,
        )?;
        let string_table = archive.read_section(
            section,
            pfs0_offset + PFS0_HEADER_SIZE + file_count * PFS0_ENTRY_SIZE,
            string_table_size as usize,
        )?;

        let data_offset = pfs0_offset + tables_size;
        let data_size = pfs0_size - tables_size;

        let mut cursor = Cursor::new(&entry_bytes);
        let mut entries = Vec::with_capacity(header.file_count as usize);
        for _ in 0..header.file_count {
            let raw: RawPfs0Entry = cursor.read_le().map_err(|_| {
                archive.mark_poisoned();
                NcaError::MalformedHeader {
                    offset: image_offset,
                    reason: "truncated PFS0 entry table",
                }
            })?;
            let name = read_table_name(&string_table, raw.name_offset, image_offset)
                .map_err(|e| {
                    archive.mark_poisoned();
                    e
                })?;
            let fits = raw
                .file_offset
                .checked_add(raw.file_size)
                .is_some_and(|end| end <= data_size);
            if !fits {
                archive.mark_poisoned();
                return Err(NcaError::MalformedHeader {
                    offset: image_offset,
                    reason: "PFS0 entry outside the data region",
                });
            }
            entries.push(Pfs0Entry {
                name,
                offset: raw.file_offset,
                size: raw.file_size,
            });
        }

        Ok(Self {
            archive,
            section,
            entries,
            data_offset,
            data_size,
        })
    }

    /// Index of the underlying section.
    #[must_use]
    pub fn section(&self) -> usize {
        self.section
    }

    /// Number of entries.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Entry metadata by index.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] for an out-of-range index.
    pub fn entry(&self, index: usize) -> Result<&Pfs0Entry> {
        self.entries.get(index).ok_or(NcaError::NotFound)
    }

    /// All entries in declaration order.
    pub fn entries(&self) -> impl Iterator<Item = &Pfs0Entry> {
        self.entries.iter()
    }

    /// Find an entry by name.
    #[must_use]
    pub fn entry_by_name(&self, name: &str) -> Option<(usize, &Pfs0Entry)> {
        self.entries
            .iter()
            .enumerate()
            .find(|(_, e)| e.name == name)
    }

    /// Whether this partition looks like an ExeFS (it carries `main.npdm`).
    #[must_use]
    pub fn is_exefs(&self) -> bool {
        self.entry_by_name("main.npdm").is_some()
    }

    /// Size of the data region in bytes.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    /// Read part of an entry's payload.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] for a bad index, [`NcaError::OutOfRange`] past
    /// the entry's size, plus section read failures.
    pub fn read_entry(&mut self, index: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        let entry = self.entries.get(index).ok_or(NcaError::NotFound)?;
        if offset > entry.size || length as u64 > entry.size - offset {
            return Err(NcaError::OutOfRange {
                section: self.section,
                offset,
                length: length as u64,
                size: entry.size,
            });
        }
        let start = self.data_offset + entry.offset + offset;
        self.archive.read_section(self.section, start, length)
    }

    /// Read an entry's whole payload.
    ///
    /// # Errors
    ///
    /// As [`Self::read_entry`].
    pub fn read_entry_all(&mut self, index: usize) -> Result<Vec<u8>> {
        let size = self.entries.get(index).ok_or(NcaError::NotFound)?.size;
        self.read_entry(index, 0, size as usize)
    }
}

fn read_table_name(table: &[u8], name_offset: u32, image_offset: u64) -> Result<String> {
    let start = name_offset as usize;
    if start >= table.len() {
        return Err(NcaError::MalformedHeader {
            offset: image_offset,
            reason: "PFS0 name offset outside the string table",
        });
    }
    let end = table[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| start + p)
        .ok_or(NcaError::MalformedHeader {
            offset: image_offset,
            reason: "unterminated PFS0 entry name",
        })?;
    String::from_utf8(table[start..end].to_vec()).map_err(|_| NcaError::MalformedHeader {
        offset: image_offset,
        reason: "PFS0 entry name is not valid UTF-8",
    })
}
