//! RomFS view: table navigation, hash-chain path resolution, file reads.
//!
//! The view works identically over a plain RomFS section and over a patch
//! section's virtual image; the owning archive's section reader hides the
//! difference.

use crate::error::{NcaError, Result};
use crate::nca::reader::ContentArchive;
use crate::nca::structs::{CryptType, Superblock};
use crate::storage::ContentStorage;

use super::structs::{
    entry_hash, parse_dir_entry, parse_file_entry, RomfsDirEntry, RomfsFileEntry, RomfsHeader,
    ROMFS_ENTRY_NONE, ROMFS_HEADER_SIZE,
};

/// A parsed RomFS inside one NCA section (or patched virtual image).
pub struct RomfsView<'a, S: ContentStorage> {
    archive: &'a mut ContentArchive<S>,
    section: usize,
    header: RomfsHeader,
    /// Image start within the section's readable space.
    image_offset: u64,
    dir_hash: Vec<u32>,
    file_hash: Vec<u32>,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,
    /// NCA-relative image offset, for error reporting.
    nca_offset: u64,
}

impl<'a, S: ContentStorage> RomfsView<'a, S> {
    pub(crate) fn open(archive: &'a mut ContentArchive<S>, section: usize) -> Result<Self> {
        let (image_offset, nca_offset, crypt_type) = {
            let state = archive.section_state(section)?;
            let ivfc = match &state.superblock {
                Superblock::Romfs(sb) => &sb.ivfc,
                Superblock::Bktr(sb) => &sb.ivfc,
                Superblock::Pfs0(_) => {
                    return Err(NcaError::UnsupportedArchive {
                        reason: "section is not a RomFS",
                    })
                }
            };
            let data_level = ivfc.num_levels as usize - 1;
            (
                ivfc.levels[data_level].logical_offset,
                state.nca_offset,
                state.crypt_type,
            )
        };
        if crypt_type == CryptType::Bktr && !archive.has_base() {
            return Err(NcaError::NotFound);
        }
        let image_nca_offset = nca_offset + image_offset;

        let header_bytes =
            archive.read_section(section, image_offset, ROMFS_HEADER_SIZE as usize)?;
        let header = RomfsHeader::parse(&header_bytes, image_nca_offset).map_err(|e| {
            archive.mark_poisoned();
            e
        })?;

        let dir_hash = read_hash_table(
            archive,
            section,
            image_offset + header.dir_hash_table_offset,
            header.dir_hash_table_size,
        )?;
        let file_hash = read_hash_table(
            archive,
            section,
            image_offset + header.file_hash_table_offset,
            header.file_hash_table_size,
        )?;
        let dir_table = archive.read_section(
            section,
            image_offset + header.dir_table_offset,
            header.dir_table_size as usize,
        )?;
        let file_table = archive.read_section(
            section,
            image_offset + header.file_table_offset,
            header.file_table_size as usize,
        )?;

        Ok(Self {
            archive,
            section,
            header,
            image_offset,
            dir_hash,
            file_hash,
            dir_table,
            file_table,
            nca_offset: image_nca_offset,
        })
    }

    /// Index of the underlying section.
    #[must_use]
    pub fn section(&self) -> usize {
        self.section
    }

    /// The root directory entry.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] when the directory table is unusable.
    pub fn root(&self) -> Result<RomfsDirEntry> {
        self.dir_entry(0)
    }

    /// Directory entry at a table offset.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on a bad offset.
    pub fn dir_entry(&self, offset: u32) -> Result<RomfsDirEntry> {
        parse_dir_entry(&self.dir_table, offset, self.nca_offset)
    }

    /// File entry at a table offset.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on a bad offset.
    pub fn file_entry(&self, offset: u32) -> Result<RomfsFileEntry> {
        parse_file_entry(&self.file_table, offset, self.nca_offset)
    }

    /// Child directories and files of `dir`, in table order.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on corrupt chains.
    pub fn list_dir(
        &self,
        dir: &RomfsDirEntry,
    ) -> Result<(Vec<RomfsDirEntry>, Vec<RomfsFileEntry>)> {
        let mut dirs = Vec::new();
        let mut offset = dir.child_dir;
        let mut steps = self.chain_cap(self.dir_table.len());
        while offset != ROMFS_ENTRY_NONE {
            self.chain_step(&mut steps)?;
            let entry = self.dir_entry(offset)?;
            offset = entry.sibling;
            dirs.push(entry);
        }

        let mut files = Vec::new();
        let mut offset = dir.child_file;
        let mut steps = self.chain_cap(self.file_table.len());
        while offset != ROMFS_ENTRY_NONE {
            self.chain_step(&mut steps)?;
            let entry = self.file_entry(offset)?;
            offset = entry.sibling;
            files.push(entry);
        }

        Ok((dirs, files))
    }

    /// Resolve a directory by absolute path (`/` separators, leading slash
    /// optional).
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] when a component does not exist.
    pub fn resolve_dir(&self, path: &str) -> Result<RomfsDirEntry> {
        let mut current = self.root()?;
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let offset = self
                .find_child_dir(&current, component)?
                .ok_or(NcaError::NotFound)?;
            current = self.dir_entry(offset)?;
        }
        Ok(current)
    }

    /// Resolve a file by absolute path.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] when the file (or a directory on the way) does
    /// not exist.
    pub fn resolve_file(&self, path: &str) -> Result<RomfsFileEntry> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let (file_name, dir_components) = components.split_last().ok_or(NcaError::NotFound)?;

        let mut current = self.root()?;
        for component in dir_components {
            let offset = self
                .find_child_dir(&current, component)?
                .ok_or(NcaError::NotFound)?;
            current = self.dir_entry(offset)?;
        }
        let offset = self
            .find_child_file(&current, file_name)?
            .ok_or(NcaError::NotFound)?;
        self.file_entry(offset)
    }

    /// Read part of a file's payload.
    ///
    /// # Errors
    ///
    /// [`NcaError::OutOfRange`] past the file's size, plus section read
    /// failures (integrity included).
    pub fn read_file(
        &mut self,
        entry: &RomfsFileEntry,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        if offset > entry.data_size || length as u64 > entry.data_size - offset {
            return Err(NcaError::OutOfRange {
                section: self.section,
                offset,
                length: length as u64,
                size: entry.data_size,
            });
        }
        let start =
            self.image_offset + self.header.file_data_offset + entry.data_offset + offset;
        self.archive.read_section(self.section, start, length)
    }

    /// Read a file's whole payload.
    ///
    /// # Errors
    ///
    /// As [`Self::read_file`].
    pub fn read_file_all(&mut self, entry: &RomfsFileEntry) -> Result<Vec<u8>> {
        self.read_file(entry, 0, entry.data_size as usize)
    }

    /// Find a child directory by name: hash-bucket chain first, then a
    /// linear sibling walk as fallback.
    fn find_child_dir(&self, parent: &RomfsDirEntry, name: &str) -> Result<Option<u32>> {
        if !self.dir_hash.is_empty() {
            let bucket = entry_hash(parent.offset, name.as_bytes())
                % u32::try_from(self.dir_hash.len()).unwrap_or(u32::MAX);
            let mut offset = self.dir_hash[bucket as usize];
            let mut steps = self.chain_cap(self.dir_table.len());
            while offset != ROMFS_ENTRY_NONE {
                self.chain_step(&mut steps)?;
                let entry = self.dir_entry(offset)?;
                if entry.parent == parent.offset && entry.name == name {
                    return Ok(Some(offset));
                }
                offset = entry.hash_sibling;
            }
        }

        let mut offset = parent.child_dir;
        let mut steps = self.chain_cap(self.dir_table.len());
        while offset != ROMFS_ENTRY_NONE {
            self.chain_step(&mut steps)?;
            let entry = self.dir_entry(offset)?;
            if entry.name == name {
                return Ok(Some(offset));
            }
            offset = entry.sibling;
        }
        Ok(None)
    }

    /// Find a child file by name, same strategy as directories.
    fn find_child_file(&self, parent: &RomfsDirEntry, name: &str) -> Result<Option<u32>> {
        if !self.file_hash.is_empty() {
            let bucket = entry_hash(parent.offset, name.as_bytes())
                % u32::try_from(self.file_hash.len()).unwrap_or(u32::MAX);
            let mut offset = self.file_hash[bucket as usize];
            let mut steps = self.chain_cap(self.file_table.len());
            while offset != ROMFS_ENTRY_NONE {
                self.chain_step(&mut steps)?;
                let entry = self.file_entry(offset)?;
                if entry.parent == parent.offset && entry.name == name {
                    return Ok(Some(offset));
                }
                offset = entry.hash_sibling;
            }
        }

        let mut offset = parent.child_file;
        let mut steps = self.chain_cap(self.file_table.len());
        while offset != ROMFS_ENTRY_NONE {
            self.chain_step(&mut steps)?;
            let entry = self.file_entry(offset)?;
            if entry.name == name {
                return Ok(Some(offset));
            }
            offset = entry.sibling;
        }
        Ok(None)
    }

    /// A chain can hold at most one entry per minimal record size.
    fn chain_cap(&self, table_len: usize) -> usize {
        table_len / 0x18 + 1
    }

    fn chain_step(&self, steps: &mut usize) -> Result<()> {
        if *steps == 0 {
            return Err(NcaError::MalformedHeader {
                offset: self.nca_offset,
                reason: "entry chain longer than its table",
            });
        }
        *steps -= 1;
        Ok(())
    }
}

fn read_hash_table<S: ContentStorage>(
    archive: &mut ContentArchive<S>,
    section: usize,
    offset: u64,
    size: u64,
) -> Result<Vec<u32>> {
    let bytes = archive.read_section(section, offset, size as usize)?;
    Ok(bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}
