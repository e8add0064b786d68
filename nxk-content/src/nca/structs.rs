//! On-disk NCA header structures.
//!
//! Layout of the 0xC00-byte encrypted header region (after XTS decryption):
//!
//! ```text
//! [0x000] RSA-2048 fixed-key signature   (0x100)
//! [0x100] RSA-2048 NPDM signature        (0x100)
//! [0x200] Main header                    (magic, sizes, key material refs)
//! [0x400] FS header, section 0           (0x200)
//! [0x600] FS header, section 1           (0x200)
//! [0x800] FS header, section 2           (0x200)
//! [0xA00] FS header, section 3           (0x200)
//! ```
//!
//! Raw `#[derive(BinRead)]` mirrors of the packed layouts live next to the
//! owned types the rest of the crate consumes; the superblock union is
//! parsed into a tagged [`Superblock`] at decode time.

use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::{NcaError, Result};
use crate::ivfc::IvfcHeader;

/// Size of the full encrypted header region.
pub const NCA_HEADER_SIZE: usize = 0xC00;

/// Size of the main header (signatures included).
pub const NCA_MAIN_HEADER_SIZE: usize = 0x400;

/// Size of one FS section header.
pub const FS_HEADER_SIZE: usize = 0x200;

/// Number of FS sections an NCA can carry.
pub const SECTION_COUNT: usize = 4;

/// Bytes per media unit; section entries count in these.
pub const MEDIA_UNIT: u64 = 0x200;

/// Archive format revision, from the decrypted magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaVersion {
    /// `NCA2`: FS headers XTS-encrypted individually as sector 0.
    Nca2,
    /// `NCA3`: the whole header region uses contiguous sector numbers.
    Nca3,
}

impl NcaVersion {
    /// Map a decrypted magic to a supported version.
    ///
    /// # Errors
    ///
    /// [`NcaError::UnsupportedArchive`] for `NCA0`/`NCA1` and anything that
    /// is not an NCA magic at all.
    pub fn from_magic(magic: [u8; 4]) -> Result<Self> {
        match &magic {
            b"NCA2" => Ok(Self::Nca2),
            b"NCA3" => Ok(Self::Nca3),
            b"NCA0" | b"NCA1" => Err(NcaError::UnsupportedArchive {
                reason: "legacy NCA0/NCA1 header",
            }),
            _ => Err(NcaError::UnsupportedArchive {
                reason: "unrecognized header magic",
            }),
        }
    }
}

/// How the content was distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DistributionType {
    /// Downloaded from the eShop / CDN.
    Download = 0,
    /// Read from a game card.
    GameCard = 1,
}

/// What the archive contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ContentType {
    Program = 0,
    Meta = 1,
    Control = 2,
    Manual = 3,
    Data = 4,
    PublicData = 5,
}

/// File-system flavor of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FsType {
    /// Flat partition file system.
    Pfs0 = 2,
    /// Hierarchical read-only file system.
    Romfs = 3,
}

/// Cipher applied to a section's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CryptType {
    /// Stored in the clear.
    None = 1,
    /// AES-128-XTS, 0x200-byte sectors.
    Xts = 2,
    /// AES-128-CTR.
    Ctr = 3,
    /// AES-128-CTR behind a bucket-tree relocation overlay.
    Bktr = 4,
}

/// Raw section entry: media-unit bounds of one FS section.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct RawSectionEntry {
    /// First media unit of the section.
    pub media_start_offset: u32,
    /// One past the last media unit.
    #[br(pad_after = 8)]
    pub media_end_offset: u32,
}

/// Decoded section entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    /// First media unit of the section.
    pub media_start: u32,
    /// One past the last media unit.
    pub media_end: u32,
}

impl SectionEntry {
    /// Whether the entry addresses any data.
    #[must_use]
    pub fn is_present(&self) -> bool {
        self.media_end > self.media_start
    }

    /// Byte offset of the section within the NCA.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        u64::from(self.media_start) * MEDIA_UNIT
    }

    /// Byte size of the section.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        u64::from(self.media_end.saturating_sub(self.media_start)) * MEDIA_UNIT
    }
}

/// Raw main header, the 0x400 bytes at offset 0 of the decrypted region.
#[derive(Clone, BinRead)]
#[br(little)]
pub struct RawNcaHeader {
    /// Fixed-key signature over the header.
    pub fixed_key_sig: [u8; 0x100],
    /// NPDM-key signature over the header.
    pub npdm_key_sig: [u8; 0x100],
    /// `NCA2`/`NCA3`.
    pub magic: [u8; 4],
    /// Distribution discriminant.
    pub distribution: u8,
    /// Content type discriminant.
    pub content_type: u8,
    /// Key generation, first field.
    pub crypto_type: u8,
    /// Key-area encryption key index.
    pub kaek_index: u8,
    /// Total archive size in bytes.
    pub nca_size: u64,
    /// Title ID.
    pub title_id: u64,
    /// SDK version the content was built with.
    #[br(pad_before = 4)]
    pub sdk_version: u32,
    /// Key generation, second field; the effective generation is the max.
    pub crypto_type2: u8,
    /// Non-zero when the section keys come from a title key.
    #[br(pad_before = 0xF)]
    pub rights_id: [u8; 0x10],
    /// Media-unit bounds of the four sections.
    pub section_entries: [RawSectionEntry; SECTION_COUNT],
    /// SHA-256 of each section's FS header.
    pub section_hashes: [[u8; 0x20]; SECTION_COUNT],
    /// Encrypted key area.
    #[br(pad_after = 0xC0)]
    pub key_area: [[u8; 0x10]; SECTION_COUNT],
}

impl RawNcaHeader {
    /// Parse from the first 0x400 decrypted bytes.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] when the buffer is too short.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        Cursor::new(bytes)
            .read_le()
            .map_err(|_| NcaError::MalformedHeader {
                offset: 0,
                reason: "truncated main header",
            })
    }
}

/// PFS0 superblock: hash-table integrity data for a partition section.
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct Pfs0Superblock {
    /// SHA-256 of the hash table.
    pub master_hash: [u8; 0x20],
    /// Hash block size in bytes.
    pub block_size: u32,
    /// Layer count, always 2.
    pub layer_count: u32,
    /// Section-relative offset of the hash table.
    pub hash_table_offset: u64,
    /// Hash table size in bytes.
    pub hash_table_size: u64,
    /// Section-relative offset of the PFS0 image.
    pub pfs0_offset: u64,
    /// PFS0 image size in bytes.
    pub pfs0_size: u64,
}

/// RomFS superblock: an IVFC tree over the file-system image.
#[derive(Debug, Clone)]
pub struct RomfsSuperblock {
    /// Integrity tree; its data level is the RomFS image.
    pub ivfc: IvfcHeader,
}

/// Location of one BKTR block within the patch section.
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct BktrBlockInfo {
    /// Section-relative offset of the block.
    pub offset: u64,
    /// Size of the block in bytes.
    pub size: u64,
    /// `"BKTR"`.
    pub magic: [u8; 4],
    /// Block format version.
    pub version: u32,
    /// Total entry count across all buckets.
    #[br(pad_after = 4)]
    pub num_entries: u32,
}

impl BktrBlockInfo {
    /// Check the magic and that the block lies inside the section.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on violation.
    pub fn validate(&self, section_size: u64, nca_offset: u64) -> Result<()> {
        if self.magic != *b"BKTR" {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "bad BKTR block magic",
            });
        }
        let fits = self
            .offset
            .checked_add(self.size)
            .is_some_and(|end| end <= section_size);
        if !fits {
            return Err(NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "BKTR block outside its section",
            });
        }
        Ok(())
    }
}

/// BKTR superblock: IVFC over the virtual image plus the two bucket blocks.
#[derive(Debug, Clone)]
pub struct BktrSuperblock {
    /// Integrity tree over the *virtual* (patched) image.
    pub ivfc: IvfcHeader,
    /// Relocation block location.
    pub relocation: BktrBlockInfo,
    /// Subsection block location.
    pub subsection: BktrBlockInfo,
}

/// Parsed FS-specific superblock.
#[derive(Debug, Clone)]
pub enum Superblock {
    /// Partition file system.
    Pfs0(Pfs0Superblock),
    /// Plain RomFS.
    Romfs(RomfsSuperblock),
    /// Patched RomFS.
    Bktr(BktrSuperblock),
}

/// Raw FS header, one 0x200-byte record per section.
#[derive(Clone, BinRead)]
#[br(little)]
pub struct RawFsHeader {
    /// FS header format version.
    pub version: u16,
    /// Partition discriminant.
    pub partition_type: u8,
    /// File-system flavor discriminant.
    pub fs_type: u8,
    /// Cipher discriminant.
    pub crypt_type: u8,
    /// FS-specific superblock bytes, shape selected by the discriminants.
    #[br(pad_before = 3)]
    pub superblock: [u8; 0x138],
    /// Low half of the section counter seed.
    pub section_ctr_low: u32,
    /// High half of the section counter seed.
    pub section_ctr_high: u32,
}

/// Decoded FS header.
#[derive(Debug, Clone)]
pub struct FsHeader {
    /// FS header format version.
    pub version: u16,
    /// Partition discriminant (raw).
    pub partition_type: u8,
    /// File-system flavor.
    pub fs_type: FsType,
    /// Cipher mode of the section body.
    pub crypt_type: CryptType,
    /// Low half of the section counter seed.
    pub section_ctr_low: u32,
    /// High half of the section counter seed.
    pub section_ctr_high: u32,
    /// FS-specific superblock.
    pub superblock: Superblock,
}

impl FsHeader {
    /// Parse one decrypted 0x200-byte FS header.
    ///
    /// `nca_offset` is the header's byte offset inside the NCA, used for
    /// error reporting.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] on truncation or superblock layout
    /// violations, [`NcaError::UnsupportedArchive`] on unknown
    /// discriminants.
    pub fn parse(bytes: &[u8], nca_offset: u64) -> Result<Self> {
        let raw: RawFsHeader =
            Cursor::new(bytes)
                .read_le()
                .map_err(|_| NcaError::MalformedHeader {
                    offset: nca_offset,
                    reason: "truncated FS header",
                })?;

        let fs_type = FsType::try_from(raw.fs_type).map_err(|_| NcaError::UnsupportedArchive {
            reason: "unknown section file-system type",
        })?;
        let crypt_type =
            CryptType::try_from(raw.crypt_type).map_err(|_| NcaError::UnsupportedArchive {
                reason: "unknown section cipher type",
            })?;

        let superblock = match (fs_type, crypt_type) {
            (FsType::Pfs0, _) => {
                let sb: Pfs0Superblock = Cursor::new(&raw.superblock[..]).read_le().map_err(
                    |_| NcaError::MalformedHeader {
                        offset: nca_offset,
                        reason: "unreadable PFS0 superblock",
                    },
                )?;
                Superblock::Pfs0(sb)
            }
            (FsType::Romfs, CryptType::Bktr) => {
                let ivfc = IvfcHeader::parse(&raw.superblock[..0xE0], nca_offset)?;
                let mut cursor = Cursor::new(&raw.superblock[0xF8..]);
                let relocation: BktrBlockInfo =
                    cursor.read_le().map_err(|_| NcaError::MalformedHeader {
                        offset: nca_offset,
                        reason: "unreadable relocation block header",
                    })?;
                let subsection: BktrBlockInfo =
                    cursor.read_le().map_err(|_| NcaError::MalformedHeader {
                        offset: nca_offset,
                        reason: "unreadable subsection block header",
                    })?;
                Superblock::Bktr(BktrSuperblock {
                    ivfc,
                    relocation,
                    subsection,
                })
            }
            (FsType::Romfs, _) => {
                let ivfc = IvfcHeader::parse(&raw.superblock[..0xE0], nca_offset)?;
                Superblock::Romfs(RomfsSuperblock { ivfc })
            }
        };

        Ok(Self {
            version: raw.version,
            partition_type: raw.partition_type,
            fs_type,
            crypt_type,
            section_ctr_low: raw.section_ctr_low,
            section_ctr_high: raw.section_ctr_high,
            superblock,
        })
    }
}

/// Fully decoded NCA header.
#[derive(Debug, Clone)]
pub struct NcaHeader {
    /// Format revision.
    pub version: NcaVersion,
    /// Distribution channel.
    pub distribution: DistributionType,
    /// Content flavor.
    pub content_type: ContentType,
    /// Key-area encryption key index.
    pub kaek_index: u8,
    /// Effective key generation (off-by-one already applied).
    pub key_generation: u8,
    /// Total archive size in bytes.
    pub nca_size: u64,
    /// Title ID.
    pub title_id: u64,
    /// SDK version the content was built with.
    pub sdk_version: u32,
    /// Rights ID; all zeros when the key area is in effect.
    pub rights_id: [u8; 0x10],
    /// Media-unit bounds of the four sections.
    pub sections: [SectionEntry; SECTION_COUNT],
    /// SHA-256 of each section's FS header.
    pub section_hashes: [[u8; 0x20]; SECTION_COUNT],
    /// Decrypted key area (zeroed under title-key crypto).
    pub key_area: [[u8; 0x10]; SECTION_COUNT],
    /// FS headers of present sections.
    pub fs_headers: [Option<FsHeader>; SECTION_COUNT],
}

impl NcaHeader {
    /// Whether the section keys come from a title key.
    #[must_use]
    pub fn uses_title_key(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    /// Effective key generation from the two raw fields: the max of both,
    /// minus one when non-zero (generations 0 and 1 share master key 0).
    #[must_use]
    pub fn effective_key_generation(crypto_type: u8, crypto_type2: u8) -> u8 {
        let generation = crypto_type.max(crypto_type2);
        generation.saturating_sub(1)
    }
}
