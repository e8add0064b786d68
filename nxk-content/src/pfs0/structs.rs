//! PFS0 on-disk structures.
//!
//! ```text
//! [0x00] Magic "PFS0"
//! [0x04] file_count          (u32 LE)
//! [0x08] string_table_size   (u32 LE)
//! [0x0C] reserved
//! [0x10] entry table         (file_count x 0x18)
//!        string table        (string_table_size bytes, NUL-terminated names)
//!        data region
//! ```

use binrw::BinRead;

/// Magic of the PFS0 header.
pub const PFS0_MAGIC: [u8; 4] = *b"PFS0";

/// Size of the PFS0 header.
pub const PFS0_HEADER_SIZE: u64 = 0x10;

/// Size of one entry-table record.
pub const PFS0_ENTRY_SIZE: u64 = 0x18;

/// Raw PFS0 header.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little, magic = b"PFS0")]
pub struct Pfs0Header {
    /// Number of entries in the entry table.
    pub file_count: u32,
    /// Size of the string table in bytes.
    #[br(pad_after = 4)]
    pub string_table_size: u32,
}

/// Raw entry-table record.
#[derive(Debug, Clone, Copy, BinRead)]
#[br(little)]
pub struct RawPfs0Entry {
    /// Offset of the payload, relative to the data region.
    pub file_offset: u64,
    /// Payload size in bytes.
    pub file_size: u64,
    /// Offset of the name within the string table.
    #[br(pad_after = 4)]
    pub name_offset: u32,
}

/// Decoded entry.
#[derive(Debug, Clone)]
pub struct Pfs0Entry {
    /// Name from the string table.
    pub name: String,
    /// Offset of the payload, relative to the data region.
    pub offset: u64,
    /// Payload size in bytes.
    pub size: u64,
}
