//! RomFS, the hierarchical read-only file system.

pub use reader::RomfsView;
pub use structs::{
    entry_hash, RomfsDirEntry, RomfsFileEntry, RomfsHeader, ROMFS_DIR_ENTRY_SIZE,
    ROMFS_ENTRY_NONE, ROMFS_FILE_ENTRY_SIZE, ROMFS_HEADER_SIZE,
};

pub mod reader;
pub mod structs;
