//! NCA container: header decryption, the archive handle, and section reads.

pub use reader::{ContentArchive, OpenOptions, SectionInfo};
pub use structs::{
    ContentType, CryptType, DistributionType, FsHeader, FsType, NcaHeader, NcaVersion,
    SectionEntry, Superblock, FS_HEADER_SIZE, MEDIA_UNIT, NCA_HEADER_SIZE, NCA_MAIN_HEADER_SIZE,
    SECTION_COUNT,
};

pub mod reader;
pub mod structs;
