//! PFS0, the flat partition file system (ExeFS, logo sections).

pub use reader::Pfs0View;
pub use structs::{Pfs0Entry, Pfs0Header, PFS0_ENTRY_SIZE, PFS0_HEADER_SIZE, PFS0_MAGIC};

pub mod reader;
pub mod structs;

#[cfg(test)]
mod tests;
