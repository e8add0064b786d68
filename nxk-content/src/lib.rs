//! **nxk-content** - decoder for Nintendo Content Archives (NCA) and their
//! embedded file systems.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`nca`]     | Header decryption, archive handle, section reads |
//! | [`pfs0`]    | PFS0 - flat partition file system (ExeFS) |
//! | [`romfs`]   | RomFS - hierarchical read-only file system |
//! | [`bktr`]    | Bucket-tree relocation overlay (patch + base composition) |
//! | [`ivfc`]    | Lazy hash-tree integrity verification |
//! | [`ticket`]  | Ticket parsing and title-key resolution |
//! | [`keys`]    | Key provisioning (`prod.keys` / `title.keys`) |
//! | [`storage`] | Content storage capability |
//! | [`cancel`]  | Cooperative cancellation |
//!
//! Opening an archive decrypts and validates its header; everything else is
//! decoded lazily as sections are read. Every section read is decrypted with
//! the section's cipher and checked against its hash tree:
//!
//! ```no_run
//! use nxk_content::keys::KeySet;
//! use nxk_content::nca::{ContentArchive, OpenOptions};
//! use nxk_content::storage::{ContentId, MemoryStorage};
//!
//! # fn run() -> nxk_content::Result<()> {
//! let mut keys = KeySet::new();
//! keys.load_prod_keys(std::fs::File::open("prod.keys")?)?;
//!
//! let storage = MemoryStorage::new();
//! let id = ContentId([0u8; 16]);
//! let mut archive = ContentArchive::open(storage, id, &keys, OpenOptions::new())?;
//!
//! let exefs = archive.pfs0(0)?;
//! let npdm = exefs.entry_by_name("main.npdm");
//! # let _ = npdm;
//! # Ok(())
//! # }
//! ```

pub mod bktr;
pub mod cancel;
pub mod error;
pub mod ivfc;
pub mod keys;
pub mod nca;
pub mod pfs0;
pub mod romfs;
pub mod storage;
pub mod ticket;

pub use error::{KeyKind, NcaError, Result};
pub use nca::{ContentArchive, OpenOptions};

#[cfg(test)]
pub(crate) mod testutil;
