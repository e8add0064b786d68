//! Content storage capability: random read access to NCA bytes.

use std::collections::HashMap;
use std::fmt;

use crate::error::{NcaError, Result};

/// 16-byte content identifier (the NCA ID).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentId(pub [u8; 16]);

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Random read access to stored content.
///
/// Implementations may block on I/O; the decoder issues sector-aligned
/// reads and never writes.
pub trait ContentStorage {
    /// Total size of the content in bytes.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] when the content does not exist, [`NcaError::Io`]
    /// on transport failure.
    fn size(&mut self, id: &ContentId) -> Result<u64>;

    /// Fill `buf` with content bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] when the content does not exist,
    /// [`NcaError::OutOfRange`] is never produced here (the decoder checks
    /// bounds first), [`NcaError::Io`] when fewer than `buf.len()` bytes are
    /// available or the transport fails.
    fn read_at(&mut self, id: &ContentId, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// In-memory storage, used by tests and small tools.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    contents: HashMap<ContentId, Vec<u8>>,
}

impl MemoryStorage {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a content blob.
    pub fn insert(&mut self, id: ContentId, bytes: Vec<u8>) {
        self.contents.insert(id, bytes);
    }

    fn get(&self, id: &ContentId) -> Result<&Vec<u8>> {
        self.contents.get(id).ok_or(NcaError::NotFound)
    }
}

impl ContentStorage for MemoryStorage {
    fn size(&mut self, id: &ContentId) -> Result<u64> {
        Ok(self.get(id)?.len() as u64)
    }

    fn read_at(&mut self, id: &ContentId, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.get(id)?;
        let start = usize::try_from(offset).map_err(|_| {
            NcaError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "offset beyond addressable memory",
            ))
        })?;
        let end = start.checked_add(buf.len()).filter(|&e| e <= bytes.len());
        match end {
            Some(end) => {
                buf.copy_from_slice(&bytes[start..end]);
                Ok(())
            }
            None => Err(NcaError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "read past end of stored content",
            ))),
        }
    }
}
