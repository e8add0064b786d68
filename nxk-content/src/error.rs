//! Error types for content decoding.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, NcaError>;

/// Which kind of key material a [`crate::keys::KeyStore`] failed to supply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    /// The 32-byte header XTS key pair.
    Header,
    /// A key-area encryption key (per KAEK index and generation).
    Application,
    /// The title-key encryption key (per master key revision).
    TitlekeyKek,
    /// The decrypted title key for a rights ID.
    Titlekey,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            KeyKind::Header => "header",
            KeyKind::Application => "key area encryption",
            KeyKind::TitlekeyKek => "titlekey encryption",
            KeyKind::Titlekey => "title",
        };
        f.write_str(name)
    }
}

/// All errors the decoder can produce.
///
/// Where it is meaningful, variants carry the section index and a byte
/// offset inside the NCA so a failure can be located in a hex dump.
#[derive(Debug, Error)]
pub enum NcaError {
    /// An underlying I/O operation failed. Callers may retry.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested content (or the base content of a patch) is not
    /// available in storage.
    #[error("content not found in storage")]
    NotFound,

    /// A structural constraint of the container was violated.
    #[error("malformed header at {offset:#x}: {reason}")]
    MalformedHeader {
        /// Byte offset of the offending structure.
        offset: u64,
        /// Which constraint was violated.
        reason: &'static str,
    },

    /// The container is recognisably an NCA but of a flavor this decoder
    /// does not handle (NCA0/NCA1, unknown magic, unknown discriminants).
    #[error("unsupported archive: {reason}")]
    UnsupportedArchive {
        /// What made the archive unsupported.
        reason: &'static str,
    },

    /// A hash check failed. Never retried.
    #[error("integrity failure in section {section}, level {level}, at {offset:#x}")]
    IntegrityFailure {
        /// Section whose data failed verification.
        section: usize,
        /// Hash-tree level of the failing block (0 = master).
        level: u32,
        /// Start of the failing block, relative to the section.
        offset: u64,
    },

    /// The key store could not supply a required key.
    #[error("missing {kind} key (index {index})")]
    MissingKey {
        /// Which kind of key was requested.
        kind: KeyKind,
        /// Index or generation that was requested.
        index: u8,
    },

    /// The ticket exists but its title key cannot be extracted without
    /// external key material (personalized crypto).
    #[error("ticket requires externally provisioned key material")]
    UnsupportedTicket,

    /// A read extended past the end of a section or overlay.
    #[error("read out of range in section {section}: {offset:#x}+{length:#x} exceeds {size:#x}")]
    OutOfRange {
        /// Section the read addressed.
        section: usize,
        /// Requested start offset.
        offset: u64,
        /// Requested length.
        length: u64,
        /// Size of the addressed space.
        size: u64,
    },

    /// The operation was cancelled through its [`crate::cancel::CancelToken`].
    /// The handle remains usable.
    #[error("operation cancelled")]
    Cancelled,
}
