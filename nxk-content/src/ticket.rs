//! Ticket parsing and title-key resolution.
//!
//! Titles with a non-zero rights ID are not keyed through the NCA key area;
//! their section key comes from a ticket. Common tickets carry the encrypted
//! title key directly in the titlekey block and can be unwrapped with the
//! titlekey encryption key. Personalized tickets wrap the key for a specific
//! console and cannot be unwrapped here.

use std::collections::HashMap;
use std::io::Cursor;

use binrw::{BinRead, BinReaderExt};
use num_enum::TryFromPrimitive;

use nxk_secure::aes::ecb_decrypt_block;

use crate::error::{NcaError, Result};
use crate::keys::KeyStore;

/// Size of an RSA-2048-SHA256 ticket structure.
pub const TICKET_SIZE: usize = 0x2C0;

/// Signature type of the only ticket flavor this crate understands.
pub const SIG_TYPE_RSA2048_SHA256: u32 = 0x10004;

/// How a ticket's title key is wrapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum TitlekeyType {
    /// Title key encrypted with the shared titlekey KEK.
    Common = 0,
    /// Title key RSA-wrapped for one console.
    Personalized = 1,
}

/// Ticket lookup capability.
pub trait TicketStore {
    /// Fetch the raw ticket bytes for a rights ID, if one is known.
    ///
    /// # Errors
    ///
    /// [`NcaError::Io`] on transport failure.
    fn lookup(&mut self, rights_id: &[u8; 16]) -> Result<Option<Vec<u8>>>;
}

impl TicketStore for HashMap<[u8; 16], Vec<u8>> {
    fn lookup(&mut self, rights_id: &[u8; 16]) -> Result<Option<Vec<u8>>> {
        Ok(self.get(rights_id).cloned())
    }
}

/// Parsed RSA-2048-SHA256 ticket.
#[derive(Debug, Clone, BinRead)]
#[br(little)]
pub struct Ticket {
    /// Signature type; must be [`SIG_TYPE_RSA2048_SHA256`].
    pub sig_type: u32,
    /// Raw signature over the ticket data.
    pub signature: [u8; 0x100],
    /// NUL-padded issuer string.
    #[br(pad_before = 0x3C)]
    pub issuer: [u8; 0x40],
    /// Title key material; common tickets use the first 16 bytes.
    pub titlekey_block: [u8; 0x100],
    /// Raw titlekey wrapping discriminant, see [`Ticket::titlekey_type`].
    #[br(pad_before = 1)]
    pub titlekey_type: u8,
    /// Master key revision selecting the titlekey KEK.
    #[br(pad_before = 3)]
    pub master_key_rev: u8,
    /// Ticket identifier.
    #[br(pad_before = 0xA)]
    pub ticket_id: u64,
    /// Console identifier (zero for common tickets).
    pub device_id: u64,
    /// Rights ID this ticket grants.
    pub rights_id: [u8; 16],
    /// Account identifier (personalized tickets).
    #[br(pad_after = 0xC)]
    pub account_id: u32,
}

impl Ticket {
    /// Parse a ticket from raw bytes.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`] when the buffer is too short,
    /// [`NcaError::UnsupportedTicket`] for signature types other than
    /// RSA-2048-SHA256.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TICKET_SIZE {
            return Err(NcaError::MalformedHeader {
                offset: 0,
                reason: "ticket shorter than 0x2C0 bytes",
            });
        }
        let ticket: Ticket =
            Cursor::new(bytes)
                .read_le()
                .map_err(|_| NcaError::MalformedHeader {
                    offset: 0,
                    reason: "unreadable ticket structure",
                })?;
        if ticket.sig_type != SIG_TYPE_RSA2048_SHA256 {
            return Err(NcaError::UnsupportedTicket);
        }
        Ok(ticket)
    }

    /// The titlekey wrapping flavor.
    ///
    /// # Errors
    ///
    /// [`NcaError::UnsupportedTicket`] for unknown discriminants.
    pub fn titlekey_type(&self) -> Result<TitlekeyType> {
        TitlekeyType::try_from(self.titlekey_type).map_err(|_| NcaError::UnsupportedTicket)
    }

    /// The encrypted title key of a common ticket.
    #[must_use]
    pub fn enc_titlekey(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.titlekey_block[..16]);
        key
    }
}

/// A resolved rights grant, cached on the archive handle.
#[derive(Debug, Clone)]
pub struct TitleRights {
    /// Rights ID the key belongs to.
    pub rights_id: [u8; 16],
    /// Title key as stored in the ticket.
    pub enc_titlekey: [u8; 16],
    /// Unwrapped title key, usable as a section key.
    pub dec_titlekey: [u8; 16],
    /// Wrapping flavor of the originating ticket.
    pub titlekey_type: TitlekeyType,
}

/// Unwrap the title key of a parsed ticket.
///
/// # Errors
///
/// [`NcaError::UnsupportedTicket`] for personalized tickets (the caller must
/// provision a pre-decrypted key instead), [`NcaError::MissingKey`] when the
/// key store lacks the titlekey KEK at the ticket's master key revision.
pub fn resolve_title_rights<K: KeyStore + ?Sized>(ticket: &Ticket, keys: &K) -> Result<TitleRights> {
    let titlekey_type = ticket.titlekey_type()?;
    if titlekey_type == TitlekeyType::Personalized {
        return Err(NcaError::UnsupportedTicket);
    }

    let kek = keys.titlekey_kek(ticket.master_key_rev)?;
    let enc_titlekey = ticket.enc_titlekey();
    let mut dec_titlekey = enc_titlekey;
    ecb_decrypt_block(&kek, &mut dec_titlekey);

    Ok(TitleRights {
        rights_id: ticket.rights_id,
        enc_titlekey,
        dec_titlekey,
        titlekey_type,
    })
}
