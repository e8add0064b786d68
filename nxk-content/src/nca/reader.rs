//! Archive handle: header decryption, key selection, section reads.
//!
//! [`ContentArchive`] owns everything derived from one NCA: the decoded
//! header, per-section cipher and integrity state, the relocation indexes of
//! patch sections, and (for patches) the attached base archive. Sections are
//! addressed by index throughout; nothing holds pointers across sections.

use nxk_secure::aes::{
    ctr_apply, ecb_decrypt_key_area, section_counter, xts_decrypt, XTS_SECTOR_SIZE,
};
use nxk_secure::hash::sha256;

use crate::bktr::{BktrOverlay, OverlaySource};
use crate::cancel::CancelToken;
use crate::error::{KeyKind, NcaError, Result};
use crate::ivfc::{HashTableVerifier, IvfcVerifier, SectionIntegrity};
use crate::keys::{KaekIndex, KeyStore};
use crate::pfs0::Pfs0View;
use crate::romfs::RomfsView;
use crate::storage::{ContentId, ContentStorage};
use crate::ticket::{resolve_title_rights, Ticket, TicketStore, TitleRights};

use super::structs::{
    ContentType, CryptType, DistributionType, FsHeader, FsType, NcaHeader, NcaVersion,
    RawNcaHeader, SectionEntry, Superblock, FS_HEADER_SIZE, NCA_HEADER_SIZE, NCA_MAIN_HEADER_SIZE,
    SECTION_COUNT,
};

/// CTR keystream alignment.
const CTR_ALIGN: u64 = 0x10;

/// Work-unit size between cancellation polls.
const WORK_UNIT: usize = 0x200;

/// External inputs consumed while opening an archive.
#[derive(Default)]
pub struct OpenOptions<'a> {
    /// Ticket source consulted when the archive carries a rights ID.
    pub ticket_store: Option<&'a mut dyn TicketStore>,
    /// Pre-decrypted title key; takes precedence over ticket lookup.
    pub title_key: Option<[u8; 16]>,
}

impl<'a> OpenOptions<'a> {
    /// Options with no external key sources.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Metadata of one present section.
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo {
    /// Section index within the archive.
    pub index: usize,
    /// Byte offset of the section within the NCA.
    pub nca_offset: u64,
    /// Physical size of the section in bytes.
    pub size: u64,
    /// Readable size: equals `size` except for patch sections, where it is
    /// the virtual overlay size.
    pub readable_size: u64,
    /// File-system flavor.
    pub fs_type: FsType,
    /// Cipher mode.
    pub crypt_type: CryptType,
}

/// Cipher state of one section.
#[derive(Debug, Clone)]
pub(crate) enum SectionCipher {
    None,
    Xts {
        data_key: [u8; 16],
        tweak_key: [u8; 16],
    },
    Ctr {
        key: [u8; 16],
        ctr_high: u32,
        ctr_low: u32,
    },
}

/// Everything the handle keeps per present section.
#[derive(Debug)]
pub(crate) struct SectionState {
    pub(crate) nca_offset: u64,
    pub(crate) size: u64,
    pub(crate) fs_type: FsType,
    pub(crate) crypt_type: CryptType,
    pub(crate) superblock: Superblock,
    pub(crate) cipher: SectionCipher,
    pub(crate) integrity: Option<SectionIntegrity>,
    pub(crate) overlay: Option<BktrOverlay>,
}

#[derive(Debug)]
struct BaseRef<S: ContentStorage> {
    archive: ContentArchive<S>,
    section: usize,
}

/// An opened NCA.
///
/// The handle is single-threaded; clone the [`CancelToken`] to interrupt
/// long reads from elsewhere. Dropping the handle releases all cached
/// indexes and cipher state.
#[derive(Debug)]
pub struct ContentArchive<S: ContentStorage> {
    storage: S,
    content_id: ContentId,
    header: NcaHeader,
    sections: [Option<SectionState>; SECTION_COUNT],
    title_rights: Option<TitleRights>,
    base: Option<Box<BaseRef<S>>>,
    cancel: CancelToken,
    poisoned: bool,
}

impl<S: ContentStorage> ContentArchive<S> {
    /// Decode the header of `content_id` and build a handle.
    ///
    /// # Errors
    ///
    /// [`NcaError::UnsupportedArchive`] for unknown magics/discriminants,
    /// [`NcaError::IntegrityFailure`] when an FS header does not match its
    /// stored hash, [`NcaError::MissingKey`] when required key material is
    /// absent, plus storage and parse failures.
    pub fn open<K: KeyStore + ?Sized>(
        mut storage: S,
        content_id: ContentId,
        keys: &K,
        mut options: OpenOptions<'_>,
    ) -> Result<Self> {
        let mut header_bytes = vec![0u8; NCA_HEADER_SIZE];
        storage.read_at(&content_id, 0, &mut header_bytes)?;

        let (data_key, tweak_key) = keys.header_key_pair()?;
        xts_decrypt(
            &data_key,
            &tweak_key,
            &mut header_bytes[..NCA_MAIN_HEADER_SIZE],
            XTS_SECTOR_SIZE,
            0,
        );

        let raw = RawNcaHeader::parse(&header_bytes[..NCA_MAIN_HEADER_SIZE])?;
        let version = NcaVersion::from_magic(raw.magic)?;

        for i in 0..SECTION_COUNT {
            let start = NCA_MAIN_HEADER_SIZE + i * FS_HEADER_SIZE;
            // NCA2 encrypts every FS header as its own sector 0.
            let first_sector = match version {
                NcaVersion::Nca3 => (2 + i) as u128,
                NcaVersion::Nca2 => 0,
            };
            xts_decrypt(
                &data_key,
                &tweak_key,
                &mut header_bytes[start..start + FS_HEADER_SIZE],
                XTS_SECTOR_SIZE,
                first_sector,
            );
        }

        let distribution = DistributionType::try_from(raw.distribution).map_err(|_| {
            NcaError::UnsupportedArchive {
                reason: "unknown distribution type",
            }
        })?;
        let content_type = ContentType::try_from(raw.content_type).map_err(|_| {
            NcaError::UnsupportedArchive {
                reason: "unknown content type",
            }
        })?;
        let key_generation =
            NcaHeader::effective_key_generation(raw.crypto_type, raw.crypto_type2);

        let sections = raw.section_entries.map(|e| SectionEntry {
            media_start: e.media_start_offset,
            media_end: e.media_end_offset,
        });

        let mut fs_headers: [Option<FsHeader>; SECTION_COUNT] = [None, None, None, None];
        for (i, entry) in sections.iter().enumerate() {
            if !entry.is_present() {
                continue;
            }
            let start = NCA_MAIN_HEADER_SIZE + i * FS_HEADER_SIZE;
            let bytes = &header_bytes[start..start + FS_HEADER_SIZE];
            if sha256(bytes) != raw.section_hashes[i] {
                return Err(NcaError::IntegrityFailure {
                    section: i,
                    level: 0,
                    offset: start as u64,
                });
            }
            fs_headers[i] = Some(FsHeader::parse(bytes, start as u64)?);
        }

        let uses_title_key = raw.rights_id.iter().any(|&b| b != 0);
        let mut key_area = raw.key_area;
        let mut title_rights = None;
        let mut title_key = None;

        if uses_title_key {
            key_area = [[0u8; 16]; SECTION_COUNT];
            let key = if let Some(key) = options.title_key {
                key
            } else if let Some(store) = options.ticket_store.as_deref_mut() {
                match store.lookup(&raw.rights_id)? {
                    Some(bytes) => {
                        let ticket = Ticket::parse(&bytes)?;
                        if ticket.rights_id != raw.rights_id {
                            return Err(NcaError::MalformedHeader {
                                offset: 0,
                                reason: "ticket rights ID mismatch",
                            });
                        }
                        let rights = resolve_title_rights(&ticket, keys)?;
                        let key = rights.dec_titlekey;
                        title_rights = Some(rights);
                        key
                    }
                    None => {
                        return Err(NcaError::MissingKey {
                            kind: KeyKind::Titlekey,
                            index: 0,
                        })
                    }
                }
            } else {
                return Err(NcaError::MissingKey {
                    kind: KeyKind::Titlekey,
                    index: 0,
                });
            };
            title_key = Some(key);
        } else {
            let kaek_index =
                KaekIndex::try_from(raw.kaek_index).map_err(|_| NcaError::UnsupportedArchive {
                    reason: "unknown key-area key index",
                })?;
            let kaek = keys.application_key(kaek_index, key_generation)?;
            ecb_decrypt_key_area(&kaek, &mut key_area);
        }

        let header = NcaHeader {
            version,
            distribution,
            content_type,
            kaek_index: raw.kaek_index,
            key_generation,
            nca_size: raw.nca_size,
            title_id: raw.title_id,
            sdk_version: raw.sdk_version,
            rights_id: raw.rights_id,
            sections,
            section_hashes: raw.section_hashes,
            key_area,
            fs_headers,
        };

        let mut section_states: [Option<SectionState>; SECTION_COUNT] = [None, None, None, None];
        for (i, entry) in header.sections.iter().enumerate() {
            let Some(fs_header) = header.fs_headers[i].as_ref() else {
                continue;
            };
            let cipher = match fs_header.crypt_type {
                CryptType::None => SectionCipher::None,
                CryptType::Xts => SectionCipher::Xts {
                    data_key: header.key_area[0],
                    tweak_key: header.key_area[1],
                },
                CryptType::Ctr | CryptType::Bktr => SectionCipher::Ctr {
                    key: title_key.unwrap_or(header.key_area[2]),
                    ctr_high: fs_header.section_ctr_high,
                    ctr_low: fs_header.section_ctr_low,
                },
            };
            let integrity = match &fs_header.superblock {
                Superblock::Pfs0(sb) => Some(SectionIntegrity::HashTable(HashTableVerifier::new(
                    sb.master_hash,
                    sb.block_size,
                    sb.hash_table_offset,
                    sb.hash_table_size,
                    sb.pfs0_offset,
                    sb.pfs0_size,
                )?)),
                Superblock::Romfs(sb) => {
                    Some(SectionIntegrity::Ivfc(IvfcVerifier::new(sb.ivfc.clone())))
                }
                Superblock::Bktr(sb) => {
                    Some(SectionIntegrity::Ivfc(IvfcVerifier::new(sb.ivfc.clone())))
                }
            };
            section_states[i] = Some(SectionState {
                nca_offset: entry.byte_offset(),
                size: entry.byte_size(),
                fs_type: fs_header.fs_type,
                crypt_type: fs_header.crypt_type,
                superblock: fs_header.superblock.clone(),
                cipher,
                integrity,
                overlay: None,
            });
        }

        let mut archive = Self {
            storage,
            content_id,
            header,
            sections: section_states,
            title_rights,
            base: None,
            cancel: CancelToken::new(),
            poisoned: false,
        };
        archive.parse_overlays()?;

        #[cfg(feature = "logging")]
        tracing::debug!(
            title_id = archive.header.title_id,
            content_type = ?archive.header.content_type,
            sections = archive.sections.iter().flatten().count(),
            "opened content archive"
        );

        Ok(archive)
    }

    /// Parse the relocation and subsection blocks of every patch section.
    fn parse_overlays(&mut self) -> Result<()> {
        for index in 0..SECTION_COUNT {
            let Some(state) = &self.sections[index] else {
                continue;
            };
            if state.crypt_type != CryptType::Bktr {
                continue;
            }
            let Superblock::Bktr(sb) = state.superblock.clone() else {
                return Err(NcaError::MalformedHeader {
                    offset: state.nca_offset,
                    reason: "patch section without BKTR superblock",
                });
            };
            let header_offset = (NCA_MAIN_HEADER_SIZE + index * FS_HEADER_SIZE) as u64;
            sb.relocation.validate(state.size, header_offset)?;
            sb.subsection.validate(state.size, header_offset)?;

            let relocation =
                self.read_physical(index, sb.relocation.offset, sb.relocation.size as usize)?;
            let subsection =
                self.read_physical(index, sb.subsection.offset, sb.subsection.size as usize)?;
            let overlay =
                BktrOverlay::parse(&relocation, &subsection, sb.subsection.offset, header_offset)?;

            #[cfg(feature = "logging")]
            tracing::debug!(
                section = index,
                virtual_size = overlay.total_size(),
                "parsed relocation overlay"
            );

            self.sections[index]
                .as_mut()
                .expect("section checked above")
                .overlay = Some(overlay);
        }
        Ok(())
    }

    /// The decoded header.
    #[must_use]
    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    /// Identifier of the decoded content.
    #[must_use]
    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    /// Rights resolved from a ticket at open time, if any.
    #[must_use]
    pub fn title_rights(&self) -> Option<&TitleRights> {
        self.title_rights.as_ref()
    }

    /// A clone of the handle's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Metadata of a present section.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] when the section is absent.
    pub fn section(&self, index: usize) -> Result<SectionInfo> {
        let state = self.section_state(index)?;
        let readable_size = match &state.overlay {
            Some(overlay) => overlay.total_size(),
            None => state.size,
        };
        Ok(SectionInfo {
            index,
            nca_offset: state.nca_offset,
            size: state.size,
            readable_size,
            fs_type: state.fs_type,
            crypt_type: state.crypt_type,
        })
    }

    /// Metadata of every present section, in index order.
    pub fn present_sections(&self) -> impl Iterator<Item = SectionInfo> + '_ {
        (0..SECTION_COUNT).filter_map(|i| self.section(i).ok())
    }

    /// Attach the base application archive a patch composes with.
    ///
    /// `base_section` names the base archive's RomFS section.
    ///
    /// # Errors
    ///
    /// [`NcaError::NotFound`] when the named section is absent,
    /// [`NcaError::UnsupportedArchive`] when it is not a RomFS section.
    pub fn attach_base(&mut self, base: ContentArchive<S>, base_section: usize) -> Result<()> {
        let info = base.section(base_section)?;
        if info.fs_type != FsType::Romfs {
            return Err(NcaError::UnsupportedArchive {
                reason: "base section is not a RomFS",
            });
        }
        self.base = Some(Box::new(BaseRef {
            archive: base,
            section: base_section,
        }));
        Ok(())
    }

    /// Whether a base archive has been attached.
    #[must_use]
    pub fn has_base(&self) -> bool {
        self.base.is_some()
    }

    /// Read decrypted, integrity-checked bytes from a section.
    ///
    /// For patch sections the offset addresses the virtual (overlaid) image.
    ///
    /// # Errors
    ///
    /// [`NcaError::OutOfRange`] past the readable size,
    /// [`NcaError::IntegrityFailure`] on corrupt data, [`NcaError::Cancelled`]
    /// when the handle's token fires, plus storage failures.
    pub fn read_section(&mut self, index: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.ensure_usable()?;
        let result = self.read_section_inner(index, offset, length);
        self.poison_on_malformed(result)
    }

    /// Open a partition file system view over a section.
    ///
    /// # Errors
    ///
    /// [`NcaError::UnsupportedArchive`] when the section is not PFS0-flavored,
    /// plus parse and read failures.
    pub fn pfs0(&mut self, index: usize) -> Result<Pfs0View<'_, S>> {
        self.ensure_usable()?;
        Pfs0View::open(self, index)
    }

    /// Open a RomFS view over a section.
    ///
    /// For patch sections this transparently composes with the attached base
    /// archive; attach it first with [`ContentArchive::attach_base`].
    ///
    /// # Errors
    ///
    /// [`NcaError::UnsupportedArchive`] when the section is not RomFS-flavored,
    /// [`NcaError::NotFound`] when a patch section has no base attached, plus
    /// parse and read failures.
    pub fn romfs(&mut self, index: usize) -> Result<RomfsView<'_, S>> {
        self.ensure_usable()?;
        RomfsView::open(self, index)
    }

    pub(crate) fn section_state(&self, index: usize) -> Result<&SectionState> {
        self.sections
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or(NcaError::NotFound)
    }

    pub(crate) fn mark_poisoned(&mut self) {
        self.poisoned = true;
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(NcaError::MalformedHeader {
                offset: 0,
                reason: "archive handle poisoned by an earlier structural failure",
            });
        }
        self.cancel.check()
    }

    fn poison_on_malformed<T>(&mut self, result: Result<T>) -> Result<T> {
        if matches!(result, Err(NcaError::MalformedHeader { .. })) {
            self.poisoned = true;
        }
        result
    }

    fn read_section_inner(&mut self, index: usize, offset: u64, length: usize) -> Result<Vec<u8>> {
        let state = self.section_state(index)?;
        match state.crypt_type {
            CryptType::Bktr => {
                let total = state
                    .overlay
                    .as_ref()
                    .map(BktrOverlay::total_size)
                    .unwrap_or(0);
                if length == 0 || offset == total {
                    return Ok(Vec::new());
                }
                if offset > total || length as u64 > total - offset {
                    return Err(NcaError::OutOfRange {
                        section: index,
                        offset,
                        length: length as u64,
                        size: total,
                    });
                }
                self.verify_intersection(index, offset, length as u64)?;
                self.read_virtual(index, offset, length)
            }
            _ => {
                let size = state.size;
                if length == 0 {
                    return Ok(Vec::new());
                }
                if offset > size || length as u64 > size - offset {
                    return Err(NcaError::OutOfRange {
                        section: index,
                        offset,
                        length: length as u64,
                        size,
                    });
                }
                self.verify_intersection(index, offset, length as u64)?;
                self.read_physical(index, offset, length)
            }
        }
    }

    /// Verify the part of `[offset, offset+length)` covered by the section's
    /// hashed data region.
    fn verify_intersection(&mut self, index: usize, offset: u64, length: u64) -> Result<()> {
        let slot = self.sections[index]
            .as_mut()
            .expect("section checked by caller");
        let Some(mut integrity) = slot.integrity.take() else {
            return Ok(());
        };
        let is_overlay = slot.crypt_type == CryptType::Bktr;

        let (data_offset, data_size) = integrity.data_region();
        let start = offset.max(data_offset);
        let end = (offset + length).min(data_offset + data_size);
        let result = if start < end {
            let mut fetch = |o: u64, l: usize| {
                if is_overlay {
                    self.read_virtual(index, o, l)
                } else {
                    self.read_physical(index, o, l)
                }
            };
            integrity.verify_data(index, start - data_offset, end - start, &mut fetch)
        } else {
            Ok(())
        };

        self.sections[index]
            .as_mut()
            .expect("section checked by caller")
            .integrity = Some(integrity);
        result
    }

    /// Decrypted read in the section's physical space; no integrity, no
    /// overlay translation.
    pub(crate) fn read_physical(
        &mut self,
        index: usize,
        offset: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        self.read_physical_with_ctr(index, offset, length, None)
    }

    /// Like [`Self::read_physical`], with the low counter half replaced
    /// (subsection rebase).
    pub(crate) fn read_physical_with_ctr(
        &mut self,
        index: usize,
        offset: u64,
        length: usize,
        ctr_low_override: Option<u32>,
    ) -> Result<Vec<u8>> {
        let (nca_offset, size, cipher) = {
            let state = self.section_state(index)?;
            (state.nca_offset, state.size, state.cipher.clone())
        };
        if length == 0 {
            return Ok(Vec::new());
        }
        if offset > size || length as u64 > size - offset {
            return Err(NcaError::OutOfRange {
                section: index,
                offset,
                length: length as u64,
                size,
            });
        }

        match cipher {
            SectionCipher::None => {
                self.cancel.check()?;
                let mut buf = vec![0u8; length];
                self.storage
                    .read_at(&self.content_id, nca_offset + offset, &mut buf)?;
                Ok(buf)
            }
            SectionCipher::Ctr {
                key,
                ctr_high,
                ctr_low,
            } => {
                let low = ctr_low_override.unwrap_or(ctr_low);
                let aligned_start = offset & !(CTR_ALIGN - 1);
                let aligned_end = (offset + length as u64).div_ceil(CTR_ALIGN) * CTR_ALIGN;
                let mut buf = vec![0u8; (aligned_end - aligned_start) as usize];
                self.storage
                    .read_at(&self.content_id, nca_offset + aligned_start, &mut buf)?;

                let mut pos = 0usize;
                let mut abs = nca_offset + aligned_start;
                while pos < buf.len() {
                    self.cancel.check()?;
                    let chunk = WORK_UNIT.min(buf.len() - pos);
                    let counter = section_counter(ctr_high, low, abs);
                    ctr_apply(&key, &counter, &mut buf[pos..pos + chunk]);
                    pos += chunk;
                    abs += chunk as u64;
                }

                let skip = (offset - aligned_start) as usize;
                buf.drain(..skip);
                buf.truncate(length);
                Ok(buf)
            }
            SectionCipher::Xts {
                data_key,
                tweak_key,
            } => {
                let sector = XTS_SECTOR_SIZE as u64;
                let aligned_start = offset / sector * sector;
                let aligned_end = (offset + length as u64).div_ceil(sector) * sector;
                let mut buf = vec![0u8; (aligned_end - aligned_start) as usize];
                self.storage
                    .read_at(&self.content_id, nca_offset + aligned_start, &mut buf)?;

                let mut sector_index = aligned_start / sector;
                for chunk in buf.chunks_mut(XTS_SECTOR_SIZE) {
                    self.cancel.check()?;
                    xts_decrypt(
                        &data_key,
                        &tweak_key,
                        chunk,
                        XTS_SECTOR_SIZE,
                        u128::from(sector_index),
                    );
                    sector_index += 1;
                }

                let skip = (offset - aligned_start) as usize;
                buf.drain(..skip);
                buf.truncate(length);
                Ok(buf)
            }
        }
    }

    /// Overlay read: translate virtual offsets through the relocation index
    /// and pull bytes from the patch section or the attached base.
    pub(crate) fn read_virtual(
        &mut self,
        index: usize,
        virt_offset: u64,
        length: usize,
    ) -> Result<Vec<u8>> {
        let plan = {
            let state = self.section_state(index)?;
            let overlay = state.overlay.as_ref().ok_or(NcaError::MalformedHeader {
                offset: state.nca_offset,
                reason: "patch section opened without relocation index",
            })?;
            overlay.plan(index, virt_offset, length as u64)?
        };

        let mut out = Vec::with_capacity(length);
        for segment in plan {
            self.cancel.check()?;
            let bytes = match segment.source {
                OverlaySource::Base => {
                    let base = self.base.as_mut().ok_or(NcaError::NotFound)?;
                    base.archive.read_section(
                        base.section,
                        segment.phys_offset,
                        segment.length as usize,
                    )?
                }
                OverlaySource::Patch { ctr_val } => self.read_physical_with_ctr(
                    index,
                    segment.phys_offset,
                    segment.length as usize,
                    Some(ctr_val),
                )?,
            };
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }
}
