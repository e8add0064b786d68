//! The relocation overlay: virtual-offset reads planned into source runs.
//!
//! A read of the virtual (patched) image is split at every relocation
//! boundary, and patch-sourced runs are split again at every subsection
//! boundary so each run carries the counter value its bytes were encrypted
//! with. Crossing a subsection boundary re-derives the counter; it is never
//! carried over.

use crate::error::Result;

use super::structs::{RelocationBlock, SubsectionBlock};

/// Where one planned run is sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlaySource {
    /// The base application's RomFS section.
    Base,
    /// The patch section, decrypted with the rebased counter.
    Patch {
        /// Subsection counter value for this run.
        ctr_val: u32,
    },
}

/// One contiguous run of a planned overlay read.
#[derive(Debug, Clone, Copy)]
pub struct OverlaySegment {
    /// Source to pull the bytes from.
    pub source: OverlaySource,
    /// Physical offset within the source's section space.
    pub phys_offset: u64,
    /// Run length in bytes.
    pub length: u64,
}

/// Parsed relocation state of one patch section.
#[derive(Debug)]
pub struct BktrOverlay {
    relocation: RelocationBlock,
    subsection: SubsectionBlock,
}

impl BktrOverlay {
    /// Parse both blocks from their decrypted bytes.
    ///
    /// `subsection_end` is the section offset where the subsection block
    /// itself begins; covered patch data must end at or before it.
    /// `nca_offset` locates the owning FS header for error reporting.
    ///
    /// # Errors
    ///
    /// [`NcaError::MalformedHeader`](crate::error::NcaError::MalformedHeader)
    /// on any table inconsistency.
    pub fn parse(
        relocation_bytes: &[u8],
        subsection_bytes: &[u8],
        subsection_end: u64,
        nca_offset: u64,
    ) -> Result<Self> {
        let relocation = RelocationBlock::parse(relocation_bytes, nca_offset)?;
        let subsection = SubsectionBlock::parse(subsection_bytes, nca_offset)?;
        if subsection.total_size > subsection_end {
            return Err(crate::error::NcaError::MalformedHeader {
                offset: nca_offset,
                reason: "subsection coverage extends into the bucket blocks",
            });
        }
        Ok(Self {
            relocation,
            subsection,
        })
    }

    /// Size of the virtual image the overlay presents.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.relocation.total_size
    }

    /// Plan the source runs covering `[virt_offset, virt_offset+length)`.
    ///
    /// The caller must have bounds-checked the range against
    /// [`Self::total_size`].
    ///
    /// # Errors
    ///
    /// [`NcaError::OutOfRange`](crate::error::NcaError::OutOfRange) when the
    /// tables do not cover a requested offset.
    pub fn plan(
        &self,
        section: usize,
        virt_offset: u64,
        length: u64,
    ) -> Result<Vec<OverlaySegment>> {
        let mut segments = Vec::new();
        let mut virt = virt_offset;
        let mut remaining = length;

        while remaining > 0 {
            let (entry, span_end) = self.relocation.lookup(section, virt)?;
            let take = remaining.min(span_end - virt);
            let phys = entry.phys_offset + (virt - entry.virt_offset);

            if entry.is_patch {
                let mut patch_offset = phys;
                let mut left = take;
                while left > 0 {
                    let (subsection, sub_end) = self.subsection.lookup(section, patch_offset)?;
                    let run = left.min(sub_end - patch_offset);
                    segments.push(OverlaySegment {
                        source: OverlaySource::Patch {
                            ctr_val: subsection.ctr_val,
                        },
                        phys_offset: patch_offset,
                        length: run,
                    });
                    patch_offset += run;
                    left -= run;
                }
            } else {
                segments.push(OverlaySegment {
                    source: OverlaySource::Base,
                    phys_offset: phys,
                    length: take,
                });
            }

            virt += take;
            remaining -= take;
        }

        Ok(segments)
    }
}
