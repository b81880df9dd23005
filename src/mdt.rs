// CLASSIFICATION: COMMUNITY
// Filename: mdt.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Image metadata (`<name>.mdt`) parsing.
//!
//! The metadata blob is an ELF header followed by its program-header table.
//! Segment payloads are not part of it; they live in separate `.bNN` blobs.
//! The blob comes from storage and is treated as untrusted: every bound is
//! checked here before `xmas_elf` is allowed to read a header in place.

use bitflags::bitflags;
use log::debug;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::error::{PilError, PilResult};
use crate::platform::PhysAddr;

pub const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const EI_CLASS: usize = 4;
const ELFCLASS64: u8 = 2;
const ELF32_EHDR_SIZE: usize = 52;
const ELF64_EHDR_SIZE: usize = 64;
const ELF32_PHDR_SIZE: usize = 32;
const ELF64_PHDR_SIZE: usize = 56;

const SEGMENT_TYPE_MASK: u32 = 0x7 << 24;
const SEGMENT_TYPE_HASH: u32 = 0x2 << 24;

bitflags! {
    /// Program-header `p_flags`, including the loader-specific bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PhdrFlags: u32 {
        const EXEC = 1;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
        /// Placement is chosen by the loader rather than fixed by the image.
        const RELOCATABLE = 1 << 27;
        const _ = !0;
    }
}

impl PhdrFlags {
    /// Hash segments carry signatures for the auth hook and are never loaded.
    #[must_use]
    pub fn is_hash(self) -> bool {
        self.bits() & SEGMENT_TYPE_MASK == SEGMENT_TYPE_HASH
    }

    #[must_use]
    pub fn hash_segment() -> Self {
        Self::from_bits_retain(SEGMENT_TYPE_HASH)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentKind {
    Load,
    Other,
}

/// One entry of the program-header table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProgramHeaderEntry {
    pub index: usize,
    pub kind: SegmentKind,
    pub flags: PhdrFlags,
    pub paddr: PhysAddr,
    pub mem_size: u64,
    pub file_size: u64,
    pub align: u64,
}

impl ProgramHeaderEntry {
    /// `PT_LOAD`, not a hash segment, and a non-zero memory footprint.
    #[must_use]
    pub fn is_loadable(&self) -> bool {
        self.kind == SegmentKind::Load && !self.flags.is_hash() && self.mem_size != 0
    }

    #[must_use]
    pub fn is_relocatable(&self) -> bool {
        self.flags.contains(PhdrFlags::RELOCATABLE)
    }

    /// Exclusive end of the memory footprint.
    pub fn end(&self) -> PilResult<PhysAddr> {
        self.paddr.checked_add(self.mem_size).ok_or_else(|| {
            PilError::integrity(format!(
                "segment {} wraps the address space ({:#x} + {:#x})",
                self.index, self.paddr, self.mem_size
            ))
        })
    }
}

/// The fields of the ELF header the loader relies on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub entry: PhysAddr,
    pub ph_count: u16,
    pub class64: bool,
}

/// Parsed metadata: header plus every program-header entry in table order.
#[derive(Clone, Debug)]
pub struct Mdt {
    header: ImageHeader,
    entries: Vec<ProgramHeaderEntry>,
}

impl Mdt {
    pub fn parse(data: &[u8]) -> PilResult<Self> {
        if data.len() < ELF32_EHDR_SIZE {
            return Err(PilError::integrity("not big enough to be an elf header"));
        }
        if data[..ELF_MAGIC.len()] != ELF_MAGIC {
            return Err(PilError::integrity("not an elf header"));
        }
        let class64 = data[EI_CLASS] == ELFCLASS64;
        let (ehdr_size, phdr_size, phdr_align) = if class64 {
            (ELF64_EHDR_SIZE, ELF64_PHDR_SIZE, 8)
        } else {
            (ELF32_EHDR_SIZE, ELF32_PHDR_SIZE, 4)
        };
        if data.len() < ehdr_size {
            return Err(PilError::integrity("not big enough to be an elf header"));
        }

        // xmas_elf reads headers in place and needs natural alignment.
        let mut owned = Vec::new();
        let data = if data.as_ptr().align_offset(8) != 0 {
            realign(data, &mut owned)?
        } else {
            data
        };

        let elf = ElfFile::new(data).map_err(|e| PilError::integrity(format!("bad elf header: {e}")))?;
        let pt2 = &elf.header.pt2;
        let ph_count = pt2.ph_count();
        if ph_count == 0 {
            return Err(PilError::integrity("no loadable segments"));
        }
        if usize::from(pt2.ph_entry_size()) != phdr_size {
            return Err(PilError::integrity(format!(
                "program header size {} does not match elf class",
                pt2.ph_entry_size()
            )));
        }
        let ph_offset = usize::try_from(pt2.ph_offset())
            .map_err(|_| PilError::integrity("program headers not within mdt"))?;
        if ph_offset < ehdr_size || ph_offset % phdr_align != 0 {
            return Err(PilError::integrity(format!(
                "bad program header offset {ph_offset:#x}"
            )));
        }
        let table_end = usize::from(ph_count)
            .checked_mul(phdr_size)
            .and_then(|len| len.checked_add(ph_offset));
        match table_end {
            Some(end) if end <= data.len() => {}
            _ => return Err(PilError::integrity("program headers not within mdt")),
        }

        let mut entries = Vec::with_capacity(usize::from(ph_count));
        for index in 0..ph_count {
            let ph = elf
                .program_header(index)
                .map_err(|e| PilError::integrity(format!("program header {index}: {e}")))?;
            let kind = match ph.get_type() {
                Ok(Type::Load) => SegmentKind::Load,
                _ => SegmentKind::Other,
            };
            entries.push(ProgramHeaderEntry {
                index: usize::from(index),
                kind,
                flags: PhdrFlags::from_bits_retain(ph.flags().0),
                paddr: ph.physical_addr(),
                mem_size: ph.mem_size(),
                file_size: ph.file_size(),
                align: ph.align(),
            });
        }

        let header = ImageHeader {
            entry: pt2.entry_point(),
            ph_count,
            class64,
        };
        debug!(
            "[pil] mdt: {} program headers, entry {:#x}",
            header.ph_count, header.entry
        );
        Ok(Self { header, entries })
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn entries(&self) -> &[ProgramHeaderEntry] {
        &self.entries
    }

    /// Loadable entries in table order.
    pub fn loadable(&self) -> impl Iterator<Item = &ProgramHeaderEntry> {
        self.entries.iter().filter(|e| e.is_loadable())
    }
}

/// Copy `data` to an 8-byte aligned window inside `buf`.
fn realign<'b>(data: &[u8], buf: &'b mut Vec<u8>) -> PilResult<&'b [u8]> {
    buf.resize(data.len() + 7, 0);
    let off = buf.as_ptr().align_offset(8);
    let window = buf
        .get_mut(off..off.saturating_add(data.len()))
        .ok_or_else(|| PilError::ResourceExhausted("no aligned buffer for mdt".into()))?;
    window.copy_from_slice(data);
    Ok(window)
}
