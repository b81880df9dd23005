// CLASSIFICATION: COMMUNITY
// Filename: segment.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! The address-ordered segment map of a loaded image.

use log::{error, info};

use crate::error::{PilError, PilResult};
use crate::mdt::ProgramHeaderEntry;
use crate::platform::PhysAddr;
use crate::region::Relocator;

/// One loadable chunk at its final physical location.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Program-header index; also names the `.bNN` payload blob.
    pub num: usize,
    pub paddr: PhysAddr,
    /// Memory footprint.
    pub size: u64,
    /// Bytes backed by the payload blob; the rest is zero-filled.
    pub file_size: u64,
    pub relocated: bool,
}

impl Segment {
    pub fn end(&self) -> PhysAddr {
        self.paddr + self.size
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.paddr && addr < self.end()
    }
}

/// Segments sorted by ascending final address. Ties keep table order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SegmentMap {
    segs: Vec<Segment>,
}

impl SegmentMap {
    /// Build the map from every loadable entry.
    ///
    /// Size checks run before relocation so a malformed entry is refused
    /// before anything is placed.
    pub fn build(entries: &[ProgramHeaderEntry], reloc: &Relocator<'_>) -> PilResult<Self> {
        let mut segs = Vec::new();
        for entry in entries.iter().filter(|e| e.is_loadable()) {
            if entry.file_size > entry.mem_size {
                error!(
                    "[pil] segment {}: file size ({:#x}) is greater than mem size ({:#x})",
                    entry.index, entry.file_size, entry.mem_size
                );
                return Err(PilError::integrity(format!(
                    "segment {} file size {:#x} exceeds mem size {:#x}",
                    entry.index, entry.file_size, entry.mem_size
                )));
            }
            let paddr = reloc.final_address(entry)?;
            if paddr.checked_add(entry.mem_size).is_none() {
                return Err(PilError::integrity(format!(
                    "segment {} wraps the address space",
                    entry.index
                )));
            }
            segs.push(Segment {
                num: entry.index,
                paddr,
                size: entry.mem_size,
                file_size: entry.file_size,
                relocated: entry.is_relocatable(),
            });
        }
        // stable: equal addresses stay in table order
        segs.sort_by(|a, b| a.paddr.cmp(&b.paddr));
        Ok(Self { segs })
    }

    /// The entry point must land inside a segment, and inside a relocated
    /// one when the image was relocated.
    pub fn check_entry(&self, name: &str, entry: PhysAddr, image_relocated: bool) -> PilResult<()> {
        let reachable = self
            .segs
            .iter()
            .any(|s| s.contains(entry) && (!image_relocated || s.relocated));
        if reachable {
            return Ok(());
        }
        error!("[pil] {name}: entry address {entry:#x} not within range");
        self.dump(name);
        Err(PilError::UnreachableEntryPoint(entry))
    }

    pub fn dump(&self, name: &str) {
        for seg in &self.segs {
            info!("[pil] {name}: {}: {:#x} {:#x}", seg.num, seg.paddr, seg.end());
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.segs.iter()
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.segs
    }

    pub fn len(&self) -> usize {
        self.segs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }

    pub fn clear(&mut self) {
        self.segs.clear();
    }

    #[cfg(test)]
    pub(crate) fn from_segments(mut segs: Vec<Segment>) -> Self {
        segs.sort_by(|a, b| a.paddr.cmp(&b.paddr));
        Self { segs }
    }
}

impl<'a> IntoIterator for &'a SegmentMap {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.segs.iter()
    }
}
