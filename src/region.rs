// CLASSIFICATION: COMMUNITY
// Filename: region.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Region planning and relocation.
//!
//! Fixed segments run where the image says. Relocatable segments are moved
//! as one block into a region obtained from the host allocator, keeping their
//! offsets relative to the lowest relocatable address (the origin).

use log::{error, info, warn};

use crate::error::{PilError, PilResult};
use crate::mdt::ProgramHeaderEntry;
use crate::platform::{PhysAddr, PhysMemory, RegionAllocation, RegionAllocator};

pub const SZ_4K: u64 = 0x1000;
pub const SZ_1M: u64 = 0x10_0000;
pub const SZ_4M: u64 = 0x40_0000;

/// Round `value` up to a power-of-two `align`.
pub fn align_up(value: u64, align: u64) -> PilResult<u64> {
    debug_assert!(align.is_power_of_two());
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or_else(|| PilError::integrity(format!("{value:#x} overflows when aligned to {align:#x}")))
}

/// Half-open physical range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Span {
    pub start: PhysAddr,
    pub end: PhysAddr,
}

impl Span {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Bounds of the relocatable and fixed parts of an image.
///
/// Every end bound is rounded up to 4 KiB for IOMMUs and protection units
/// that work on 4 KiB chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ImageLimits {
    pub relocatable: Option<Span>,
    /// Alignment requested by the lowest relocatable entry.
    pub align: u64,
    pub fixed: Option<Span>,
}

impl ImageLimits {
    pub fn scan(entries: &[ProgramHeaderEntry]) -> PilResult<Self> {
        let mut reloc: Option<Span> = None;
        let mut fixed: Option<Span> = None;
        let mut align = 0;

        for entry in entries.iter().filter(|e| e.is_loadable()) {
            let start = entry.paddr;
            let end = entry.end()?;
            if entry.is_relocatable() {
                let span = reloc.get_or_insert(Span { start, end });
                span.start = span.start.min(start);
                span.end = span.end.max(end);
                if span.start == start {
                    align = entry.align;
                }
            } else {
                let span = fixed.get_or_insert(Span { start, end });
                span.start = span.start.min(start);
                span.end = span.end.max(end);
            }
        }

        let round = |span: Option<Span>| -> PilResult<Option<Span>> {
            span.map(|s| {
                Ok(Span {
                    start: s.start,
                    end: align_up(s.end, SZ_4K)?,
                })
            })
            .transpose()
        };
        Ok(Self {
            relocatable: round(reloc)?,
            align,
            fixed: round(fixed)?,
        })
    }

    /// Decide how the image is placed.
    pub fn plan(&self) -> PilResult<RegionPlan> {
        match (self.relocatable, self.fixed) {
            (Some(span), _) => Ok(RegionPlan::Relocatable {
                span,
                align: self.align,
            }),
            (None, Some(span)) => Ok(RegionPlan::Fixed(span)),
            (None, None) => Err(PilError::integrity("no loadable segments")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegionPlan {
    /// The image runs in place; no allocation.
    Fixed(Span),
    /// Relocatable span to be backed by an allocated region.
    Relocatable { span: Span, align: u64 },
}

/// Final placement of an image: where it lives and where it came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub start: PhysAddr,
    pub end: PhysAddr,
    /// Lowest relocatable header address, or the image start when fixed.
    pub origin: PhysAddr,
    pub relocated: bool,
}

impl Placement {
    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

/// A live allocation backing relocatable segments.
#[derive(Debug)]
pub struct Region {
    allocation: RegionAllocation,
    /// Span size requested when the region was allocated.
    requested: u64,
}

impl Region {
    pub fn start(&self) -> PhysAddr {
        self.allocation.base()
    }

    pub fn capacity(&self) -> u64 {
        self.requested
    }

    /// Bytes actually reserved, including granule round-up.
    pub fn reserved(&self) -> u64 {
        self.allocation.size()
    }

    pub fn free(self, allocator: &dyn RegionAllocator) {
        allocator.free(self.allocation);
    }
}

fn alloc_granule(align: u64) -> u64 {
    if align > SZ_4M {
        SZ_4M
    } else {
        SZ_1M
    }
}

/// Turn a plan into a placement, allocating or reusing `region` as needed.
///
/// A live region is never reallocated: it is reused when large enough and
/// refused otherwise. A fixed plan drops any region left by an earlier
/// relocatable image.
pub fn setup_region(
    name: &str,
    region: &mut Option<Region>,
    plan: &RegionPlan,
    allocator: &dyn RegionAllocator,
) -> PilResult<Placement> {
    match *plan {
        RegionPlan::Fixed(span) => {
            if let Some(stale) = region.take() {
                warn!("[pil] {name}: dropping region at {:#x} left by a relocatable image", stale.start());
                stale.free(allocator);
            }
            Ok(Placement {
                start: span.start,
                end: span.end,
                origin: span.start,
                relocated: false,
            })
        }
        RegionPlan::Relocatable { span, align } => {
            let size = span.len();
            if let Some(existing) = region.as_ref() {
                if existing.capacity() < size {
                    error!("[pil] {name}: can't reuse PIL memory, too small");
                    return Err(PilError::Sizing {
                        have: existing.capacity(),
                        need: size,
                    });
                }
                let start = existing.start();
                return Ok(Placement {
                    start,
                    end: start + size,
                    origin: span.start,
                    relocated: true,
                });
            }

            let aligned_size = align_up(size, alloc_granule(align))?;
            let allocation = allocator
                .alloc(aligned_size, align.max(SZ_4K))
                .map_err(|e| {
                    error!("[pil] {name}: failed to allocate relocatable region of size {size:#x}: {e}");
                    match e {
                        PilError::ResourceExhausted(msg) => PilError::ResourceExhausted(msg),
                        other => PilError::ResourceExhausted(other.to_string()),
                    }
                })?;
            let start = allocation.base();
            let end = start.checked_add(size).ok_or_else(|| {
                PilError::ResourceExhausted(format!("region at {start:#x} wraps the address space"))
            })?;
            info!(
                "[pil] {name}: allocated region {start:#x}..{end:#x} ({:#x} reserved)",
                allocation.size()
            );
            *region = Some(Region {
                allocation,
                requested: size,
            });
            Ok(Placement {
                start,
                end,
                origin: span.start,
                relocated: true,
            })
        }
    }
}

/// Maps header addresses onto their final location.
pub struct Relocator<'a> {
    placement: Placement,
    memory: &'a dyn PhysMemory,
}

impl<'a> Relocator<'a> {
    pub fn new(placement: Placement, memory: &'a dyn PhysMemory) -> Self {
        Self { placement, memory }
    }

    /// `addr - origin + start`, for addresses inside the relocatable span.
    pub fn relocate(&self, addr: PhysAddr) -> PilResult<PhysAddr> {
        addr.checked_sub(self.placement.origin)
            .and_then(|offset| offset.checked_add(self.placement.start))
            .ok_or_else(|| PilError::integrity(format!("address {addr:#x} cannot be relocated")))
    }

    /// Final address for a loadable entry.
    ///
    /// Fixed entries keep their address but may not touch host memory.
    pub fn final_address(&self, entry: &ProgramHeaderEntry) -> PilResult<PhysAddr> {
        if entry.is_relocatable() {
            return self.relocate(entry.paddr);
        }
        if self.memory.overlaps_host_memory(entry.paddr, entry.mem_size) {
            let end = entry.end()?;
            error!(
                "[pil] kernel memory would be overwritten [{:#010x}, {end:#010x})",
                entry.paddr
            );
            return Err(PilError::Permission {
                start: entry.paddr,
                end,
            });
        }
        Ok(entry.paddr)
    }

    /// Entry point after relocation. Out-of-range results are left for the
    /// entry check to reject.
    pub fn entry_point(&self, entry: PhysAddr) -> PhysAddr {
        if self.placement.relocated {
            entry
                .wrapping_sub(self.placement.origin)
                .wrapping_add(self.placement.start)
        } else {
            entry
        }
    }

    pub fn placement(&self) -> &Placement {
        &self.placement
    }
}
