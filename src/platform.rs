// CLASSIFICATION: COMMUNITY
// Filename: platform.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Capabilities the loader consumes from the host platform and from the
//! per-peripheral implementation.
//!
//! Blob storage, physical memory, the region allocator and the interrupt
//! line are provided by the host. The implementation hooks ([`PilOps`]) are
//! supplied by whoever knows how to power, authenticate and reset a given
//! peripheral. Optional hooks are grouped into small traits and exposed
//! through accessors returning `Option`, so a hook is either present as a
//! whole or absent.

use std::fmt;
use std::sync::Arc;

use crate::error::PilResult;
use crate::proxy::UnvoteIrqHandler;

/// Physical address on the host bus.
pub type PhysAddr = u64;

/// A named blob handed out by the firmware store.
///
/// Dropping the value releases the blob.
#[derive(Clone)]
pub struct Firmware {
    name: String,
    data: Arc<[u8]>,
}

impl Firmware {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for Firmware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firmware")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Blob storage and retrieval.
pub trait FirmwareLoader: Send + Sync {
    /// Fetch a whole blob into host memory.
    fn request(&self, name: &str) -> PilResult<Firmware>;

    /// Copy a blob straight into physical memory at `dest`.
    ///
    /// Returns the number of bytes written. A blob larger than `capacity`
    /// must be refused with [`PilError::NotFound`](crate::PilError::NotFound).
    fn request_into(
        &self,
        name: &str,
        dest: PhysAddr,
        capacity: usize,
        memory: &dyn PhysMemory,
    ) -> PilResult<usize>;
}

/// Scoped access to physical memory.
pub trait PhysMemory: Send + Sync {
    /// Map `[paddr, paddr + len)`, run `f` over the mapping and unmap it.
    fn with_mapping(
        &self,
        paddr: PhysAddr,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> PilResult<()>;

    /// Whether `[start, start + size)` intersects memory the host itself uses.
    fn overlaps_host_memory(&self, start: PhysAddr, size: u64) -> bool;
}

/// A physically contiguous allocation returned by a [`RegionAllocator`].
///
/// The value is consumed by [`RegionAllocator::free`], so an allocation can
/// only be returned once.
#[derive(Debug, PartialEq, Eq)]
pub struct RegionAllocation {
    base: PhysAddr,
    size: u64,
    cookie: u64,
}

impl RegionAllocation {
    /// Build an allocation record. `cookie` is opaque allocator bookkeeping.
    pub fn new(base: PhysAddr, size: u64, cookie: u64) -> Self {
        Self { base, size, cookie }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    /// Size actually reserved, after granule round-up.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }
}

/// Allocator for relocatable image regions.
pub trait RegionAllocator: Send + Sync {
    fn alloc(&self, size: u64, align: u64) -> PilResult<RegionAllocation>;
    fn free(&self, allocation: RegionAllocation);
}

/// Interrupt line a peripheral raises once it no longer needs proxy votes.
pub trait IrqLine: Send + Sync {
    /// Install `handler`; the line must be left disabled afterwards.
    fn request(&self, name: &str, handler: UnvoteIrqHandler) -> anyhow::Result<()>;
    fn enable(&self);
    fn disable(&self);
    fn free(&self);
}

/// Power and clock votes held across the boot window.
pub trait ProxyVoter: Send + Sync {
    fn vote(&self) -> anyhow::Result<()>;
    fn unvote(&self);
}

/// Image metadata validation, paired with its teardown.
pub trait ImageSetup: Send + Sync {
    fn init_image(&self, metadata: &[u8]) -> anyhow::Result<()>;
    fn deinit_image(&self);
}

/// Prepares the planned memory range (e.g. protection units) for the image.
pub trait MemSetup: Send + Sync {
    fn mem_setup(&self, base: PhysAddr, size: u64) -> anyhow::Result<()>;
}

/// Content verification over a fully loaded segment.
pub trait BlobVerifier: Send + Sync {
    fn verify_blob(&self, paddr: PhysAddr, size: u64) -> anyhow::Result<()>;
}

/// Per-peripheral implementation hooks.
pub trait PilOps: Send + Sync {
    /// Authenticate the loaded image and release the peripheral from reset.
    fn auth_and_reset(&self) -> anyhow::Result<()>;

    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn proxy(&self) -> Option<&dyn ProxyVoter> {
        None
    }

    fn image(&self) -> Option<&dyn ImageSetup> {
        None
    }

    fn memory(&self) -> Option<&dyn MemSetup> {
        None
    }

    fn verifier(&self) -> Option<&dyn BlobVerifier> {
        None
    }
}

/// Host capabilities shared by every descriptor.
#[derive(Clone)]
pub struct Platform {
    pub firmware: Arc<dyn FirmwareLoader>,
    pub memory: Arc<dyn PhysMemory>,
    pub allocator: Arc<dyn RegionAllocator>,
}

impl Platform {
    pub fn new(
        firmware: Arc<dyn FirmwareLoader>,
        memory: Arc<dyn PhysMemory>,
        allocator: Arc<dyn RegionAllocator>,
    ) -> Self {
        Self {
            firmware,
            memory,
            allocator,
        }
    }
}
