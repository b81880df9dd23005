// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v2.0
// Date Modified: 2026-10-19
// Author: Lukas Bower

//! Peripheral image loader.
//!
//! Loads auxiliary-processor firmware described by an ELF metadata blob
//! (`<name>.mdt`) and per-segment payload blobs (`<name>.bNN`) into physical
//! memory, then drives the boot lifecycle: region planning and relocation,
//! segment loading, proxy power votes, authentication and reset, shutdown and
//! ramdump.
//!
//! Callers must serialise `boot`/`shutdown` on a single [`Descriptor`]; the
//! descriptor's state lock enforces this, so a second caller simply waits.

/// Error taxonomy and hook stage tags
pub mod error;

/// Global override and per-descriptor settings
pub mod config;

/// Capabilities consumed from the host and the peripheral implementation
pub mod platform;

/// ELF metadata parsing
pub mod mdt;

/// Region planning and relocation
pub mod region;

/// Address-ordered segment map
pub mod segment;

/// Windowed zero-fill over physical memory
pub mod fill;

/// Segment payload loading
pub mod loader;

/// Shared background queue for delayed work
pub mod workqueue;

/// Proxy votes and their deferred release
pub mod proxy;

/// Suspend barrier and wake sources
pub mod pm;

/// Bounded descriptor identity pool
pub mod ida;

/// Image-info table read by external tooling
pub mod imem;

/// Descriptor and boot lifecycle
pub mod desc;

/// Ramdump producer
pub mod ramdump;

/// In-memory platform for bring-up and tests
pub mod sim;

pub use config::{get_config, set_config, DescriptorConfig, PilConfig, ProxyTimeout};
pub use desc::{BootState, Descriptor};
pub use error::{HookStage, PilError, PilResult};
pub use platform::{
    BlobVerifier, Firmware, FirmwareLoader, ImageSetup, IrqLine, MemSetup, PhysAddr, PhysMemory,
    PilOps, Platform, ProxyVoter, RegionAllocation, RegionAllocator,
};
pub use proxy::UnvoteIrqHandler;
pub use ramdump::{RamdumpDevice, RamdumpSegment};
