// CLASSIFICATION: COMMUNITY
// Filename: desc.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Peripheral descriptor and its boot lifecycle.
//!
//! ```text
//! Idle -> FetchingHeader -> PlanningRegion -> AwaitingProxyPower
//!      -> LoadingSegments -> AuthAndReset -> Running -> ShuttingDown -> Idle
//! ```
//!
//! Every state before `Running` can drop to `Failed`. A failed boot releases
//! everything it acquired before returning: header blob, proxy vote, region
//! and segment map.
//!
//! Boots of one descriptor are serialised by its state lock. Boots of
//! different descriptors are independent.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};

use crate::config::DescriptorConfig;
use crate::error::{HookStage, PilError, PilResult};
use crate::ida::SlotId;
use crate::imem;
use crate::loader::{mdt_name, SegmentLoader};
use crate::mdt::Mdt;
use crate::platform::{Firmware, PhysAddr, PilOps, Platform};
use crate::pm;
use crate::proxy::ProxyVote;
use crate::ramdump::{self, RamdumpDevice};
use crate::region::{setup_region, ImageLimits, Placement, Region, Relocator};
use crate::segment::SegmentMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootState {
    Idle,
    FetchingHeader,
    PlanningRegion,
    AwaitingProxyPower,
    LoadingSegments,
    AuthAndReset,
    Running,
    Failed,
    ShuttingDown,
}

impl fmt::Display for BootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Default)]
struct PrivState {
    region: Option<Region>,
    segments: SegmentMap,
    entry_addr: PhysAddr,
}

/// One registered peripheral.
pub struct Descriptor {
    config: DescriptorConfig,
    platform: Platform,
    ops: Arc<dyn PilOps>,
    slot: SlotId,
    proxy: ProxyVote,
    state: Mutex<PrivState>,
    phase: Mutex<BootState>,
}

impl Descriptor {
    /// Register a peripheral: claim an identity slot, wire the unvote
    /// interrupt and publish the name in the image-info table.
    pub fn new(config: DescriptorConfig, platform: Platform, ops: Arc<dyn PilOps>) -> PilResult<Self> {
        let slot = SlotId::acquire()?;
        let proxy = ProxyVote::new(
            &config.name,
            Arc::clone(&ops),
            config.unvote_irq.clone(),
            config.proxy_timeout,
            config.hold_proxy_until_shutdown,
        )?;
        if let Some(table) = imem::current() {
            table.set_name(slot.index(), &config.name);
        }
        info!("[pil] {}: registered in slot {}", config.name, slot.index());
        Ok(Self {
            config,
            platform,
            ops,
            slot,
            proxy,
            state: Mutex::new(PrivState::default()),
            phase: Mutex::new(BootState::Idle),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn slot(&self) -> usize {
        self.slot.index()
    }

    pub fn state(&self) -> BootState {
        *self.phase.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Entry address computed by the last boot, 0 before any boot.
    pub fn entry_address(&self) -> PhysAddr {
        self.lock_state().entry_addr
    }

    /// Number of segments in the current map.
    pub fn segment_count(&self) -> usize {
        self.lock_state().segments.len()
    }

    /// Whether a region is currently held for relocatable segments.
    pub fn has_region(&self) -> bool {
        self.lock_state().region.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, PrivState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn transition(&self, next: BootState) {
        let mut phase = self.phase.lock().unwrap_or_else(|p| p.into_inner());
        debug!("[pil] {}: {} -> {}", self.config.name, *phase, next);
        *phase = next;
    }

    /// Drop the segment map and unpublish the image location.
    fn release_mmap(&self, st: &mut PrivState) {
        st.segments.clear();
        if let Some(table) = imem::current() {
            table.clear_region(self.slot.index());
        }
    }

    fn free_region(&self, st: &mut PrivState) {
        if let Some(region) = st.region.take() {
            debug!("[pil] {}: freeing region at {:#x}", self.config.name, region.start());
            region.free(&*self.platform.allocator);
        }
    }

    /// Load the image and bring the peripheral out of reset.
    pub fn boot(&self) -> PilResult<()> {
        let mut st = self.state.lock().map_err(|_| PilError::LockPoisoned)?;
        let name = self.config.name.as_str();
        if self.state() == BootState::Running {
            warn!("[pil] {name}: booting again without a shutdown");
        }

        self.release_mmap(&mut st);
        st.entry_addr = 0;
        if self.proxy.is_voted() {
            // votes still held from the previous boot go back before re-voting
            self.proxy.disable_irq();
            self.proxy.unvote(true);
        }

        // suspend may not start while firmware is being pulled from storage
        let _fetch = pm::barrier().read();
        match self.run_boot(&mut st) {
            Ok(()) => {
                self.transition(BootState::Running);
                info!("[pil] {name}: brought out of reset");
                Ok(())
            }
            Err(e) => {
                self.release_mmap(&mut st);
                self.free_region(&mut st);
                st.entry_addr = 0;
                self.transition(BootState::Failed);
                error!("[pil] {name}: failed to bring out of reset: {e}");
                Err(e)
            }
        }
    }

    fn run_boot(&self, st: &mut PrivState) -> PilResult<()> {
        let name = self.config.name.as_str();

        self.transition(BootState::FetchingHeader);
        let mdt_fw = self.platform.firmware.request(&mdt_name(name)).map_err(|e| {
            error!("[pil] {name}: failed to locate {}", mdt_name(name));
            e
        })?;
        let mdt = Mdt::parse(mdt_fw.data()).map_err(|e| {
            error!("[pil] {name}: {e}");
            e
        })?;

        self.transition(BootState::PlanningRegion);
        let plan = ImageLimits::scan(mdt.entries())?.plan()?;
        let placement = setup_region(name, &mut st.region, &plan, &*self.platform.allocator)?;
        if let Some(table) = imem::current() {
            // a reused region is published with the extent it actually holds
            let size = match (&st.region, placement.relocated) {
                (Some(region), true) => region.capacity(),
                _ => placement.size(),
            };
            table.set_region(self.slot.index(), placement.start, size);
        }
        let reloc = Relocator::new(placement, &*self.platform.memory);
        st.segments = SegmentMap::build(mdt.entries(), &reloc)?;
        st.entry_addr = reloc.entry_point(mdt.header().entry);
        if !self.config.skip_entry_check {
            st.segments.check_entry(name, st.entry_addr, placement.relocated)?;
        }
        info!(
            "[pil] {name}: loading from {:#x} to {:#x}",
            placement.start, placement.end
        );

        self.transition(BootState::AwaitingProxyPower);
        // a release left over from the previous boot must not eat this vote
        self.proxy.flush();
        self.proxy.vote()?;

        match self.load_and_reset(&st.segments, &placement, &mdt_fw) {
            Ok(()) => {
                self.proxy.unvote(false);
                Ok(())
            }
            Err(e) => {
                self.proxy.disable_irq();
                self.proxy.unvote(true);
                Err(e)
            }
        }
    }

    /// Implementation hooks and segment loading, with the image-setup
    /// teardown run if anything after `init_image` fails.
    fn load_and_reset(
        &self,
        segments: &SegmentMap,
        placement: &Placement,
        mdt_fw: &Firmware,
    ) -> PilResult<()> {
        let name = self.config.name.as_str();
        let image = self.ops.image();
        if let Some(image) = image {
            image.init_image(mdt_fw.data()).map_err(|e| {
                error!("[pil] {name}: invalid firmware metadata");
                PilError::hook(HookStage::InitImage, e)
            })?;
        }

        let result = self.setup_and_load(segments, placement);
        if result.is_err() {
            if let Some(image) = image {
                image.deinit_image();
            }
        }
        result
    }

    fn setup_and_load(&self, segments: &SegmentMap, placement: &Placement) -> PilResult<()> {
        let name = self.config.name.as_str();
        if let Some(mem) = self.ops.memory() {
            mem.mem_setup(placement.start, placement.size()).map_err(|e| {
                error!("[pil] {name}: memory setup error");
                PilError::hook(HookStage::MemSetup, e)
            })?;
        }

        self.transition(BootState::LoadingSegments);
        SegmentLoader::new(
            name,
            &*self.platform.firmware,
            &*self.platform.memory,
            self.ops.verifier(),
        )
        .load_all(segments)?;

        self.transition(BootState::AuthAndReset);
        self.ops.auth_and_reset().map_err(|e| {
            error!("[pil] {name}: failed to bring out of reset");
            PilError::hook(HookStage::AuthAndReset, e)
        })
    }

    /// Stop a running peripheral and give back its memory.
    ///
    /// Cleanup always completes; a failing shutdown hook is reported after.
    pub fn shutdown(&self) -> PilResult<()> {
        let mut st = self.state.lock().map_err(|_| PilError::LockPoisoned)?;
        let name = self.config.name.as_str();
        if self.state() != BootState::Running {
            warn!("[pil] {name}: shutdown requested in state {}", self.state());
            return Ok(());
        }
        self.transition(BootState::ShuttingDown);

        let hook = self.ops.shutdown().map_err(|e| {
            error!("[pil] {name}: shutdown hook failed: {e:#}");
            PilError::hook(HookStage::Shutdown, e)
        });
        // the release unit must finish before the region goes away
        self.proxy.on_shutdown();
        self.free_region(&mut st);
        self.release_mmap(&mut st);

        self.transition(BootState::Idle);
        info!("[pil] {name}: shut down");
        hook
    }

    /// Hand the resident segment list to `device`.
    pub fn produce_ramdump(&self, device: &dyn RamdumpDevice) -> PilResult<()> {
        let st = self.state.lock().map_err(|_| PilError::LockPoisoned)?;
        ramdump::produce(&self.config.name, &st.segments, device)
    }

    /// Deregister the peripheral.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Descriptor {
    fn drop(&mut self) {
        let name = self.config.name.clone();
        if self.proxy.is_voted() {
            warn!("[pil] {name}: released with proxy votes held");
            self.proxy.unvote(true);
        }
        self.proxy.teardown();
        let mut st = self.lock_state();
        self.free_region(&mut st);
        st.segments.clear();
        drop(st);
        if let Some(table) = imem::current() {
            table.clear(self.slot.index());
        }
        debug!("[pil] {name}: released slot {}", self.slot.index());
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("name", &self.config.name)
            .field("slot", &self.slot.index())
            .field("state", &self.state())
            .finish()
    }
}
