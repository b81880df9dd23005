// CLASSIFICATION: COMMUNITY
// Filename: pm.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Suspend coordination.
//!
//! Boots take the barrier shared while they pull firmware from storage;
//! suspend takes it exclusively. Once suspend has started, new boots block
//! until [`post_suspend`] is called. Wake sources are held across the boot
//! window and make [`suspend_prepare`] refuse outright.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use log::{debug, info};
use once_cell::sync::Lazy;

use crate::error::{PilError, PilResult};

#[derive(Default)]
struct BarrierState {
    readers: usize,
    suspended: bool,
}

/// Multiple-readers / single-writer barrier between boots and suspend.
pub struct SuspendBarrier {
    state: Mutex<BarrierState>,
    changed: Condvar,
}

impl SuspendBarrier {
    fn new() -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Shared access for a firmware fetch; blocks while suspend is in progress.
    pub fn read(&self) -> FetchGuard<'_> {
        let mut state = self.lock();
        while state.suspended {
            state = self.changed.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        state.readers += 1;
        FetchGuard { barrier: self }
    }

    /// Exclusive access: stop new readers, then wait for active ones to drain.
    fn write(&self) {
        let mut state = self.lock();
        while state.suspended {
            state = self.changed.wait(state).unwrap_or_else(|p| p.into_inner());
        }
        state.suspended = true;
        while state.readers > 0 {
            state = self.changed.wait(state).unwrap_or_else(|p| p.into_inner());
        }
    }

    fn release_write(&self) {
        self.lock().suspended = false;
        self.changed.notify_all();
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }
}

/// Held by a boot for as long as it may fetch firmware.
pub struct FetchGuard<'a> {
    barrier: &'a SuspendBarrier,
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.barrier.lock();
        state.readers -= 1;
        drop(state);
        self.barrier.changed.notify_all();
    }
}

static BARRIER: Lazy<SuspendBarrier> = Lazy::new(SuspendBarrier::new);
static WAKE_SOURCES: AtomicUsize = AtomicUsize::new(0);

/// The process-wide barrier.
pub fn barrier() -> &'static SuspendBarrier {
    &BARRIER
}

/// Suspend is about to begin. Waits for in-flight firmware fetches.
pub fn suspend_prepare() -> PilResult<()> {
    let active = WAKE_SOURCES.load(Ordering::SeqCst);
    if active > 0 {
        info!("[pm] suspend refused: {active} wake source(s) held");
        return Err(PilError::Busy(active));
    }
    BARRIER.write();
    // a boot that was draining may have taken a wake source meanwhile
    let active = WAKE_SOURCES.load(Ordering::SeqCst);
    if active > 0 {
        BARRIER.release_write();
        info!("[pm] suspend refused after drain: {active} wake source(s) held");
        return Err(PilError::Busy(active));
    }
    debug!("[pm] suspend prepared");
    Ok(())
}

/// Suspend/resume finished; blocked boots may proceed.
pub fn post_suspend() {
    BARRIER.release_write();
    debug!("[pm] resumed");
}

/// Number of wake sources currently held.
pub fn wake_sources_active() -> usize {
    WAKE_SOURCES.load(Ordering::SeqCst)
}

/// A named reason to keep the system awake.
#[derive(Debug)]
pub struct WakeSource {
    name: String,
}

impl WakeSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) -> WakeGuard {
        WAKE_SOURCES.fetch_add(1, Ordering::SeqCst);
        debug!("[pm] wake source {} held", self.name);
        WakeGuard {
            name: self.name.clone(),
        }
    }
}

/// Keeps its wake source held until dropped.
#[derive(Debug)]
pub struct WakeGuard {
    name: String,
}

impl Drop for WakeGuard {
    fn drop(&mut self) {
        WAKE_SOURCES.fetch_sub(1, Ordering::SeqCst);
        debug!("[pm] wake source {} released", self.name);
    }
}
