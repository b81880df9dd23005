// CLASSIFICATION: COMMUNITY
// Filename: ida.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Bounded pool of descriptor identities.
//!
//! Each live descriptor owns one slot; the slot index also selects its record
//! in the image-info table. The pool never grows.

use std::sync::Mutex;

use once_cell::sync::Lazy;

use crate::error::{PilError, PilResult};

/// Maximum number of concurrently registered descriptors.
pub const PIL_NUM_DESC: usize = 10;

static SLOTS: Lazy<Mutex<[bool; PIL_NUM_DESC]>> = Lazy::new(|| Mutex::new([false; PIL_NUM_DESC]));

/// An identity slot, returned to the pool on drop.
#[derive(Debug, PartialEq, Eq)]
pub struct SlotId(usize);

impl SlotId {
    /// Claim the lowest free slot.
    pub fn acquire() -> PilResult<Self> {
        let mut slots = SLOTS.lock().map_err(|_| PilError::LockPoisoned)?;
        let free = slots.iter().position(|used| !used).ok_or_else(|| {
            PilError::ResourceExhausted(format!("all {PIL_NUM_DESC} descriptor ids in use"))
        })?;
        slots[free] = true;
        Ok(SlotId(free))
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl Drop for SlotId {
    fn drop(&mut self) {
        let mut slots = SLOTS.lock().unwrap_or_else(|p| p.into_inner());
        slots[self.0] = false;
    }
}

/// Number of slots currently claimed.
pub fn in_use() -> usize {
    SLOTS
        .lock()
        .map(|s| s.iter().filter(|used| **used).count())
        .unwrap_or(PIL_NUM_DESC)
}
