// CLASSIFICATION: COMMUNITY
// Filename: imem.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Image-info table shared with external tooling.
//!
//! One packed little-endian record per identity slot:
//!
//! | offset | field | type     |
//! |--------|-------|----------|
//! | 0      | name  | [u8; 8]  |
//! | 8      | start | u64 (le) |
//! | 16     | size  | u32 (le) |
//!
//! Tooling reads the table to find where each peripheral image currently
//! resides. The host installs the table once; without one, records are
//! simply not published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use log::warn;
use once_cell::sync::Lazy;

use crate::ida::PIL_NUM_DESC;
use crate::platform::PhysAddr;

pub const NAME_LEN: usize = 8;
pub const RECORD_SIZE: usize = NAME_LEN + 8 + 4;
pub const TABLE_SIZE: usize = RECORD_SIZE * PIL_NUM_DESC;

/// Decoded view of one record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImageInfo {
    pub name: [u8; NAME_LEN],
    pub start: PhysAddr,
    pub size: u32,
}

impl ImageInfo {
    /// Name up to the first NUL. Names are not NUL-terminated when they fill all 8 bytes.
    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&raw[..NAME_LEN]);
        let mut start = [0u8; 8];
        start.copy_from_slice(&raw[NAME_LEN..NAME_LEN + 8]);
        let mut size = [0u8; 4];
        size.copy_from_slice(&raw[NAME_LEN + 8..RECORD_SIZE]);
        Self {
            name,
            start: u64::from_le_bytes(start),
            size: u32::from_le_bytes(size),
        }
    }
}

/// The raw table.
pub struct ImageInfoTable {
    bytes: Mutex<[u8; TABLE_SIZE]>,
}

impl Default for ImageInfoTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageInfoTable {
    pub fn new() -> Self {
        Self {
            bytes: Mutex::new([0; TABLE_SIZE]),
        }
    }

    fn lock(&self) -> MutexGuard<'_, [u8; TABLE_SIZE]> {
        self.bytes.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record_mut(bytes: &mut [u8; TABLE_SIZE], slot: usize) -> &mut [u8] {
        let off = slot * RECORD_SIZE;
        &mut bytes[off..off + RECORD_SIZE]
    }

    /// Write the name, truncated to 8 bytes.
    pub fn set_name(&self, slot: usize, name: &str) {
        let mut bytes = self.lock();
        let rec = Self::record_mut(&mut bytes, slot);
        rec[..NAME_LEN].fill(0);
        let src = name.as_bytes();
        let n = src.len().min(NAME_LEN);
        rec[..n].copy_from_slice(&src[..n]);
    }

    pub fn set_region(&self, slot: usize, start: PhysAddr, size: u64) {
        let size = u32::try_from(size).unwrap_or_else(|_| {
            warn!("[pil] image size {size:#x} does not fit the info table");
            u32::MAX
        });
        let mut bytes = self.lock();
        let rec = Self::record_mut(&mut bytes, slot);
        rec[NAME_LEN..NAME_LEN + 8].copy_from_slice(&start.to_le_bytes());
        rec[NAME_LEN + 8..].copy_from_slice(&size.to_le_bytes());
    }

    pub fn clear_region(&self, slot: usize) {
        self.set_region(slot, 0, 0);
    }

    /// Zero the whole record, name included.
    pub fn clear(&self, slot: usize) {
        let mut bytes = self.lock();
        Self::record_mut(&mut bytes, slot).fill(0);
    }

    pub fn record(&self, slot: usize) -> ImageInfo {
        let bytes = self.lock();
        let off = slot * RECORD_SIZE;
        ImageInfo::decode(&bytes[off..off + RECORD_SIZE])
    }

    /// Raw copy of the table as tooling would read it.
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().to_vec()
    }
}

static TABLE: Lazy<RwLock<Option<Arc<ImageInfoTable>>>> = Lazy::new(|| RwLock::new(None));
static WARNED: AtomicBool = AtomicBool::new(false);

/// Publish `table` as the process-wide image-info table.
pub fn install(table: Arc<ImageInfoTable>) {
    *TABLE.write().unwrap_or_else(|p| p.into_inner()) = Some(table);
}

pub fn uninstall() {
    *TABLE.write().unwrap_or_else(|p| p.into_inner()) = None;
}

pub(crate) fn current() -> Option<Arc<ImageInfoTable>> {
    let table = TABLE.read().unwrap_or_else(|p| p.into_inner()).clone();
    if table.is_none() && !WARNED.swap(true, Ordering::Relaxed) {
        warn!("[pil] no image-info table installed; image locations will not be published");
    }
    table
}
