// CLASSIFICATION: COMMUNITY
// Filename: ramdump.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Ramdump producer: hands the resident segment list to a memory-capture
//! facility as one batch.

use log::{error, info};

use crate::error::{PilError, PilResult};
use crate::platform::PhysAddr;
use crate::segment::SegmentMap;

/// One address/size pair to capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RamdumpSegment {
    pub address: PhysAddr,
    pub size: u64,
}

/// External memory-capture facility.
pub trait RamdumpDevice: Send + Sync {
    fn capture(&self, segments: &[RamdumpSegment]) -> PilResult<()>;
}

/// Copy the map into a capture list, in address order.
pub fn snapshot(map: &SegmentMap) -> PilResult<Vec<RamdumpSegment>> {
    let mut out = Vec::new();
    out.try_reserve_exact(map.len()).map_err(|e| {
        PilError::ResourceExhausted(format!("ramdump list of {} segments: {e}", map.len()))
    })?;
    out.extend(map.iter().map(|seg| RamdumpSegment {
        address: seg.paddr,
        size: seg.size,
    }));
    Ok(out)
}

pub(crate) fn produce(name: &str, map: &SegmentMap, device: &dyn RamdumpDevice) -> PilResult<()> {
    let segments = snapshot(map)?;
    info!("[pil] {name}: capturing {} segment(s)", segments.len());
    device.capture(&segments).map_err(|e| {
        error!("[pil] {name}: ramdump capture failed: {e}");
        e
    })
}
