// CLASSIFICATION: COMMUNITY
// Filename: loader.rs v0.3
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Segment loading: payload copy, zero-fill and verification.

use log::{debug, error};

use crate::error::{HookStage, PilError, PilResult};
use crate::fill::{zero_phys, FillWindow};
use crate::platform::{BlobVerifier, FirmwareLoader, PhysMemory};
use crate::segment::{Segment, SegmentMap};

/// Name of the metadata blob for peripheral `name`.
pub fn mdt_name(name: &str) -> String {
    format!("{name}.mdt")
}

/// Name of the payload blob for program header `num`.
pub fn blob_name(name: &str, num: usize) -> String {
    format!("{name}.b{num:02}")
}

/// Loads segments for one peripheral.
pub struct SegmentLoader<'a> {
    name: &'a str,
    firmware: &'a dyn FirmwareLoader,
    memory: &'a dyn PhysMemory,
    verifier: Option<&'a dyn BlobVerifier>,
    fill: FillWindow,
}

impl<'a> SegmentLoader<'a> {
    pub fn new(
        name: &'a str,
        firmware: &'a dyn FirmwareLoader,
        memory: &'a dyn PhysMemory,
        verifier: Option<&'a dyn BlobVerifier>,
    ) -> Self {
        Self {
            name,
            firmware,
            memory,
            verifier,
            fill: FillWindow::default(),
        }
    }

    #[must_use]
    pub fn with_fill(mut self, fill: FillWindow) -> Self {
        self.fill = fill;
        self
    }

    /// Place one segment: payload first, zeros up to the footprint, then verify.
    pub fn load(&self, seg: &Segment) -> PilResult<()> {
        let name = self.name;
        if seg.file_size > 0 {
            let fw_name = blob_name(name, seg.num);
            let want = usize::try_from(seg.file_size)
                .map_err(|_| PilError::integrity(format!("blob {fw_name} too large for host")))?;
            let written = self
                .firmware
                .request_into(&fw_name, seg.paddr, want, self.memory)
                .map_err(|e| {
                    error!("[pil] {name}: failed to locate blob {fw_name} or blob is too big");
                    e
                })?;
            if written != want {
                error!("[pil] {name}: blob size {written:#x} doesn't match {want:#x}");
                return Err(PilError::integrity(format!(
                    "blob {fw_name} is {written:#x} bytes, expected {want:#x}"
                )));
            }
        }

        let tail = seg.size - seg.file_size;
        zero_phys(self.memory, seg.paddr + seg.file_size, tail, self.fill)?;
        debug!(
            "[pil] {name}: segment {} at {:#x}: {:#x} from blob, {tail:#x} zeroed",
            seg.num, seg.paddr, seg.file_size
        );

        if let Some(verifier) = self.verifier {
            verifier.verify_blob(seg.paddr, seg.size).map_err(|e| {
                error!("[pil] {name}: blob{} failed verification", seg.num);
                PilError::hook(HookStage::VerifySegment(seg.num), e)
            })?;
        }
        Ok(())
    }

    /// Load every segment in address order, stopping at the first failure.
    pub fn load_all(&self, map: &SegmentMap) -> PilResult<()> {
        map.iter().try_for_each(|seg| self.load(seg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{DigestVerifier, FirmwareStore, SimMemory};

    fn seg(num: usize, paddr: u64, size: u64, file_size: u64) -> Segment {
        Segment {
            num,
            paddr,
            size,
            file_size,
            relocated: false,
        }
    }

    #[test]
    fn blob_names_are_zero_padded() {
        assert_eq!(mdt_name("modem"), "modem.mdt");
        assert_eq!(blob_name("modem", 3), "modem.b03");
        assert_eq!(blob_name("modem", 12), "modem.b12");
    }

    #[test]
    fn payload_then_zero_tail() {
        let memory = SimMemory::new();
        memory.add_bank(0x1000, 0x1000);
        memory.fill(0x1000, 0x1000, 0xEE);
        let store = FirmwareStore::new();
        store.insert("adsp.b00", vec![0x11; 0x203]);
        let loader = SegmentLoader::new("adsp", &store, &memory, None);
        loader.load(&seg(0, 0x1000, 0x801, 0x203)).unwrap();
        let bytes = memory.read(0x1000, 0x1000).unwrap();
        assert!(bytes[..0x203].iter().all(|&b| b == 0x11));
        assert!(bytes[0x203..0x801].iter().all(|&b| b == 0));
        assert!(bytes[0x801..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn small_fill_window_zeroes_the_whole_tail() {
        let memory = SimMemory::new();
        memory.add_bank(0x1000, 0x1000);
        memory.fill(0x1000, 0x1000, 0xEE);
        let store = FirmwareStore::new();
        store.insert("adsp.b00", vec![0x11; 0x13]);
        let loader = SegmentLoader::new("adsp", &store, &memory, None)
            .with_fill(FillWindow { window: 0x40, word: 8 });
        loader.load(&seg(0, 0x1000, 0x155, 0x13)).unwrap();
        let bytes = memory.read(0x1000, 0x200).unwrap();
        assert!(bytes[..0x13].iter().all(|&b| b == 0x11));
        assert!(bytes[0x13..0x155].iter().all(|&b| b == 0));
        assert!(bytes[0x155..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn short_blob_is_integrity_error() {
        let memory = SimMemory::new();
        memory.add_bank(0x1000, 0x1000);
        let store = FirmwareStore::new();
        store.insert("adsp.b01", vec![0; 0x500]);
        let loader = SegmentLoader::new("adsp", &store, &memory, None);
        let err = loader.load(&seg(1, 0x1000, 0x1000, 0x600)).unwrap_err();
        assert!(matches!(err, PilError::Integrity(_)));
    }

    #[test]
    fn missing_or_oversized_blob_is_not_found() {
        let memory = SimMemory::new();
        memory.add_bank(0x1000, 0x1000);
        let store = FirmwareStore::new();
        store.insert("adsp.b01", vec![0; 0x700]);
        let loader = SegmentLoader::new("adsp", &store, &memory, None);
        assert!(matches!(
            loader.load(&seg(0, 0x1000, 0x1000, 0x600)),
            Err(PilError::NotFound(_))
        ));
        assert!(matches!(
            loader.load(&seg(1, 0x1000, 0x1000, 0x600)),
            Err(PilError::NotFound(_))
        ));
    }

    #[test]
    fn verification_failure_stops_the_run() {
        let memory = SimMemory::new();
        memory.add_bank(0x1000, 0x3000);
        let store = FirmwareStore::new();
        store.insert("adsp.b00", vec![0x22; 0x100]);
        store.insert("adsp.b01", vec![0x33; 0x100]);
        store.insert("adsp.b02", vec![0x44; 0x100]);
        let verifier = DigestVerifier::new(memory.clone());
        let mut expected = vec![0x22u8; 0x100];
        expected.resize(0x1000, 0);
        verifier.expect(0x1000, DigestVerifier::digest(&expected));
        verifier.expect(0x2000, [0u8; 32]);
        let map = SegmentMap::from_segments(vec![
            seg(2, 0x3000, 0x1000, 0x100),
            seg(0, 0x1000, 0x1000, 0x100),
            seg(1, 0x2000, 0x1000, 0x100),
        ]);

        let loader = SegmentLoader::new("adsp", &store, &memory, Some(&verifier));
        let err = loader.load_all(&map).unwrap_err();
        assert_eq!(err.hook_stage(), Some(HookStage::VerifySegment(1)));
        assert_eq!(store.requests(), vec!["adsp.b00", "adsp.b01"]);
    }
}
