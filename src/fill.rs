// CLASSIFICATION: COMMUNITY
// Filename: fill.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Zero-fill of physical ranges through bounded mapping windows.
//!
//! Only one window is mapped at a time. Inside a window the bytes before the
//! first word boundary and after the last one are cleared individually and
//! the aligned middle is cleared a word at a time, which keeps device-memory
//! mappings free of unaligned wide stores.

use log::error;

use crate::error::PilResult;
use crate::platform::{PhysAddr, PhysMemory};
use crate::region::SZ_1M;

/// Largest range mapped at once.
pub const IOMAP_SIZE: usize = SZ_1M as usize;

/// Native store width.
pub const WORD_SIZE: usize = std::mem::size_of::<u64>();

/// Window and word sizes used by [`zero_phys`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FillWindow {
    pub window: usize,
    pub word: usize,
}

impl Default for FillWindow {
    fn default() -> Self {
        Self {
            window: IOMAP_SIZE,
            word: WORD_SIZE,
        }
    }
}

/// How a window splits into leading bytes, whole words and trailing bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fringes {
    pub before: usize,
    pub words: usize,
    pub after: usize,
}

/// Split `len` bytes starting at virtual address `addr` around `word` boundaries.
pub fn fringes(addr: usize, len: usize, word: usize) -> Fringes {
    let misalign = addr % word;
    let before = if misalign == 0 {
        0
    } else {
        (word - misalign).min(len)
    };
    let rest = len - before;
    Fringes {
        before,
        words: rest / word,
        after: rest % word,
    }
}

/// Clear one mapped window.
pub fn zero_window(buf: &mut [u8], word: usize) -> Fringes {
    let split = fringes(buf.as_ptr() as usize, buf.len(), word);
    let (head, rest) = buf.split_at_mut(split.before);
    head.fill(0);
    let (middle, tail) = rest.split_at_mut(split.words * word);
    tail.fill(0);
    for w in middle.chunks_exact_mut(word) {
        w.fill(0);
    }
    split
}

/// Zero `[start, start + len)` one window at a time.
pub fn zero_phys(
    memory: &dyn PhysMemory,
    start: PhysAddr,
    len: u64,
    shape: FillWindow,
) -> PilResult<()> {
    let mut paddr = start;
    let mut remaining = len;
    while remaining > 0 {
        let size = usize::try_from(remaining).map_or(shape.window, |r| r.min(shape.window));
        memory
            .with_mapping(paddr, size, &mut |buf: &mut [u8]| {
                zero_window(buf, shape.word);
            })
            .map_err(|e| {
                error!("[pil] failed to map memory at {paddr:#x}: {e}");
                e
            })?;
        remaining -= size as u64;
        paddr += size as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimMemory;

    #[test]
    fn fringes_cover_every_byte() {
        for addr in 0..16usize {
            for len in 0..40usize {
                let f = fringes(addr, len, 8);
                assert_eq!(f.before + f.words * 8 + f.after, len);
                assert!(f.before < 8 && f.after < 8);
                if f.words > 0 {
                    assert_eq!((addr + f.before) % 8, 0);
                }
            }
        }
    }

    #[test]
    fn short_unaligned_window_is_all_fringe() {
        assert_eq!(fringes(3, 2, 8), Fringes { before: 2, words: 0, after: 0 });
        assert_eq!(fringes(8, 5, 8), Fringes { before: 0, words: 0, after: 5 });
    }

    #[test]
    fn zero_window_clears_odd_lengths() {
        let mut backing = vec![0xAAu8; 64];
        for start in 0..8 {
            for len in [1usize, 7, 9, 23, 41] {
                backing.fill(0xAA);
                zero_window(&mut backing[start..start + len], 8);
                assert!(backing[start..start + len].iter().all(|&b| b == 0));
                assert!(backing[..start].iter().all(|&b| b == 0xAA));
                assert!(backing[start + len..].iter().all(|&b| b == 0xAA));
            }
        }
    }

    #[test]
    fn zero_phys_walks_multiple_windows() {
        let memory = SimMemory::new();
        memory.add_bank(0x1000, 0x200);
        memory.fill(0x1000, 0x200, 0x5A);
        let shape = FillWindow { window: 16, word: 8 };
        zero_phys(&memory, 0x1003, 0x5d, shape).unwrap();
        let bytes = memory.read(0x1000, 0x200).unwrap();
        assert!(bytes[..3].iter().all(|&b| b == 0x5A));
        assert!(bytes[3..0x60].iter().all(|&b| b == 0));
        assert!(bytes[0x60..].iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn unmapped_range_fails() {
        let memory = SimMemory::new();
        assert!(zero_phys(&memory, 0x1000, 0x10, FillWindow::default()).is_err());
    }
}
