// CLASSIFICATION: COMMUNITY
// Filename: sim.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! In-memory host platform.
//!
//! Stands in for blob storage, physical memory, the region allocator, the
//! unvote interrupt and a peripheral's implementation hooks so the loader can
//! be brought up and tested without hardware. Every piece records what was
//! asked of it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail};
use log::{debug, warn};
use sha2::{Digest, Sha256};

use crate::error::{PilError, PilResult};
use crate::mdt::{PhdrFlags, ELF_MAGIC};
use crate::platform::{
    BlobVerifier, Firmware, FirmwareLoader, ImageSetup, IrqLine, MemSetup, PhysAddr, PhysMemory,
    PilOps, Platform, ProxyVoter, RegionAllocation, RegionAllocator,
};
use crate::proxy::UnvoteIrqHandler;
use crate::ramdump::{RamdumpDevice, RamdumpSegment};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// metadata

const PT_NULL: u32 = 0;
const PT_LOAD: u32 = 1;
const ET_EXEC: u16 = 2;
const EM_QDSP6: u16 = 164;

#[derive(Clone, Copy, Debug)]
struct PhdrTemplate {
    kind: u32,
    flags: u32,
    paddr: u64,
    mem_size: u64,
    file_size: u64,
    align: u64,
}

/// Builds `.mdt` metadata blobs: an ELF header followed by its program headers.
///
/// ELF32 by default; 64-bit fields are truncated in that class.
#[derive(Clone, Debug)]
pub struct MdtBuilder {
    entry: u64,
    class64: bool,
    phdrs: Vec<PhdrTemplate>,
}

impl MdtBuilder {
    pub fn new(entry: PhysAddr) -> Self {
        Self {
            entry,
            class64: false,
            phdrs: Vec::new(),
        }
    }

    #[must_use]
    pub fn elf64(mut self) -> Self {
        self.class64 = true;
        self
    }

    /// Add a `PT_LOAD` entry.
    #[must_use]
    pub fn segment(
        mut self,
        paddr: PhysAddr,
        mem_size: u64,
        file_size: u64,
        flags: PhdrFlags,
        align: u64,
    ) -> Self {
        self.phdrs.push(PhdrTemplate {
            kind: PT_LOAD,
            flags: flags.bits(),
            paddr,
            mem_size,
            file_size,
            align,
        });
        self
    }

    /// Add the hash segment carrying the image signature.
    #[must_use]
    pub fn hash_segment(mut self, file_size: u64) -> Self {
        self.phdrs.push(PhdrTemplate {
            kind: PT_NULL,
            flags: PhdrFlags::hash_segment().bits(),
            paddr: 0,
            mem_size: 0,
            file_size,
            align: 0x1000,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        if self.class64 {
            self.build64()
        } else {
            self.build32()
        }
    }

    fn ident(&self, class: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&ELF_MAGIC);
        out.extend_from_slice(&[class, 1, 1, 0]);
        out.resize(16, 0);
        out
    }

    fn build32(&self) -> Vec<u8> {
        const EHDR: u16 = 52;
        const PHDR: u16 = 32;
        let mut out = self.ident(1);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_QDSP6.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&(self.entry as u32).to_le_bytes());
        out.extend_from_slice(&u32::from(EHDR).to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&EHDR.to_le_bytes());
        out.extend_from_slice(&PHDR.to_le_bytes());
        out.extend_from_slice(&(self.phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]); // no section headers
        for ph in &self.phdrs {
            for field in [
                ph.kind,
                0,
                ph.paddr as u32,
                ph.paddr as u32,
                ph.file_size as u32,
                ph.mem_size as u32,
                ph.flags,
                ph.align as u32,
            ] {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        out
    }

    fn build64(&self) -> Vec<u8> {
        const EHDR: u16 = 64;
        const PHDR: u16 = 56;
        let mut out = self.ident(2);
        out.extend_from_slice(&ET_EXEC.to_le_bytes());
        out.extend_from_slice(&EM_QDSP6.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&self.entry.to_le_bytes());
        out.extend_from_slice(&u64::from(EHDR).to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&EHDR.to_le_bytes());
        out.extend_from_slice(&PHDR.to_le_bytes());
        out.extend_from_slice(&(self.phdrs.len() as u16).to_le_bytes());
        out.extend_from_slice(&[0; 6]);
        for ph in &self.phdrs {
            out.extend_from_slice(&ph.kind.to_le_bytes());
            out.extend_from_slice(&ph.flags.to_le_bytes());
            for field in [0, ph.paddr, ph.paddr, ph.file_size, ph.mem_size, ph.align] {
                out.extend_from_slice(&field.to_le_bytes());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// physical memory

struct Bank {
    base: PhysAddr,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct MemInner {
    banks: Vec<Bank>,
    host: Vec<(PhysAddr, u64)>,
    maps: usize,
}

/// Banks of simulated RAM plus the ranges the host itself owns.
///
/// Clones share the same banks.
#[derive(Clone, Default)]
pub struct SimMemory {
    inner: Arc<Mutex<MemInner>>,
}

impl SimMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Back `[base, base + size)` with zeroed RAM.
    pub fn add_bank(&self, base: PhysAddr, size: usize) {
        lock(&self.inner).banks.push(Bank {
            base,
            bytes: vec![0; size],
        });
    }

    /// Mark `[start, start + size)` as host memory.
    pub fn reserve_host(&self, start: PhysAddr, size: u64) {
        lock(&self.inner).host.push((start, size));
    }

    /// Set every byte of a range; unmapped ranges are skipped with a warning.
    pub fn fill(&self, addr: PhysAddr, len: usize, byte: u8) {
        if let Err(e) = self.with_mapping(addr, len, &mut |buf: &mut [u8]| buf.fill(byte)) {
            warn!("[sim] fill {addr:#x}: {e}");
        }
    }

    pub fn read(&self, addr: PhysAddr, len: usize) -> PilResult<Vec<u8>> {
        let mut out = Vec::new();
        self.with_mapping(addr, len, &mut |buf: &mut [u8]| out.extend_from_slice(buf))?;
        Ok(out)
    }

    pub fn write(&self, addr: PhysAddr, data: &[u8]) -> PilResult<()> {
        self.with_mapping(addr, data.len(), &mut |buf: &mut [u8]| buf.copy_from_slice(data))
    }

    /// Number of mappings handed out so far.
    pub fn map_count(&self) -> usize {
        lock(&self.inner).maps
    }
}

impl PhysMemory for SimMemory {
    fn with_mapping(
        &self,
        paddr: PhysAddr,
        len: usize,
        f: &mut dyn FnMut(&mut [u8]),
    ) -> PilResult<()> {
        let mut inner = lock(&self.inner);
        inner.maps += 1;
        let end = paddr
            .checked_add(len as u64)
            .ok_or_else(|| PilError::ResourceExhausted(format!("cannot map {paddr:#x}+{len:#x}")))?;
        let bank = inner
            .banks
            .iter_mut()
            .find(|b| b.base <= paddr && end <= b.base + b.bytes.len() as u64)
            .ok_or_else(|| {
                PilError::ResourceExhausted(format!("no memory backs {paddr:#x}..{end:#x}"))
            })?;
        let off = (paddr - bank.base) as usize;
        f(&mut bank.bytes[off..off + len]);
        Ok(())
    }

    fn overlaps_host_memory(&self, start: PhysAddr, size: u64) -> bool {
        let end = start.saturating_add(size);
        lock(&self.inner)
            .host
            .iter()
            .any(|&(h, len)| start < h.saturating_add(len) && h < end)
    }
}

// ---------------------------------------------------------------------------
// region allocator

#[derive(Default)]
struct AllocInner {
    live: Vec<(PhysAddr, u64, u64)>,
    next_cookie: u64,
    alloc_calls: usize,
    free_calls: usize,
}

/// First-fit allocator over a fixed window.
pub struct SimAllocator {
    base: PhysAddr,
    capacity: u64,
    inner: Mutex<AllocInner>,
}

fn round_up(value: u64, align: u64) -> Option<u64> {
    value.checked_add(align - 1).map(|v| v / align * align)
}

impl SimAllocator {
    pub fn new(base: PhysAddr, capacity: u64) -> Self {
        Self {
            base,
            capacity,
            inner: Mutex::new(AllocInner::default()),
        }
    }

    pub fn alloc_calls(&self) -> usize {
        lock(&self.inner).alloc_calls
    }

    pub fn free_calls(&self) -> usize {
        lock(&self.inner).free_calls
    }

    /// Allocations not yet freed.
    pub fn live(&self) -> usize {
        lock(&self.inner).live.len()
    }
}

impl RegionAllocator for SimAllocator {
    fn alloc(&self, size: u64, align: u64) -> PilResult<RegionAllocation> {
        let mut inner = lock(&self.inner);
        inner.alloc_calls += 1;
        let align = align.max(1);
        let limit = self.base.saturating_add(self.capacity);
        let exhausted = || PilError::ResourceExhausted(format!("no {size:#x} bytes at align {align:#x}"));

        let mut candidate = round_up(self.base, align).ok_or_else(exhausted)?;
        loop {
            let end = candidate.checked_add(size).ok_or_else(exhausted)?;
            if end > limit {
                return Err(exhausted());
            }
            match inner
                .live
                .iter()
                .find(|&&(b, s, _)| candidate < b + s && b < end)
            {
                Some(&(b, s, _)) => candidate = round_up(b + s, align).ok_or_else(exhausted)?,
                None => break,
            }
        }
        inner.next_cookie += 1;
        let cookie = inner.next_cookie;
        inner.live.push((candidate, size, cookie));
        debug!("[sim] alloc {candidate:#x}+{size:#x} (cookie {cookie})");
        Ok(RegionAllocation::new(candidate, size, cookie))
    }

    fn free(&self, allocation: RegionAllocation) {
        let mut inner = lock(&self.inner);
        inner.free_calls += 1;
        let before = inner.live.len();
        inner.live.retain(|&(_, _, c)| c != allocation.cookie());
        if inner.live.len() == before {
            warn!("[sim] free of unknown allocation {:#x}", allocation.base());
        }
    }
}

// ---------------------------------------------------------------------------
// blob storage

/// Named blobs held in memory.
#[derive(Default)]
pub struct FirmwareStore {
    blobs: Mutex<HashMap<String, Arc<[u8]>>>,
    requests: Mutex<Vec<String>>,
}

impl FirmwareStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        lock(&self.blobs).insert(name.into(), data.into());
    }

    pub fn remove(&self, name: &str) {
        lock(&self.blobs).remove(name);
    }

    /// Every blob name requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }

    /// Handles to `name` still held outside the store.
    pub fn outstanding(&self, name: &str) -> usize {
        lock(&self.blobs)
            .get(name)
            .map_or(0, |data| Arc::strong_count(data) - 1)
    }

    fn get(&self, name: &str) -> PilResult<Arc<[u8]>> {
        lock(&self.requests).push(name.to_owned());
        lock(&self.blobs)
            .get(name)
            .cloned()
            .ok_or_else(|| PilError::NotFound(name.to_owned()))
    }
}

impl FirmwareLoader for FirmwareStore {
    fn request(&self, name: &str) -> PilResult<Firmware> {
        Ok(Firmware::new(name, self.get(name)?))
    }

    fn request_into(
        &self,
        name: &str,
        dest: PhysAddr,
        capacity: usize,
        memory: &dyn PhysMemory,
    ) -> PilResult<usize> {
        let data = self.get(name)?;
        if data.len() > capacity {
            return Err(PilError::NotFound(name.to_owned()));
        }
        if !data.is_empty() {
            memory.with_mapping(dest, data.len(), &mut |buf: &mut [u8]| {
                buf.copy_from_slice(&data)
            })?;
        }
        Ok(data.len())
    }
}

// ---------------------------------------------------------------------------
// verification

/// SHA-256 verifier: each segment address maps to its expected digest.
#[derive(Clone)]
pub struct DigestVerifier {
    memory: SimMemory,
    expected: Arc<Mutex<HashMap<PhysAddr, [u8; 32]>>>,
}

impl DigestVerifier {
    pub fn new(memory: SimMemory) -> Self {
        Self {
            memory,
            expected: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn digest(data: &[u8]) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(data));
        out
    }

    pub fn expect(&self, paddr: PhysAddr, digest: [u8; 32]) {
        lock(&self.expected).insert(paddr, digest);
    }

    /// Register a digest given as lowercase hex.
    pub fn expect_hex(&self, paddr: PhysAddr, digest: &str) -> anyhow::Result<()> {
        let raw = hex::decode(digest)?;
        let digest: [u8; 32] = raw
            .try_into()
            .map_err(|_| anyhow!("digest for {paddr:#x} is not 32 bytes"))?;
        self.expect(paddr, digest);
        Ok(())
    }
}

impl BlobVerifier for DigestVerifier {
    fn verify_blob(&self, paddr: PhysAddr, size: u64) -> anyhow::Result<()> {
        let want = lock(&self.expected)
            .get(&paddr)
            .copied()
            .ok_or_else(|| anyhow!("no digest registered for {paddr:#x}"))?;
        let len = usize::try_from(size)?;
        let got = Self::digest(&self.memory.read(paddr, len)?);
        if got != want {
            bail!(
                "digest mismatch at {paddr:#x}: expected {} got {}",
                hex::encode(want),
                hex::encode(got)
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// interrupt line

/// Unvote interrupt fired by hand.
#[derive(Default)]
pub struct SimIrq {
    handler: Mutex<Option<UnvoteIrqHandler>>,
    enabled: AtomicBool,
    freed: AtomicBool,
    refuse: AtomicBool,
}

impl SimIrq {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `request` fail.
    pub fn refuse_request(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    /// Raise the line. Returns whether a handler saw it.
    pub fn fire(&self) -> bool {
        if !self.enabled.load(Ordering::SeqCst) {
            return false;
        }
        let handler = lock(&self.handler).clone();
        match handler {
            Some(h) => {
                h.handle();
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_requested(&self) -> bool {
        lock(&self.handler).is_some()
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::SeqCst)
    }
}

impl IrqLine for SimIrq {
    fn request(&self, name: &str, handler: UnvoteIrqHandler) -> anyhow::Result<()> {
        if self.refuse.swap(false, Ordering::SeqCst) {
            bail!("irq for {name} already claimed");
        }
        *lock(&self.handler) = Some(handler);
        Ok(())
    }

    fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    fn free(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        *lock(&self.handler) = None;
        self.freed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// implementation hooks

/// Peripheral hooks that record every call and fail on request.
///
/// Hook names: `proxy_vote`, `proxy_unvote`, `init_image`, `deinit_image`,
/// `mem_setup`, `auth_and_reset`, `shutdown`.
pub struct SimOps {
    proxy: bool,
    verifier: Option<DigestVerifier>,
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<Vec<&'static str>>,
    mem_setups: Mutex<Vec<(PhysAddr, u64)>>,
}

impl SimOps {
    fn build(proxy: bool, verifier: Option<DigestVerifier>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            verifier,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            mem_setups: Mutex::new(Vec::new()),
        })
    }

    /// Every hook present, no verifier.
    pub fn new() -> Arc<Self> {
        Self::build(true, None)
    }

    /// No proxy voter.
    pub fn without_proxy() -> Arc<Self> {
        Self::build(false, None)
    }

    pub fn with_verifier(verifier: DigestVerifier) -> Arc<Self> {
        Self::build(true, Some(verifier))
    }

    /// Make `hook` fail from now on.
    pub fn fail_at(&self, hook: &'static str) {
        lock(&self.failures).push(hook);
    }

    pub fn clear_failures(&self) {
        lock(&self.failures).clear();
    }

    pub fn calls(&self) -> Vec<&'static str> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, hook: &str) -> usize {
        lock(&self.calls).iter().filter(|c| **c == hook).count()
    }

    pub fn votes(&self) -> usize {
        self.count("proxy_vote")
    }

    pub fn unvotes(&self) -> usize {
        self.count("proxy_unvote")
    }

    /// Arguments of every `mem_setup` call.
    pub fn mem_setups(&self) -> Vec<(PhysAddr, u64)> {
        lock(&self.mem_setups).clone()
    }

    fn call(&self, hook: &'static str) -> anyhow::Result<()> {
        lock(&self.calls).push(hook);
        if lock(&self.failures).contains(&hook) {
            bail!("{hook} refused by simulated peripheral");
        }
        Ok(())
    }
}

impl ProxyVoter for SimOps {
    fn vote(&self) -> anyhow::Result<()> {
        self.call("proxy_vote")
    }

    fn unvote(&self) {
        lock(&self.calls).push("proxy_unvote");
    }
}

impl ImageSetup for SimOps {
    fn init_image(&self, metadata: &[u8]) -> anyhow::Result<()> {
        if metadata.get(..ELF_MAGIC.len()) != Some(&ELF_MAGIC[..]) {
            bail!("metadata handed to init_image is not an elf header");
        }
        self.call("init_image")
    }

    fn deinit_image(&self) {
        lock(&self.calls).push("deinit_image");
    }
}

impl MemSetup for SimOps {
    fn mem_setup(&self, base: PhysAddr, size: u64) -> anyhow::Result<()> {
        lock(&self.mem_setups).push((base, size));
        self.call("mem_setup")
    }
}

impl PilOps for SimOps {
    fn auth_and_reset(&self) -> anyhow::Result<()> {
        self.call("auth_and_reset")
    }

    fn shutdown(&self) -> anyhow::Result<()> {
        self.call("shutdown")
    }

    fn proxy(&self) -> Option<&dyn ProxyVoter> {
        if self.proxy {
            Some(self)
        } else {
            None
        }
    }

    fn image(&self) -> Option<&dyn ImageSetup> {
        Some(self)
    }

    fn memory(&self) -> Option<&dyn MemSetup> {
        Some(self)
    }

    fn verifier(&self) -> Option<&dyn BlobVerifier> {
        self.verifier.as_ref().map(|v| v as &dyn BlobVerifier)
    }
}

// ---------------------------------------------------------------------------
// ramdump

/// Capture facility that keeps every batch it receives.
#[derive(Default)]
pub struct SimRamdump {
    captures: Mutex<Vec<Vec<RamdumpSegment>>>,
    fail: AtomicBool,
}

impl SimRamdump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn captures(&self) -> Vec<Vec<RamdumpSegment>> {
        lock(&self.captures).clone()
    }
}

impl RamdumpDevice for SimRamdump {
    fn capture(&self, segments: &[RamdumpSegment]) -> PilResult<()> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(PilError::ResourceExhausted("capture device busy".into()));
        }
        lock(&self.captures).push(segments.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// bundle

/// Memory, allocator and blob store wired together.
///
/// Fixed images may use `[0, fixed_size)`; relocatable regions come out of
/// `[reloc_base, reloc_base + reloc_size)`.
pub struct SimPlatform {
    pub memory: SimMemory,
    pub allocator: Arc<SimAllocator>,
    pub firmware: Arc<FirmwareStore>,
}

impl SimPlatform {
    pub fn new(fixed_size: usize, reloc_base: PhysAddr, reloc_size: usize) -> Self {
        let memory = SimMemory::new();
        memory.add_bank(0, fixed_size);
        memory.add_bank(reloc_base, reloc_size);
        Self {
            memory,
            allocator: Arc::new(SimAllocator::new(reloc_base, reloc_size as u64)),
            firmware: Arc::new(FirmwareStore::new()),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform::new(
            self.firmware.clone(),
            Arc::new(self.memory.clone()),
            self.allocator.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_honours_alignment_and_capacity() {
        let allocator = SimAllocator::new(0x1000, 0x10_0000);
        let a = allocator.alloc(0x1000, 0x1000).unwrap();
        let b = allocator.alloc(0x1000, 0x4000).unwrap();
        assert_eq!(a.base(), 0x1000);
        assert_eq!(b.base(), 0x4000);
        assert!(allocator.alloc(0x20_0000, 0x1000).is_err());
        allocator.free(a);
        assert_eq!(allocator.live(), 1);
    }

    #[test]
    fn store_tracks_outstanding_handles() {
        let store = FirmwareStore::new();
        store.insert("a.mdt", vec![1, 2, 3]);
        let fw = store.request("a.mdt").unwrap();
        assert_eq!(store.outstanding("a.mdt"), 1);
        drop(fw);
        assert_eq!(store.outstanding("a.mdt"), 0);
        assert!(matches!(store.request("b.mdt"), Err(PilError::NotFound(_))));
    }

    #[test]
    fn verifier_accepts_hex_digests() {
        let memory = SimMemory::new();
        memory.add_bank(0, 0x100);
        memory.write(0x10, b"abc").unwrap();
        let verifier = DigestVerifier::new(memory);
        verifier
            .expect_hex(
                0x10,
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
            )
            .unwrap();
        verifier.verify_blob(0x10, 3).unwrap();
        assert!(verifier.verify_blob(0x10, 2).is_err());
        assert!(verifier.verify_blob(0x20, 3).is_err());
    }
}
