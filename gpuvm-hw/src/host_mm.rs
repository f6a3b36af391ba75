// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Host process memory manager.
//!
//! Models the slice of the host kernel's MM that user-pointer mappings depend
//! on: anonymous regions whose pages are faulted in lazily from system memory,
//! page pinning with reference counts, page migration, and interval notifiers
//! with a per-interval change sequence.
//!
//! The sequence of an interval is odd while an invalidation is in progress and
//! advances by two for every completed invalidation that overlaps it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use thiserror::Error;

use gpuvm_common::{
    is_page_aligned, DevAddr, HostVa, MemoryDomain, PAGE_MASK, PAGE_SIZE, PAGE_SIZE_U64,
};

use crate::memory::{DeviceMemory, MemoryError};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned by [`HostMm`] operations.
#[derive(Debug, Error)]
pub enum HostMmError {
    #[error("host address 0x{0:016X} is not mapped")]
    NotMapped(HostVa),

    #[error("permission denied at host address 0x{addr:016X}: required {required}, have {actual}")]
    PermissionDenied {
        addr: HostVa,
        required: HostProt,
        actual: HostProt,
    },

    #[error("host address 0x{0:016X} is not page-aligned")]
    Misaligned(HostVa),

    #[error("region [0x{0:016X}..0x{1:016X}) overlaps an existing mapping")]
    Overlap(HostVa, HostVa),

    #[error("host memory exhausted")]
    OutOfMemory,

    #[error("memory access failed: {0}")]
    Memory(MemoryError),
}

impl From<MemoryError> for HostMmError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::Exhausted { .. } => HostMmError::OutOfMemory,
            other => HostMmError::Memory(other),
        }
    }
}

pub type HostMmResult<T> = Result<T, HostMmError>;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

bitflags! {
    /// Protection of a host region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostProt: u32 {
        const READ  = 1;
        const WRITE = 2;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl std::fmt::Display for HostProt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let r = if self.contains(Self::READ) { 'R' } else { '-' };
        let w = if self.contains(Self::WRITE) { 'W' } else { '-' };
        write!(f, "{r}{w}")
    }
}

bitflags! {
    /// Reclaim state of a page frame.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageState: u32 {
        const REFERENCED = 1;
        const DIRTY      = 2;
    }
}

// ---------------------------------------------------------------------------
// Notifiers
// ---------------------------------------------------------------------------

/// Callback for invalidations of a registered interval.
///
/// Invoked synchronously from the invalidating thread. Implementations must
/// not block.
pub trait HostNotifier: Send + Sync {
    fn invalidate(&self, start: HostVa, end: HostVa, seq: u64);
}

/// Handle of a registered interval notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierHandle(u64);

struct Interval {
    start: HostVa,
    end: HostVa,
    seq: Arc<AtomicU64>,
    callback: Weak<dyn HostNotifier>,
}

// ---------------------------------------------------------------------------
// HostMm
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Region {
    size: u64,
    prot: HostProt,
}

#[derive(Debug, Default)]
struct Frame {
    pins: u32,
    mapped: bool,
    state: PageState,
}

#[derive(Default)]
struct Inner {
    regions: BTreeMap<HostVa, Region>,
    /// Page VA -> frame.
    pages: HashMap<HostVa, DevAddr>,
    frames: HashMap<DevAddr, Frame>,
    next_va: HostVa,
}

/// Base of the bump allocator used by [`HostMm::mmap`].
const MMAP_BASE: HostVa = 0x7F00_0000_0000;

/// A host process address space.
pub struct HostMm {
    mem: Arc<DeviceMemory>,
    inner: Mutex<Inner>,
    notifiers: Mutex<HashMap<u64, Interval>>,
    next_notifier: AtomicU64,
}

impl HostMm {
    pub fn new(mem: Arc<DeviceMemory>) -> Self {
        Self {
            mem,
            inner: Mutex::new(Inner {
                next_va: MMAP_BASE,
                ..Inner::default()
            }),
            notifiers: Mutex::new(HashMap::new()),
            next_notifier: AtomicU64::new(1),
        }
    }

    // -- Regions ------------------------------------------------------------

    /// Map an anonymous region at a kernel-chosen address.
    pub fn mmap(&self, size: u64, prot: HostProt) -> HostMmResult<HostVa> {
        let va = {
            let mut inner = self.inner.lock();
            let va = inner.next_va;
            // Leave a guard page between regions.
            inner.next_va += (size + PAGE_MASK) & !PAGE_MASK;
            inner.next_va += PAGE_SIZE_U64;
            va
        };
        self.mmap_fixed(va, size, prot)?;
        Ok(va)
    }

    /// Map an anonymous region at `va`.
    pub fn mmap_fixed(&self, va: HostVa, size: u64, prot: HostProt) -> HostMmResult<()> {
        if !is_page_aligned(va) {
            return Err(HostMmError::Misaligned(va));
        }
        let size = (size + PAGE_MASK) & !PAGE_MASK;
        let mut inner = self.inner.lock();
        let end = va + size;
        let overlaps = inner
            .regions
            .range(..end)
            .next_back()
            .is_some_and(|(&start, r)| start + r.size > va);
        if overlaps {
            return Err(HostMmError::Overlap(va, end));
        }
        inner.regions.insert(va, Region { size, prot });
        log::debug!("host_mm: mmap [0x{:X}..0x{:X}) {}", va, end, prot);
        Ok(())
    }

    /// Unmap the region starting at `va`.
    pub fn munmap(&self, va: HostVa) -> HostMmResult<()> {
        let (size, freed) = {
            let mut inner = self.inner.lock();
            let region = inner.regions.remove(&va).ok_or(HostMmError::NotMapped(va))?;
            let mut freed = Vec::new();
            for page in (va..va + region.size).step_by(PAGE_SIZE) {
                if let Some(frame) = inner.pages.remove(&page) {
                    if Self::release_mapping(&mut inner, frame) {
                        freed.push(frame);
                    }
                }
            }
            (region.size, freed)
        };
        self.mem.free_pages(&freed);
        log::debug!("host_mm: munmap [0x{:X}..0x{:X})", va, va + size);
        self.invalidate(va, va + size);
        Ok(())
    }

    fn region_of(inner: &Inner, va: HostVa) -> HostMmResult<Region> {
        inner
            .regions
            .range(..=va)
            .next_back()
            .filter(|(&start, r)| va < start + r.size)
            .map(|(_, r)| *r)
            .ok_or(HostMmError::NotMapped(va))
    }

    fn check_prot(inner: &Inner, va: HostVa, write: bool) -> HostMmResult<()> {
        let region = Self::region_of(inner, va)?;
        let required = if write { HostProt::WRITE } else { HostProt::READ };
        if !region.prot.contains(required) {
            return Err(HostMmError::PermissionDenied {
                addr: va,
                required,
                actual: region.prot,
            });
        }
        Ok(())
    }

    /// Drop the VA mapping of `frame`. Returns whether the frame can be freed.
    fn release_mapping(inner: &mut Inner, frame: DevAddr) -> bool {
        match inner.frames.get_mut(&frame) {
            Some(f) if f.pins > 0 => {
                f.mapped = false;
                false
            }
            _ => {
                inner.frames.remove(&frame);
                true
            }
        }
    }

    /// Frame of `page`, faulting it in when `fault` is set.
    fn frame_of(&self, inner: &mut Inner, page: HostVa, fault: bool) -> HostMmResult<Option<DevAddr>> {
        if let Some(&frame) = inner.pages.get(&page) {
            return Ok(Some(frame));
        }
        if !fault {
            return Ok(None);
        }
        let frame = self.mem.alloc_zeroed_page(MemoryDomain::System)?;
        inner.pages.insert(page, frame);
        inner.frames.insert(
            frame,
            Frame {
                mapped: true,
                ..Frame::default()
            },
        );
        log::trace!("host_mm: fault 0x{:X} -> 0x{:X}", page, frame);
        Ok(Some(frame))
    }

    // -- Access -------------------------------------------------------------

    pub fn read(&self, va: HostVa, dst: &mut [u8]) -> HostMmResult<()> {
        let mut inner = self.inner.lock();
        let mut done = 0usize;
        while done < dst.len() {
            let cur = va + done as u64;
            Self::check_prot(&inner, cur, false)?;
            let n = (dst.len() - done).min(PAGE_SIZE - (cur & PAGE_MASK) as usize);
            match self.frame_of(&mut inner, cur & !PAGE_MASK, false)? {
                Some(frame) => self.mem.read(frame + (cur & PAGE_MASK), &mut dst[done..done + n])?,
                None => dst[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    pub fn write(&self, va: HostVa, src: &[u8]) -> HostMmResult<()> {
        let mut inner = self.inner.lock();
        let mut done = 0usize;
        while done < src.len() {
            let cur = va + done as u64;
            Self::check_prot(&inner, cur, true)?;
            let n = (src.len() - done).min(PAGE_SIZE - (cur & PAGE_MASK) as usize);
            if let Some(frame) = self.frame_of(&mut inner, cur & !PAGE_MASK, true)? {
                self.mem.write(frame + (cur & PAGE_MASK), &src[done..done + n])?;
            }
            done += n;
        }
        Ok(())
    }

    /// Whether the page holding `va` has a frame.
    pub fn is_populated(&self, va: HostVa) -> bool {
        self.inner.lock().pages.contains_key(&(va & !PAGE_MASK))
    }

    /// Frame currently backing the page holding `va`.
    pub fn frame(&self, va: HostVa) -> Option<DevAddr> {
        self.inner.lock().pages.get(&(va & !PAGE_MASK)).copied()
    }

    /// Pin count of a frame.
    pub fn pin_count(&self, frame: DevAddr) -> u32 {
        self.inner.lock().frames.get(&frame).map_or(0, |f| f.pins)
    }

    /// Reclaim state of a frame.
    pub fn page_state(&self, frame: DevAddr) -> PageState {
        self.inner
            .lock()
            .frames
            .get(&frame)
            .map_or(PageState::empty(), |f| f.state)
    }

    // -- Pinning ------------------------------------------------------------

    fn pin_frame(inner: &mut Inner, frame: DevAddr, write: bool) {
        if let Some(f) = inner.frames.get_mut(&frame) {
            f.pins += 1;
            f.state |= PageState::REFERENCED;
            if write {
                f.state |= PageState::DIRTY;
            }
        }
    }

    /// Pin already-populated pages starting at `va`, without faulting.
    ///
    /// Stops at the first page that is not populated or not accessible and
    /// returns the frames pinned so far.
    pub fn pin_fast(&self, va: HostVa, count: usize, write: bool) -> Vec<DevAddr> {
        let mut inner = self.inner.lock();
        let mut frames = Vec::with_capacity(count);
        for i in 0..count {
            let page = (va & !PAGE_MASK) + (i as u64) * PAGE_SIZE_U64;
            if Self::check_prot(&inner, page, write).is_err() {
                break;
            }
            let Some(&frame) = inner.pages.get(&page) else {
                break;
            };
            Self::pin_frame(&mut inner, frame, write);
            frames.push(frame);
        }
        frames
    }

    /// Pin `count` pages starting at `va`, faulting in missing pages.
    ///
    /// On failure nothing stays pinned.
    pub fn pin(&self, va: HostVa, count: usize, write: bool) -> HostMmResult<Vec<DevAddr>> {
        let mut frames = Vec::with_capacity(count);
        let result = {
            let mut inner = self.inner.lock();
            (0..count).try_for_each(|i| -> HostMmResult<()> {
                let page = (va & !PAGE_MASK) + (i as u64) * PAGE_SIZE_U64;
                Self::check_prot(&inner, page, write)?;
                if let Some(frame) = self.frame_of(&mut inner, page, true)? {
                    Self::pin_frame(&mut inner, frame, write);
                    frames.push(frame);
                }
                Ok(())
            })
        };
        if let Err(err) = result {
            self.unpin(&frames);
            return Err(err);
        }
        Ok(frames)
    }

    /// Take an extra pin on frames that are already pinned.
    pub fn get_frames(&self, frames: &[DevAddr]) {
        let mut inner = self.inner.lock();
        for &frame in frames {
            match inner.frames.get_mut(&frame) {
                Some(f) if f.pins > 0 => f.pins += 1,
                _ => log::warn!("host_mm: get of unpinned frame 0x{:X}", frame),
            }
        }
    }

    /// Drop one pin from each frame.
    pub fn unpin(&self, frames: &[DevAddr]) {
        let mut freed = Vec::new();
        {
            let mut inner = self.inner.lock();
            for &frame in frames {
                let Some(f) = inner.frames.get_mut(&frame) else {
                    log::warn!("host_mm: unpin of unknown frame 0x{:X}", frame);
                    continue;
                };
                f.pins = f.pins.saturating_sub(1);
                if f.pins == 0 && !f.mapped {
                    inner.frames.remove(&frame);
                    freed.push(frame);
                }
            }
        }
        self.mem.free_pages(&freed);
    }

    // -- Migration ----------------------------------------------------------

    /// Move the page holding `va` to a new frame, as compaction would.
    /// Pinned frames stay allocated until unpinned.
    pub fn migrate_page(&self, va: HostVa) -> HostMmResult<DevAddr> {
        let page = va & !PAGE_MASK;
        let (old, new, free_old) = {
            let mut inner = self.inner.lock();
            Self::region_of(&inner, page)?;
            let old = *inner.pages.get(&page).ok_or(HostMmError::NotMapped(page))?;
            let new = self.mem.alloc_pages(
                MemoryDomain::System,
                1,
                crate::memory::Placement::Contiguous { align: PAGE_SIZE_U64 },
            )?[0];
            let mut data = vec![0u8; PAGE_SIZE];
            self.mem.read(old, &mut data)?;
            self.mem.write(new, &data)?;
            inner.pages.insert(page, new);
            inner.frames.insert(
                new,
                Frame {
                    mapped: true,
                    ..Frame::default()
                },
            );
            let free_old = Self::release_mapping(&mut inner, old);
            (old, new, free_old)
        };
        if free_old {
            self.mem.free_pages(&[old]);
        }
        log::debug!("host_mm: migrated 0x{:X}: 0x{:X} -> 0x{:X}", page, old, new);
        self.invalidate(page, page + PAGE_SIZE_U64);
        Ok(new)
    }

    // -- Notifiers ----------------------------------------------------------

    /// Register `callback` for invalidations overlapping `[start, end)`.
    pub fn register_notifier(
        &self,
        start: HostVa,
        end: HostVa,
        callback: Weak<dyn HostNotifier>,
    ) -> NotifierHandle {
        let id = self.next_notifier.fetch_add(1, Ordering::Relaxed);
        self.notifiers.lock().insert(
            id,
            Interval {
                start,
                end,
                seq: Arc::new(AtomicU64::new(2)),
                callback,
            },
        );
        NotifierHandle(id)
    }

    pub fn unregister_notifier(&self, handle: NotifierHandle) {
        self.notifiers.lock().remove(&handle.0);
    }

    fn seq_of(&self, handle: NotifierHandle) -> Option<Arc<AtomicU64>> {
        self.notifiers.lock().get(&handle.0).map(|i| i.seq.clone())
    }

    /// Current sequence of an interval. Waits out an invalidation in progress.
    pub fn read_begin(&self, handle: NotifierHandle) -> u64 {
        let Some(seq) = self.seq_of(handle) else {
            return 0;
        };
        loop {
            let s = seq.load(Ordering::Acquire);
            if s & 1 == 0 {
                return s;
            }
            std::thread::yield_now();
        }
    }

    /// Whether the interval was invalidated since `seq` was read.
    pub fn read_retry(&self, handle: NotifierHandle, seq: u64) -> bool {
        self.seq_of(handle)
            .map_or(true, |s| s.load(Ordering::Acquire) != seq)
    }

    fn invalidate(&self, start: HostVa, end: HostVa) {
        let hit: Vec<(Arc<AtomicU64>, Weak<dyn HostNotifier>)> = self
            .notifiers
            .lock()
            .values()
            .filter(|i| i.start < end && start < i.end)
            .map(|i| (i.seq.clone(), i.callback.clone()))
            .collect();
        for (seq, callback) in hit {
            let s = seq.fetch_add(1, Ordering::AcqRel) + 1;
            if let Some(callback) = callback.upgrade() {
                callback.invalidate(start, end, s + 1);
            }
            seq.fetch_add(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuvm_common::SZ_2M;
    use std::sync::atomic::AtomicUsize;

    fn host() -> (Arc<DeviceMemory>, HostMm) {
        let mem = Arc::new(DeviceMemory::new(SZ_2M, 8 * SZ_2M, true).unwrap());
        (mem.clone(), HostMm::new(mem))
    }

    #[derive(Default)]
    struct Hits(AtomicUsize);

    impl HostNotifier for Hits {
        fn invalidate(&self, _start: HostVa, _end: HostVa, _seq: u64) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_lazy_fault_and_rw() {
        let (_mem, mm) = host();
        let va = mm.mmap(4 * PAGE_SIZE_U64, HostProt::READ_WRITE).unwrap();
        assert!(!mm.is_populated(va));

        let mut buf = [0xFFu8; 8];
        mm.read(va + 0x10, &mut buf).unwrap();
        assert_eq!(buf, [0; 8]);
        assert!(!mm.is_populated(va));

        mm.write(va + PAGE_SIZE_U64 - 2, &[1, 2, 3, 4]).unwrap();
        assert!(mm.is_populated(va));
        assert!(mm.is_populated(va + PAGE_SIZE_U64));
        mm.read(va + PAGE_SIZE_U64 - 2, &mut buf[..4]).unwrap();
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_permissions_and_unmapped() {
        let (_mem, mm) = host();
        let va = mm.mmap(PAGE_SIZE_U64, HostProt::READ).unwrap();
        assert!(matches!(
            mm.write(va, &[1]),
            Err(HostMmError::PermissionDenied { .. })
        ));
        assert!(matches!(
            mm.pin(va, 1, true),
            Err(HostMmError::PermissionDenied { .. })
        ));
        assert!(matches!(
            mm.pin(va + 0x10_0000, 1, false),
            Err(HostMmError::NotMapped(_))
        ));
    }

    #[test]
    fn test_pin_fast_stops_at_hole() {
        let (_mem, mm) = host();
        let va = mm.mmap(4 * PAGE_SIZE_U64, HostProt::READ_WRITE).unwrap();
        mm.write(va, &[1]).unwrap();
        mm.write(va + PAGE_SIZE_U64, &[1]).unwrap();
        mm.write(va + 3 * PAGE_SIZE_U64, &[1]).unwrap();

        let fast = mm.pin_fast(va, 4, true);
        assert_eq!(fast.len(), 2);
        let rest = mm.pin(va + 2 * PAGE_SIZE_U64, 2, true).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(mm.pin_count(fast[0]), 1);
        assert!(mm.page_state(fast[0]).contains(PageState::REFERENCED | PageState::DIRTY));
    }

    #[test]
    fn test_migrate_keeps_pinned_frame() {
        let (mem, mm) = host();
        let va = mm.mmap(PAGE_SIZE_U64, HostProt::READ_WRITE).unwrap();
        mm.write(va, &[9, 8, 7]).unwrap();
        let pinned = mm.pin(va, 1, false).unwrap();
        let used = mem.used_pages(MemoryDomain::System);

        let new = mm.migrate_page(va).unwrap();
        assert_ne!(new, pinned[0]);
        assert_eq!(mm.frame(va), Some(new));
        assert_eq!(mem.used_pages(MemoryDomain::System), used + 1);
        let mut buf = [0u8; 3];
        mm.read(va, &mut buf).unwrap();
        assert_eq!(buf, [9, 8, 7]);

        mm.unpin(&pinned);
        assert_eq!(mem.used_pages(MemoryDomain::System), used);
    }

    #[test]
    fn test_notifier_sequence() {
        let (_mem, mm) = host();
        let va = mm.mmap(2 * PAGE_SIZE_U64, HostProt::READ_WRITE).unwrap();
        mm.write(va, &[1]).unwrap();
        let other = mm.mmap(PAGE_SIZE_U64, HostProt::READ_WRITE).unwrap();
        mm.write(other, &[1]).unwrap();

        let hits = Arc::new(Hits::default());
        let cb: Arc<dyn HostNotifier> = hits.clone();
        let handle = mm.register_notifier(va, va + 2 * PAGE_SIZE_U64, Arc::downgrade(&cb));
        let seq = mm.read_begin(handle);
        assert!(!mm.read_retry(handle, seq));

        // Unrelated range leaves the sequence alone.
        mm.migrate_page(other).unwrap();
        assert!(!mm.read_retry(handle, seq));

        mm.migrate_page(va).unwrap();
        assert!(mm.read_retry(handle, seq));
        assert_eq!(mm.read_begin(handle), seq + 2);
        assert_eq!(hits.0.load(Ordering::SeqCst), 1);

        mm.unregister_notifier(handle);
        assert!(mm.read_retry(handle, seq + 2));
    }

    #[test]
    fn test_munmap_frees_unpinned() {
        let (mem, mm) = host();
        let before = mem.used_pages(MemoryDomain::System);
        let va = mm.mmap(3 * PAGE_SIZE_U64, HostProt::READ_WRITE).unwrap();
        mm.write(va, &[0u8; 3 * PAGE_SIZE]).unwrap();
        let pinned = mm.pin(va, 1, false).unwrap();
        mm.munmap(va).unwrap();
        assert_eq!(mem.used_pages(MemoryDomain::System), before + 1);
        mm.unpin(&pinned);
        assert_eq!(mem.used_pages(MemoryDomain::System), before);
        assert!(matches!(mm.munmap(va), Err(HostMmError::NotMapped(_))));
    }
}
