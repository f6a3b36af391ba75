// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device physical memory.
//!
//! Two regions are modelled: device-local VRAM and system memory reachable by
//! the device. Each is backed by a sparse anonymous mmap, so untouched pages
//! never get committed by the host. The regions live at disjoint device
//! physical addresses ([`VRAM_BASE`], [`SYSTEM_BASE`]), which lets a bare
//! device address identify its domain.

use std::collections::BTreeMap;

use memmap2::MmapMut;
use parking_lot::Mutex;
use thiserror::Error;

use gpuvm_common::{
    align_up, DevAddr, MemoryDomain, Settings, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE, PAGE_SIZE_U64,
    SYSTEM_BASE, VRAM_BASE,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors returned by [`DeviceMemory`] operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("{domain} memory exhausted (requested {requested} pages, {free} free)")]
    Exhausted {
        domain: MemoryDomain,
        requested: usize,
        free: usize,
    },

    #[error("device address 0x{0:016X} is not backed by device memory")]
    InvalidAddress(DevAddr),

    #[error("access [0x{0:016X}+0x{1:X}) runs past the end of its region")]
    OutOfBounds(DevAddr, usize),

    #[error("device address 0x{0:016X} is not page-aligned")]
    Misaligned(DevAddr),

    #[error("failed to create backing mmap: {0}")]
    MmapFailed(#[from] std::io::Error),
}

/// Result alias for memory operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

// ---------------------------------------------------------------------------
// Frame allocator
// ---------------------------------------------------------------------------

/// First-fit allocator over page frames, keyed by first free frame.
#[derive(Debug)]
struct FrameAllocator {
    free: BTreeMap<u64, u64>,
    total: u64,
    used: u64,
}

impl FrameAllocator {
    fn new(frames: u64) -> Self {
        let mut free = BTreeMap::new();
        if frames > 0 {
            free.insert(0, frames);
        }
        Self {
            free,
            total: frames,
            used: 0,
        }
    }

    fn free_frames(&self) -> u64 {
        self.total - self.used
    }

    /// Allocate `count` consecutive frames whose first frame is a multiple of `align`.
    fn alloc(&mut self, count: u64, align: u64) -> Option<u64> {
        let (start, len, aligned) = self.free.iter().find_map(|(&start, &len)| {
            let aligned = align_up(start, align);
            (aligned + count <= start + len).then_some((start, len, aligned))
        })?;

        self.free.remove(&start);
        if aligned > start {
            self.free.insert(start, aligned - start);
        }
        let tail = (start + len) - (aligned + count);
        if tail > 0 {
            self.free.insert(aligned + count, tail);
        }
        self.used += count;
        Some(aligned)
    }

    fn release(&mut self, frame: u64, count: u64) {
        let mut start = frame;
        let mut len = count;

        // Merge with the preceding free run.
        if let Some((&prev, &prev_len)) = self.free.range(..frame).next_back() {
            if prev + prev_len == frame {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        // Merge with the following free run.
        if let Some(&next_len) = self.free.get(&(frame + count)) {
            self.free.remove(&(frame + count));
            len += next_len;
        }

        self.free.insert(start, len);
        self.used -= count;
    }
}

// ---------------------------------------------------------------------------
// Regions
// ---------------------------------------------------------------------------

struct Region {
    domain: MemoryDomain,
    base: DevAddr,
    size: u64,
    backing: Mutex<MmapMut>,
    frames: Mutex<FrameAllocator>,
}

impl Region {
    fn new(domain: MemoryDomain, base: DevAddr, size: u64) -> MemoryResult<Self> {
        let size = size & !PAGE_MASK;
        let backing = MmapMut::map_anon(size.max(PAGE_SIZE_U64) as usize)?;
        Ok(Self {
            domain,
            base,
            size,
            backing: Mutex::new(backing),
            frames: Mutex::new(FrameAllocator::new(size >> PAGE_SHIFT)),
        })
    }

    fn contains(&self, addr: DevAddr) -> bool {
        addr >= self.base && addr < self.base + self.size
    }

    fn offset(&self, addr: DevAddr, len: usize) -> MemoryResult<usize> {
        let off = addr - self.base;
        if off + len as u64 > self.size {
            return Err(MemoryError::OutOfBounds(addr, len));
        }
        Ok(off as usize)
    }
}

/// How pages of one allocation are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// One physically contiguous run aligned to `align` bytes.
    Contiguous { align: u64 },
    /// Pages are handed out in descending physical order, so no two
    /// neighbouring pages are physically adjacent.
    Scattered,
}

// ---------------------------------------------------------------------------
// DeviceMemory
// ---------------------------------------------------------------------------

/// Physical memory as seen by the device.
pub struct DeviceMemory {
    vram: Region,
    system: Region,
    vram_cpu_visible: bool,
}

impl DeviceMemory {
    pub fn new(vram_size: u64, system_size: u64, vram_cpu_visible: bool) -> MemoryResult<Self> {
        let vram = Region::new(MemoryDomain::Vram, VRAM_BASE, vram_size)?;
        let system = Region::new(MemoryDomain::System, SYSTEM_BASE, system_size)?;
        log::info!(
            "memory: vram {} MiB @ 0x{:X}, system {} MiB @ 0x{:X}, vram cpu-visible={}",
            vram.size >> 20,
            VRAM_BASE,
            system.size >> 20,
            SYSTEM_BASE,
            vram_cpu_visible
        );
        Ok(Self {
            vram,
            system,
            vram_cpu_visible,
        })
    }

    pub fn from_settings(settings: &Settings) -> MemoryResult<Self> {
        Self::new(
            settings.vram_size,
            settings.system_size,
            settings.vram_cpu_visible,
        )
    }

    fn region(&self, domain: MemoryDomain) -> &Region {
        match domain {
            MemoryDomain::Vram => &self.vram,
            MemoryDomain::System => &self.system,
        }
    }

    fn region_of(&self, addr: DevAddr) -> MemoryResult<&Region> {
        if self.vram.contains(addr) {
            Ok(&self.vram)
        } else if self.system.contains(addr) {
            Ok(&self.system)
        } else {
            Err(MemoryError::InvalidAddress(addr))
        }
    }

    /// Domain holding `addr`, if any.
    pub fn domain_of(&self, addr: DevAddr) -> Option<MemoryDomain> {
        self.region_of(addr).ok().map(|r| r.domain)
    }

    /// Size of a domain in bytes.
    pub fn size(&self, domain: MemoryDomain) -> u64 {
        self.region(domain).size
    }

    /// Whether the host CPU may write `domain` directly.
    pub fn is_cpu_visible(&self, domain: MemoryDomain) -> bool {
        match domain {
            MemoryDomain::System => true,
            MemoryDomain::Vram => self.vram_cpu_visible,
        }
    }

    // -- Allocation ---------------------------------------------------------

    /// Allocate `count` pages in `domain`.
    pub fn alloc_pages(
        &self,
        domain: MemoryDomain,
        count: usize,
        placement: Placement,
    ) -> MemoryResult<Vec<DevAddr>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let region = self.region(domain);
        let align_frames = match placement {
            Placement::Contiguous { align } => (align.max(PAGE_SIZE_U64) >> PAGE_SHIFT).next_power_of_two(),
            Placement::Scattered => 1,
        };

        let first = {
            let mut frames = region.frames.lock();
            frames
                .alloc(count as u64, align_frames)
                .ok_or(MemoryError::Exhausted {
                    domain,
                    requested: count,
                    free: frames.free_frames() as usize,
                })?
        };

        let mut pages: Vec<DevAddr> = (0..count as u64)
            .map(|i| region.base + ((first + i) << PAGE_SHIFT))
            .collect();
        if placement == Placement::Scattered {
            pages.reverse();
        }

        log::trace!(
            "memory: alloc {} {} pages @ 0x{:X} ({:?})",
            count,
            domain,
            region.base + (first << PAGE_SHIFT),
            placement
        );
        Ok(pages)
    }

    /// Allocate one zero-filled page.
    pub fn alloc_zeroed_page(&self, domain: MemoryDomain) -> MemoryResult<DevAddr> {
        let page = self.alloc_pages(domain, 1, Placement::Contiguous { align: PAGE_SIZE_U64 })?[0];
        self.fill(page, PAGE_SIZE, 0)?;
        Ok(page)
    }

    /// Return pages to their domain.
    pub fn free_pages(&self, pages: &[DevAddr]) {
        for &page in pages {
            match self.region_of(page) {
                Ok(region) => {
                    let frame = (page - region.base) >> PAGE_SHIFT;
                    region.frames.lock().release(frame, 1);
                }
                Err(_) => log::warn!("memory: free of foreign page 0x{:X}", page),
            }
        }
    }

    /// Number of allocated pages in `domain`.
    pub fn used_pages(&self, domain: MemoryDomain) -> usize {
        self.region(domain).frames.lock().used as usize
    }

    // -- Access -------------------------------------------------------------

    pub fn read(&self, addr: DevAddr, dst: &mut [u8]) -> MemoryResult<()> {
        if dst.is_empty() {
            return Ok(());
        }
        let region = self.region_of(addr)?;
        let off = region.offset(addr, dst.len())?;
        let backing = region.backing.lock();
        dst.copy_from_slice(&backing[off..off + dst.len()]);
        Ok(())
    }

    pub fn write(&self, addr: DevAddr, src: &[u8]) -> MemoryResult<()> {
        if src.is_empty() {
            return Ok(());
        }
        let region = self.region_of(addr)?;
        let off = region.offset(addr, src.len())?;
        let mut backing = region.backing.lock();
        backing[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn fill(&self, addr: DevAddr, len: usize, value: u8) -> MemoryResult<()> {
        if len == 0 {
            return Ok(());
        }
        let region = self.region_of(addr)?;
        let off = region.offset(addr, len)?;
        let mut backing = region.backing.lock();
        backing[off..off + len].fill(value);
        Ok(())
    }

    pub fn read_u64(&self, addr: DevAddr) -> MemoryResult<u64> {
        let mut bytes = [0u8; 8];
        self.read(addr, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }

    pub fn write_u64(&self, addr: DevAddr, value: u64) -> MemoryResult<()> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write consecutive little-endian qwords starting at `addr`.
    pub fn write_qwords(&self, addr: DevAddr, values: &[u64]) -> MemoryResult<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write(addr, &bytes)
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

/// Backing pages of an object, in object order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storage {
    domain: MemoryDomain,
    pages: Vec<DevAddr>,
}

impl Storage {
    pub fn new(domain: MemoryDomain, pages: Vec<DevAddr>) -> Self {
        Self { domain, pages }
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    pub fn pages(&self) -> &[DevAddr] {
        &self.pages
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        (self.pages.len() as u64) << PAGE_SHIFT
    }

    /// Device address of byte `offset`.
    pub fn addr(&self, offset: u64) -> Option<DevAddr> {
        self.pages
            .get((offset >> PAGE_SHIFT) as usize)
            .map(|page| page + (offset & PAGE_MASK))
    }

    /// Number of physically consecutive pages starting at page `first`,
    /// capped at `max`.
    pub fn run_len(&self, first: usize, max: usize) -> usize {
        let Some(&base) = self.pages.get(first) else {
            return 0;
        };
        let end = self.pages.len().min(first.saturating_add(max));
        let mut n = 1;
        while first + n < end && self.pages[first + n] == base + ((n as u64) << PAGE_SHIFT) {
            n += 1;
        }
        n
    }

    /// Whether bytes `[offset, offset + len)` are physically contiguous and
    /// start at a device address aligned to `align`.
    pub fn is_contiguous(&self, offset: u64, len: u64, align: u64) -> bool {
        let first = (offset >> PAGE_SHIFT) as usize;
        let count = (len >> PAGE_SHIFT) as usize;
        match self.addr(offset) {
            Some(start) if start % align == 0 && offset & PAGE_MASK == 0 => {
                count > 0 && self.run_len(first, count) == count
            }
            _ => false,
        }
    }

    /// Pages covering bytes `[offset, offset + len)`.
    pub fn slice(&self, offset: u64, len: u64) -> Storage {
        let first = ((offset >> PAGE_SHIFT) as usize).min(self.pages.len());
        let end = ((align_up(offset + len, PAGE_SIZE_U64) >> PAGE_SHIFT) as usize).min(self.pages.len());
        Storage::new(self.domain, self.pages[first..end].to_vec())
    }
}
