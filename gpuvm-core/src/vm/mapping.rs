// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::ops::Range;
use std::sync::Arc;

use bitflags::bitflags;

use gpuvm_common::{GpuVa, HostVa, MAX_TILES};
use gpuvm_hw::{Buffer, Fence, HostMm};

use crate::pt::LeafIndex;
use crate::userptr::{PinStatus, PinnedRegion};

bitflags! {
    /// Flags of a bind request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BindFlags: u32 {
        const READ_ONLY = 1 << 0;
        /// Run the bind on the async queue.
        const ASYNC     = 1 << 1;
        /// Bind now. Without it the mapping waits for the next rebind.
        const IMMEDIATE = 1 << 2;
    }
}

/// Lifecycle state of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    Staging,
    Bound,
    /// Created without `IMMEDIATE`, not bound yet.
    Deferred,
    /// Backing changed under a bound mapping; its leaves are zapped.
    Invalidated,
    Unbinding,
}

/// What a bind request maps.
pub enum BindBacking {
    Buffer { buffer: Arc<Buffer>, offset: u64 },
    Userptr { host: Arc<HostMm>, addr: HostVa },
}

/// A request to map `[start, start + len)`.
pub struct BindRequest {
    pub start: GpuVa,
    pub len: u64,
    pub backing: BindBacking,
    pub flags: BindFlags,
    /// Tiles to bind on. `None` means every tile.
    pub tile_mask: Option<u8>,
    /// Fences the page-table writes wait for.
    pub wait: Vec<Arc<Fence>>,
    /// Fences signaled once the bind completes.
    pub signal: Vec<Arc<Fence>>,
}

impl BindRequest {
    fn new(start: GpuVa, len: u64, backing: BindBacking) -> Self {
        Self {
            start,
            len,
            backing,
            flags: BindFlags::IMMEDIATE,
            tile_mask: None,
            wait: Vec::new(),
            signal: Vec::new(),
        }
    }

    /// Map `len` bytes of `buffer` starting at byte `offset`.
    pub fn buffer(start: GpuVa, len: u64, buffer: Arc<Buffer>, offset: u64) -> Self {
        Self::new(start, len, BindBacking::Buffer { buffer, offset })
    }

    /// Map the host range starting at `addr`.
    pub fn userptr(start: GpuVa, len: u64, host: Arc<HostMm>, addr: HostVa) -> Self {
        Self::new(start, len, BindBacking::Userptr { host, addr })
    }

    pub fn read_only(mut self) -> Self {
        self.flags |= BindFlags::READ_ONLY;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.flags.remove(BindFlags::IMMEDIATE);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.flags |= BindFlags::ASYNC;
        self
    }

    pub fn tiles(mut self, mask: u8) -> Self {
        self.tile_mask = Some(mask);
        self
    }

    pub fn wait(mut self, fence: Arc<Fence>) -> Self {
        self.wait.push(fence);
        self
    }

    pub fn signal(mut self, fence: Arc<Fence>) -> Self {
        self.signal.push(fence);
        self
    }
}

/// Backing of a live mapping.
pub(crate) enum Backing {
    Buffer { buffer: Arc<Buffer>, offset: u64 },
    Userptr(PinnedRegion),
}

/// One bound range of an address space.
pub(crate) struct Mapping {
    pub id: u64,
    pub start: GpuVa,
    pub end: GpuVa,
    pub flags: BindFlags,
    pub tile_mask: u8,
    /// Tiles whose trees hold translations for the mapping.
    pub tile_present: u8,
    pub state: MappingState,
    pub backing: Backing,
    /// Whether the buffer's reverse-mapping list holds this mapping.
    pub registered: bool,
    pub leaves: [Option<LeafIndex>; MAX_TILES],
}

impl Mapping {
    pub fn new(id: u64, start: GpuVa, end: GpuVa, flags: BindFlags, tile_mask: u8, backing: Backing) -> Self {
        Self {
            id,
            start,
            end,
            flags,
            tile_mask,
            tile_present: 0,
            state: MappingState::Staging,
            backing,
            registered: false,
            leaves: Default::default(),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn contains(&self, va: GpuVa) -> bool {
        self.start <= va && va < self.end
    }

    pub fn overlaps(&self, start: GpuVa, end: GpuVa) -> bool {
        self.start < end && start < self.end
    }

    pub fn writable(&self) -> bool {
        !self.flags.contains(BindFlags::READ_ONLY)
    }

    pub fn is_userptr(&self) -> bool {
        matches!(self.backing, Backing::Userptr(_))
    }

    /// Backing buffer and the offset of the mapping's first byte in it.
    pub fn buffer(&self) -> Option<(Arc<Buffer>, u64)> {
        match &self.backing {
            Backing::Buffer { buffer, offset } => Some((buffer.clone(), *offset)),
            Backing::Userptr(_) => None,
        }
    }

    /// Whether a pinned host backing no longer matches the host.
    pub fn is_stale(&self) -> bool {
        match &self.backing {
            Backing::Userptr(region) => region.check_and_retry() == PinStatus::Stale,
            Backing::Buffer { .. } => false,
        }
    }

    pub fn tiles(&self) -> impl Iterator<Item = usize> {
        let mask = self.tile_mask;
        (0..MAX_TILES).filter(move |t| mask & (1 << t) != 0)
    }

    pub fn present_tiles(&self) -> impl Iterator<Item = usize> {
        let mask = self.tile_present;
        (0..MAX_TILES).filter(move |t| mask & (1 << t) != 0)
    }

    pub fn info(&self) -> MappingInfo {
        MappingInfo {
            id: self.id,
            start: self.start,
            end: self.end,
            state: self.state,
            read_only: !self.writable(),
            userptr: self.is_userptr(),
            tile_present: self.tile_present,
        }
    }
}

/// Snapshot of a mapping for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingInfo {
    pub id: u64,
    pub start: GpuVa,
    pub end: GpuVa,
    pub state: MappingState,
    pub read_only: bool,
    pub userptr: bool,
    pub tile_present: u8,
}

impl MappingInfo {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn range(&self) -> Range<GpuVa> {
        self.start..self.end
    }

    /// Last byte of the mapping.
    pub fn last(&self) -> GpuVa {
        self.end - 1
    }
}
