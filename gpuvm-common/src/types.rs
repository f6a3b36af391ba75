// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// GPU virtual address inside an address space.
pub type GpuVa = u64;

/// Device physical address (VRAM or system memory as seen by the GPU).
pub type DevAddr = u64;

/// Virtual address inside a host process.
pub type HostVa = u64;

/// Hardware tile index.
pub type TileId = u8;

/// Base page size (4 KiB).
pub const PAGE_SIZE: usize = 0x1000;

/// Page size as u64 for address math.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

pub const SZ_64K: u64 = 0x1_0000;
pub const SZ_2M: u64 = 0x20_0000;
pub const SZ_1G: u64 = 0x4000_0000;

/// Maximum number of tiles a device may expose.
pub const MAX_TILES: usize = 4;

/// GPU virtual address width: 4 levels of 9 bits over a 12-bit page offset.
pub const GPU_VA_BITS: u32 = 48;

/// Size of a GPU address space.
pub const GPU_VA_SIZE: u64 = 1 << GPU_VA_BITS;

/// Physical base of device-local memory.
pub const VRAM_BASE: DevAddr = 0x1_0000_0000;

/// Physical base of system memory as seen by the device.
pub const SYSTEM_BASE: DevAddr = 0x100_0000_0000;

/// Memory placement domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryDomain {
    /// Host RAM reachable by the device over the bus.
    System,
    /// Device-local memory.
    Vram,
}

impl MemoryDomain {
    pub fn from_str_or_default(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "0" | "system" | "sys" => Self::System,
            "1" | "vram" | "local" => Self::Vram,
            _ => Self::System,
        }
    }
}

impl std::fmt::Display for MemoryDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::Vram => write!(f, "vram"),
        }
    }
}

/// Align a value up to the given alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Check if a value is aligned to a power-of-two alignment.
#[inline]
pub const fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// Number of pages needed to hold `size` bytes.
#[inline]
pub const fn pages_for(size: u64) -> usize {
    (align_up(size, PAGE_SIZE_U64) >> PAGE_SHIFT) as usize
}
