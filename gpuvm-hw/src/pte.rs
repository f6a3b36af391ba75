// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware page-table entry format and tree geometry.
//!
//! The translation tree has four levels of 512 qword entries over 4 KiB base
//! pages, covering a 48-bit address space:
//!
//! | Level | Entry span | Leaf allowed      |
//! |-------|------------|-------------------|
//! | 3     | 512 GiB    | no (root)         |
//! | 2     | 1 GiB      | yes (`HUGE`)      |
//! | 1     | 2 MiB      | yes (`HUGE`)      |
//! | 0     | 4 KiB      | yes               |
//!
//! A level-1 directory entry with `COMPACT` points to a compact level-0 table
//! holding 32 entries of 64 KiB each.
//!
//! ## Entry layout (64 bits)
//!
//! | Bits   | Field                                   |
//! |--------|-----------------------------------------|
//! | 0      | Valid                                   |
//! | 1      | Writable                                |
//! | 7      | Huge leaf (level 1/2)                   |
//! | 8      | 64 KiB page (compact table entry)       |
//! | 10     | Child is a compact 64 KiB table (PDE)   |
//! | 11     | Target is device-local memory           |
//! | 51:12  | Physical address                        |

use bitflags::bitflags;

use gpuvm_common::{DevAddr, MemoryDomain, GPU_VA_SIZE, PAGE_SHIFT, SZ_64K};

/// Entries per page-table node.
pub const PT_ENTRIES: usize = 512;

/// Entries used in a compact 64 KiB table.
pub const COMPACT_ENTRIES: usize = 32;

/// Level of the root node.
pub const MAX_LEVEL: u8 = 3;

/// Highest level at which a leaf may be installed.
pub const MAX_HUGE_LEVEL: u8 = 2;

/// Bits of index per level.
const LEVEL_BITS: u32 = 9;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

bitflags! {
    /// Flag bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const VALID      = 1 << 0;
        const WRITABLE   = 1 << 1;
        const HUGE       = 1 << 7;
        const PS64       = 1 << 8;
        const COMPACT    = 1 << 10;
        const DEVICE_MEM = 1 << 11;
    }
}

/// Shift of the span covered by one entry at `level`.
#[inline]
pub const fn level_shift(level: u8) -> u32 {
    PAGE_SHIFT + LEVEL_BITS * level as u32
}

/// Bytes covered by one entry at `level`.
#[inline]
pub const fn level_size(level: u8) -> u64 {
    1u64 << level_shift(level)
}

/// Index of `va` inside a node at `level`.
#[inline]
pub const fn pt_index(va: u64, level: u8) -> usize {
    ((va >> level_shift(level)) as usize) & (PT_ENTRIES - 1)
}

/// Shift of the span covered by one entry of a node, accounting for compact tables.
#[inline]
pub const fn entry_shift(level: u8, compact: bool) -> u32 {
    if compact {
        16
    } else {
        level_shift(level)
    }
}

/// Whether `va` lies inside the translatable range.
#[inline]
pub const fn va_in_range(va: u64) -> bool {
    va < GPU_VA_SIZE
}

fn domain_bit(domain: MemoryDomain) -> PteFlags {
    match domain {
        MemoryDomain::Vram => PteFlags::DEVICE_MEM,
        MemoryDomain::System => PteFlags::empty(),
    }
}

/// Encode a leaf entry.
///
/// `level` selects the leaf kind: 0 is a 4 KiB page, 1 and 2 are huge leaves.
/// `ps64` marks an entry of a compact table.
pub fn encode_pte(addr: DevAddr, domain: MemoryDomain, writable: bool, level: u8, ps64: bool) -> u64 {
    let mut flags = PteFlags::VALID | domain_bit(domain);
    if writable {
        flags |= PteFlags::WRITABLE;
    }
    if level > 0 {
        flags |= PteFlags::HUGE;
    }
    if ps64 {
        flags |= PteFlags::PS64;
    }
    (addr & ADDR_MASK) | flags.bits()
}

/// Encode a directory entry pointing at a child node.
pub fn encode_pde(child: DevAddr, domain: MemoryDomain, compact: bool) -> u64 {
    let mut flags = PteFlags::VALID | PteFlags::WRITABLE | domain_bit(domain);
    if compact {
        flags |= PteFlags::COMPACT;
    }
    (child & ADDR_MASK) | flags.bits()
}

/// A decoded entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte(pub u64);

impl Pte {
    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    #[inline]
    pub fn addr(self) -> DevAddr {
        self.0 & ADDR_MASK
    }

    #[inline]
    pub fn domain(self) -> MemoryDomain {
        if self.flags().contains(PteFlags::DEVICE_MEM) {
            MemoryDomain::Vram
        } else {
            MemoryDomain::System
        }
    }

    /// Whether this entry terminates the walk at `level`.
    #[inline]
    pub fn is_leaf(self, level: u8) -> bool {
        level == 0 || self.flags().contains(PteFlags::HUGE)
    }

    #[inline]
    pub fn is_writable(self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }
}

/// Bytes mapped by a leaf of a compact table.
pub const COMPACT_PAGE_SIZE: u64 = SZ_64K;
