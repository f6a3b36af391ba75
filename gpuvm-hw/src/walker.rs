// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Hardware page-table walker.
//!
//! Resolves GPU virtual addresses by reading the translation tree out of
//! device memory, exactly as the device's MMU would. Used by the copy engine
//! and by anything that needs the hardware's view of an address space.

use gpuvm_common::{DevAddr, GpuVa, MemoryDomain, PAGE_SIZE_U64};

use crate::memory::{DeviceMemory, MemoryResult};
use crate::pte::{level_size, pt_index, Pte, PteFlags, COMPACT_PAGE_SIZE, MAX_LEVEL};

/// Result of a successful walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    /// Device address of `va` (leaf base plus page offset).
    pub addr: DevAddr,
    pub domain: MemoryDomain,
    pub writable: bool,
    /// Bytes covered by the leaf that produced the translation.
    pub page_size: u64,
    /// Level the leaf was found at (0 for 4 KiB and 64 KiB leaves).
    pub level: u8,
    /// Raw leaf entry.
    pub pte: u64,
}

impl Translation {
    /// Bytes left in the leaf from the translated address onward.
    pub fn remaining_in_page(&self, va: GpuVa) -> u64 {
        self.page_size - (va & (self.page_size - 1))
    }
}

/// Walk the tree rooted at `root` for `va`.
///
/// Returns `Ok(None)` for an unmapped address and an error only when the
/// tree itself points outside device memory.
pub fn translate(mem: &DeviceMemory, root: DevAddr, va: GpuVa) -> MemoryResult<Option<Translation>> {
    let mut table = root;
    let mut level = MAX_LEVEL;
    loop {
        let entry = Pte(mem.read_u64(table + (pt_index(va, level) as u64) * 8)?);
        if !entry.is_valid() {
            return Ok(None);
        }
        if entry.is_leaf(level) {
            let size = level_size(level);
            return Ok(Some(Translation {
                addr: entry.addr() + (va & (size - 1)),
                domain: entry.domain(),
                writable: entry.is_writable(),
                page_size: size,
                level,
                pte: entry.0,
            }));
        }
        if level == 1 && entry.flags().contains(PteFlags::COMPACT) {
            let idx = ((va >> 16) & 0x1F) * 8;
            let leaf = Pte(mem.read_u64(entry.addr() + idx)?);
            if !leaf.is_valid() {
                return Ok(None);
            }
            return Ok(Some(Translation {
                addr: leaf.addr() + (va & (COMPACT_PAGE_SIZE - 1)),
                domain: leaf.domain(),
                writable: leaf.is_writable(),
                page_size: COMPACT_PAGE_SIZE,
                level: 0,
                pte: leaf.0,
            }));
        }
        table = entry.addr();
        level -= 1;
    }
}

/// Read bytes through the translation tree. An unmapped page stops the read
/// and reports the faulting address in the inner `Err`.
pub fn read_virtual(
    mem: &DeviceMemory,
    root: DevAddr,
    va: GpuVa,
    dst: &mut [u8],
) -> MemoryResult<Result<(), GpuVa>> {
    let mut offset = 0usize;
    while offset < dst.len() {
        let cur = va + offset as u64;
        let Some(t) = translate(mem, root, cur)? else {
            return Ok(Err(cur));
        };
        let chunk = (dst.len() - offset).min(t.remaining_in_page(cur).min(PAGE_SIZE_U64) as usize);
        mem.read(t.addr, &mut dst[offset..offset + chunk])?;
        offset += chunk;
    }
    Ok(Ok(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::Placement;
    use crate::pte::{encode_pde, encode_pte};
    use gpuvm_common::{SZ_2M, SZ_64K};

    struct Tree {
        mem: DeviceMemory,
        root: DevAddr,
        l2: DevAddr,
        l1: DevAddr,
        l0: DevAddr,
    }

    /// Builds root -> l2 -> l1 -> l0 covering VA 0.
    fn tree() -> Tree {
        let mem = DeviceMemory::new(16 * SZ_2M, 8 * SZ_2M, true).unwrap();
        let root = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let l2 = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let l1 = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let l0 = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        mem.write_u64(root, encode_pde(l2, MemoryDomain::System, false)).unwrap();
        mem.write_u64(l2, encode_pde(l1, MemoryDomain::System, false)).unwrap();
        mem.write_u64(l1, encode_pde(l0, MemoryDomain::System, false)).unwrap();
        Tree { mem, root, l2, l1, l0 }
    }

    #[test]
    fn test_translate_4k() {
        let t = tree();
        let page = t.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        t.mem
            .write_u64(t.l0 + 3 * 8, encode_pte(page, MemoryDomain::Vram, true, 0, false))
            .unwrap();

        let tr = translate(&t.mem, t.root, 0x3ABC).unwrap().unwrap();
        assert_eq!(tr.addr, page + 0xABC);
        assert_eq!(tr.page_size, 0x1000);
        assert_eq!(tr.domain, MemoryDomain::Vram);
        assert!(translate(&t.mem, t.root, 0x4000).unwrap().is_none());
    }

    #[test]
    fn test_translate_huge() {
        let t = tree();
        let run = t
            .mem
            .alloc_pages(MemoryDomain::Vram, 512, Placement::Contiguous { align: SZ_2M })
            .unwrap();
        t.mem
            .write_u64(t.l1 + 8, encode_pte(run[0], MemoryDomain::Vram, false, 1, false))
            .unwrap();

        let tr = translate(&t.mem, t.root, SZ_2M + 0x12345).unwrap().unwrap();
        assert_eq!(tr.addr, run[0] + 0x12345);
        assert_eq!(tr.level, 1);
        assert!(!tr.writable);
        let _ = t.l2;
    }

    #[test]
    fn test_translate_compact() {
        let t = tree();
        let compact = t.mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let run = t
            .mem
            .alloc_pages(MemoryDomain::Vram, 16, Placement::Contiguous { align: SZ_64K })
            .unwrap();
        t.mem
            .write_u64(t.l1 + 8, encode_pde(compact, MemoryDomain::System, true))
            .unwrap();
        t.mem
            .write_u64(compact + 2 * 8, encode_pte(run[0], MemoryDomain::Vram, true, 0, true))
            .unwrap();

        let va = SZ_2M + 2 * SZ_64K + 0x1234;
        let tr = translate(&t.mem, t.root, va).unwrap().unwrap();
        assert_eq!(tr.addr, run[0] + 0x1234);
        assert_eq!(tr.page_size, SZ_64K);
    }

    #[test]
    fn test_read_virtual_cross_page() {
        let t = tree();
        let a = t.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        let b = t.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        t.mem.write_u64(t.l0, encode_pte(a, MemoryDomain::Vram, true, 0, false)).unwrap();
        t.mem.write_u64(t.l0 + 8, encode_pte(b, MemoryDomain::Vram, true, 0, false)).unwrap();
        t.mem.write(a + 0xFFC, &[1, 2, 3, 4]).unwrap();
        t.mem.write(b, &[5, 6, 7, 8]).unwrap();

        let mut buf = [0u8; 8];
        read_virtual(&t.mem, t.root, 0xFFC, &mut buf).unwrap().unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        let mut buf = [0u8; 4];
        let fault = read_virtual(&t.mem, t.root, 0x1FFE, &mut buf).unwrap();
        assert_eq!(fault, Err(0x2000));
    }
}
