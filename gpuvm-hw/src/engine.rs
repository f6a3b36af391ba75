// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Copy engine.
//!
//! Executes decoded command batches against device memory. Every access goes
//! through the hardware walker of the executing context, and translations are
//! cached per 4 KiB page until the batch issues a TLB flush.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use gpuvm_common::{DevAddr, GpuVa, PAGE_MASK, PAGE_SIZE_U64};

use crate::command::{Batch, Command, DecodeError};
use crate::fence::FenceError;
use crate::memory::{DeviceMemory, MemoryError};
use crate::walker;

/// Errors raised while executing a batch.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("bad batch: {0}")]
    Decode(#[from] DecodeError),

    #[error("page fault at GPU VA 0x{0:016X}")]
    PageFault(GpuVa),

    #[error("write to read-only page at GPU VA 0x{0:016X}")]
    WriteFault(GpuVa),

    #[error("memory access failed: {0}")]
    Memory(#[from] MemoryError),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl From<EngineError> for FenceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::PageFault(va) | EngineError::WriteFault(va) => FenceError::PageFault(va),
            other => FenceError::Engine(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TlbEntry {
    page: DevAddr,
    writable: bool,
}

/// The copy engine of one execution context.
pub struct CopyEngine {
    mem: Arc<DeviceMemory>,
    tlb: HashMap<GpuVa, TlbEntry>,
}

impl CopyEngine {
    pub fn new(mem: Arc<DeviceMemory>) -> Self {
        Self {
            mem,
            tlb: HashMap::new(),
        }
    }

    /// Run `batch` in the address space rooted at `root`.
    ///
    /// The TLB starts empty for every batch.
    pub fn execute(&mut self, root: DevAddr, batch: &Batch) -> EngineResult<()> {
        let commands = batch.decode()?;
        self.tlb.clear();
        for command in commands {
            match command {
                Command::StoreQwords { va, data } => {
                    for (i, value) in data.iter().enumerate() {
                        let at = va + (i as u64) * 8;
                        let (addr, _) = self.lookup(root, at, true)?;
                        self.mem.write_u64(addr, *value)?;
                    }
                }
                Command::Copy { src, dst, len } => self.copy(root, src, dst, len)?,
                Command::Fill { dst, len, value } => self.fill(root, dst, len, value)?,
                Command::FlushTlb => {
                    log::trace!("engine: flush tlb ({} entries)", self.tlb.len());
                    self.tlb.clear();
                }
                Command::End => break,
            }
        }
        Ok(())
    }

    /// Translate `va`, returning the device address and the bytes left in its page.
    fn lookup(&mut self, root: DevAddr, va: GpuVa, write: bool) -> EngineResult<(DevAddr, u64)> {
        let page_va = va & !PAGE_MASK;
        let entry = match self.tlb.get(&page_va) {
            Some(entry) => *entry,
            None => {
                let t = walker::translate(&self.mem, root, page_va)?
                    .ok_or(EngineError::PageFault(va))?;
                let entry = TlbEntry {
                    page: t.addr,
                    writable: t.writable,
                };
                self.tlb.insert(page_va, entry);
                entry
            }
        };
        if write && !entry.writable {
            return Err(EngineError::WriteFault(va));
        }
        let offset = va & PAGE_MASK;
        Ok((entry.page + offset, PAGE_SIZE_U64 - offset))
    }

    fn copy(&mut self, root: DevAddr, src: GpuVa, dst: GpuVa, len: u64) -> EngineResult<()> {
        let mut buf = vec![0u8; PAGE_SIZE_U64 as usize];
        let mut done = 0u64;
        while done < len {
            let (s, s_left) = self.lookup(root, src + done, false)?;
            let (d, d_left) = self.lookup(root, dst + done, true)?;
            let n = s_left.min(d_left).min(len - done) as usize;
            self.mem.read(s, &mut buf[..n])?;
            self.mem.write(d, &buf[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    fn fill(&mut self, root: DevAddr, dst: GpuVa, len: u64, value: u8) -> EngineResult<()> {
        let mut done = 0u64;
        while done < len {
            let (d, d_left) = self.lookup(root, dst + done, true)?;
            let n = d_left.min(len - done);
            self.mem.fill(d, n as usize, value)?;
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pte::{encode_pde, encode_pte};
    use gpuvm_common::{MemoryDomain, SZ_2M};

    struct Space {
        mem: Arc<DeviceMemory>,
        root: DevAddr,
        l0: DevAddr,
    }

    /// Single-leaf-table space covering VA [0, 2M). The leaf table itself is
    /// mapped writable at VA 0x10000.
    fn space() -> Space {
        let mem = Arc::new(DeviceMemory::new(8 * SZ_2M, 8 * SZ_2M, true).unwrap());
        let root = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let l2 = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let l1 = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        let l0 = mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        mem.write_u64(root, encode_pde(l2, MemoryDomain::System, false)).unwrap();
        mem.write_u64(l2, encode_pde(l1, MemoryDomain::System, false)).unwrap();
        mem.write_u64(l1, encode_pde(l0, MemoryDomain::System, false)).unwrap();
        mem.write_u64(l0 + 0x10 * 8, encode_pte(l0, MemoryDomain::System, true, 0, false))
            .unwrap();
        Space { mem, root, l0 }
    }

    fn map(s: &Space, va: GpuVa, page: DevAddr, writable: bool) {
        let domain = s.mem.domain_of(page).unwrap();
        s.mem
            .write_u64(s.l0 + (va >> 12) * 8, encode_pte(page, domain, writable, 0, false))
            .unwrap();
    }

    #[test]
    fn test_copy_and_fill() {
        let s = space();
        let a = s.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        let b = s.mem.alloc_zeroed_page(MemoryDomain::System).unwrap();
        map(&s, 0x1000, a, true);
        map(&s, 0x2000, b, true);

        let mut batch = Batch::new();
        batch.fill(0x1000, 0x1000, 0x5A).copy(0x1000, 0x2000, 0x800).end();
        CopyEngine::new(s.mem.clone()).execute(s.root, &batch).unwrap();

        let mut out = [0u8; 0x1000];
        s.mem.read(b, &mut out).unwrap();
        assert!(out[..0x800].iter().all(|&x| x == 0x5A));
        assert!(out[0x800..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_unmapped_faults() {
        let s = space();
        let mut batch = Batch::new();
        batch.fill(0x5000, 8, 0).end();
        let err = CopyEngine::new(s.mem.clone()).execute(s.root, &batch).unwrap_err();
        assert!(matches!(err, EngineError::PageFault(0x5000)));
        assert_eq!(FenceError::from(err), FenceError::PageFault(0x5000));
    }

    #[test]
    fn test_read_only_faults_on_write() {
        let s = space();
        let a = s.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        map(&s, 0x1000, a, false);
        let mut batch = Batch::new();
        batch.store_qwords(0x1008, &[1]).end();
        let err = CopyEngine::new(s.mem.clone()).execute(s.root, &batch).unwrap_err();
        assert!(matches!(err, EngineError::WriteFault(0x1008)));
    }

    #[test]
    fn test_stale_tlb_until_flush() {
        let s = space();
        let a = s.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        let b = s.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        let dst = s.mem.alloc_zeroed_page(MemoryDomain::Vram).unwrap();
        s.mem.fill(a, 0x1000, 0xAA).unwrap();
        s.mem.fill(b, 0x1000, 0xBB).unwrap();
        map(&s, 0x1000, a, true);
        map(&s, 0x3000, dst, true);

        let remap = encode_pte(b, MemoryDomain::Vram, true, 0, false);
        let mut engine = CopyEngine::new(s.mem.clone());

        // Without a flush the old translation is still used.
        let mut batch = Batch::new();
        batch
            .copy(0x1000, 0x3000, 4)
            .store_qwords(0x10000 + 8, &[remap])
            .copy(0x1000, 0x3004, 4)
            .end();
        engine.execute(s.root, &batch).unwrap();
        let mut out = [0u8; 8];
        s.mem.read(dst, &mut out).unwrap();
        assert_eq!(out, [0xAA; 8]);

        // Remap back to `a`, then flush before reading.
        map(&s, 0x1000, a, true);
        let mut batch = Batch::new();
        batch
            .copy(0x1000, 0x3000, 4)
            .store_qwords(0x10000 + 8, &[remap])
            .flush_tlb()
            .copy(0x1000, 0x3004, 4)
            .end();
        engine.execute(s.root, &batch).unwrap();
        s.mem.read(dst, &mut out).unwrap();
        assert_eq!(out, [0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);
    }
}
