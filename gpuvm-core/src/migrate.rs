// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Migration engine.
//!
//! Every tile owns one privileged address space used to move memory and to
//! write page tables the CPU cannot reach. Its layout:
//!
//! | VA              | Contents                                              |
//! |-----------------|-------------------------------------------------------|
//! | `SLOT_BASE`     | slot window: 4 KiB pages whose PTEs live in the slot   |
//! |                 | table. Slot 0 maps the slot table itself, so the PTE   |
//! |                 | of slot `k` is writable at `SLOT_BASE + k * 8`.        |
//! | `IDENTITY_BASE` | all of VRAM, mapped with 2 MiB leaves                  |
//!
//! Copies and clears run in passes of one batch each, at most 2 MiB per pass.
//! A side whose whole pass is contiguous VRAM is addressed through the
//! identity map. Any other side is mapped page by page through the slots,
//! `slots_per_side` pages at a time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use gpuvm_common::{
    align_up, DevAddr, GpuVa, MemoryDomain, Settings, TileId, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE_U64, SZ_2M, VRAM_BASE,
};
use gpuvm_hw::pte::{encode_pte, MAX_LEVEL, PT_ENTRIES};
use gpuvm_hw::{
    Batch, BufferError, BufferMover, BufferResult, DeviceMemory, ExecContext, Fence, FenceError, JobSubmitter,
    MemoryError, Storage,
};

use crate::pt::{self, BindSource, NodeWrite, PtArena, PtError, PtPolicy, StagedUpdate};

/// Base of the slot window.
pub const SLOT_BASE: GpuVa = 1 << 30;

/// Base of the VRAM identity map.
pub const IDENTITY_BASE: GpuVa = 1 << 39;

/// Node limit of a migration address space.
const MIGRATE_PT_NODES: usize = 64;

#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("migration memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("migration page tables: {0}")]
    Pt(#[from] PtError),

    #[error("migration context of tile {0} is banned")]
    Banned(TileId),
}

pub type MigrateResult<T> = Result<T, MigrateError>;

/// Work counters of one migration context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrateStats {
    /// Copy/clear passes addressed through the identity map.
    pub large_passes: u64,
    /// Copy/clear passes addressed through slots.
    pub small_passes: u64,
    /// Page-table writes done by the CPU.
    pub cpu_updates: u64,
    /// Page-table writes emitted as store commands.
    pub gpu_updates: u64,
    pub batches: u64,
}

/// One side of a pass.
enum Side {
    Identity(GpuVa),
    Slots { first: u32, pages: Vec<DevAddr>, domain: MemoryDomain },
}

/// Migration context of one tile.
pub struct Migrate {
    tile: TileId,
    mem: Arc<DeviceMemory>,
    submitter: Arc<dyn JobSubmitter>,
    ctx: Arc<ExecContext>,
    slots_per_side: u32,
    /// Slots usable for page-table writes (all but the self-map).
    update_slots: u32,
    /// Serialises batch construction and submission.
    job_mutex: Mutex<()>,
    stats: Mutex<MigrateStats>,
    scratch: DevAddr,
    _arena: PtArena,
}

impl Migrate {
    pub fn new(
        tile: TileId,
        mem: Arc<DeviceMemory>,
        submitter: Arc<dyn JobSubmitter>,
        settings: &Settings,
    ) -> MigrateResult<Self> {
        let slots_per_side = settings.slots_per_side();
        let update_slots = slots_per_side * 2;
        let scratch = mem.alloc_zeroed_page(MemoryDomain::System)?;

        let mut arena = PtArena::new(mem.clone(), MemoryDomain::System, MIGRATE_PT_NODES);
        let built = Self::build_tables(&mem, &mut arena, scratch);
        let root = match built {
            Ok(root) => root,
            Err(err) => {
                mem.free_pages(&[scratch]);
                return Err(err);
            }
        };

        log::info!(
            "migrate{}: ready, {} slots per side, identity map of {} MiB",
            tile,
            slots_per_side,
            mem.size(MemoryDomain::Vram) >> 20
        );
        Ok(Self {
            tile,
            ctx: ExecContext::new(format!("migrate{}", tile), root),
            mem,
            submitter,
            slots_per_side,
            update_slots,
            job_mutex: Mutex::new(()),
            stats: Mutex::new(MigrateStats::default()),
            scratch,
            _arena: arena,
        })
    }

    /// Build the slot window and identity map. Returns the root address.
    fn build_tables(mem: &DeviceMemory, arena: &mut PtArena, scratch: DevAddr) -> MigrateResult<DevAddr> {
        let root = arena.alloc_root(MAX_LEVEL)?;
        let window = Storage::new(MemoryDomain::System, vec![scratch; PT_ENTRIES]);
        let identity = Storage::new(
            MemoryDomain::Vram,
            (0..mem.size(MemoryDomain::Vram) >> PAGE_SHIFT)
                .map(|i| VRAM_BASE + (i << PAGE_SHIFT))
                .collect(),
        );

        let maps = [
            (SLOT_BASE, &window, PtPolicy { max_leaf_level: 0, compact_64k: false }),
            (IDENTITY_BASE, &identity, PtPolicy { max_leaf_level: 1, compact_64k: false }),
        ];
        for (base, storage, policy) in maps {
            if storage.page_count() == 0 {
                continue;
            }
            let staged = pt::stage_bind(
                arena,
                root,
                base,
                base + storage.size(),
                BindSource { storage, writable: true },
                policy,
            )?;
            for write in &staged.populate {
                mem.write_qwords(write.addr, &write.entries)?;
            }
            for update in &staged.updates {
                mem.write_qwords(update.target(), &update.qwords())?;
            }
            pt::commit(arena, staged, &Fence::signaled());
        }

        let index = pt::build_leaves(arena, root, SLOT_BASE, SLOT_BASE + PAGE_SIZE_U64);
        if let Some(run) = index.runs.first() {
            let self_map = encode_pte(run.addr, run.domain, true, 0, false);
            mem.write_u64(run.addr, self_map)?;
        }
        Ok(arena[root].addr)
    }

    pub fn tile(&self) -> TileId {
        self.tile
    }

    pub fn context(&self) -> &Arc<ExecContext> {
        &self.ctx
    }

    pub fn stats(&self) -> MigrateStats {
        *self.stats.lock()
    }

    fn check_banned(&self) -> MigrateResult<()> {
        if self.ctx.is_banned() {
            return Err(MigrateError::Banned(self.tile));
        }
        Ok(())
    }

    fn submit(&self, batch: Batch, deps: Vec<Arc<Fence>>) -> Arc<Fence> {
        let mut job = self.submitter.create_job(&self.ctx, batch);
        job.add_deps(deps);
        self.stats.lock().batches += 1;
        self.submitter.submit(job)
    }

    /// Copy `src` into `dst`, page for page.
    pub fn copy(&self, src: &Storage, dst: &Storage) -> MigrateResult<Arc<Fence>> {
        self.run_passes(Some(src), dst, 0)
    }

    /// Fill `dst` with `value`.
    pub fn clear(&self, dst: &Storage, value: u8) -> MigrateResult<Arc<Fence>> {
        self.run_passes(None, dst, value)
    }

    /// Identity address of `storage` at `offset` and the bytes it covers,
    /// when the bytes up to `max` or the next 2 MiB boundary of the device
    /// address, whichever comes first, are contiguous VRAM.
    fn identity_chunk(storage: &Storage, offset: u64, max: u64) -> Option<(GpuVa, u64)> {
        if storage.domain() != MemoryDomain::Vram {
            return None;
        }
        let addr = storage.addr(offset)?;
        let boundary = align_up(addr + 1, SZ_2M) - addr;
        let want = (max.min(boundary) >> PAGE_SHIFT) as usize;
        let run = storage.run_len((offset >> PAGE_SHIFT) as usize, want);
        (run == want).then(|| (IDENTITY_BASE + (addr - VRAM_BASE), (run as u64) << PAGE_SHIFT))
    }

    fn run_passes(&self, src: Option<&Storage>, dst: &Storage, value: u8) -> MigrateResult<Arc<Fence>> {
        let _job = self.job_mutex.lock();
        self.check_banned()?;

        let size = src.map_or(dst.size(), |s| s.size().min(dst.size()));
        let slot_bytes = u64::from(self.slots_per_side) << PAGE_SHIFT;
        let mut fence = Fence::signaled();
        let mut offset = 0;

        while offset < size {
            let remaining = size - offset;
            let src_ident = src.and_then(|s| Self::identity_chunk(s, offset, remaining));
            let dst_ident = Self::identity_chunk(dst, offset, remaining);

            let mut chunk = remaining;
            if let Some((_, len)) = src_ident {
                chunk = chunk.min(len);
            } else if src.is_some() {
                chunk = chunk.min(slot_bytes);
            }
            match dst_ident {
                Some((_, len)) => chunk = chunk.min(len),
                None => chunk = chunk.min(slot_bytes),
            }
            let large = src_ident.is_some() || dst_ident.is_some();

            let side = |storage: &Storage, ident: Option<(GpuVa, u64)>, first: u32| match ident {
                Some((va, _)) => Side::Identity(va),
                None => {
                    let lo = (offset >> PAGE_SHIFT) as usize;
                    let hi = ((offset + chunk) >> PAGE_SHIFT) as usize;
                    Side::Slots {
                        first,
                        pages: storage.pages()[lo..hi].to_vec(),
                        domain: storage.domain(),
                    }
                }
            };
            let dst_side = side(dst, dst_ident, 1 + self.slots_per_side);
            let src_side = src.map(|s| side(s, src_ident, 1));

            let mut batch = Batch::new();
            let mut mapped = false;
            for s in src_side.iter().chain(std::iter::once(&dst_side)) {
                if let Side::Slots { first, pages, domain } = s {
                    let ptes: Vec<u64> = pages
                        .iter()
                        .map(|&page| encode_pte(page, *domain, true, 0, false))
                        .collect();
                    batch.store_qwords(SLOT_BASE + u64::from(*first) * 8, &ptes);
                    mapped = true;
                }
            }
            if mapped {
                batch.flush_tlb();
            }
            let dst_va = Self::side_va(&dst_side);
            match &src_side {
                Some(s) => batch.copy(Self::side_va(s), dst_va, chunk),
                None => batch.fill(dst_va, chunk, value),
            };
            batch.end();

            {
                let mut stats = self.stats.lock();
                if large {
                    stats.large_passes += 1;
                } else {
                    stats.small_passes += 1;
                }
            }
            log::trace!(
                "migrate{}: pass at 0x{:X}, 0x{:X} bytes, {}",
                self.tile,
                offset,
                chunk,
                if large { "identity" } else { "slots" }
            );
            fence = self.submit(batch, vec![fence]);
            offset += chunk;
        }
        Ok(fence)
    }

    fn side_va(side: &Side) -> GpuVa {
        match side {
            Side::Identity(va) => *va,
            Side::Slots { first, .. } => SLOT_BASE + (u64::from(*first) << PAGE_SHIFT),
        }
    }

    /// Issue page-table writes: `populate` first, then `updates`.
    ///
    /// The CPU writes them directly when every dependency has signaled and
    /// every target is CPU-visible. Otherwise they are emitted as stores
    /// through the slots, in batches ordered after `deps`.
    pub fn update_page_tables(
        &self,
        updates: &[StagedUpdate],
        populate: &[NodeWrite],
        deps: Vec<Arc<Fence>>,
    ) -> MigrateResult<Arc<Fence>> {
        let writes: Vec<(DevAddr, MemoryDomain, Vec<u64>)> = populate
            .iter()
            .map(|w| (w.addr, w.domain, w.entries.clone()))
            .chain(updates.iter().map(|u| (u.target(), u.domain, u.qwords())))
            .collect();
        if writes.is_empty() {
            return Ok(Fence::all(deps));
        }

        let cpu = deps.iter().all(|d| d.is_signaled())
            && writes.iter().all(|(_, domain, _)| self.mem.is_cpu_visible(*domain));
        if cpu {
            for (addr, _, values) in &writes {
                self.mem.write_qwords(*addr, values)?;
            }
            self.stats.lock().cpu_updates += writes.len() as u64;
            log::trace!("migrate{}: {} page-table writes by cpu", self.tile, writes.len());
            return Ok(Fence::signaled());
        }

        let _job = self.job_mutex.lock();
        self.check_banned()?;

        let mut fence: Option<Arc<Fence>> = None;
        let mut deps = Some(deps);
        let mut rest = &writes[..];
        while !rest.is_empty() {
            // Map as many target pages as there are slots.
            let mut slots: HashMap<DevAddr, u32> = HashMap::new();
            let mut ptes = Vec::new();
            let mut taken = 0;
            for (addr, domain, _) in rest {
                let page = addr & !PAGE_MASK;
                if !slots.contains_key(&page) {
                    if slots.len() as u32 == self.update_slots {
                        break;
                    }
                    slots.insert(page, slots.len() as u32 + 1);
                    ptes.push(encode_pte(page, *domain, true, 0, false));
                }
                taken += 1;
            }

            let mut batch = Batch::new();
            batch.store_qwords(SLOT_BASE + 8, &ptes);
            batch.flush_tlb();
            for (addr, _, values) in &rest[..taken] {
                let slot = slots.get(&(addr & !PAGE_MASK)).copied().unwrap_or_default();
                let va = SLOT_BASE + (u64::from(slot) << PAGE_SHIFT) + (addr & PAGE_MASK);
                batch.store_qwords(va, values);
            }
            batch.end();

            let batch_deps = match (deps.take(), &fence) {
                (Some(first), _) => first,
                (None, Some(prev)) => vec![prev.clone()],
                (None, None) => Vec::new(),
            };
            fence = Some(self.submit(batch, batch_deps));
            self.stats.lock().gpu_updates += taken as u64;
            rest = &rest[taken..];
        }
        log::trace!("migrate{}: {} page-table writes by gpu", self.tile, writes.len());
        Ok(fence.unwrap_or_else(Fence::signaled))
    }
}

impl Drop for Migrate {
    fn drop(&mut self) {
        self.mem.free_pages(&[self.scratch]);
    }
}

fn to_buffer_error(err: MigrateError) -> BufferError {
    match err {
        MigrateError::Banned(_) => BufferError::Move(FenceError::Banned),
        MigrateError::Memory(err) => BufferError::Memory(err),
        other => BufferError::Move(FenceError::Submission(other.to_string())),
    }
}

impl BufferMover for Migrate {
    fn copy(&self, buffer: u64, src: &Storage, dst: &Storage) -> BufferResult<Arc<Fence>> {
        log::debug!(
            "migrate{}: buffer {} {} -> {} ({} KiB)",
            self.tile,
            buffer,
            src.domain(),
            dst.domain(),
            dst.size() >> 10
        );
        Migrate::copy(self, src, dst).map_err(to_buffer_error)
    }

    fn clear(&self, buffer: u64, dst: &Storage, value: u8) -> BufferResult<Arc<Fence>> {
        log::trace!("migrate{}: clear buffer {} ({} KiB)", self.tile, buffer, dst.size() >> 10);
        Migrate::clear(self, dst, value).map_err(to_buffer_error)
    }
}
