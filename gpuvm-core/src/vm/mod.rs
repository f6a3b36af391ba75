// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU address spaces.
//!
//! A [`Vm`] owns the mappings of one GPU context and one page-table tree per
//! tile. Every mutation runs under the space's write lock: it stages the
//! change on each tile, issues the writes through that tile's migration
//! context and commits the bookkeeping. Backing changes (buffer moves, host
//! invalidations) only leave the mapping id in a queue; the next rebind zaps
//! and re-stages the affected mappings.
//!
//! Writes to a tile are ordered after the completion of the previous write,
//! not its success. A write that fails on the engine records its range; the
//! next mutation rewrites the directories there from bookkeeping and queues
//! the mappings inside for a rebind.

mod async_queue;
mod mapping;
mod preempt;


pub use async_queue::{AsyncOp, ErrorCapture, CAPTURE_RECORD_SIZE};
pub use mapping::{BindBacking, BindFlags, BindRequest, MappingInfo, MappingState};
pub use preempt::ComputeContext;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use gpuvm_common::{align_up, is_page_aligned, GpuVa, HostVa, MemoryDomain, GPU_VA_SIZE, PAGE_SIZE_U64};
use gpuvm_hw::pte::MAX_LEVEL;
use gpuvm_hw::walker::{self, Translation};
use gpuvm_hw::{Buffer, BufferBackend, BufferError, BufferState, Fence, HostNotifier, MoveListener, Storage};

use crate::device::Device;
use crate::migrate::Migrate;
use crate::pt::{
    build_leaves, commit, discard, pt_resync, stage_bind, stage_unbind, zap_leaves, BindSource, NodeId, PtArena,
    PtPolicy,
};
use crate::userptr::PinnedRegion;
use crate::{VmError, VmResult};

use async_queue::AsyncQueue;
use mapping::{Backing, Mapping};

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

/// How the space is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VmMode {
    /// Submissions carry their own dependencies.
    #[default]
    Default,
    /// Long-running contexts are preempted around every rebind.
    Preempt,
}

/// Page-table tree of one tile.
struct TileTree {
    arena: PtArena,
    root: NodeId,
    /// Completion of the last page-table write issued on the tile.
    last_update: Arc<Fence>,
}

struct VmState {
    tiles: Vec<TileTree>,
    /// Mappings keyed by start address.
    mappings: BTreeMap<GpuVa, Mapping>,
    ids: HashMap<u64, GpuVa>,
    /// Mappings waiting for the next rebind.
    rebind: BTreeSet<u64>,
    next_id: u64,
}

impl VmState {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert(&mut self, m: Mapping) {
        self.ids.insert(m.id, m.start);
        self.mappings.insert(m.start, m);
    }

    /// Remove the mapping at `key`. Also reports whether it was waiting for
    /// a rebind.
    fn remove(&mut self, key: GpuVa) -> Option<(Mapping, bool)> {
        let m = self.mappings.remove(&key)?;
        self.ids.remove(&m.id);
        let pending = self.rebind.remove(&m.id);
        Some((m, pending))
    }

    /// Start addresses of the mappings overlapping `[start, end)`, ascending.
    fn overlapping(&self, start: GpuVa, end: GpuVa) -> Vec<GpuVa> {
        let mut keys: Vec<GpuVa> = self
            .mappings
            .range(..end)
            .rev()
            .take_while(|(_, m)| m.end > start)
            .map(|(&k, _)| k)
            .collect();
        keys.reverse();
        keys
    }

    /// Gap around `[start, end)` between the closest mappings that have
    /// entries on `tile`.
    fn hole_on(&self, tile: usize, start: GpuVa, end: GpuVa) -> (GpuVa, GpuVa) {
        let bit = 1u8 << tile;
        let lo = self
            .mappings
            .range(..start)
            .rev()
            .find(|(_, m)| m.tile_present & bit != 0)
            .map_or(0, |(_, m)| m.end);
        let hi = self
            .mappings
            .range(end..)
            .find(|(_, m)| m.tile_present & bit != 0)
            .map_or(GPU_VA_SIZE, |(&k, _)| k);
        (lo, hi)
    }

    /// [`Self::hole_on`] for every tile.
    fn holes(&self, start: GpuVa, end: GpuVa) -> Vec<(GpuVa, GpuVa)> {
        (0..self.tiles.len()).map(|t| self.hole_on(t, start, end)).collect()
    }
}

/// Mapping ids whose backing changed since they were bound.
#[derive(Default)]
struct Invalidations(Mutex<Vec<u64>>);

impl Invalidations {
    fn push(&self, id: u64) {
        let mut ids = self.0.lock();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    fn remove(&self, id: u64) -> bool {
        let mut ids = self.0.lock();
        let before = ids.len();
        ids.retain(|&i| i != id);
        ids.len() != before
    }

    fn contains(&self, id: u64) -> bool {
        self.0.lock().contains(&id)
    }

    fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }

    fn drain(&self) -> Vec<u64> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Tile ranges whose page-table writes failed on the engine.
#[derive(Default)]
struct WriteFailures(Mutex<Vec<(usize, GpuVa, GpuVa)>>);

impl WriteFailures {
    fn push(&self, tile: usize, start: GpuVa, end: GpuVa) {
        self.0.lock().push((tile, start, end));
    }

    fn drain(&self) -> Vec<(usize, GpuVa, GpuVa)> {
        std::mem::take(&mut *self.0.lock())
    }
}

impl MoveListener for Invalidations {
    fn buffer_moved(&self, mapping: u64) {
        log::trace!("vm: buffer under mapping {} moved", mapping);
        self.push(mapping);
    }
}

struct UserptrNotifier {
    inv: Arc<Invalidations>,
    mapping: u64,
}

impl HostNotifier for UserptrNotifier {
    fn invalidate(&self, start: HostVa, end: HostVa, _seq: u64) {
        log::trace!(
            "vm: host range [0x{:X}..0x{:X}) under mapping {} invalidated",
            start,
            end,
            self.mapping
        );
        self.inv.push(self.mapping);
    }
}

/// A GPU address space.
pub struct Vm {
    id: u64,
    this: Weak<Vm>,
    device: Arc<Device>,
    mode: VmMode,
    policy: PtPolicy,
    state: RwLock<VmState>,
    inv: Arc<Invalidations>,
    failures: Arc<WriteFailures>,
    contexts: Mutex<Vec<Arc<ComputeContext>>>,
    queue: AsyncQueue,
    closed: AtomicBool,
    banned: AtomicBool,
}

impl Vm {
    pub(crate) fn new(device: Arc<Device>, mode: VmMode) -> VmResult<Arc<Self>> {
        let settings = device.settings();
        let mut tiles = Vec::with_capacity(device.tile_count());
        for _ in device.tiles() {
            let mut arena = PtArena::new(device.memory().clone(), settings.pt_domain, settings.max_pt_nodes);
            let root = arena.alloc_root(MAX_LEVEL)?;
            tiles.push(TileTree {
                arena,
                root,
                last_update: Fence::signaled(),
            });
        }

        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);
        let policy = PtPolicy::from_settings(settings);
        let queue = AsyncQueue::new(settings.async_queue_depth);
        log::info!("vm[{}]: created, {:?} mode, {} tile(s)", id, mode, tiles.len());
        Ok(Arc::new_cyclic(|this| Self {
            id,
            this: this.clone(),
            device,
            mode,
            policy,
            state: RwLock::new(VmState {
                tiles,
                mappings: BTreeMap::new(),
                ids: HashMap::new(),
                rebind: BTreeSet::new(),
                next_id: 0,
            }),
            inv: Arc::new(Invalidations::default()),
            failures: Arc::new(WriteFailures::default()),
            contexts: Mutex::new(Vec::new()),
            queue,
            closed: AtomicBool::new(false),
            banned: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> VmMode {
        self.mode
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> VmResult<()> {
        if self.is_closed() {
            return Err(VmError::Closed);
        }
        if self.is_banned() {
            return Err(VmError::Banned);
        }
        Ok(())
    }

    fn wait_timeout(&self) -> Duration {
        self.device.settings().job_timeout * 2
    }

    fn migrate(&self, tile: usize) -> &Arc<Migrate> {
        &self.device.tiles()[tile].migrate
    }

    fn notifier(&self, mapping: u64) -> Arc<dyn HostNotifier> {
        Arc::new(UserptrNotifier {
            inv: self.inv.clone(),
            mapping,
        })
    }

    /// Record `[start, end)` of `tile` for repair if `fence` fails. A failed
    /// write of `mapping` also invalidates it.
    fn track(&self, tile: usize, start: GpuVa, end: GpuVa, fence: &Arc<Fence>, mapping: Option<u64>) {
        let failures = self.failures.clone();
        let inv = self.inv.clone();
        let id = self.id;
        fence.on_complete(move |result| {
            let Err(err) = result else {
                return;
            };
            log::warn!(
                "vm[{}]: page-table write to [0x{:X}..0x{:X}) on tile {} failed: {}",
                id,
                start,
                end,
                tile,
                err
            );
            failures.push(tile, start, end);
            if let Some(mapping) = mapping {
                inv.push(mapping);
            }
        });
    }

    /// Rewrite the directories of every range whose write failed, and queue
    /// the mappings inside for a rebind.
    fn repair_locked(&self, st: &mut VmState) -> VmResult<()> {
        let mut failed = self.failures.drain().into_iter();
        while let Some((tile, start, end)) = failed.next() {
            let tree = &mut st.tiles[tile];
            let updates = pt_resync(&tree.arena, tree.root, start, end);
            let fence = match self
                .migrate(tile)
                .update_page_tables(&updates, &[], vec![tree.last_update.clone()])
            {
                Ok(fence) => fence,
                Err(err) => {
                    self.failures.push(tile, start, end);
                    for (t, s, e) in failed.by_ref() {
                        self.failures.push(t, s, e);
                    }
                    return Err(err.into());
                }
            };
            log::info!(
                "vm[{}]: resyncing [0x{:X}..0x{:X}) on tile {} after a failed write",
                self.id,
                start,
                end,
                tile
            );
            tree.arena.release_quarantined(&fence);
            self.track(tile, start, end, &fence, None);
            tree.last_update = fence.settled();

            for key in st.overlapping(start, end) {
                let m = &st.mappings[&key];
                if m.tile_present & (1 << tile) != 0 {
                    self.inv.push(m.id);
                }
            }
        }
        Ok(())
    }

    /// Validate `[start, start + len)` and return its end.
    fn check_range(start: GpuVa, len: u64) -> VmResult<GpuVa> {
        if len == 0 || !is_page_aligned(start) || !is_page_aligned(len) {
            return Err(VmError::InvalidRange(start, len));
        }
        start
            .checked_add(len)
            .filter(|&end| end <= GPU_VA_SIZE)
            .ok_or(VmError::OutOfRange(start, len))
    }

    // -- Bind -------------------------------------------------------------

    /// Map a buffer range or a host range.
    ///
    /// Requests flagged `ASYNC` go through the async queue. The returned
    /// fence signals once the page tables of every requested tile point at
    /// the backing.
    pub fn bind(&self, req: BindRequest) -> VmResult<Arc<Fence>> {
        if req.flags.contains(BindFlags::ASYNC) {
            return self.submit_async(AsyncOp::Bind(req), None);
        }
        self.bind_now(req)
    }

    fn bind_now(&self, req: BindRequest) -> VmResult<Arc<Fence>> {
        self.check_usable()?;
        let BindRequest {
            start,
            len,
            backing,
            flags,
            tile_mask,
            wait,
            signal,
        } = req;
        let end = Self::check_range(start, len)?;

        let all = self.device.all_tiles();
        let tile_mask = tile_mask.unwrap_or(all);
        if tile_mask == 0 || tile_mask & !all != 0 {
            return Err(VmError::InvalidTiles(tile_mask));
        }
        if let BindBacking::Buffer { buffer, offset } = &backing {
            let fits = offset
                .checked_add(len)
                .is_some_and(|last| last <= align_up(buffer.size(), PAGE_SIZE_U64));
            if !is_page_aligned(*offset) || !fits {
                return Err(BufferError::OutOfBounds {
                    id: buffer.id(),
                    offset: *offset,
                    size: buffer.size(),
                }
                .into());
            }
        }

        let mut st = self.state.write();
        self.repair_locked(&mut st)?;
        if let Some(&key) = st.overlapping(start, end).first() {
            let existing = &st.mappings[&key];
            return Err(if existing.start == start && existing.end == end {
                VmError::AlreadyMapped(start, end)
            } else {
                VmError::Overlap(start, end)
            });
        }

        let id = st.alloc_id();
        let backing = match backing {
            BindBacking::Buffer { buffer, offset } => Backing::Buffer { buffer, offset },
            BindBacking::Userptr { host, addr } => {
                let writable = !flags.contains(BindFlags::READ_ONLY);
                Backing::Userptr(PinnedRegion::new(host, addr, len, writable, self.notifier(id)))
            }
        };
        let mut m = Mapping::new(id, start, end, flags, tile_mask, backing);

        if !flags.contains(BindFlags::IMMEDIATE) {
            log::debug!("vm[{}]: deferred bind [0x{:X}..0x{:X})", self.id, start, end);
            m.state = MappingState::Deferred;
            st.insert(m);
            st.rebind.insert(id);
            let fence = Fence::all(wait);
            for s in signal {
                fence.chain(s);
            }
            return Ok(fence);
        }

        let holes = st.holes(start, end);
        let fence = match self.bind_mapping(&mut st.tiles, &mut m, wait, &holes) {
            Ok(fence) => fence,
            Err(err) => {
                log::debug!("vm[{}]: bind [0x{:X}..0x{:X}) failed: {}", self.id, start, end, err);
                self.release_backing(&mut m);
                return Err(err);
            }
        };
        log::debug!(
            "vm[{}]: bound [0x{:X}..0x{:X}) as mapping {} on tiles 0b{:b}",
            self.id,
            start,
            end,
            id,
            m.tile_present
        );
        st.insert(m);
        for s in signal {
            fence.chain(s);
        }
        Ok(fence)
    }

    /// Make the backing of `m` current and map it on every tile of its mask.
    ///
    /// All tiles are staged before any of them is written. A failure while
    /// staging leaves the trees untouched; a failure while submitting unbinds
    /// the tiles already committed, reclaiming nodes inside `holes`.
    fn bind_mapping(
        &self,
        tiles: &mut [TileTree],
        m: &mut Mapping,
        mut deps: Vec<Arc<Fence>>,
        holes: &[(GpuVa, GpuVa)],
    ) -> VmResult<Arc<Fence>> {
        let prior = m.state;
        m.state = MappingState::Staging;
        let result = self.bind_tiles(tiles, m, &mut deps, holes);
        m.state = match result {
            Ok(_) => MappingState::Bound,
            Err(_) => prior,
        };
        result
    }

    fn bind_tiles(
        &self,
        tiles: &mut [TileTree],
        m: &mut Mapping,
        deps: &mut Vec<Arc<Fence>>,
        holes: &[(GpuVa, GpuVa)],
    ) -> VmResult<Arc<Fence>> {
        let held = m.buffer();
        // The reservation stays held until every tile is staged.
        let mut resv = held.as_ref().map(|(buffer, _)| buffer.lock());
        let storage = match (held.as_ref(), resv.as_deref_mut()) {
            (Some((buffer, offset)), Some(state)) => self.validate_buffer(m, buffer, state, *offset, deps)?,
            _ => self.pin_userptr(m)?,
        };

        let src = BindSource {
            storage: &storage,
            writable: m.writable(),
        };
        let mut staged = Vec::new();
        for t in m.tiles() {
            let tree = &mut tiles[t];
            match stage_bind(&mut tree.arena, tree.root, m.start, m.end, src, self.policy) {
                Ok(s) => staged.push((t, s)),
                Err(err) => {
                    for (t, s) in staged {
                        discard(&mut tiles[t].arena, s);
                    }
                    return Err(err.into());
                }
            }
        }
        drop(resv);

        let mut fences = Vec::with_capacity(staged.len());
        let mut committed = 0u8;
        let mut pending = staged.into_iter();
        while let Some((t, s)) = pending.next() {
            let tree = &mut tiles[t];
            let mut tile_deps = deps.clone();
            tile_deps.push(tree.last_update.clone());
            match self.migrate(t).update_page_tables(&s.updates, &s.populate, tile_deps) {
                Ok(fence) => {
                    commit(&mut tree.arena, s, &fence);
                    self.track(t, m.start, m.end, &fence, Some(m.id));
                    tree.last_update = fence.settled();
                    m.leaves[t] = Some(build_leaves(&tree.arena, tree.root, m.start, m.end));
                    committed |= 1 << t;
                    fences.push(fence);
                }
                Err(err) => {
                    discard(&mut tree.arena, s);
                    for (t, s) in pending {
                        discard(&mut tiles[t].arena, s);
                    }
                    log::warn!(
                        "vm[{}]: writing tile {} of mapping {} failed, rolling back tiles 0b{:b}",
                        self.id,
                        t,
                        m.id,
                        committed
                    );
                    if let Err(undo) = self.unbind_range(tiles, committed, m.start, m.end, holes, fences) {
                        log::warn!("vm[{}]: rollback of mapping {} failed: {}", self.id, m.id, undo);
                    }
                    m.tile_present &= !committed;
                    return Err(err.into());
                }
            }
        }
        m.tile_present |= committed;
        Ok(Fence::all(fences))
    }

    fn validate_buffer(
        &self,
        m: &mut Mapping,
        buffer: &Buffer,
        state: &mut BufferState,
        offset: u64,
        deps: &mut Vec<Arc<Fence>>,
    ) -> VmResult<Storage> {
        let domain = state.preferred();
        if let Some(fence) = self.device.backend().validate(buffer, state, domain)? {
            deps.push(fence);
        }
        deps.push(state.idle_fence());
        // Our own validate may have reported the move back to us.
        self.inv.remove(m.id);
        if !m.registered {
            let listener: Arc<dyn MoveListener> = self.inv.clone();
            state.add_binding(Arc::downgrade(&listener), m.id);
            m.registered = true;
        }
        Ok(state.storage().slice(offset, m.len()))
    }

    fn pin_userptr(&self, m: &mut Mapping) -> VmResult<Storage> {
        let (id, start) = (m.id, m.start);
        let Backing::Userptr(region) = &mut m.backing else {
            return Err(VmError::NotMapped(start));
        };
        // Anything reported from here on must survive for the next rebind.
        self.inv.remove(id);
        region.pin(self.device.settings().userptr_retry_limit)?;
        region.storage().cloned().ok_or(VmError::Invalidated(start))
    }

    /// Drop the links a mapping holds on its backing.
    fn release_backing(&self, m: &mut Mapping) {
        match &mut m.backing {
            Backing::Buffer { buffer, .. } => {
                if m.registered {
                    buffer.lock().remove_binding(m.id);
                    m.registered = false;
                }
            }
            Backing::Userptr(region) => region.release(),
        }
        self.inv.remove(m.id);
    }

    // -- Unbind -----------------------------------------------------------

    /// Stage, write and commit the removal of `[start, end)` on the tiles of
    /// `mask`. `holes[t]` bounds node reclamation on tile `t`.
    fn unbind_range(
        &self,
        tiles: &mut [TileTree],
        mask: u8,
        start: GpuVa,
        end: GpuVa,
        holes: &[(GpuVa, GpuVa)],
        deps: Vec<Arc<Fence>>,
    ) -> VmResult<Arc<Fence>> {
        let mut fences = Vec::new();
        for (t, tree) in tiles.iter_mut().enumerate() {
            if mask & (1 << t) == 0 {
                continue;
            }
            let hole = holes.get(t).copied().unwrap_or((start, end));
            let staged = stage_unbind(&mut tree.arena, tree.root, start, end, hole);
            let mut tile_deps = deps.clone();
            tile_deps.push(tree.last_update.clone());
            let fence = match self.migrate(t).update_page_tables(&staged.updates, &staged.populate, tile_deps) {
                Ok(fence) => fence,
                Err(err) => {
                    discard(&mut tree.arena, staged);
                    return Err(err.into());
                }
            };
            commit(&mut tree.arena, staged, &fence);
            self.track(t, start, end, &fence, None);
            tree.last_update = fence.settled();
            fences.push(fence);
        }
        if fences.is_empty() {
            return Ok(Fence::all(deps));
        }
        Ok(Fence::all(fences))
    }

    /// Unmap everything overlapping `[start, start + len)`.
    ///
    /// Mappings sticking out of the range are cut down to their remnants.
    /// When no leaf crosses a cut, the remnants keep their translations;
    /// otherwise the whole mapping is unbound and the remnants are bound
    /// again. `syncs` are waited for before the page tables change.
    pub fn unbind(&self, start: GpuVa, len: u64, syncs: Vec<Arc<Fence>>) -> VmResult<Arc<Fence>> {
        self.check_usable()?;
        let end = Self::check_range(start, len)?;
        let mut st = self.state.write();
        self.unbind_locked(&mut st, start, end, syncs)
    }

    fn unbind_locked(&self, st: &mut VmState, start: GpuVa, end: GpuVa, syncs: Vec<Arc<Fence>>) -> VmResult<Arc<Fence>> {
        self.repair_locked(st)?;
        let victims = st.overlapping(start, end);
        if victims.is_empty() {
            return Err(VmError::NotMapped(start));
        }

        let mut fences = Vec::new();
        let mut first_err = None;
        for key in victims {
            let Some((mut m, was_pending)) = st.remove(key) else {
                continue;
            };
            let s = start.max(m.start);
            let e = end.min(m.end);
            let head = m.start < s;
            let tail = e < m.end;
            let straddle = m.present_tiles().any(|t| {
                m.leaves[t]
                    .as_ref()
                    .is_some_and(|l| (head && l.straddles(s)) || (tail && l.straddles(e)))
            });
            let prior = m.state;
            m.state = MappingState::Unbinding;
            log::debug!(
                "vm[{}]: unbind [0x{:X}..0x{:X}) of mapping {} [0x{:X}..0x{:X}){}",
                self.id,
                s,
                e,
                m.id,
                m.start,
                m.end,
                if straddle { ", rebinding remnants" } else { "" }
            );

            let (lo, hi) = if straddle { (m.start, m.end) } else { (s, e) };
            let holes: Vec<(GpuVa, GpuVa)> = st
                .holes(m.start, m.end)
                .into_iter()
                .map(|(prev_end, next_start)| {
                    if straddle {
                        (prev_end, next_start)
                    } else {
                        (if head { s } else { prev_end }, if tail { e } else { next_start })
                    }
                })
                .collect();
            let unbound = self.unbind_range(&mut st.tiles, m.tile_present, lo, hi, &holes, syncs.clone());
            let fence = match unbound {
                Ok(fence) => fence,
                Err(err) => {
                    m.state = prior;
                    let id = m.id;
                    st.insert(m);
                    if was_pending {
                        st.rebind.insert(id);
                    }
                    return Err(err);
                }
            };
            fences.push(fence.clone());

            let invalidated = self.inv.contains(m.id);
            let mut remnants = Vec::new();
            if head {
                remnants.push(self.carve(st, &m, m.start, s));
            }
            if tail {
                remnants.push(self.carve(st, &m, e, m.end));
            }
            if straddle {
                m.tile_present = 0;
            }
            self.release_backing(&mut m);

            for mut r in remnants {
                let id = r.id;
                if straddle && prior == MappingState::Bound {
                    let holes = st.holes(r.start, r.end);
                    match self.bind_mapping(&mut st.tiles, &mut r, vec![fence.clone()], &holes) {
                        Ok(f) => fences.push(f),
                        Err(err) => {
                            log::warn!("vm[{}]: rebinding remnant {} failed: {}", self.id, id, err);
                            r.state = MappingState::Invalidated;
                            st.rebind.insert(id);
                            first_err.get_or_insert(err);
                        }
                    }
                } else {
                    r.state = prior;
                    if !straddle {
                        r.tile_present = m.tile_present;
                        for t in r.present_tiles() {
                            let tree = &st.tiles[t];
                            r.leaves[t] = Some(build_leaves(&tree.arena, tree.root, r.start, r.end));
                        }
                    }
                    if prior != MappingState::Bound || was_pending {
                        st.rebind.insert(id);
                    }
                    if invalidated {
                        self.inv.push(id);
                    }
                }
                st.insert(r);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(Fence::all(fences)),
        }
    }

    /// Remnant `[start, end)` of `m`, under a new id.
    fn carve(&self, st: &mut VmState, m: &Mapping, start: GpuVa, end: GpuVa) -> Mapping {
        let id = st.alloc_id();
        let delta = start - m.start;
        let backing = match &m.backing {
            Backing::Buffer { buffer, offset } => Backing::Buffer {
                buffer: buffer.clone(),
                offset: offset + delta,
            },
            Backing::Userptr(region) => Backing::Userptr(region.split(delta, end - start, self.notifier(id))),
        };
        let mut r = Mapping::new(id, start, end, m.flags, m.tile_mask, backing);
        if let Backing::Buffer { buffer, .. } = &r.backing {
            let listener: Arc<dyn MoveListener> = self.inv.clone();
            buffer.lock().add_binding(Arc::downgrade(&listener), id);
            r.registered = true;
        }
        r
    }

    // -- Rebind -----------------------------------------------------------

    /// Bring every mapping whose backing changed, or that was never bound,
    /// back in line with its backing.
    pub fn rebind_all(&self) -> VmResult<Arc<Fence>> {
        self.check_usable()?;
        let mut st = self.state.write();
        self.rebind_locked(&mut st)
    }

    fn rebind_locked(&self, st: &mut VmState) -> VmResult<Arc<Fence>> {
        self.repair_locked(st)?;
        let mut fences = Vec::new();

        for id in self.inv.drain() {
            let VmState {
                tiles,
                mappings,
                ids,
                rebind,
                ..
            } = &mut *st;
            let Some(m) = ids.get(&id).and_then(|key| mappings.get_mut(key)) else {
                continue;
            };
            if m.state == MappingState::Bound {
                fences.push(self.zap(tiles, m)?);
                m.state = MappingState::Invalidated;
            }
            rebind.insert(id);
        }

        let pending: Vec<u64> = std::mem::take(&mut st.rebind).into_iter().collect();
        if !pending.is_empty() {
            log::debug!("vm[{}]: rebinding {} mapping(s)", self.id, pending.len());
        }
        let mut first_err = None;
        for id in pending {
            let Some(&key) = st.ids.get(&id) else {
                continue;
            };
            let Some(end) = st.mappings.get(&key).map(|m| m.end) else {
                continue;
            };
            let holes = st.holes(key, end);
            let VmState {
                tiles,
                mappings,
                rebind,
                ..
            } = &mut *st;
            let Some(m) = mappings.get_mut(&key) else {
                continue;
            };
            match self.bind_mapping(tiles, m, Vec::new(), &holes) {
                Ok(fence) => fences.push(fence),
                Err(err) => {
                    log::warn!("vm[{}]: rebind of mapping {} failed: {}", self.id, id, err);
                    rebind.insert(id);
                    first_err.get_or_insert(err);
                }
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(Fence::all(fences)),
        }
    }

    /// Clear the hardware leaves of `m`, keeping the tree shape.
    fn zap(&self, tiles: &mut [TileTree], m: &Mapping) -> VmResult<Arc<Fence>> {
        let mut fences = Vec::new();
        for t in m.present_tiles() {
            let Some(index) = &m.leaves[t] else {
                continue;
            };
            let tree = &mut tiles[t];
            let updates = zap_leaves(&tree.arena, index);
            let fence = self
                .migrate(t)
                .update_page_tables(&updates, &[], vec![tree.last_update.clone()])?;
            self.track(t, m.start, m.end, &fence, Some(m.id));
            tree.last_update = fence.settled();
            fences.push(fence);
        }
        log::trace!("vm[{}]: zapped mapping {}", self.id, m.id);
        Ok(Fence::all(fences))
    }

    /// Rebind until every host-backed mapping is current, giving up after
    /// `userptr_retry_limit` rounds.
    pub fn prepare_exec(&self) -> VmResult<Arc<Fence>> {
        self.check_usable()?;
        let limit = self.device.settings().userptr_retry_limit.max(1);
        let mut st = self.state.write();
        for attempt in 1..=limit {
            let fence = self.rebind_locked(&mut st)?;
            let settled = self.inv.is_empty() && st.rebind.is_empty() && st.mappings.values().all(|m| !m.is_stale());
            if settled {
                return Ok(fence);
            }
            log::debug!("vm[{}]: host ranges changed during rebind (round {}/{})", self.id, attempt, limit);
        }
        log::warn!("vm[{}]: exec preparation gave up after {} rounds", self.id, limit);
        Err(VmError::RetryExhausted(limit))
    }

    /// Move the buffers under `[start, start + len)` to `domain` and rebind.
    pub fn prefetch(&self, start: GpuVa, len: u64, domain: MemoryDomain) -> VmResult<Arc<Fence>> {
        self.check_usable()?;
        let end = Self::check_range(start, len)?;
        let mut st = self.state.write();
        let keys = st.overlapping(start, end);
        if keys.is_empty() {
            return Err(VmError::NotMapped(start));
        }

        let mut fences = Vec::new();
        for key in keys {
            let Some((buffer, _)) = st.mappings.get(&key).and_then(Mapping::buffer) else {
                continue;
            };
            let mut state = buffer.lock();
            state.set_preferred(domain);
            if let Some(fence) = self.device.backend().validate(&buffer, &mut state, domain)? {
                log::debug!("vm[{}]: prefetching buffer {} to {}", self.id, buffer.id(), domain);
                fences.push(fence);
            }
        }
        fences.push(self.rebind_locked(&mut st)?);
        Ok(Fence::all(fences))
    }

    // -- Lifecycle --------------------------------------------------------

    /// Ban the space. Queued async operations are cancelled and later
    /// operations fail.
    pub fn kill(&self) {
        if !self.banned.swap(true, Ordering::AcqRel) {
            log::warn!("vm[{}]: killed", self.id);
        }
    }

    /// Stop the async queue, detach contexts and unmap everything.
    pub fn close(&self) -> VmResult<Arc<Fence>> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(VmError::Closed);
        }
        self.queue.stop();
        self.contexts.lock().clear();

        let mut st = self.state.write();
        let count = st.mappings.len();
        let fence = if count == 0 {
            Fence::signaled()
        } else {
            self.unbind_locked(&mut st, 0, GPU_VA_SIZE, Vec::new())?
        };
        st.rebind.clear();
        log::info!("vm[{}]: closed, {} mapping(s) torn down", self.id, count);
        Ok(fence)
    }

    // -- Queries ----------------------------------------------------------

    /// Mappings still marked bound whose backing or page tables changed
    /// report as invalidated.
    fn info_of(&self, m: &Mapping) -> MappingInfo {
        let mut info = m.info();
        if info.state == MappingState::Bound && self.inv.contains(m.id) {
            info.state = MappingState::Invalidated;
        }
        info
    }

    pub fn lookup(&self, va: GpuVa) -> Option<MappingInfo> {
        let st = self.state.read();
        st.mappings
            .range(..=va)
            .next_back()
            .filter(|(_, m)| m.contains(va))
            .map(|(_, m)| self.info_of(m))
    }

    pub fn mappings(&self) -> Vec<MappingInfo> {
        self.state.read().mappings.values().map(|m| self.info_of(m)).collect()
    }

    /// Walk the tree of `tile` for `va`.
    pub fn translate(&self, tile: usize, va: GpuVa) -> VmResult<Option<Translation>> {
        let st = self.state.read();
        let tree = st.tiles.get(tile).ok_or(VmError::InvalidTiles(0))?;
        Ok(walker::translate(tree.arena.memory(), tree.arena[tree.root].addr, va)?)
    }

    /// Read memory the way the GPU sees it.
    ///
    /// Fails on mappings that are not bound or whose backing changed since
    /// they were.
    pub fn read_gpu(&self, va: GpuVa, buf: &mut [u8]) -> VmResult<()> {
        let len = (buf.len() as u64).max(1);
        let end = va.checked_add(len).ok_or(VmError::OutOfRange(va, len))?;
        let st = self.state.read();
        let keys = st.overlapping(va, end);
        let mut tile = None;
        for m in keys.iter().filter_map(|k| st.mappings.get(k)) {
            match m.state {
                MappingState::Bound if !m.is_stale() && !self.inv.contains(m.id) => {}
                MappingState::Deferred => return Err(VmError::NotMapped(m.start)),
                _ => return Err(VmError::Invalidated(m.start)),
            }
            tile = tile.or(m.present_tiles().next());
        }
        let Some(tile) = tile else {
            return Err(VmError::NotMapped(va));
        };
        let tree = &st.tiles[tile];
        match walker::read_virtual(tree.arena.memory(), tree.arena[tree.root].addr, va, buf)? {
            Ok(()) => Ok(()),
            Err(fault) => Err(VmError::NotMapped(fault)),
        }
    }

    /// Live page-table nodes across all tiles.
    pub fn pt_node_count(&self) -> usize {
        self.state.read().tiles.iter().map(|t| t.arena.node_count()).sum()
    }

    /// Present entries in the root node of `tile`.
    pub fn root_live_entries(&self, tile: usize) -> Option<u32> {
        let st = self.state.read();
        st.tiles.get(tile).map(|t| t.arena[t.root].num_live)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.queue.stop();
        let state = self.state.get_mut();
        state.mappings.clear();
        let tiles = std::mem::take(&mut state.tiles);
        if tiles.is_empty() {
            return;
        }

        let id = self.id;
        let timeout = self.wait_timeout();
        let spawned = thread::Builder::new()
            .name(format!("vm{}-destroy", id))
            .spawn(move || {
                for tree in tiles {
                    if let Err(err) = tree.last_update.wait(timeout) {
                        log::warn!("vm[{}]: last page-table update did not complete: {}", id, err);
                    }
                    drop(tree);
                }
                log::debug!("vm[{}]: page tables destroyed", id);
            });
        if let Err(err) = spawned {
            log::error!("vm[{}]: failed to spawn teardown thread: {}", id, err);
        }
    }
}
