// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use gpuvm_common::{align_down, GpuVa, MemoryDomain, Settings, SZ_64K};
use gpuvm_hw::pte::{encode_pde, encode_pte, MAX_HUGE_LEVEL};
use gpuvm_hw::Storage;

use super::commit::discard;
use super::node::{NodeId, NodeState, PtArena};
use super::{NodeWrite, PtError, PtResult, Staged, StagedEntry, StagedUpdate, UpdateOp};

/// Leaf-size policy of a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtPolicy {
    /// Highest level a leaf may be installed at (0 disables huge leaves).
    pub max_leaf_level: u8,
    pub compact_64k: bool,
}

impl PtPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_leaf_level: if settings.huge_pages { MAX_HUGE_LEVEL } else { 0 },
            compact_64k: settings.compact_64k,
        }
    }
}

/// Pages to map. Page 0 of `storage` backs the first page of the range.
#[derive(Debug, Clone, Copy)]
pub struct BindSource<'a> {
    pub storage: &'a Storage,
    pub writable: bool,
}

impl BindSource<'_> {
    fn domain(&self) -> MemoryDomain {
        self.storage.domain()
    }

    /// Whether every 64 KiB chunk of `[offset, offset + len)` is contiguous
    /// and aligned.
    fn is_64k_contiguous(&self, offset: u64, len: u64) -> bool {
        (0..len / SZ_64K).all(|k| self.storage.is_contiguous(offset + k * SZ_64K, SZ_64K, SZ_64K))
    }
}

struct Walk<'a> {
    arena: &'a mut PtArena,
    staged: Staged,
    /// Index of the update record last opened for each shared node.
    open: HashMap<NodeId, usize>,
}

impl<'a> Walk<'a> {
    fn new(arena: &'a mut PtArena) -> Self {
        Self {
            arena,
            staged: Staged::default(),
            open: HashMap::new(),
        }
    }

    fn alloc_private(&mut self, level: u8, compact: bool) -> PtResult<NodeId> {
        let id = self.arena.alloc(level, compact, NodeState::Private)?;
        self.staged.private.push(id);
        Ok(id)
    }

    /// Record an update for a shared node, extending the open record when
    /// `idx` directly follows it.
    fn record(&mut self, node: NodeId, idx: usize, entry: Option<StagedEntry>) {
        if let Err(entry) = self.extend(node, idx, entry) {
            self.open_record(node, idx, entry);
        }
    }

    fn extend(&mut self, node: NodeId, idx: usize, entry: Option<StagedEntry>) -> Result<(), Option<StagedEntry>> {
        let Some(&i) = self.open.get(&node) else {
            return Err(entry);
        };
        let update = &mut self.staged.updates[i];
        if update.offset + update.count() != idx {
            return Err(entry);
        }
        match (&mut update.op, entry) {
            (UpdateOp::Write(entries), Some(entry)) => entries.push(entry),
            (UpdateOp::Clear(n), None) => *n += 1,
            (_, entry) => return Err(entry),
        }
        Ok(())
    }

    fn open_record(&mut self, node: NodeId, idx: usize, entry: Option<StagedEntry>) {
        let n = &self.arena[node];
        let op = match entry {
            Some(entry) => UpdateOp::Write(vec![entry]),
            None => UpdateOp::Clear(1),
        };
        self.staged.updates.push(StagedUpdate {
            node,
            addr: n.addr,
            domain: n.domain,
            level: n.level,
            offset: idx,
            op,
            bookkeeping: true,
        });
        self.open.insert(node, self.staged.updates.len() - 1);
    }

    /// Write an entry. Private nodes are written in place.
    fn write(&mut self, node: NodeId, idx: usize, value: u64, child: Option<NodeId>, replaced: Option<NodeId>) {
        let n = &mut self.arena[node];
        match n.state {
            NodeState::Private => {
                if let Some(shadow) = n.shadow.as_mut() {
                    shadow[idx] = value;
                }
                n.set_present(idx);
                n.set_child(idx, child);
            }
            NodeState::Shared => {
                self.record(node, idx, Some(StagedEntry { value, child, replaced }));
            }
        }
    }

    fn clear(&mut self, node: NodeId, idx: usize) {
        self.record(node, idx, None);
    }

    fn finish(mut self) -> Staged {
        for &id in &self.staged.private {
            let node = &mut self.arena[id];
            if let Some(entries) = node.shadow.take() {
                self.staged.populate.push(NodeWrite {
                    node: id,
                    addr: node.addr,
                    domain: node.domain,
                    entries,
                });
            }
        }
        self.staged
    }
}

/// Stage the mapping of `[start, end)` onto `src`.
///
/// On error every node the walk allocated is freed and the live tree is
/// untouched.
pub fn stage_bind(
    arena: &mut PtArena,
    root: NodeId,
    start: GpuVa,
    end: GpuVa,
    src: BindSource<'_>,
    policy: PtPolicy,
) -> PtResult<Staged> {
    if src.storage.size() < end - start {
        return Err(PtError::ShortSource {
            need: end - start,
            have: src.storage.size(),
        });
    }
    let mut walk = Walk::new(arena);
    let ctx = BindCtx { start, src, policy };
    match bind_node(&mut walk, &ctx, root, start, end) {
        Ok(()) => {
            let staged = walk.finish();
            log::trace!(
                "pt: staged bind [0x{:X}..0x{:X}): {} updates, {} new nodes",
                start,
                end,
                staged.updates.len(),
                staged.private.len()
            );
            Ok(staged)
        }
        Err(err) => {
            let staged = std::mem::take(&mut walk.staged);
            discard(&mut *walk.arena, staged);
            Err(err)
        }
    }
}

struct BindCtx<'a> {
    start: GpuVa,
    src: BindSource<'a>,
    policy: PtPolicy,
}

impl BindCtx<'_> {
    fn addr(&self, va: GpuVa) -> u64 {
        // The source size was checked against the range.
        self.src.storage.addr(va - self.start).unwrap_or_default()
    }
}

fn bind_node(walk: &mut Walk<'_>, ctx: &BindCtx<'_>, node: NodeId, start: GpuVa, end: GpuVa) -> PtResult<()> {
    let (level, compact, entry_size) = {
        let n = &walk.arena[node];
        (n.level, n.compact, n.entry_size())
    };
    let domain = ctx.src.domain();
    let writable = ctx.src.writable;

    let mut va = start;
    while va < end {
        let idx = walk.arena[node].index_of(va);
        let entry_start = align_down(va, entry_size);
        let entry_end = entry_start + entry_size;
        let next = end.min(entry_end);
        let offset = va - ctx.start;

        if level == 0 {
            let pte = encode_pte(ctx.addr(va), domain, writable, 0, compact);
            walk.write(node, idx, pte, None, None);
            va = next;
            continue;
        }

        let full = va == entry_start && next == entry_end;
        let existing = walk.arena[node].child(idx);
        if full
            && existing.is_none()
            && level <= ctx.policy.max_leaf_level
            && ctx.src.storage.is_contiguous(offset, entry_size, entry_size)
        {
            let pte = encode_pte(ctx.addr(va), domain, writable, level, false);
            walk.write(node, idx, pte, None, None);
            va = next;
            continue;
        }

        let want_compact = level == 1
            && full
            && ctx.policy.compact_64k
            && domain == MemoryDomain::Vram
            && ctx.src.is_64k_contiguous(offset, entry_size);
        let reuse = existing.filter(|&c| want_compact || !walk.arena[c].compact);
        match reuse {
            Some(child) => bind_node(walk, ctx, child, va, next)?,
            None => {
                let child = walk.alloc_private(level - 1, want_compact)?;
                bind_node(walk, ctx, child, va, next)?;
                let pde = encode_pde(walk.arena[child].addr, walk.arena.domain(), want_compact);
                walk.write(node, idx, pde, Some(child), existing);
            }
        }
        va = next;
    }
    Ok(())
}

/// Stage the unmapping of `[start, end)`.
///
/// `hole` is the gap between the neighbouring mappings, which contains the
/// range. A child node is reclaimed only when its whole span lies inside the
/// hole and all its live entries fall inside the range; otherwise the walk
/// descends into it. The root is never reclaimed.
pub fn stage_unbind(arena: &mut PtArena, root: NodeId, start: GpuVa, end: GpuVa, hole: (GpuVa, GpuVa)) -> Staged {
    let mut walk = Walk::new(arena);
    unbind_node(&mut walk, root, start, end, hole);
    let staged = walk.finish();
    log::trace!(
        "pt: staged unbind [0x{:X}..0x{:X}) hole [0x{:X}..0x{:X}): {} updates",
        start,
        end,
        hole.0,
        hole.1,
        staged.updates.len()
    );
    staged
}

fn unbind_node(walk: &mut Walk<'_>, node: NodeId, start: GpuVa, end: GpuVa, hole: (GpuVa, GpuVa)) {
    let entry_size = walk.arena[node].entry_size();
    let mut va = start;
    while va < end {
        let n = &walk.arena[node];
        let idx = n.index_of(va);
        let entry_start = align_down(va, entry_size);
        let entry_end = entry_start + entry_size;
        let next = end.min(entry_end);

        if n.is_present(idx) {
            match n.child(idx) {
                None => walk.clear(node, idx),
                Some(child) => {
                    let c = &walk.arena[child];
                    let first = c.index_of(va);
                    let last = if next == entry_end {
                        c.entries()
                    } else {
                        c.index_of(next - 1) + 1
                    };
                    let inside_hole = hole.0 <= entry_start && entry_end <= hole.1;
                    if inside_hole && c.count_present(first, last) == c.num_live {
                        walk.clear(node, idx);
                    } else {
                        unbind_node(walk, child, va, next, hole);
                    }
                }
            }
        }
        va = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt::test_util::{apply_cpu, setup};
    use crate::pt::test_util::Tree;
    use crate::pt::{build_leaves, commit};
    use gpuvm_common::{PAGE_SIZE_U64, SZ_1G, SZ_2M};
    use gpuvm_hw::memory::Placement;
    use gpuvm_hw::walker::translate;
    use gpuvm_hw::Fence;

    const POLICY: PtPolicy = PtPolicy {
        max_leaf_level: MAX_HUGE_LEVEL,
        compact_64k: true,
    };

    fn storage(t: &Tree, domain: MemoryDomain, pages: usize, placement: Placement) -> Storage {
        Storage::new(domain, t.mem.alloc_pages(domain, pages, placement).unwrap())
    }

    fn bind(t: &mut Tree, start: GpuVa, src: &Storage) -> Staged {
        let end = start + src.size();
        let staged = stage_bind(
            &mut t.arena,
            t.root,
            start,
            end,
            BindSource {
                storage: src,
                writable: true,
            },
            POLICY,
        )
        .unwrap();
        apply_cpu(&t.arena, &staged);
        staged
    }

    #[test]
    fn test_fresh_bind_is_all_private() {
        let mut t = setup();
        let src = storage(&t, MemoryDomain::System, 4, Placement::Scattered);
        let staged = bind(&mut t, 0x10_0000, &src);

        // Only the root entry is a staged update; the rest is populate.
        assert_eq!(staged.updates.len(), 1);
        assert_eq!(staged.updates[0].node, t.root);
        assert_eq!(staged.updates[0].count(), 1);
        assert_eq!(staged.populate.len(), 3);
        commit(&mut t.arena, staged, &Fence::signaled());

        for i in 0..4u64 {
            let tr = translate(&t.mem, t.root_addr(), 0x10_0000 + i * PAGE_SIZE_U64)
                .unwrap()
                .unwrap();
            assert_eq!(tr.addr, src.pages()[i as usize]);
        }
        assert_eq!(t.arena.node_count(), 4);
    }

    #[test]
    fn test_huge_promotion() {
        let mut t = setup();
        let src = storage(&t, MemoryDomain::Vram, 1024, Placement::Contiguous { align: SZ_2M });
        let staged = bind(&mut t, SZ_1G, &src);
        commit(&mut t.arena, staged, &Fence::signaled());

        let tr = translate(&t.mem, t.root_addr(), SZ_1G + SZ_2M + 0x10).unwrap().unwrap();
        assert_eq!(tr.level, 1);
        assert_eq!(tr.addr, src.pages()[512] + 0x10);
        // root, level 2 and one level-1 node holding two huge leaves.
        assert_eq!(t.arena.node_count(), 3);
    }

    #[test]
    fn test_compact_promotion() {
        let mut t = setup();
        // 64 KiB aligned but not 2 MiB contiguous: swap the two halves.
        let mut pages = t
            .mem
            .alloc_pages(MemoryDomain::Vram, 1024, Placement::Contiguous { align: SZ_2M })
            .unwrap();
        pages.truncate(512);
        pages.rotate_left(16);
        let src = Storage::new(MemoryDomain::Vram, pages);
        let staged = bind(&mut t, 0, &src);
        commit(&mut t.arena, staged, &Fence::signaled());

        let tr = translate(&t.mem, t.root_addr(), 0x1_2345).unwrap().unwrap();
        assert_eq!(tr.page_size, SZ_64K);
        assert_eq!(tr.addr, src.pages()[0x12] + 0x345);
    }

    #[test]
    fn test_shared_node_updates_are_coalesced() {
        let mut t = setup();
        let a = storage(&t, MemoryDomain::System, 1, Placement::Scattered);
        let staged = bind(&mut t, 0, &a);
        commit(&mut t.arena, staged, &Fence::signaled());

        // Second bind lands in the same, now shared, leaf node.
        let b = storage(&t, MemoryDomain::System, 8, Placement::Scattered);
        let staged = bind(&mut t, 4 * PAGE_SIZE_U64, &b);
        assert!(staged.populate.is_empty());
        assert_eq!(staged.updates.len(), 1);
        assert_eq!(staged.updates[0].offset, 4);
        assert_eq!(staged.updates[0].count(), 8);
        let before = t.arena.node_count();
        commit(&mut t.arena, staged, &Fence::signaled());
        assert_eq!(t.arena.node_count(), before);
    }

    #[test]
    fn test_failed_walk_frees_private_nodes() {
        let mut t = setup();
        t.arena = PtArena::new(t.mem.clone(), MemoryDomain::System, 2);
        t.root = t.arena.alloc_root(3).unwrap();
        let used = t.mem.used_pages(MemoryDomain::System);

        let src = storage(&t, MemoryDomain::System, 1, Placement::Scattered);
        let err = stage_bind(
            &mut t.arena,
            t.root,
            0,
            PAGE_SIZE_U64,
            BindSource {
                storage: &src,
                writable: true,
            },
            POLICY,
        )
        .unwrap_err();
        assert!(matches!(err, PtError::OutOfNodes(2)));
        assert_eq!(t.arena.node_count(), 1);
        assert_eq!(t.mem.used_pages(MemoryDomain::System), used + 1);
        assert_eq!(t.arena[t.root].num_live, 0);
    }

    #[test]
    fn test_unbind_reclaims_only_inside_hole() {
        let mut t = setup();
        let a = storage(&t, MemoryDomain::System, 1, Placement::Scattered);
        let b = storage(&t, MemoryDomain::System, 1, Placement::Scattered);
        let s = bind(&mut t, 0, &a);
        commit(&mut t.arena, s, &Fence::signaled());
        let s = bind(&mut t, PAGE_SIZE_U64, &b);
        commit(&mut t.arena, s, &Fence::signaled());
        assert_eq!(t.arena.node_count(), 4);

        // [0, 4K): neighbour at 4K keeps the directory alive.
        let s = stage_unbind(&mut t.arena, t.root, 0, PAGE_SIZE_U64, (0, PAGE_SIZE_U64));
        assert_eq!(s.updates.len(), 1);
        assert_eq!(s.updates[0].level, 0);
        apply_cpu(&t.arena, &s);
        commit(&mut t.arena, s, &Fence::signaled());
        assert_eq!(t.arena.node_count(), 4);

        // [4K, 8K): nothing else left, the whole subtree goes.
        let s = stage_unbind(&mut t.arena, t.root, PAGE_SIZE_U64, 2 * PAGE_SIZE_U64, (0, u64::MAX));
        assert_eq!(s.updates.len(), 1);
        assert_eq!(s.updates[0].node, t.root);
        apply_cpu(&t.arena, &s);
        commit(&mut t.arena, s, &Fence::signaled());
        assert_eq!(t.arena.node_count(), 1);
        assert_eq!(t.arena[t.root].num_live, 0);
        assert!(build_leaves(&t.arena, t.root, 0, SZ_1G).runs.is_empty());
    }

    #[test]
    fn test_rebind_replaces_compact_child() {
        let mut t = setup();
        let vram = storage(&t, MemoryDomain::Vram, 512, Placement::Contiguous { align: SZ_2M });
        let mut pages = vram.pages().to_vec();
        pages.rotate_left(16);
        let compactable = Storage::new(MemoryDomain::Vram, pages);
        let s = bind(&mut t, 0, &compactable);
        commit(&mut t.arena, s, &Fence::signaled());
        let nodes = t.arena.node_count();

        // Same range, now backed by scattered system pages.
        let sys = storage(&t, MemoryDomain::System, 512, Placement::Scattered);
        let s = bind(&mut t, 0, &sys);
        assert_eq!(s.populate.len(), 1);
        let live = t.arena[t.root].num_live;
        commit(&mut t.arena, s, &Fence::signaled());
        assert_eq!(t.arena.node_count(), nodes);
        assert_eq!(t.arena[t.root].num_live, live);

        let tr = translate(&t.mem, t.root_addr(), 0x5000).unwrap().unwrap();
        assert_eq!(tr.page_size, PAGE_SIZE_U64);
        assert_eq!(tr.addr, sys.pages()[5]);
    }
}
