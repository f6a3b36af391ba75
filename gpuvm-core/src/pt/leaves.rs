// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use gpuvm_common::{align_down, DevAddr, GpuVa, MemoryDomain, PAGE_SIZE_U64, SZ_2M};
use gpuvm_hw::pte::encode_pde;

use super::node::{NodeId, PtArena};
use super::{StagedEntry, StagedUpdate, UpdateOp};

/// Consecutive leaf entries of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRun {
    pub node: NodeId,
    /// Storage of the node.
    pub addr: DevAddr,
    pub domain: MemoryDomain,
    pub level: u8,
    pub compact: bool,
    pub offset: usize,
    pub count: usize,
    /// First address mapped by the run.
    pub va: GpuVa,
    pub entry_size: u64,
}

impl LeafRun {
    pub fn end(&self) -> GpuVa {
        self.va + self.count as u64 * self.entry_size
    }

    pub fn contains(&self, va: GpuVa) -> bool {
        self.va <= va && va < self.end()
    }

    /// Smallest unit a split of this run must respect.
    fn split_unit(&self) -> u64 {
        if self.compact {
            SZ_2M
        } else {
            self.entry_size
        }
    }
}

/// Leaf entries installed for one mapping, in address order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeafIndex {
    pub runs: Vec<LeafRun>,
}

impl LeafIndex {
    pub fn leaf_count(&self) -> usize {
        self.runs.iter().map(|r| r.count).sum()
    }

    pub fn leaf_at(&self, va: GpuVa) -> Option<&LeafRun> {
        self.runs.iter().find(|r| r.contains(va))
    }

    /// Whether cutting the mapping at `boundary` would split a leaf larger
    /// than a base page or part of a compact table.
    pub fn straddles(&self, boundary: GpuVa) -> bool {
        self.runs.iter().any(|r| {
            let unit = r.split_unit();
            if unit <= PAGE_SIZE_U64 || boundary % unit == 0 {
                return false;
            }
            let block = align_down(boundary, unit);
            block < r.end() && block + unit > r.va
        })
    }
}

/// Collect the leaf entries covering `[start, end)`.
pub fn build_leaves(arena: &PtArena, root: NodeId, start: GpuVa, end: GpuVa) -> LeafIndex {
    let mut index = LeafIndex::default();
    collect(arena, root, start, end, &mut index);
    index
}

fn collect(arena: &PtArena, id: NodeId, start: GpuVa, end: GpuVa, index: &mut LeafIndex) {
    let node = &arena[id];
    let entry_size = node.entry_size();
    let mut va = start;
    while va < end {
        let idx = node.index_of(va);
        let entry_start = align_down(va, entry_size);
        let next = end.min(entry_start + entry_size);
        if node.is_present(idx) {
            match node.child(idx) {
                Some(child) => collect(arena, child, va, next, index),
                None => match index.runs.last_mut() {
                    Some(run) if run.node == id && run.offset + run.count == idx => run.count += 1,
                    _ => index.runs.push(LeafRun {
                        node: id,
                        addr: node.addr,
                        domain: node.domain,
                        level: node.level,
                        compact: node.compact,
                        offset: idx,
                        count: 1,
                        va: entry_start,
                        entry_size,
                    }),
                },
            }
        }
        va = next;
    }
}

/// Clear the hardware entries of `index` without touching bookkeeping.
///
/// Entries that were removed or turned into directories since the index
/// was built are skipped.
pub fn zap_leaves(arena: &PtArena, index: &LeafIndex) -> Vec<StagedUpdate> {
    let mut updates: Vec<StagedUpdate> = Vec::new();
    for run in &index.runs {
        let Some(node) = arena.get(run.node) else {
            continue;
        };
        if node.addr != run.addr {
            continue;
        }
        for idx in run.offset..run.offset + run.count {
            if !node.is_present(idx) || node.child(idx).is_some() {
                continue;
            }
            match updates.last_mut() {
                Some(StagedUpdate {
                    node: last,
                    offset,
                    op: UpdateOp::Clear(n),
                    ..
                }) if *last == run.node && *offset + *n == idx => *n += 1,
                _ => updates.push(StagedUpdate {
                    node: run.node,
                    addr: node.addr,
                    domain: node.domain,
                    level: node.level,
                    offset: idx,
                    op: UpdateOp::Clear(1),
                    bookkeeping: false,
                }),
            }
        }
    }
    updates
}

/// Stage clearing the leaves under `[start, end)`. The tree shape is kept.
pub fn pt_zap(arena: &PtArena, root: NodeId, start: GpuVa, end: GpuVa) -> Vec<StagedUpdate> {
    let index = build_leaves(arena, root, start, end);
    log::trace!(
        "pt: zap [0x{:X}..0x{:X}): {} leaves",
        start,
        end,
        index.leaf_count()
    );
    zap_leaves(arena, &index)
}

/// Rewrite every node on the paths to `[start, end)` from bookkeeping.
///
/// Directory entries get their child pointer again and absent entries are
/// cleared, across the whole of each node visited. Present leaves are left
/// alone; their owners rebind them. Used after a write to the tree failed
/// and the hardware view may disagree with the arena.
pub fn pt_resync(arena: &PtArena, root: NodeId, start: GpuVa, end: GpuVa) -> Vec<StagedUpdate> {
    let mut updates = Vec::new();
    resync_node(arena, root, start, end, &mut updates);
    log::trace!("pt: resync [0x{:X}..0x{:X}): {} runs", start, end, updates.len());
    updates
}

fn resync_node(arena: &PtArena, id: NodeId, start: GpuVa, end: GpuVa, updates: &mut Vec<StagedUpdate>) {
    let node = &arena[id];
    let mut run: Option<StagedUpdate> = None;
    for idx in 0..node.entries() {
        let child = node.child(idx);
        if node.is_present(idx) && child.is_none() {
            updates.extend(run.take());
            continue;
        }
        let value = child.and_then(|c| arena.get(c)).map_or(0, |c| encode_pde(c.addr, arena.domain(), c.compact));
        let entry = StagedEntry {
            value,
            child: None,
            replaced: None,
        };
        match run.as_mut() {
            Some(StagedUpdate {
                op: UpdateOp::Write(entries),
                ..
            }) => entries.push(entry),
            _ => {
                run = Some(StagedUpdate {
                    node: id,
                    addr: node.addr,
                    domain: node.domain,
                    level: node.level,
                    offset: idx,
                    op: UpdateOp::Write(vec![entry]),
                    bookkeeping: false,
                })
            }
        }
    }
    updates.extend(run);

    let entry_size = node.entry_size();
    let mut va = start;
    while va < end {
        let next = end.min(align_down(va, entry_size) + entry_size);
        if let Some(child) = node.child(node.index_of(va)) {
            resync_node(arena, child, va, next, updates);
        }
        va = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt::test_util::{apply_cpu, setup, Tree};
    use crate::pt::{commit, stage_bind, BindSource, PtPolicy};
    use gpuvm_common::{SZ_1G, SZ_64K};
    use gpuvm_hw::walker::translate;
    use gpuvm_hw::{Fence, Placement, Storage};

    fn bind(t: &mut Tree, start: GpuVa, src: &Storage, policy: PtPolicy) {
        let staged = stage_bind(
            &mut t.arena,
            t.root,
            start,
            start + src.size(),
            BindSource {
                storage: src,
                writable: true,
            },
            policy,
        )
        .unwrap();
        apply_cpu(&t.arena, &staged);
        commit(&mut t.arena, staged, &Fence::signaled());
    }

    #[test]
    fn test_runs_merge_per_node() {
        let mut t = setup();
        let pages = t.mem.alloc_pages(MemoryDomain::System, 8, Placement::Scattered).unwrap();
        let src = Storage::new(MemoryDomain::System, pages);
        // Crosses a 2 MiB boundary: two level-0 nodes.
        let start = SZ_2M - 3 * PAGE_SIZE_U64;
        bind(
            &mut t,
            start,
            &src,
            PtPolicy {
                max_leaf_level: 0,
                compact_64k: false,
            },
        );

        let index = build_leaves(&t.arena, t.root, start, start + src.size());
        assert_eq!(index.runs.len(), 2);
        assert_eq!(index.runs[0].count, 3);
        assert_eq!(index.runs[0].offset, 509);
        assert_eq!(index.runs[1].count, 5);
        assert_eq!(index.runs[1].va, SZ_2M);
        assert_eq!(index.leaf_count(), 8);
        assert!(!index.straddles(SZ_2M + PAGE_SIZE_U64));
        assert_eq!(index.leaf_at(SZ_2M - 1).map(|r| r.offset), Some(509));
    }

    #[test]
    fn test_huge_leaves_straddle() {
        let mut t = setup();
        let pages = t
            .mem
            .alloc_pages(MemoryDomain::Vram, 1024, Placement::Contiguous { align: SZ_2M })
            .unwrap();
        let src = Storage::new(MemoryDomain::Vram, pages);
        bind(
            &mut t,
            SZ_1G,
            &src,
            PtPolicy {
                max_leaf_level: 2,
                compact_64k: true,
            },
        );

        let index = build_leaves(&t.arena, t.root, SZ_1G, SZ_1G + 2 * SZ_2M);
        assert_eq!(index.runs.len(), 1);
        assert_eq!(index.runs[0].entry_size, SZ_2M);
        assert!(index.straddles(SZ_1G + SZ_64K));
        assert!(!index.straddles(SZ_1G + SZ_2M));
        assert!(!index.straddles(SZ_1G + 4 * SZ_2M + PAGE_SIZE_U64));
    }

    #[test]
    fn test_zap_covers_only_leaves() {
        let mut t = setup();
        let pages = t.mem.alloc_pages(MemoryDomain::System, 4, Placement::Scattered).unwrap();
        let src = Storage::new(MemoryDomain::System, pages);
        bind(
            &mut t,
            0,
            &src,
            PtPolicy {
                max_leaf_level: 0,
                compact_64k: false,
            },
        );

        let zap = pt_zap(&t.arena, t.root, PAGE_SIZE_U64, 3 * PAGE_SIZE_U64);
        assert_eq!(zap.len(), 1);
        assert_eq!(zap[0].offset, 1);
        assert_eq!(zap[0].count(), 2);
        assert_eq!(zap[0].level, 0);
        assert!(!zap[0].bookkeeping);
    }

    #[test]
    fn test_resync_restores_directories() {
        let mut t = setup();
        let pages = t.mem.alloc_pages(MemoryDomain::System, 2, Placement::Scattered).unwrap();
        let src = Storage::new(MemoryDomain::System, pages);
        bind(
            &mut t,
            0,
            &src,
            PtPolicy {
                max_leaf_level: 0,
                compact_64k: false,
            },
        );
        let mem = t.mem.clone();
        let root_addr = t.root_addr();
        let leaf = build_leaves(&t.arena, t.root, 0, 2 * PAGE_SIZE_U64).runs[0].clone();

        // A lost link at the root and a stale entry in the leaf table.
        mem.write_u64(root_addr, 0).unwrap();
        mem.write_u64(leaf.addr + 100 * 8, 0xDEAD_0001).unwrap();
        assert!(translate(&mem, root_addr, 0).unwrap().is_none());

        let updates = pt_resync(&t.arena, t.root, 0, 2 * PAGE_SIZE_U64);
        assert!(updates.iter().all(|u| !u.bookkeeping));
        for u in &updates {
            mem.write_qwords(u.target(), &u.qwords()).unwrap();
        }
        let tr = translate(&mem, root_addr, PAGE_SIZE_U64).unwrap().unwrap();
        assert_eq!(tr.addr, src.pages()[1]);
        assert_eq!(mem.read_u64(leaf.addr + 100 * 8).unwrap(), 0);

        // Present leaves are not part of the rewrite.
        let runs: Vec<_> = updates.iter().filter(|u| u.node == leaf.node).collect();
        assert_eq!(runs.len(), 1);
        assert_eq!((runs[0].offset, runs[0].count()), (2, 510));
    }
}
