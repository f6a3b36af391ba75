// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::ops::{Index, IndexMut};
use std::sync::Arc;

use gpuvm_common::{DevAddr, GpuVa, MemoryDomain};
use gpuvm_hw::memory::Placement;
use gpuvm_hw::pte::{entry_shift, COMPACT_ENTRIES, PT_ENTRIES};
use gpuvm_hw::{DeviceMemory, Fence};
use parking_lot::Mutex;

use super::{PtError, PtResult};

/// Handle of a node inside its [`PtArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Visibility of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Allocated by an in-flight walk and not reachable from the root.
    Private,
    /// Part of the live tree.
    Shared,
}

/// One page-table node.
#[derive(Debug)]
pub struct PtNode {
    pub level: u8,
    /// Level-0 node holding 64 KiB entries.
    pub compact: bool,
    pub state: NodeState,
    pub addr: DevAddr,
    pub domain: MemoryDomain,
    /// Number of present entries.
    pub num_live: u32,
    present: [u64; PT_ENTRIES / 64],
    children: Vec<Option<NodeId>>,
    /// Entry values of a private node, written out when it is populated.
    pub(crate) shadow: Option<Vec<u64>>,
}

impl PtNode {
    /// Number of usable entries.
    pub fn entries(&self) -> usize {
        if self.compact {
            COMPACT_ENTRIES
        } else {
            PT_ENTRIES
        }
    }

    /// Bytes covered by one entry.
    pub fn entry_size(&self) -> u64 {
        1u64 << entry_shift(self.level, self.compact)
    }

    /// Bytes covered by the whole node.
    pub fn span(&self) -> u64 {
        self.entry_size() * self.entries() as u64
    }

    /// Index of the entry covering `va`.
    pub fn index_of(&self, va: GpuVa) -> usize {
        ((va >> entry_shift(self.level, self.compact)) as usize) & (self.entries() - 1)
    }

    pub fn is_present(&self, idx: usize) -> bool {
        self.present[idx / 64] & (1 << (idx % 64)) != 0
    }

    /// Mark an entry present. Returns whether it was absent.
    pub(crate) fn set_present(&mut self, idx: usize) -> bool {
        let was = self.is_present(idx);
        if !was {
            self.present[idx / 64] |= 1 << (idx % 64);
            self.num_live += 1;
        }
        !was
    }

    /// Mark an entry absent. Returns whether it was present.
    pub(crate) fn clear_present(&mut self, idx: usize) -> bool {
        let was = self.is_present(idx);
        if was {
            self.present[idx / 64] &= !(1 << (idx % 64));
            self.num_live -= 1;
        }
        was
    }

    /// Present entries with index in `first..last`.
    pub fn count_present(&self, first: usize, last: usize) -> u32 {
        (first..last.min(self.entries()))
            .filter(|&i| self.is_present(i))
            .count() as u32
    }

    pub fn child(&self, idx: usize) -> Option<NodeId> {
        self.children.get(idx).copied().flatten()
    }

    pub(crate) fn set_child(&mut self, idx: usize, child: Option<NodeId>) {
        if let Some(slot) = self.children.get_mut(idx) {
            *slot = child;
        }
    }

    pub(crate) fn take_child(&mut self, idx: usize) -> Option<NodeId> {
        self.children.get_mut(idx).and_then(Option::take)
    }
}

/// Arena holding the page-table nodes of one tree.
pub struct PtArena {
    mem: Arc<DeviceMemory>,
    domain: MemoryDomain,
    limit: usize,
    nodes: Vec<Option<PtNode>>,
    free_slots: Vec<u32>,
    live: usize,
    /// Pages of nodes unlinked by a write that failed. The hardware may still
    /// reach them until the entries above are rewritten.
    quarantine: Arc<Mutex<Vec<DevAddr>>>,
}

impl PtArena {
    /// Arena storing nodes in `domain`, holding at most `limit` nodes.
    pub fn new(mem: Arc<DeviceMemory>, domain: MemoryDomain, limit: usize) -> Self {
        Self {
            mem,
            domain,
            limit,
            nodes: Vec::new(),
            free_slots: Vec::new(),
            live: 0,
            quarantine: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.mem
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    /// Live nodes, excluding nodes awaiting deferred destruction.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Allocate the shared, zeroed root node.
    pub fn alloc_root(&mut self, level: u8) -> PtResult<NodeId> {
        let id = self.alloc(level, false, NodeState::Shared)?;
        let addr = self[id].addr;
        if let Err(err) = self.mem.fill(addr, gpuvm_common::PAGE_SIZE, 0) {
            self.release(id);
            return Err(err.into());
        }
        Ok(id)
    }

    /// Allocate a node. Private nodes get a zeroed shadow.
    pub(crate) fn alloc(&mut self, level: u8, compact: bool, state: NodeState) -> PtResult<NodeId> {
        if self.live >= self.limit {
            log::warn!("pt: node limit {} reached", self.limit);
            return Err(PtError::OutOfNodes(self.limit));
        }
        let addr = self.mem.alloc_pages(
            self.domain,
            1,
            Placement::Contiguous {
                align: gpuvm_common::PAGE_SIZE_U64,
            },
        )?[0];

        let entries = if compact { COMPACT_ENTRIES } else { PT_ENTRIES };
        let node = PtNode {
            level,
            compact,
            state,
            addr,
            domain: self.domain,
            num_live: 0,
            present: [0; PT_ENTRIES / 64],
            children: if level > 0 { vec![None; entries] } else { Vec::new() },
            shadow: (state == NodeState::Private).then(|| vec![0; entries]),
        };

        let id = match self.free_slots.pop() {
            Some(slot) => {
                self.nodes[slot as usize] = Some(node);
                NodeId(slot)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId((self.nodes.len() - 1) as u32)
            }
        };
        self.live += 1;
        log::trace!("pt: alloc node {:?} level {} @ 0x{:X}", id, level, addr);
        Ok(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&PtNode> {
        self.nodes.get(id.index()).and_then(Option::as_ref)
    }

    /// Remove a node from the arena and return its storage page.
    fn remove(&mut self, id: NodeId) -> Option<DevAddr> {
        let node = self.nodes.get_mut(id.index())?.take()?;
        self.free_slots.push(id.0);
        self.live -= 1;
        Some(node.addr)
    }

    /// Remove a node and free its storage right away.
    pub(crate) fn release(&mut self, id: NodeId) {
        if let Some(addr) = self.remove(id) {
            self.mem.free_pages(&[addr]);
        }
    }

    /// Remove `id` and everything below it. Storage is freed once `fence`
    /// completes, since the hardware may still walk the old nodes until then.
    pub(crate) fn destroy_subtree(&mut self, id: NodeId, fence: &Arc<Fence>) {
        let mut pages = Vec::new();
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.get(cur) {
                stack.extend(node.children.iter().flatten().copied());
            }
            if let Some(addr) = self.remove(cur) {
                pages.push(addr);
            }
        }
        log::trace!("pt: destroying {} nodes under {:?}", pages.len(), id);
        self.free_after(pages, fence);
    }

    /// Free `pages` once `fence` signals. If it fails they are quarantined.
    fn free_after(&self, pages: Vec<DevAddr>, fence: &Arc<Fence>) {
        let mem = self.mem.clone();
        let quarantine = self.quarantine.clone();
        fence.on_complete(move |result| match result {
            Ok(()) => mem.free_pages(&pages),
            Err(err) => {
                log::warn!("pt: holding {} node pages after failed write: {}", pages.len(), err);
                quarantine.lock().extend(pages);
            }
        });
    }

    /// Pages held back by failed writes.
    pub fn quarantined_pages(&self) -> usize {
        self.quarantine.lock().len()
    }

    /// Free the quarantined pages once `fence`, the write that unlinks them
    /// again, signals.
    pub(crate) fn release_quarantined(&self, fence: &Arc<Fence>) {
        let pages = std::mem::take(&mut *self.quarantine.lock());
        if !pages.is_empty() {
            self.free_after(pages, fence);
        }
    }

    /// Storage pages of every node, for teardown.
    pub(crate) fn drain_pages(&mut self) -> Vec<DevAddr> {
        let mut pages: Vec<DevAddr> = self.nodes.iter().flatten().map(|n| n.addr).collect();
        pages.append(&mut *self.quarantine.lock());
        self.nodes.clear();
        self.free_slots.clear();
        self.live = 0;
        pages
    }
}

impl Index<NodeId> for PtArena {
    type Output = PtNode;

    fn index(&self, id: NodeId) -> &PtNode {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale page-table node handle {:?}", id),
        }
    }
}

impl IndexMut<NodeId> for PtArena {
    fn index_mut(&mut self, id: NodeId) -> &mut PtNode {
        match self.nodes.get_mut(id.index()).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("stale page-table node handle {:?}", id),
        }
    }
}

impl Drop for PtArena {
    fn drop(&mut self) {
        let pages = self.drain_pages();
        self.mem.free_pages(&pages);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuvm_common::{SZ_2M, SZ_64K};
    use gpuvm_hw::FenceError;

    fn arena(limit: usize) -> PtArena {
        let mem = Arc::new(DeviceMemory::new(4 * SZ_2M, 4 * SZ_2M, true).unwrap());
        PtArena::new(mem, MemoryDomain::System, limit)
    }

    #[test]
    fn test_alloc_and_limit() {
        let mut a = arena(2);
        let root = a.alloc_root(3).unwrap();
        let child = a.alloc(2, false, NodeState::Private).unwrap();
        assert_eq!(a.node_count(), 2);
        assert!(a[child].shadow.is_some());
        assert!(a[root].shadow.is_none());
        assert!(matches!(
            a.alloc(1, false, NodeState::Private),
            Err(PtError::OutOfNodes(2))
        ));
        a.release(child);
        assert_eq!(a.node_count(), 1);
        // Freed slots are reused.
        let again = a.alloc(1, false, NodeState::Private).unwrap();
        assert_eq!(again, child);
    }

    #[test]
    fn test_presence_counts() {
        let mut a = arena(8);
        let id = a.alloc(0, false, NodeState::Private).unwrap();
        let node = &mut a[id];
        assert!(node.set_present(3));
        assert!(!node.set_present(3));
        assert!(node.set_present(200));
        assert_eq!(node.num_live, 2);
        assert_eq!(node.count_present(0, 100), 1);
        assert!(node.clear_present(3));
        assert_eq!(node.num_live, 1);
    }

    #[test]
    fn test_compact_geometry() {
        let mut a = arena(8);
        let id = a.alloc(0, true, NodeState::Private).unwrap();
        assert_eq!(a[id].entries(), 32);
        assert_eq!(a[id].entry_size(), SZ_64K);
        assert_eq!(a[id].span(), SZ_2M);
        assert_eq!(a[id].index_of(SZ_2M + 3 * SZ_64K + 5), 3);
    }

    #[test]
    fn test_destroy_subtree_defers_free() {
        let mut a = arena(8);
        let mem = a.memory().clone();
        let parent = a.alloc(1, false, NodeState::Shared).unwrap();
        let child = a.alloc(0, false, NodeState::Shared).unwrap();
        a[parent].set_child(5, Some(child));
        let used = mem.used_pages(MemoryDomain::System);

        let fence = Fence::new();
        a.destroy_subtree(parent, &fence);
        assert_eq!(a.node_count(), 0);
        assert_eq!(mem.used_pages(MemoryDomain::System), used);
        fence.signal();
        assert_eq!(mem.used_pages(MemoryDomain::System), used - 2);
    }

    #[test]
    fn test_failed_unlink_quarantines_pages() {
        let mut a = arena(8);
        let mem = a.memory().clone();
        let node = a.alloc(0, false, NodeState::Shared).unwrap();
        let used = mem.used_pages(MemoryDomain::System);

        a.destroy_subtree(node, &Fence::failed(FenceError::Timeout));
        assert_eq!(a.quarantined_pages(), 1);
        assert_eq!(mem.used_pages(MemoryDomain::System), used);

        let rewrite = Fence::new();
        a.release_quarantined(&rewrite);
        assert_eq!(a.quarantined_pages(), 0);
        rewrite.signal();
        assert_eq!(mem.used_pages(MemoryDomain::System), used - 1);
    }
}
