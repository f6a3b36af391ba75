// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Page-table tree management.
//!
//! The tree of one address space on one tile lives in a [`PtArena`]. Changes
//! are made in two phases:
//!
//! 1. **Stage**: [`stage_bind`] / [`stage_unbind`] walk the live tree. Nodes
//!    the walk allocates are *private*: nothing else can see them, so their
//!    entries go straight into a shadow copy and their bookkeeping is updated
//!    in place. Entries of preexisting *shared* nodes are collected into
//!    [`StagedUpdate`]s instead, and the live bookkeeping is left alone.
//! 2. **Commit**: once the writes of a [`Staged`] set have been issued (CPU or
//!    migration engine), [`commit`] applies the shared-node bookkeeping,
//!    splices private nodes in and hands reclaimed nodes to the fence that
//!    makes them unreachable. A failed walk is undone with [`discard`].

mod commit;
mod leaves;
mod node;
mod stage;

pub use commit::{commit, discard};
pub use leaves::{build_leaves, pt_resync, pt_zap, zap_leaves, LeafIndex, LeafRun};
pub use node::{NodeId, NodeState, PtArena, PtNode};
pub use stage::{stage_bind, stage_unbind, BindSource, PtPolicy};

use thiserror::Error;

use gpuvm_common::{DevAddr, MemoryDomain};
use gpuvm_hw::MemoryError;

/// Errors raised while staging page-table changes.
#[derive(Debug, Error)]
pub enum PtError {
    #[error("page-table node limit of {0} reached")]
    OutOfNodes(usize),

    #[error("page-table storage allocation failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("backing of 0x{have:X} bytes cannot map 0x{need:X} bytes")]
    ShortSource { need: u64, have: u64 },
}

pub type PtResult<T> = Result<T, PtError>;

/// One entry written into a shared node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedEntry {
    pub value: u64,
    /// Child node spliced in by this entry.
    pub child: Option<NodeId>,
    /// Child node this entry replaces.
    pub replaced: Option<NodeId>,
}

/// What a staged update does to its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOp {
    Write(Vec<StagedEntry>),
    Clear(usize),
}

/// A run of consecutive entries to change in a shared node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedUpdate {
    pub node: NodeId,
    /// Storage of the target node.
    pub addr: DevAddr,
    pub domain: MemoryDomain,
    pub level: u8,
    /// First entry index.
    pub offset: usize,
    pub op: UpdateOp,
    /// Whether commit updates presence, counts and children. Zaps do not.
    pub bookkeeping: bool,
}

impl StagedUpdate {
    /// Number of entries touched.
    pub fn count(&self) -> usize {
        match &self.op {
            UpdateOp::Write(entries) => entries.len(),
            UpdateOp::Clear(n) => *n,
        }
    }

    /// Device address of the first entry.
    pub fn target(&self) -> DevAddr {
        self.addr + (self.offset as u64) * 8
    }

    /// Values to store, in entry order.
    pub fn qwords(&self) -> Vec<u64> {
        match &self.op {
            UpdateOp::Write(entries) => entries.iter().map(|e| e.value).collect(),
            UpdateOp::Clear(n) => vec![0; *n],
        }
    }
}

/// Full contents of a private node, written before it is spliced in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeWrite {
    pub node: NodeId,
    pub addr: DevAddr,
    pub domain: MemoryDomain,
    pub entries: Vec<u64>,
}

/// Result of a staging walk.
#[derive(Debug, Default)]
pub struct Staged {
    pub updates: Vec<StagedUpdate>,
    pub populate: Vec<NodeWrite>,
    /// Nodes allocated by the walk.
    pub(crate) private: Vec<NodeId>,
}

impl Staged {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty() && self.populate.is_empty()
    }

    /// Nodes allocated by the walk.
    pub fn private_nodes(&self) -> &[NodeId] {
        &self.private
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use std::sync::Arc;

    use gpuvm_common::{DevAddr, MemoryDomain, SZ_2M};
    use gpuvm_hw::DeviceMemory;

    use super::{NodeId, PtArena, Staged};

    pub(crate) struct Tree {
        pub mem: Arc<DeviceMemory>,
        pub arena: PtArena,
        pub root: NodeId,
    }

    impl Tree {
        pub fn root_addr(&self) -> DevAddr {
            self.arena[self.root].addr
        }
    }

    /// An empty tree stored in system memory.
    pub(crate) fn setup() -> Tree {
        let mem = Arc::new(DeviceMemory::new(16 * SZ_2M, 16 * SZ_2M, true).unwrap());
        let mut arena = PtArena::new(mem.clone(), MemoryDomain::System, 256);
        let root = arena.alloc_root(3).unwrap();
        Tree { mem, arena, root }
    }

    /// Write a staged set with the CPU, private nodes first.
    pub(crate) fn apply_cpu(arena: &PtArena, staged: &Staged) {
        let mem = arena.memory();
        for write in &staged.populate {
            mem.write_qwords(write.addr, &write.entries).unwrap();
        }
        for update in &staged.updates {
            mem.write_qwords(update.target(), &update.qwords()).unwrap();
        }
    }
}
