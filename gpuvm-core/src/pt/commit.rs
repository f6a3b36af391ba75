// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;

use gpuvm_hw::Fence;

use super::node::{NodeState, PtArena};
use super::{Staged, UpdateOp};

/// Apply the bookkeeping of a staged set whose writes have been issued.
///
/// Nodes that drop out of the tree are destroyed once `fence` completes,
/// which must be the fence of the writes that unlink them.
pub fn commit(arena: &mut PtArena, staged: Staged, fence: &Arc<Fence>) {
    let Staged { updates, private, .. } = staged;

    for update in updates.into_iter().filter(|u| u.bookkeeping) {
        match update.op {
            UpdateOp::Write(entries) => {
                for (i, entry) in entries.into_iter().enumerate() {
                    let idx = update.offset + i;
                    let node = &mut arena[update.node];
                    node.set_present(idx);
                    let old = node.take_child(idx);
                    node.set_child(idx, entry.child);
                    if let Some(old) = old.filter(|&old| Some(old) != entry.child) {
                        arena.destroy_subtree(old, fence);
                    }
                }
            }
            UpdateOp::Clear(count) => {
                for idx in update.offset..update.offset + count {
                    let node = &mut arena[update.node];
                    node.clear_present(idx);
                    if let Some(child) = node.take_child(idx) {
                        arena.destroy_subtree(child, fence);
                    }
                }
            }
        }
    }

    for id in private {
        let node = &mut arena[id];
        node.state = NodeState::Shared;
        node.shadow = None;
    }
}

/// Drop a staged set without applying it, freeing the nodes it allocated.
pub fn discard(arena: &mut PtArena, staged: Staged) {
    log::debug!("pt: discarding staged set, {} private nodes", staged.private.len());
    for &id in staged.private.iter().rev() {
        arena.release(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pt::test_util::{apply_cpu, setup};
    use crate::pt::{build_leaves, stage_bind, zap_leaves, BindSource, PtPolicy};
    use gpuvm_common::{MemoryDomain, PAGE_SIZE_U64};
    use gpuvm_hw::walker::translate;
    use gpuvm_hw::{Placement, Storage};

    const POLICY: PtPolicy = PtPolicy {
        max_leaf_level: 0,
        compact_64k: false,
    };

    #[test]
    fn test_discard_leaves_tree_untouched() {
        let mut t = setup();
        let used = t.mem.used_pages(MemoryDomain::System);
        let src = Storage::new(
            MemoryDomain::System,
            t.mem.alloc_pages(MemoryDomain::System, 2, Placement::Scattered).unwrap(),
        );
        let staged = stage_bind(
            &mut t.arena,
            t.root,
            0,
            2 * PAGE_SIZE_U64,
            BindSource {
                storage: &src,
                writable: true,
            },
            POLICY,
        )
        .unwrap();
        assert_eq!(staged.private_nodes().len(), 3);
        discard(&mut t.arena, staged);

        assert_eq!(t.arena.node_count(), 1);
        assert_eq!(t.arena[t.root].num_live, 0);
        assert_eq!(t.mem.used_pages(MemoryDomain::System), used + 2);
        assert!(translate(&t.mem, t.root_addr(), 0).unwrap().is_none());
    }

    #[test]
    fn test_zap_skips_bookkeeping() {
        let mut t = setup();
        let src = Storage::new(
            MemoryDomain::System,
            t.mem.alloc_pages(MemoryDomain::System, 4, Placement::Scattered).unwrap(),
        );
        let staged = stage_bind(
            &mut t.arena,
            t.root,
            0,
            4 * PAGE_SIZE_U64,
            BindSource {
                storage: &src,
                writable: false,
            },
            POLICY,
        )
        .unwrap();
        apply_cpu(&t.arena, &staged);
        commit(&mut t.arena, staged, &Fence::signaled());

        let index = build_leaves(&t.arena, t.root, 0, 4 * PAGE_SIZE_U64);
        let zap = Staged {
            updates: zap_leaves(&t.arena, &index),
            ..Staged::default()
        };
        apply_cpu(&t.arena, &zap);
        commit(&mut t.arena, zap, &Fence::signaled());

        // Hardware view is gone, the tree shape is not.
        assert!(translate(&t.mem, t.root_addr(), PAGE_SIZE_U64).unwrap().is_none());
        assert_eq!(t.arena.node_count(), 4);
        let leaf = index.runs[0].node;
        assert_eq!(t.arena[leaf].num_live, 4);
    }
}
