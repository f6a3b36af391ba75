// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Preemption of long-running contexts around page-table rebinds.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

use gpuvm_hw::Fence;

use super::{Vm, VmMode};
use crate::{VmError, VmResult};

/// A long-running submission context bound to a preempt-mode space.
///
/// It carries one preempt fence at a time. Arming the fence asks the context
/// to suspend; the fence signals once it has.
pub struct ComputeContext {
    name: String,
    suspended: AtomicBool,
    preemptions: AtomicU64,
    fence: Mutex<Arc<Fence>>,
}

impl ComputeContext {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            suspended: AtomicBool::new(false),
            preemptions: AtomicU64::new(0),
            fence: Mutex::new(Fence::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Times the context was preempted.
    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    /// The fence currently installed.
    pub fn preempt_fence(&self) -> Arc<Fence> {
        self.fence.lock().clone()
    }

    /// Enable signaling on the installed fence. The context suspends on its
    /// own thread and then signals.
    fn arm(self: &Arc<Self>) -> Arc<Fence> {
        let fence = self.preempt_fence();
        let ctx = self.clone();
        let signal = fence.clone();
        let spawned = thread::Builder::new()
            .name(format!("preempt-{}", self.name))
            .spawn(move || ctx.suspend(&signal));
        if let Err(err) = spawned {
            log::warn!("vm: preempting '{}' inline: {}", self.name, err);
            self.suspend(&fence);
        }
        fence
    }

    fn suspend(&self, fence: &Fence) {
        if !self.suspended.swap(true, Ordering::AcqRel) {
            self.preemptions.fetch_add(1, Ordering::Relaxed);
        }
        fence.signal();
    }

    /// Install a fresh fence and let the context run again.
    fn resume(&self) {
        *self.fence.lock() = Fence::new();
        self.suspended.store(false, Ordering::Release);
    }
}

impl Vm {
    fn check_preempt_mode(&self) -> VmResult<()> {
        if self.mode != VmMode::Preempt {
            return Err(VmError::WrongMode);
        }
        Ok(())
    }

    pub fn register_context(&self, ctx: Arc<ComputeContext>) -> VmResult<()> {
        self.check_preempt_mode()?;
        self.check_usable()?;
        log::debug!("vm[{}]: registered context '{}'", self.id, ctx.name());
        self.contexts.lock().push(ctx);
        Ok(())
    }

    pub fn unregister_context(&self, ctx: &Arc<ComputeContext>) -> VmResult<()> {
        self.check_preempt_mode()?;
        self.contexts.lock().retain(|c| !Arc::ptr_eq(c, ctx));
        Ok(())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.lock().len()
    }

    /// Suspend every registered context, rebind, then resume them.
    ///
    /// The registration lock is held for the whole sequence. The tree lock
    /// is only taken once every context has stopped.
    pub fn preempt_rebind(&self) -> VmResult<Arc<Fence>> {
        self.check_preempt_mode()?;
        self.check_usable()?;
        let timeout = self.wait_timeout();
        let contexts = self.contexts.lock();

        let armed: Vec<Arc<Fence>> = contexts.iter().map(|c| c.arm()).collect();
        log::debug!("vm[{}]: preempting {} context(s)", self.id, armed.len());
        let result = Fence::all(armed)
            .wait(timeout)
            .map_err(VmError::from)
            .and_then(|()| {
                let mut st = self.state.write();
                self.rebind_locked(&mut st)
            })
            .and_then(|fence| {
                fence.wait(timeout)?;
                Ok(fence)
            });

        for ctx in contexts.iter() {
            ctx.resume();
        }
        if let Err(err) = &result {
            log::warn!("vm[{}]: preempt rebind failed: {}", self.id, err);
        }
        result
    }
}
