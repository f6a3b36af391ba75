// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Job submission.
//!
//! [`JobSubmitter`] is the submission backend consumed by the migration
//! engine: build a job for an execution context, submit it, get a fence.
//! [`SimScheduler`] runs one worker thread per context, waits for each job's
//! dependencies in order and executes the batch on a [`CopyEngine`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use gpuvm_common::DevAddr;

use crate::command::Batch;
use crate::engine::CopyEngine;
use crate::fence::{Fence, FenceError};
use crate::memory::DeviceMemory;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A hardware execution context: a queue bound to one address space.
#[derive(Debug)]
pub struct ExecContext {
    id: u64,
    name: String,
    root: DevAddr,
    banned: AtomicBool,
}

impl ExecContext {
    pub fn new(name: impl Into<String>, root: DevAddr) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            root,
            banned: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root of the translation tree jobs on this context execute in.
    pub fn root(&self) -> DevAddr {
        self.root
    }

    pub fn is_banned(&self) -> bool {
        self.banned.load(Ordering::Acquire)
    }

    /// Ban the context. Pending and future jobs fail.
    pub fn ban(&self) {
        if !self.banned.swap(true, Ordering::AcqRel) {
            log::error!("sched: context '{}' banned", self.name);
        }
    }
}

/// A batch ready for submission.
pub struct Job {
    ctx: Arc<ExecContext>,
    batch: Batch,
    deps: Vec<Arc<Fence>>,
}

impl Job {
    pub fn ctx(&self) -> &Arc<ExecContext> {
        &self.ctx
    }

    pub fn batch(&self) -> &Batch {
        &self.batch
    }

    /// Add a fence that must complete before the job runs.
    pub fn add_dep(&mut self, fence: Arc<Fence>) {
        if !fence.is_signaled() {
            self.deps.push(fence);
        }
    }

    pub fn add_deps(&mut self, fences: impl IntoIterator<Item = Arc<Fence>>) {
        for fence in fences {
            self.add_dep(fence);
        }
    }
}

/// Command-submission backend.
pub trait JobSubmitter: Send + Sync {
    fn create_job(&self, ctx: &Arc<ExecContext>, batch: Batch) -> Job {
        Job {
            ctx: ctx.clone(),
            batch,
            deps: Vec::new(),
        }
    }

    /// Submit `job`. Never blocks; the result arrives through the fence.
    fn submit(&self, job: Job) -> Arc<Fence>;
}

/// Fault injected into the next submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// The submission itself is rejected.
    FailNext,
    /// The job never completes; the watchdog bans its context.
    HangNext,
}

struct Work {
    job: Job,
    fence: Arc<Fence>,
    hang: bool,
}

/// Simulated scheduler executing jobs on worker threads.
pub struct SimScheduler {
    mem: Arc<DeviceMemory>,
    timeout: Duration,
    queues: Mutex<HashMap<u64, Sender<Work>>>,
    inject: Mutex<Option<InjectedFault>>,
    submitted: AtomicU64,
}

impl SimScheduler {
    pub fn new(mem: Arc<DeviceMemory>, timeout: Duration) -> Self {
        Self {
            mem,
            timeout,
            queues: Mutex::new(HashMap::new()),
            inject: Mutex::new(None),
            submitted: AtomicU64::new(0),
        }
    }

    /// Arm a fault for the next submission.
    pub fn inject(&self, fault: InjectedFault) {
        *self.inject.lock() = Some(fault);
    }

    /// Jobs accepted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    fn spawn_worker(&self, ctx: &ExecContext) -> Sender<Work> {
        let (tx, rx) = mpsc::channel::<Work>();
        let mut engine = CopyEngine::new(self.mem.clone());
        let timeout = self.timeout;
        let name = format!("sched-{}", ctx.name());
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            for work in rx {
                run_job(&mut engine, timeout, work);
            }
            log::trace!("sched: worker {} exiting", name);
        });
        if let Err(err) = spawned {
            log::error!("sched: failed to spawn worker: {}", err);
        }
        tx
    }
}

fn run_job(engine: &mut CopyEngine, timeout: Duration, work: Work) {
    let Work { job, fence, hang } = work;
    let ctx = job.ctx;

    if !job.deps.is_empty() {
        let deps = Fence::all(job.deps);
        if let Err(err) = deps.wait(timeout) {
            log::debug!("sched: job {} dependency failed: {}", fence.seqno(), err);
            fence.fail(err);
            return;
        }
    }
    if ctx.is_banned() {
        fence.fail(FenceError::Banned);
        return;
    }
    if hang {
        log::error!(
            "sched: job {} on '{}' timed out after {:?}",
            fence.seqno(),
            ctx.name(),
            timeout
        );
        ctx.ban();
        fence.fail(FenceError::Timeout);
        return;
    }

    match engine.execute(ctx.root(), &job.batch) {
        Ok(()) => {
            fence.signal();
        }
        Err(err) => {
            log::warn!("sched: job {} on '{}' failed: {}", fence.seqno(), ctx.name(), err);
            fence.fail(err.into());
        }
    }
}

impl JobSubmitter for SimScheduler {
    fn submit(&self, job: Job) -> Arc<Fence> {
        if job.ctx.is_banned() {
            return Fence::failed(FenceError::Banned);
        }
        let fault = self.inject.lock().take();
        if fault == Some(InjectedFault::FailNext) {
            log::warn!("sched: rejecting job on '{}'", job.ctx.name());
            return Fence::failed(FenceError::Submission("injected failure".into()));
        }

        let fence = Fence::new();
        let ctx_id = job.ctx.id();
        let mut queues = self.queues.lock();
        let tx = match queues.get(&ctx_id) {
            Some(tx) => tx.clone(),
            None => {
                let tx = self.spawn_worker(&job.ctx);
                queues.insert(ctx_id, tx.clone());
                tx
            }
        };
        drop(queues);

        log::trace!(
            "sched: submit job {} on '{}' ({} dwords, {} deps)",
            fence.seqno(),
            job.ctx.name(),
            job.batch.dwords().len(),
            job.deps.len()
        );
        self.submitted.fetch_add(1, Ordering::Relaxed);
        let work = Work {
            job,
            fence: fence.clone(),
            hang: fault == Some(InjectedFault::HangNext),
        };
        if let Err(mpsc::SendError(work)) = tx.send(work) {
            work.fence.fail(FenceError::Submission("worker is gone".into()));
        }
        fence
    }
}
