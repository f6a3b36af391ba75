// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Per-space queue of bind operations run in submission order.
//!
//! The first failure halts the queue: the operation's fence fails, the error
//! record is written to the capture address if one was given, and every
//! operation still queued is cancelled until the queue is restarted.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;

use gpuvm_common::{GpuVa, HostVa, MemoryDomain};
use gpuvm_hw::{Fence, FenceError, HostMm};

use super::{BindFlags, BindRequest, Vm};
use crate::{VmError, VmResult};

/// Size of the error-capture record.
pub const CAPTURE_RECORD_SIZE: usize = 24;

/// An operation for the async queue.
pub enum AsyncOp {
    Bind(BindRequest),
    Unbind {
        start: GpuVa,
        len: u64,
        syncs: Vec<Arc<Fence>>,
    },
    Prefetch {
        start: GpuVa,
        len: u64,
        domain: MemoryDomain,
    },
}

impl AsyncOp {
    /// Operation code of the error-capture record.
    fn code(&self) -> u32 {
        match self {
            AsyncOp::Bind(_) => 1,
            AsyncOp::Unbind { .. } => 2,
            AsyncOp::Prefetch { .. } => 3,
        }
    }

    fn range(&self) -> (GpuVa, u64) {
        match self {
            AsyncOp::Bind(req) => (req.start, req.len),
            AsyncOp::Unbind { start, len, .. } | AsyncOp::Prefetch { start, len, .. } => (*start, *len),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            AsyncOp::Bind(_) => "bind",
            AsyncOp::Unbind { .. } => "unbind",
            AsyncOp::Prefetch { .. } => "prefetch",
        }
    }
}

/// Host location receiving the record of a failed async operation.
///
/// The record is four little-endian fields: error code (u32), operation
/// (u32: 1 bind, 2 unbind, 3 prefetch), start address (u64), length (u64).
#[derive(Clone)]
pub struct ErrorCapture {
    pub host: Arc<HostMm>,
    pub addr: HostVa,
}

impl ErrorCapture {
    fn write(&self, err: &VmError, op: u32, addr: GpuVa, range: u64) {
        let mut record = [0u8; CAPTURE_RECORD_SIZE];
        let mut cur = Cursor::new(&mut record[..]);
        let _ = cur.write_u32::<LittleEndian>(err.code().raw());
        let _ = cur.write_u32::<LittleEndian>(op);
        let _ = cur.write_u64::<LittleEndian>(addr);
        let _ = cur.write_u64::<LittleEndian>(range);
        if let Err(err) = self.host.write(self.addr, &record) {
            log::warn!("vm: error capture at 0x{:X} failed: {}", self.addr, err);
        }
    }
}

struct Queued {
    op: AsyncOp,
    capture: Option<ErrorCapture>,
    done: Arc<Fence>,
}

pub(super) struct AsyncQueue {
    depth: usize,
    sender: Mutex<Option<SyncSender<Queued>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    halted: AtomicBool,
}

impl AsyncQueue {
    pub(super) fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            sender: Mutex::new(None),
            worker: Mutex::new(None),
            halted: AtomicBool::new(false),
        }
    }

    pub(super) fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Sender of the queue, starting the worker on first use.
    fn sender(&self, vm: &Weak<Vm>, id: u64) -> VmResult<SyncSender<Queued>> {
        let mut sender = self.sender.lock();
        if let Some(tx) = sender.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::sync_channel(self.depth);
        let vm = vm.clone();
        let handle = thread::Builder::new()
            .name(format!("vm{}-async", id))
            .spawn(move || run(vm, rx))
            .map_err(|err| {
                log::error!("vm[{}]: failed to spawn async worker: {}", id, err);
                VmError::Closed
            })?;
        *self.worker.lock() = Some(handle);
        *sender = Some(tx.clone());
        Ok(tx)
    }

    /// Close the queue and wait for the worker, unless called from it.
    pub(super) fn stop(&self) {
        self.sender.lock().take();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        if handle.join().is_err() {
            log::error!("vm: async worker panicked");
        }
    }
}

fn run(vm: Weak<Vm>, rx: Receiver<Queued>) {
    for item in rx {
        match vm.upgrade() {
            Some(vm) => vm.run_async(item),
            None => {
                item.done.fail(FenceError::Cancelled);
            }
        }
    }
}

impl Vm {
    /// Queue `op`. The returned fence completes once it ran.
    pub fn submit_async(&self, op: AsyncOp, capture: Option<ErrorCapture>) -> VmResult<Arc<Fence>> {
        self.check_usable()?;
        if self.queue.is_halted() {
            return Err(VmError::AsyncHalted);
        }
        let tx = self.queue.sender(&self.this, self.id)?;
        let done = Fence::new();
        log::trace!("vm[{}]: queued async {}", self.id, op.name());
        tx.send(Queued {
            op,
            capture,
            done: done.clone(),
        })
        .map_err(|_| VmError::Closed)?;
        Ok(done)
    }

    /// Accept async operations again after a failure.
    pub fn restart_async(&self) {
        if self.queue.halted.swap(false, Ordering::AcqRel) {
            log::info!("vm[{}]: async queue restarted", self.id);
        }
    }

    pub fn is_async_halted(&self) -> bool {
        self.queue.is_halted()
    }

    fn run_async(&self, item: Queued) {
        let Queued { op, capture, done } = item;
        if self.is_banned() {
            done.fail(FenceError::Banned);
            return;
        }
        if self.queue.is_halted() {
            done.fail(FenceError::Cancelled);
            return;
        }

        let code = op.code();
        let name = op.name();
        let (start, len) = op.range();
        let result = match op {
            AsyncOp::Bind(mut req) => {
                req.flags.remove(BindFlags::ASYNC);
                self.bind_now(req)
            }
            AsyncOp::Unbind { start, len, syncs } => self.unbind(start, len, syncs),
            AsyncOp::Prefetch { start, len, domain } => self.prefetch(start, len, domain),
        }
        .and_then(|fence| fence.wait(self.wait_timeout()).map_err(VmError::from));

        match result {
            Ok(()) => {
                done.signal();
            }
            Err(err) => {
                self.queue.halted.store(true, Ordering::Release);
                log::error!(
                    "vm[{}]: async {} of [0x{:X}+0x{:X}) failed, queue halted: {}",
                    self.id,
                    name,
                    start,
                    len,
                    err
                );
                if let Some(capture) = capture {
                    capture.write(&err, code, start, len);
                }
                done.fail(err.to_fence_error());
            }
        }
    }
}
