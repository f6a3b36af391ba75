// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device-side collaborators of the address-space manager.
//!
//! Physical memory, the page-table entry format and walker, fences, command
//! batches with the copy engine that runs them, the job scheduler, buffer
//! objects and the host process MM. Everything here is consumed through narrow
//! interfaces; the simulated implementations make the core runnable on a host.

pub mod buffer;
pub mod command;
pub mod engine;
pub mod fence;
pub mod host_mm;
pub mod memory;
pub mod pte;
pub mod scheduler;
pub mod walker;

pub use buffer::{
    lock_all, Buffer, BufferBackend, BufferError, BufferMover, BufferResult, BufferState, MoveListener, SimBufferBackend,
};
pub use command::Batch;
pub use fence::{Fence, FenceError, FenceResult};
pub use host_mm::{HostMm, HostMmError, HostNotifier, HostProt, NotifierHandle};
pub use memory::{DeviceMemory, MemoryError, Placement, Storage};
pub use scheduler::{ExecContext, InjectedFault, Job, JobSubmitter, SimScheduler};
