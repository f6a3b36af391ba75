// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Buffer objects and the residency backend.
//!
//! A buffer owns backing [`Storage`] in one memory domain. Its reservation
//! lock guards the storage and the list of mappings bound to it. Moving a
//! buffer between domains goes through the installed [`BufferMover`], and every
//! bound mapping is told about the move through its [`MoveListener`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

use gpuvm_common::{pages_for, DevAddr, MemoryDomain};

use crate::fence::{Fence, FenceError};
use crate::memory::{DeviceMemory, MemoryError, Placement, Storage};

/// Errors returned by buffer operations.
#[derive(Debug, Error)]
pub enum BufferError {
    #[error("buffer size must be non-zero")]
    ZeroSize,

    #[error("offset 0x{offset:X} is outside buffer {id} (size 0x{size:X})")]
    OutOfBounds { id: u64, offset: u64, size: u64 },

    #[error("buffer move failed: {0}")]
    Move(#[from] FenceError),

    #[error("no buffer mover installed")]
    NoMover,

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub type BufferResult<T> = Result<T, BufferError>;

/// Receives notice that a bound buffer moved.
///
/// Called with the buffer's reservation held. Implementations must only
/// record the event.
pub trait MoveListener: Send + Sync {
    fn buffer_moved(&self, mapping: u64);
}

/// Copies or clears buffer storage on behalf of the backend.
pub trait BufferMover: Send + Sync {
    fn copy(&self, buffer: u64, src: &Storage, dst: &Storage) -> BufferResult<Arc<Fence>>;
    fn clear(&self, buffer: u64, dst: &Storage, value: u8) -> BufferResult<Arc<Fence>>;
}

struct Binding {
    listener: Weak<dyn MoveListener>,
    mapping: u64,
}

/// State guarded by a buffer's reservation lock.
pub struct BufferState {
    storage: Storage,
    bindings: Vec<Binding>,
    /// Domain the buffer is validated into when bound.
    preferred: MemoryDomain,
    /// Completion of the last move or clear.
    idle: Arc<Fence>,
}

impl BufferState {
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Fence that completes once the current contents are in place.
    pub fn idle_fence(&self) -> Arc<Fence> {
        self.idle.clone()
    }

    pub fn preferred(&self) -> MemoryDomain {
        self.preferred
    }

    pub fn set_preferred(&mut self, domain: MemoryDomain) {
        self.preferred = domain;
    }

    pub fn add_binding(&mut self, listener: Weak<dyn MoveListener>, mapping: u64) {
        self.bindings.push(Binding { listener, mapping });
    }

    pub fn remove_binding(&mut self, mapping: u64) {
        self.bindings.retain(|b| b.mapping != mapping);
    }

    pub fn binding_count(&self) -> usize {
        self.bindings.len()
    }

    fn notify_moved(&mut self) {
        self.bindings.retain(|b| match b.listener.upgrade() {
            Some(listener) => {
                listener.buffer_moved(b.mapping);
                true
            }
            None => false,
        });
    }
}

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(1);

/// A buffer object.
pub struct Buffer {
    id: u64,
    size: u64,
    placement: Placement,
    mem: Arc<DeviceMemory>,
    resv: Mutex<BufferState>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

impl Buffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Take the reservation lock.
    pub fn lock(&self) -> MutexGuard<'_, BufferState> {
        self.resv.lock()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        let state = self.resv.get_mut();
        let pages = state.storage.pages().to_vec();
        let mem = self.mem.clone();
        state.idle.on_complete(move |_| mem.free_pages(&pages));
    }
}

/// Lock several buffers in ascending id order. Duplicates are locked once.
pub fn lock_all<'a>(buffers: &[&'a Buffer]) -> Vec<MutexGuard<'a, BufferState>> {
    let mut sorted: Vec<&'a Buffer> = buffers.to_vec();
    sorted.sort_by_key(|b| b.id);
    sorted.dedup_by_key(|b| b.id);
    sorted.into_iter().map(|b| b.resv.lock()).collect()
}

/// Buffer/residency backend consumed by the address-space manager.
pub trait BufferBackend: Send + Sync {
    fn create(&self, size: u64, domain: MemoryDomain) -> BufferResult<Arc<Buffer>>;

    /// Make the buffer resident in `domain`, moving it if needed. Returns the
    /// move fence when a move was started. The caller holds the reservation.
    fn validate(
        &self,
        buffer: &Buffer,
        state: &mut BufferState,
        domain: MemoryDomain,
    ) -> BufferResult<Option<Arc<Fence>>>;

    /// Device address of byte `offset`.
    fn address(&self, buffer: &Buffer, state: &BufferState, offset: u64) -> BufferResult<DevAddr> {
        state.storage.addr(offset).ok_or(BufferError::OutOfBounds {
            id: buffer.id,
            offset,
            size: buffer.size,
        })
    }

    fn is_resident_in(&self, state: &BufferState, domain: MemoryDomain) -> bool {
        state.storage.domain() == domain
    }
}

/// Simulated backend allocating from [`DeviceMemory`].
pub struct SimBufferBackend {
    mem: Arc<DeviceMemory>,
    placement: Placement,
    mover: RwLock<Option<Arc<dyn BufferMover>>>,
}

impl SimBufferBackend {
    pub fn new(mem: Arc<DeviceMemory>) -> Self {
        Self {
            mem,
            placement: Placement::Contiguous { align: gpuvm_common::SZ_2M },
            mover: RwLock::new(None),
        }
    }

    /// Backend that scatters every buffer's pages.
    pub fn scattered(mem: Arc<DeviceMemory>) -> Self {
        Self {
            placement: Placement::Scattered,
            ..Self::new(mem)
        }
    }

    pub fn set_mover(&self, mover: Arc<dyn BufferMover>) {
        *self.mover.write() = Some(mover);
    }

    fn mover(&self) -> BufferResult<Arc<dyn BufferMover>> {
        self.mover.read().clone().ok_or(BufferError::NoMover)
    }

    fn alloc(&self, size: u64, domain: MemoryDomain, placement: Placement) -> BufferResult<Storage> {
        let pages = match placement {
            Placement::Contiguous { .. } => {
                // Large buffers get 2 MiB alignment; fall back to page alignment.
                self.mem
                    .alloc_pages(domain, pages_for(size), placement)
                    .or_else(|_| {
                        self.mem.alloc_pages(
                            domain,
                            pages_for(size),
                            Placement::Contiguous {
                                align: gpuvm_common::PAGE_SIZE_U64,
                            },
                        )
                    })?
            }
            Placement::Scattered => self.mem.alloc_pages(domain, pages_for(size), placement)?,
        };
        Ok(Storage::new(domain, pages))
    }

    /// Create a buffer with an explicit page placement.
    pub fn create_with(
        &self,
        size: u64,
        domain: MemoryDomain,
        placement: Placement,
    ) -> BufferResult<Arc<Buffer>> {
        if size == 0 {
            return Err(BufferError::ZeroSize);
        }
        let id = NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed);
        let storage = self.alloc(size, domain, placement)?;
        let idle = match self.mover.read().clone() {
            Some(mover) => mover.clear(id, &storage, 0)?,
            None => {
                for &page in storage.pages() {
                    self.mem.fill(page, gpuvm_common::PAGE_SIZE, 0)?;
                }
                Fence::signaled()
            }
        };
        let buffer = Arc::new(Buffer {
            id,
            size,
            placement,
            mem: self.mem.clone(),
            resv: Mutex::new(BufferState {
                storage,
                bindings: Vec::new(),
                preferred: domain,
                idle,
            }),
        });
        log::debug!(
            "buffer: created {} ({} KiB, {}, {:?})",
            buffer.id,
            size >> 10,
            domain,
            placement
        );
        Ok(buffer)
    }

    /// Move `buffer` to `domain` as memory pressure would.
    pub fn evict(&self, buffer: &Buffer, domain: MemoryDomain) -> BufferResult<Option<Arc<Fence>>> {
        let mut state = buffer.lock();
        self.validate(buffer, &mut state, domain)
    }
}

impl BufferBackend for SimBufferBackend {
    fn create(&self, size: u64, domain: MemoryDomain) -> BufferResult<Arc<Buffer>> {
        self.create_with(size, domain, self.placement)
    }

    fn validate(
        &self,
        buffer: &Buffer,
        state: &mut BufferState,
        domain: MemoryDomain,
    ) -> BufferResult<Option<Arc<Fence>>> {
        if self.is_resident_in(state, domain) {
            return Ok(None);
        }
        let mover = self.mover()?;
        let new = self.alloc(buffer.size, domain, buffer.placement)?;
        let fence = match mover.copy(buffer.id, &state.storage, &new) {
            Ok(fence) => fence,
            Err(err) => {
                self.mem.free_pages(new.pages());
                return Err(err);
            }
        };

        log::debug!(
            "buffer: moving {} {} -> {}",
            buffer.id,
            state.storage.domain(),
            domain
        );
        state.notify_moved();
        let old = std::mem::replace(&mut state.storage, new);
        let mem = self.mem.clone();
        fence.on_complete(move |_| mem.free_pages(old.pages()));
        state.idle = fence.clone();
        Ok(Some(fence))
    }
}
