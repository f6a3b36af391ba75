// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Pinned host regions backing user-pointer mappings.
//!
//! A [`PinnedRegion`] pins the host pages of a virtual range and remembers the
//! notifier sequence it pinned at. Whenever the host invalidates any part of
//! the range the sequence moves and the region reports itself stale until it
//! is pinned again.

use std::sync::Arc;

use thiserror::Error;

use gpuvm_common::{pages_for, HostVa, MemoryDomain, PAGE_SIZE_U64};
use gpuvm_hw::{HostMm, HostMmError, HostNotifier, NotifierHandle, Storage};

#[derive(Debug, Error)]
pub enum PinError {
    #[error(transparent)]
    HostMm(#[from] HostMmError),

    #[error("host range kept changing, gave up after {0} attempts")]
    RetryExhausted(u32),
}

pub type PinResult<T> = Result<T, PinError>;

/// Whether a pinned snapshot still matches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinStatus {
    Current,
    Stale,
}

struct Snapshot {
    seq: u64,
    /// One system-memory frame per page of the range.
    storage: Storage,
}

/// Host pages of one user-pointer mapping.
pub struct PinnedRegion {
    host: Arc<HostMm>,
    start: HostVa,
    len: u64,
    writable: bool,
    handle: NotifierHandle,
    /// Kept alive for the interval registration, which only holds a weak ref.
    _notifier: Arc<dyn HostNotifier>,
    pinned: Option<Snapshot>,
    walks: u64,
    released: bool,
}

impl std::fmt::Debug for PinnedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinnedRegion")
            .field("start", &format_args!("0x{:X}", self.start))
            .field("len", &self.len)
            .field("writable", &self.writable)
            .field("pinned", &self.pinned.is_some())
            .finish()
    }
}

impl PinnedRegion {
    /// Track `[start, start + len)`. Nothing is pinned until [`pin`](Self::pin).
    pub fn new(
        host: Arc<HostMm>,
        start: HostVa,
        len: u64,
        writable: bool,
        notifier: Arc<dyn HostNotifier>,
    ) -> Self {
        let handle = host.register_notifier(start, start + len, Arc::downgrade(&notifier));
        Self {
            host,
            start,
            len,
            writable,
            handle,
            _notifier: notifier,
            pinned: None,
            walks: 0,
            released: false,
        }
    }

    pub fn start(&self) -> HostVa {
        self.start
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn host(&self) -> &Arc<HostMm> {
        &self.host
    }

    /// Frames of the last successful pin.
    pub fn storage(&self) -> Option<&Storage> {
        self.pinned.as_ref().map(|p| &p.storage)
    }

    /// Number of page walks performed so far.
    pub fn walks(&self) -> u64 {
        self.walks
    }

    /// Pin the range, unless the current snapshot is still valid.
    pub fn pin(&mut self, retry_limit: u32) -> PinResult<()> {
        if self.check_and_retry() == PinStatus::Current {
            return Ok(());
        }

        let count = pages_for(self.len);
        let limit = retry_limit.max(1);
        for attempt in 1..=limit {
            let seq = self.host.read_begin(self.handle);
            self.walks += 1;

            let mut frames = self.host.pin_fast(self.start, count, self.writable);
            if frames.len() < count {
                let va = self.start + frames.len() as u64 * PAGE_SIZE_U64;
                match self.host.pin(va, count - frames.len(), self.writable) {
                    Ok(rest) => frames.extend(rest),
                    Err(err) => {
                        self.host.unpin(&frames);
                        log::debug!("userptr: pin of 0x{:X} failed: {}", self.start, err);
                        return Err(err.into());
                    }
                }
            }

            if self.host.read_retry(self.handle, seq) {
                log::debug!(
                    "userptr: 0x{:X} invalidated during pin (attempt {}/{})",
                    self.start,
                    attempt,
                    limit
                );
                self.host.unpin(&frames);
                continue;
            }

            let fresh = Snapshot {
                seq,
                storage: Storage::new(MemoryDomain::System, frames),
            };
            if let Some(old) = self.pinned.replace(fresh) {
                self.host.unpin(old.storage.pages());
            }
            log::trace!("userptr: pinned {} pages at 0x{:X} seq {}", count, self.start, seq);
            return Ok(());
        }

        log::warn!("userptr: 0x{:X} retry limit {} exhausted", self.start, limit);
        Err(PinError::RetryExhausted(limit))
    }

    pub fn check_and_retry(&self) -> PinStatus {
        match &self.pinned {
            Some(p) if !self.released && !self.host.read_retry(self.handle, p.seq) => PinStatus::Current,
            _ => PinStatus::Stale,
        }
    }

    /// Derive the region for `[offset, offset + len)` of this one.
    ///
    /// A current snapshot is shared, with its own pins on the frames; a stale
    /// one is not carried over.
    pub fn split(&self, offset: u64, len: u64, notifier: Arc<dyn HostNotifier>) -> Self {
        let mut region = Self::new(
            self.host.clone(),
            self.start + offset,
            len,
            self.writable,
            notifier,
        );
        let seq = self.host.read_begin(region.handle);
        if let (Some(p), PinStatus::Current) = (&self.pinned, self.check_and_retry()) {
            let storage = p.storage.slice(offset, len);
            self.host.get_frames(storage.pages());
            region.pinned = Some(Snapshot { seq, storage });
        }
        region
    }

    /// Unpin the pages and stop tracking the range.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.host.unregister_notifier(self.handle);
        if let Some(p) = self.pinned.take() {
            self.host.unpin(p.storage.pages());
        }
    }
}

impl Drop for PinnedRegion {
    fn drop(&mut self) {
        self.release();
    }
}
