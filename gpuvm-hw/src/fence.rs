// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Completion fences.
//!
//! A fence is a one-shot completion object: it starts pending and is
//! completed exactly once, either signaled or with an error. The host can
//! block until completion, and other components can chain callbacks that run
//! on the completing thread. [`Fence::all`] builds a fence tree out of several
//! fences.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

/// Error a fence may complete with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FenceError {
    #[error("engine page fault at GPU VA 0x{0:016X}")]
    PageFault(u64),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("job timed out, context hung")]
    Timeout,

    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("execution context is banned")]
    Banned,

    #[error("operation cancelled")]
    Cancelled,

    #[error("timed out waiting for fence")]
    WaitTimeout,
}

/// Result a fence completes with.
pub type FenceResult = Result<(), FenceError>;

type Callback = Box<dyn FnOnce(FenceResult) + Send>;

enum State {
    Pending(Vec<Callback>),
    Done(FenceResult),
}

static NEXT_SEQNO: AtomicU64 = AtomicU64::new(1);

/// One-shot completion fence.
pub struct Fence {
    seqno: u64,
    state: Mutex<State>,
    cond: Condvar,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("seqno", &self.seqno)
            .field("status", &self.status())
            .finish()
    }
}

impl Fence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seqno: NEXT_SEQNO.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(State::Pending(Vec::new())),
            cond: Condvar::new(),
        })
    }

    /// A fence that is already signaled.
    pub fn signaled() -> Arc<Self> {
        let fence = Self::new();
        fence.signal();
        fence
    }

    /// A fence that has already failed.
    pub fn failed(err: FenceError) -> Arc<Self> {
        let fence = Self::new();
        fence.fail(err);
        fence
    }

    pub fn seqno(&self) -> u64 {
        self.seqno
    }

    /// Complete successfully. Returns `false` if already completed.
    pub fn signal(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Complete with an error. Returns `false` if already completed.
    pub fn fail(&self, err: FenceError) -> bool {
        self.complete(Err(err))
    }

    fn complete(&self, result: FenceResult) -> bool {
        let callbacks = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(_) => return false,
                State::Pending(callbacks) => {
                    let callbacks = std::mem::take(callbacks);
                    *state = State::Done(result.clone());
                    callbacks
                }
            }
        };
        self.cond.notify_all();
        log::trace!("fence {} completed: {:?}", self.seqno, result);
        for callback in callbacks {
            callback(result.clone());
        }
        true
    }

    /// `None` while pending, otherwise the completion result.
    pub fn status(&self) -> Option<FenceResult> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Done(result) => Some(result.clone()),
        }
    }

    /// Whether the fence has completed (successfully or not).
    pub fn is_complete(&self) -> bool {
        self.status().is_some()
    }

    /// Whether the fence completed successfully.
    pub fn is_signaled(&self) -> bool {
        matches!(self.status(), Some(Ok(())))
    }

    /// Block until completion or until `timeout` expires.
    pub fn wait(&self, timeout: Duration) -> FenceResult {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let State::Done(result) = &*state {
                return result.clone();
            }
            if self.cond.wait_until(&mut state, deadline).timed_out() {
                return match &*state {
                    State::Done(result) => result.clone(),
                    State::Pending(_) => Err(FenceError::WaitTimeout),
                };
            }
        }
    }

    /// Run `callback` on completion. Runs immediately if already complete.
    pub fn on_complete(&self, callback: impl FnOnce(FenceResult) + Send + 'static) {
        let result = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Pending(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                State::Done(result) => result.clone(),
            }
        };
        callback(result);
    }

    /// Fence that completes once every fence in `fences` has completed.
    /// It carries the first error observed, if any.
    pub fn all(fences: Vec<Arc<Fence>>) -> Arc<Fence> {
        match fences.len() {
            0 => return Self::signaled(),
            1 => return fences.into_iter().next().unwrap_or_else(Self::signaled),
            _ => {}
        }

        let out = Self::new();
        let remaining = Arc::new(AtomicUsize::new(fences.len()));
        let first_err: Arc<Mutex<Option<FenceError>>> = Arc::new(Mutex::new(None));
        for fence in fences {
            let out = out.clone();
            let remaining = remaining.clone();
            let first_err = first_err.clone();
            fence.on_complete(move |result| {
                if let Err(err) = result {
                    first_err.lock().get_or_insert(err);
                }
                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                    match first_err.lock().take() {
                        Some(err) => out.fail(err),
                        None => out.signal(),
                    };
                }
            });
        }
        out
    }

    /// Fence that signals once this one completes, whatever the result.
    /// Orders later work after this fence without inheriting its error.
    pub fn settled(&self) -> Arc<Fence> {
        let out = Self::new();
        let done = out.clone();
        self.on_complete(move |_| {
            done.signal();
        });
        out
    }

    /// Forward this fence's completion to `other`.
    pub fn chain(&self, other: Arc<Fence>) {
        self.on_complete(move |result| {
            match result {
                Ok(()) => other.signal(),
                Err(err) => other.fail(err),
            };
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_signal_once() {
        let fence = Fence::new();
        assert_eq!(fence.status(), None);
        assert!(fence.signal());
        assert!(!fence.fail(FenceError::Cancelled));
        assert!(fence.is_signaled());
    }

    #[test]
    fn test_wait_timeout() {
        let fence = Fence::new();
        let start = Instant::now();
        assert_eq!(fence.wait(Duration::from_millis(50)), Err(FenceError::WaitTimeout));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_wait_then_signal() {
        let fence = Fence::new();
        let waiter = {
            let fence = fence.clone();
            thread::spawn(move || fence.wait(Duration::from_secs(2)))
        };
        thread::sleep(Duration::from_millis(20));
        fence.signal();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_callback_after_completion_runs_inline() {
        let fence = Fence::failed(FenceError::Timeout);
        let seen = Arc::new(Mutex::new(None));
        let seen2 = seen.clone();
        fence.on_complete(move |r| *seen2.lock() = Some(r));
        assert_eq!(*seen.lock(), Some(Err(FenceError::Timeout)));
    }

    #[test]
    fn test_all_waits_for_every_fence() {
        let a = Fence::new();
        let b = Fence::new();
        let both = Fence::all(vec![a.clone(), b.clone()]);
        a.signal();
        assert!(!both.is_complete());
        b.signal();
        assert!(both.is_signaled());
    }

    #[test]
    fn test_all_propagates_error() {
        let a = Fence::new();
        let b = Fence::new();
        let both = Fence::all(vec![a.clone(), b.clone()]);
        a.fail(FenceError::PageFault(0x1000));
        b.signal();
        assert_eq!(both.status(), Some(Err(FenceError::PageFault(0x1000))));
        assert!(Fence::all(Vec::new()).is_signaled());
    }

    #[test]
    fn test_settled_ignores_error() {
        let a = Fence::new();
        let settled = a.settled();
        assert!(!settled.is_complete());
        a.fail(FenceError::Submission("lost".into()));
        assert!(settled.is_signaled());
        assert!(Fence::failed(FenceError::Timeout).settled().is_signaled());
    }

    #[test]
    fn test_chain() {
        let a = Fence::new();
        let b = Fence::new();
        a.chain(b.clone());
        a.fail(FenceError::Cancelled);
        assert_eq!(b.status(), Some(Err(FenceError::Cancelled)));
    }
}
