// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

use gpuvm_common::error::{self as codes, ErrorCode};
use gpuvm_common::GpuVa;
use gpuvm_hw::{BufferError, FenceError, HostMmError, MemoryError};

use crate::migrate::MigrateError;
use crate::pt::PtError;
use crate::userptr::PinError;

/// Errors returned by address-space operations.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("range [0x{0:X}+0x{1:X}) is empty or not page-aligned")]
    InvalidRange(GpuVa, u64),

    #[error("range [0x{0:X}+0x{1:X}) exceeds the GPU address space")]
    OutOfRange(GpuVa, u64),

    #[error("range [0x{0:X}..0x{1:X}) is already mapped")]
    AlreadyMapped(GpuVa, GpuVa),

    #[error("range [0x{0:X}..0x{1:X}) overlaps an existing mapping")]
    Overlap(GpuVa, GpuVa),

    #[error("address 0x{0:X} is not mapped")]
    NotMapped(GpuVa),

    #[error("tile mask 0b{0:b} names no usable tile")]
    InvalidTiles(u8),

    #[error(transparent)]
    Pt(#[from] PtError),

    #[error(transparent)]
    Pin(#[from] PinError),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Migrate(#[from] MigrateError),

    #[error("operation failed on the device: {0}")]
    Fence(#[from] FenceError),

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error("address space is closed")]
    Closed,

    #[error("address space is banned")]
    Banned,

    #[error("async queue halted by an earlier failure")]
    AsyncHalted,

    #[error("operation needs a preempt-mode address space")]
    WrongMode,

    #[error("host ranges kept changing, gave up after {0} attempts")]
    RetryExhausted(u32),

    #[error("mapping at 0x{0:X} is invalidated")]
    Invalidated(GpuVa),
}

pub type VmResult<T> = Result<T, VmError>;

fn memory_code(err: &MemoryError) -> ErrorCode {
    match err {
        MemoryError::Exhausted { .. } => codes::OUT_OF_MEMORY,
        _ => codes::INVALID_ADDRESS,
    }
}

fn fence_code(err: &FenceError) -> ErrorCode {
    match err {
        FenceError::Timeout => codes::ENGINE_HANG,
        FenceError::PageFault(_) | FenceError::Engine(_) => codes::ENGINE_FAULT,
        FenceError::Submission(_) => codes::JOB_FAILED,
        FenceError::Banned => codes::CONTEXT_BANNED,
        FenceError::Cancelled => codes::JOB_CANCELLED,
        FenceError::WaitTimeout => codes::WAIT_TIMEOUT,
    }
}

fn pt_code(err: &PtError) -> ErrorCode {
    match err {
        PtError::OutOfNodes(_) => codes::PT_OUT_OF_NODES,
        PtError::Memory(err) => memory_code(err),
        PtError::ShortSource { .. } => codes::INVALID_RANGE,
    }
}

impl VmError {
    /// Code written to the error-capture record.
    pub fn code(&self) -> ErrorCode {
        match self {
            VmError::InvalidRange(..) | VmError::OutOfRange(..) | VmError::InvalidTiles(_) => codes::INVALID_RANGE,
            VmError::AlreadyMapped(..) => codes::ALREADY_MAPPED,
            VmError::Overlap(..) => codes::RANGE_OVERLAP,
            VmError::NotMapped(_) => codes::NOT_MAPPED,
            VmError::Pt(err) => pt_code(err),
            VmError::Pin(PinError::RetryExhausted(_)) | VmError::RetryExhausted(_) => codes::PIN_RETRY,
            VmError::Pin(PinError::HostMm(err)) => match err {
                HostMmError::PermissionDenied { .. } => codes::PIN_PERMISSION,
                HostMmError::OutOfMemory => codes::OUT_OF_MEMORY,
                _ => codes::PIN_FAULT,
            },
            VmError::Buffer(err) => match err {
                BufferError::Move(err) => fence_code(err),
                BufferError::Memory(err) => memory_code(err),
                _ => codes::BUFFER_INVALID,
            },
            VmError::Migrate(err) => match err {
                MigrateError::Banned(_) => codes::CONTEXT_BANNED,
                MigrateError::Memory(err) => memory_code(err),
                MigrateError::Pt(err) => pt_code(err),
            },
            VmError::Fence(err) => fence_code(err),
            VmError::Memory(err) => memory_code(err),
            VmError::Closed => codes::VM_CLOSED,
            VmError::Banned => codes::VM_BANNED,
            VmError::AsyncHalted => codes::QUEUE_HALTED,
            VmError::WrongMode => codes::WRONG_MODE,
            VmError::Invalidated(_) => codes::INVALIDATED,
        }
    }

    /// Fence error carrying this failure to waiters.
    pub fn to_fence_error(&self) -> FenceError {
        match self {
            VmError::Fence(err) | VmError::Buffer(BufferError::Move(err)) => err.clone(),
            VmError::Migrate(MigrateError::Banned(_)) | VmError::Banned => FenceError::Banned,
            other => FenceError::Submission(other.to_string()),
        }
    }
}
