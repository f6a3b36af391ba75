// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Packed error code reported through the async error-capture channel.
/// Layout: bits [8:0] = module, bits [21:9] = description.
/// Value 0 = success.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ErrorCode(pub u32);

impl ErrorCode {
    pub const SUCCESS: Self = Self(0);

    #[inline]
    pub const fn new(module: u32, description: u32) -> Self {
        Self((module & 0x1FF) | ((description & 0x1FFF) << 9))
    }

    #[inline]
    pub const fn module(self) -> u32 {
        self.0 & 0x1FF
    }

    #[inline]
    pub const fn description(self) -> u32 {
        (self.0 >> 9) & 0x1FFF
    }

    #[inline]
    pub const fn is_success(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "ErrorCode::SUCCESS")
        } else {
            write!(
                f,
                "ErrorCode(module={}, desc={}, raw=0x{:08X})",
                self.module(),
                self.description(),
                self.0
            )
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_success() {
            write!(f, "Success")
        } else {
            write!(f, "Error(module={}, desc={})", self.module(), self.description())
        }
    }
}

/// Error modules.
pub mod module {
    pub const MEMORY: u32 = 1;
    pub const PAGE_TABLE: u32 = 2;
    pub const MIGRATE: u32 = 3;
    pub const USERPTR: u32 = 4;
    pub const SCHED: u32 = 5;
    pub const BUFFER: u32 = 6;
    pub const VM: u32 = 7;
}

pub const OUT_OF_MEMORY: ErrorCode = ErrorCode::new(module::MEMORY, 1);
pub const INVALID_ADDRESS: ErrorCode = ErrorCode::new(module::MEMORY, 2);
pub const PT_OUT_OF_NODES: ErrorCode = ErrorCode::new(module::PAGE_TABLE, 1);
pub const ENGINE_FAULT: ErrorCode = ErrorCode::new(module::MIGRATE, 1);
pub const ENGINE_HANG: ErrorCode = ErrorCode::new(module::MIGRATE, 2);
pub const PIN_FAULT: ErrorCode = ErrorCode::new(module::USERPTR, 1);
pub const PIN_PERMISSION: ErrorCode = ErrorCode::new(module::USERPTR, 2);
pub const PIN_RETRY: ErrorCode = ErrorCode::new(module::USERPTR, 3);
pub const JOB_FAILED: ErrorCode = ErrorCode::new(module::SCHED, 1);
pub const JOB_CANCELLED: ErrorCode = ErrorCode::new(module::SCHED, 2);
pub const CONTEXT_BANNED: ErrorCode = ErrorCode::new(module::SCHED, 3);
pub const BUFFER_INVALID: ErrorCode = ErrorCode::new(module::BUFFER, 1);
pub const INVALID_RANGE: ErrorCode = ErrorCode::new(module::VM, 1);
pub const ALREADY_MAPPED: ErrorCode = ErrorCode::new(module::VM, 2);
pub const RANGE_OVERLAP: ErrorCode = ErrorCode::new(module::VM, 3);
pub const NOT_MAPPED: ErrorCode = ErrorCode::new(module::VM, 4);
pub const VM_CLOSED: ErrorCode = ErrorCode::new(module::VM, 5);
pub const VM_BANNED: ErrorCode = ErrorCode::new(module::VM, 6);
pub const QUEUE_HALTED: ErrorCode = ErrorCode::new(module::VM, 7);
pub const WRONG_MODE: ErrorCode = ErrorCode::new(module::VM, 8);
pub const INVALIDATED: ErrorCode = ErrorCode::new(module::VM, 9);
pub const WAIT_TIMEOUT: ErrorCode = ErrorCode::new(module::VM, 10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_fields() {
        let code = ErrorCode::new(module::PAGE_TABLE, 1);
        assert_eq!(code.module(), 2);
        assert_eq!(code.description(), 1);
        assert!(!code.is_success());
        assert_eq!(code, PT_OUT_OF_NODES);
    }

    #[test]
    fn test_success() {
        assert!(ErrorCode::SUCCESS.is_success());
        assert_eq!(format!("{}", ErrorCode::SUCCESS), "Success");
    }

    #[test]
    fn test_codes_distinct() {
        assert_ne!(ENGINE_FAULT, ENGINE_HANG);
        assert_ne!(ALREADY_MAPPED.raw(), RANGE_OVERLAP.raw());
    }
}
