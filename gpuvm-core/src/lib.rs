// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! GPU virtual address space management.

pub mod device;
pub mod error;
pub mod migrate;
pub mod pt;
pub mod userptr;
pub mod vm;

pub use device::{Device, DeviceError, Tile};
pub use error::{VmError, VmResult};
pub use migrate::{Migrate, MigrateError, MigrateStats};
pub use userptr::{PinError, PinStatus, PinnedRegion};
pub use vm::{
    AsyncOp, BindBacking, BindFlags, BindRequest, ComputeContext, ErrorCapture, MappingInfo, MappingState, Vm, VmMode,
};
