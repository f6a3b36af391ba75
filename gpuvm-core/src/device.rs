// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! The device service object.
//!
//! Owns device memory, the buffer backend, the job scheduler and one
//! migration context per tile. Address spaces are created from it and keep
//! it alive.

use std::sync::Arc;

use thiserror::Error;

use gpuvm_common::{Settings, TileId, MAX_TILES};
use gpuvm_hw::{DeviceMemory, HostMm, JobSubmitter, MemoryError, Placement, SimBufferBackend, SimScheduler};

use crate::migrate::{Migrate, MigrateError};
use crate::vm::{Vm, VmMode};
use crate::VmResult;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device memory: {0}")]
    Memory(#[from] MemoryError),

    #[error("migration context: {0}")]
    Migrate(#[from] MigrateError),

    #[error("unsupported tile count {0}")]
    TileCount(u8),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

pub struct Tile {
    pub id: TileId,
    pub migrate: Arc<Migrate>,
}

pub struct Device {
    settings: Settings,
    mem: Arc<DeviceMemory>,
    backend: Arc<SimBufferBackend>,
    scheduler: Arc<SimScheduler>,
    tiles: Vec<Tile>,
}

impl Device {
    /// Bring up a device whose buffers get contiguous backing.
    pub fn attach(settings: Settings) -> DeviceResult<Arc<Self>> {
        Self::attach_with(settings, Placement::Contiguous { align: gpuvm_common::SZ_2M })
    }

    /// Bring up a device with an explicit buffer placement policy.
    pub fn attach_with(settings: Settings, placement: Placement) -> DeviceResult<Arc<Self>> {
        let tile_count = settings.tile_count;
        if tile_count == 0 || usize::from(tile_count) > MAX_TILES {
            return Err(DeviceError::TileCount(tile_count));
        }

        let mem = Arc::new(DeviceMemory::from_settings(&settings)?);
        let scheduler = Arc::new(SimScheduler::new(mem.clone(), settings.job_timeout));
        let backend = Arc::new(match placement {
            Placement::Scattered => SimBufferBackend::scattered(mem.clone()),
            Placement::Contiguous { .. } => SimBufferBackend::new(mem.clone()),
        });

        let submitter: Arc<dyn JobSubmitter> = scheduler.clone();
        let tiles = (0..tile_count)
            .map(|id| {
                let migrate = Migrate::new(id, mem.clone(), submitter.clone(), &settings)?;
                Ok(Tile {
                    id,
                    migrate: Arc::new(migrate),
                })
            })
            .collect::<DeviceResult<Vec<_>>>()?;
        backend.set_mover(tiles[0].migrate.clone());

        log::info!(
            "device: attached, {} tile(s), page tables in {}, huge pages {}, 64K pages {}",
            tile_count,
            settings.pt_domain,
            settings.huge_pages,
            settings.compact_64k
        );
        Ok(Arc::new(Self {
            settings,
            mem,
            backend,
            scheduler,
            tiles,
        }))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn memory(&self) -> &Arc<DeviceMemory> {
        &self.mem
    }

    pub fn backend(&self) -> &Arc<SimBufferBackend> {
        &self.backend
    }

    pub fn scheduler(&self) -> &Arc<SimScheduler> {
        &self.scheduler
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    /// Mask with one bit per tile.
    pub fn all_tiles(&self) -> u8 {
        ((1u16 << self.tiles.len()) - 1) as u8
    }

    pub fn migrate(&self, tile: usize) -> Option<&Arc<Migrate>> {
        self.tiles.get(tile).map(|t| &t.migrate)
    }

    /// A host process whose pages come from this device's system memory.
    pub fn new_host_mm(&self) -> Arc<HostMm> {
        Arc::new(HostMm::new(self.mem.clone()))
    }

    pub fn create_vm(self: &Arc<Self>, mode: VmMode) -> VmResult<Arc<Vm>> {
        Vm::new(self.clone(), mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpuvm_common::MemoryDomain;
    use gpuvm_hw::BufferBackend;
    use std::time::Duration;

    #[test]
    fn test_attach_installs_mover() {
        let dev = Device::attach(Settings::for_tests()).unwrap();
        assert_eq!(dev.tile_count(), 1);
        assert_eq!(dev.all_tiles(), 1);

        let buffer = dev.backend().create(0x4000, MemoryDomain::System).unwrap();
        let fence = dev.backend().evict(&buffer, MemoryDomain::Vram).unwrap().unwrap();
        assert_eq!(fence.wait(Duration::from_secs(5)), Ok(()));
        assert_eq!(buffer.lock().storage().domain(), MemoryDomain::Vram);
        assert!(dev.migrate(0).unwrap().stats().batches > 0);
    }

    #[test]
    fn test_tile_count_checked() {
        let settings = Settings {
            tile_count: 0,
            ..Settings::for_tests()
        };
        assert!(matches!(Device::attach(settings), Err(DeviceError::TileCount(0))));

        let settings = Settings {
            tile_count: 2,
            ..Settings::for_tests()
        };
        let dev = Device::attach(settings).unwrap();
        assert_eq!(dev.all_tiles(), 0b11);
        assert_eq!(dev.migrate(1).unwrap().context().name(), "migrate1");
    }
}
