// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use ini::{Ini, Properties};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gpuvm_common::settings::{parse_bool, parse_size};
use gpuvm_common::{MemoryDomain, Settings, MAX_TILES};

/// Locate gpuvm.ini in the user's config directory.
pub fn find_config_path() -> Option<PathBuf> {
    // XDG_CONFIG_HOME/gpuvm/gpuvm.ini
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        let path = PathBuf::from(&xdg).join("gpuvm").join("gpuvm.ini");
        if path.exists() {
            return Some(path);
        }
    }

    // ~/.config/gpuvm/gpuvm.ini
    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(&home).join(".config").join("gpuvm").join("gpuvm.ini");
        if path.exists() {
            return Some(path);
        }
    }

    None
}

/// Load settings, falling back to defaults for anything missing or malformed.
pub fn load_config(path: Option<&PathBuf>) -> Settings {
    let settings = Settings::default();

    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                warn!("Config file not found: {}", p.display());
                return settings;
            }
            p.clone()
        }
        None => match find_config_path() {
            Some(p) => p,
            None => {
                info!("No config found, using defaults");
                return settings;
            }
        },
    };

    info!("Loading config from: {}", config_path.display());
    load_from_file(&config_path, settings)
}

fn load_from_file(path: &Path, mut settings: Settings) -> Settings {
    let conf = match Ini::load_from_file(path) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to parse config: {}", e);
            return settings;
        }
    };

    // [Memory]
    if let Some(section) = conf.section(Some("Memory")) {
        if let Some(size) = size_value(section, "vram_size") {
            settings.vram_size = size;
        }
        if let Some(size) = size_value(section, "system_size") {
            settings.system_size = size;
        }
        if let Some(visible) = bool_value(section, "vram_cpu_visible") {
            settings.vram_cpu_visible = visible;
        }
        if let Some(tiles) = section.get("tile_count") {
            match tiles.trim().parse::<u8>() {
                Ok(n) if (1..=MAX_TILES as u8).contains(&n) => settings.tile_count = n,
                _ => warn!("Ignoring tile_count '{}' (1..={})", tiles, MAX_TILES),
            }
        }
    }

    // [PageTable]
    if let Some(section) = conf.section(Some("PageTable")) {
        if let Some(domain) = section.get("domain") {
            settings.pt_domain = MemoryDomain::from_str_or_default(domain);
            debug!("Page-table domain: {}", settings.pt_domain);
        }
        if let Some(nodes) = section.get("max_nodes") {
            match nodes.trim().parse::<usize>() {
                Ok(n) if n > 0 => settings.max_pt_nodes = n,
                _ => warn!("Ignoring max_nodes '{}'", nodes),
            }
        }
        if let Some(huge) = bool_value(section, "huge_pages") {
            settings.huge_pages = huge;
        }
        if let Some(compact) = bool_value(section, "compact_64k") {
            settings.compact_64k = compact;
        }
    }

    // [Migrate]
    if let Some(section) = conf.section(Some("Migrate")) {
        if let Some(slots) = section.get("slots") {
            match slots.trim().parse::<u32>() {
                Ok(n) => settings.migrate_slots = n,
                Err(_) => warn!("Ignoring slots '{}'", slots),
            }
        }
        if let Some(ms) = section.get("job_timeout_ms") {
            match ms.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => settings.job_timeout = Duration::from_millis(ms),
                _ => warn!("Ignoring job_timeout_ms '{}'", ms),
            }
        }
    }

    // [Vm]
    if let Some(section) = conf.section(Some("Vm")) {
        if let Some(limit) = section.get("userptr_retry_limit") {
            settings.userptr_retry_limit = limit.trim().parse().unwrap_or(settings.userptr_retry_limit);
        }
        if let Some(depth) = section.get("async_queue_depth") {
            settings.async_queue_depth = depth.trim().parse().unwrap_or(settings.async_queue_depth);
        }
    }

    settings
}

fn size_value(section: &Properties, key: &str) -> Option<u64> {
    let raw = section.get(key)?;
    let size = parse_size(raw);
    if size.is_none() {
        warn!("Ignoring {} '{}'", key, raw);
    }
    size
}

fn bool_value(section: &Properties, key: &str) -> Option<bool> {
    let raw = section.get(key)?;
    let value = parse_bool(raw);
    if value.is_none() {
        warn!("Ignoring {} '{}'", key, raw);
    }
    value
}
