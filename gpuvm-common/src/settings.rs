// SPDX-FileCopyrightText: 2025 gpuvm contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::time::Duration;

use crate::types::MemoryDomain;

/// Device and address-space tunables, populated from the config INI.
#[derive(Debug, Clone)]
pub struct Settings {
    // Memory
    pub vram_size: u64,
    pub system_size: u64,
    /// Whether the host CPU may write device-local memory directly.
    pub vram_cpu_visible: bool,
    pub tile_count: u8,

    // Page tables
    pub pt_domain: MemoryDomain,
    /// Upper bound on live page-table nodes per address space.
    pub max_pt_nodes: usize,
    pub huge_pages: bool,
    pub compact_64k: bool,

    // Migration
    /// Scratch page-table slots per migration context (slot 0 maps the table itself).
    pub migrate_slots: u32,
    pub job_timeout: Duration,

    // Address space
    pub userptr_retry_limit: u32,
    pub async_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            vram_size: 256 * 1024 * 1024,
            system_size: 256 * 1024 * 1024,
            vram_cpu_visible: true,
            tile_count: 1,
            pt_domain: MemoryDomain::Vram,
            max_pt_nodes: 4096,
            huge_pages: true,
            compact_64k: true,
            migrate_slots: 512,
            job_timeout: Duration::from_secs(5),
            userptr_retry_limit: 4,
            async_queue_depth: 64,
        }
    }
}

impl Settings {
    /// Small memory footprint used by unit tests.
    pub fn for_tests() -> Self {
        Self {
            vram_size: 64 * 1024 * 1024,
            system_size: 64 * 1024 * 1024,
            job_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Usable transfer slots per side of a copy (source and destination).
    pub fn slots_per_side(&self) -> u32 {
        (self.migrate_slots.clamp(8, 512) - 1) / 2
    }
}

/// Parse an INI boolean the way the config loader accepts it.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a size with an optional `K`/`M`/`G` suffix.
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last()?.to_ascii_uppercase() {
        'K' => (&s[..s.len() - 1], 10),
        'M' => (&s[..s.len() - 1], 20),
        'G' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value = if let Some(hex) = digits.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };
    value.checked_mul(1u64 << shift)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096"), Some(4096));
        assert_eq!(parse_size("64M"), Some(64 << 20));
        assert_eq!(parse_size("1g"), Some(1 << 30));
        assert_eq!(parse_size("0x1000"), Some(0x1000));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("true"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_slots_per_side() {
        let mut s = Settings::default();
        assert_eq!(s.slots_per_side(), 255);
        s.migrate_slots = 2;
        assert_eq!(s.slots_per_side(), 3);
    }
}
