//! Device topology configuration.
//!
//! A JSON file describes each block device as a tree of target nodes, with
//! an optional chunk-cache wrapper at the top:
//!
//! ```json
//! {
//!   "devices": [
//!     {
//!       "bdev_suffix": "0",
//!       "cache": { "len": 1024, "chunk_sz": 65536, "write_through": true },
//!       "target": {
//!         "type": "raid0",
//!         "strip_sz": 131072,
//!         "leaves": [
//!           { "type": "raid1", "read_strip_sz": 131072, "leaves": [
//!             { "type": "file", "path": "/dev/nvme0n1" },
//!             { "type": "file", "path": "/dev/nvme1n1" } ] },
//!           { "type": "raid1", "read_strip_sz": 131072, "leaves": [
//!             { "type": "file", "path": "/dev/nvme2n1" },
//!             { "type": "file", "path": "/dev/nvme3n1" } ] }
//!         ]
//!       }
//!     }
//!   ]
//! }
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use ublk_engine::SECTOR_SZ;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    /// Suffix of the block device name (`ublk-<suffix>` under /sys/block).
    pub bdev_suffix: String,
    pub target: TargetConfig,
    #[serde(default)]
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Number of cached chunks.
    pub len: usize,
    /// Chunk size in bytes.
    pub chunk_sz: usize,
    /// Write-through (serialize per chunk) vs write-invalidate.
    #[serde(default = "default_write_through")]
    pub write_through: bool,
}

fn default_write_through() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TargetConfig {
    /// Flat backing file (or raw block device node).
    File { path: PathBuf },
    /// Volatile in-memory store.
    Mem { size_bytes: u64 },
    Raid0 {
        strip_sz: u64,
        leaves: Vec<TargetConfig>,
    },
    Raid1 {
        read_strip_sz: u64,
        /// Retry failed read strips on the remaining mirrors.
        #[serde(default)]
        failover_reads: bool,
        leaves: Vec<TargetConfig>,
    },
    Raid4 {
        strip_sz: u64,
        leaves: Vec<TargetConfig>,
    },
    Raid5 {
        strip_sz: u64,
        leaves: Vec<TargetConfig>,
    },
}

/// Loads and validates a configuration file.
pub fn load(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let config: Config = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    if config.devices.is_empty() {
        bail!("config lists no devices");
    }
    for device in &config.devices {
        validate_target(&device.target)
            .with_context(|| format!("device \"{}\"", device.bdev_suffix))?;
        if let Some(cache) = &device.cache {
            if cache.len == 0 || cache.chunk_sz == 0 {
                bail!(
                    "device \"{}\": cache len and chunk_sz must be non-zero",
                    device.bdev_suffix
                );
            }
            if cache.chunk_sz as u64 % SECTOR_SZ != 0 {
                bail!(
                    "device \"{}\": cache chunk_sz must be sector-aligned",
                    device.bdev_suffix
                );
            }
        }
    }
    Ok(config)
}

fn validate_target(target: &TargetConfig) -> Result<()> {
    match target {
        TargetConfig::File { .. } => Ok(()),
        TargetConfig::Mem { size_bytes } => {
            if *size_bytes == 0 || size_bytes % SECTOR_SZ != 0 {
                bail!("mem target size must be a non-zero sector multiple");
            }
            Ok(())
        }
        TargetConfig::Raid0 { strip_sz, leaves } => {
            check_strip(*strip_sz)?;
            check_leaves(leaves, 1, "raid0")
        }
        TargetConfig::Raid1 {
            read_strip_sz,
            leaves,
            ..
        } => {
            if read_strip_sz % SECTOR_SZ != 0 || *read_strip_sz == 0 {
                bail!("raid1 read_strip_sz must be a non-zero sector multiple");
            }
            check_leaves(leaves, 2, "raid1")
        }
        TargetConfig::Raid4 { strip_sz, leaves } | TargetConfig::Raid5 { strip_sz, leaves } => {
            check_strip(*strip_sz)?;
            check_leaves(leaves, 3, "raid4/raid5")
        }
    }
}

fn check_strip(strip_sz: u64) -> Result<()> {
    if !strip_sz.is_power_of_two() || strip_sz % SECTOR_SZ != 0 {
        bail!("strip_sz must be a sector-aligned power of two, got {strip_sz}");
    }
    Ok(())
}

fn check_leaves(leaves: &[TargetConfig], min: usize, kind: &str) -> Result<()> {
    if leaves.len() < min {
        bail!("{kind} needs at least {min} leaves, got {}", leaves.len());
    }
    for leaf in leaves {
        validate_target(leaf)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).expect("valid config json")
    }

    #[test]
    fn parses_a_raid10_device_with_cache() {
        let config = parse(
            r#"{
                "devices": [{
                    "bdev_suffix": "0",
                    "cache": { "len": 128, "chunk_sz": 65536 },
                    "target": {
                        "type": "raid0", "strip_sz": 131072,
                        "leaves": [
                            { "type": "raid1", "read_strip_sz": 131072,
                              "leaves": [ { "type": "mem", "size_bytes": 1048576 },
                                          { "type": "mem", "size_bytes": 1048576 } ] },
                            { "type": "raid1", "read_strip_sz": 131072, "failover_reads": true,
                              "leaves": [ { "type": "mem", "size_bytes": 1048576 },
                                          { "type": "mem", "size_bytes": 1048576 } ] }
                        ]
                    }
                }]
            }"#,
        );

        assert_eq!(config.devices.len(), 1);
        let device = &config.devices[0];
        let cache = device.cache.as_ref().unwrap();
        assert!(cache.write_through, "write-through is the default");
        let TargetConfig::Raid0 { strip_sz, leaves } = &device.target else {
            panic!("expected raid0 at the top");
        };
        assert_eq!(*strip_sz, 131072);
        assert!(matches!(
            leaves[1],
            TargetConfig::Raid1 {
                failover_reads: true,
                ..
            }
        ));
        for device in &config.devices {
            validate_target(&device.target).unwrap();
        }
    }

    #[test]
    fn rejects_a_non_power_of_two_strip() {
        let config = parse(
            r#"{ "devices": [{ "bdev_suffix": "0",
                "target": { "type": "raid0", "strip_sz": 3000,
                            "leaves": [ { "type": "mem", "size_bytes": 512 } ] } }] }"#,
        );
        assert!(validate_target(&config.devices[0].target).is_err());
    }

    #[test]
    fn rejects_an_undersized_parity_array() {
        let config = parse(
            r#"{ "devices": [{ "bdev_suffix": "0",
                "target": { "type": "raid5", "strip_sz": 4096,
                            "leaves": [ { "type": "mem", "size_bytes": 512 },
                                        { "type": "mem", "size_bytes": 512 } ] } }] }"#,
        );
        assert!(validate_target(&config.devices[0].target).is_err());
    }

    #[test]
    fn file_and_mem_leaves_parse() {
        let config = parse(
            r#"{ "devices": [{ "bdev_suffix": "a",
                "target": { "type": "raid5", "strip_sz": 4096,
                            "leaves": [ { "type": "file", "path": "/tmp/a.img" },
                                        { "type": "file", "path": "/tmp/b.img" },
                                        { "type": "mem", "size_bytes": 1048576 } ] } }] }"#,
        );
        validate_target(&config.devices[0].target).unwrap();
    }
}
