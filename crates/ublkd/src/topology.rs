//! Assembles the dispatcher tree a device config describes.
//!
//! Targets compose: a RAID10 is a RAID0 whose leaves are FSM-wrapped RAID1
//! targets, RAID40/50 likewise over RAID4/RAID5 columns. Every nested
//! target carries its own online/offline state machine; the optional cache
//! wraps the finished tree.

use crate::config::{CacheConfig, DeviceConfig, TargetConfig};
use anyhow::{Context, Result};
use std::rc::Rc;
use ublk_engine::raid1::ReadPolicy;
use ublk_engine::{cache, file, inmem, raid0, raid1, raid4, raid5, RwHandler};

/// Builds the complete handler for one device, cache wrapper included.
pub fn build_device(config: &DeviceConfig) -> Result<Rc<dyn RwHandler>> {
    let target = build_target(&config.target)
        .with_context(|| format!("assembling device \"{}\"", config.bdev_suffix))?;
    Ok(match &config.cache {
        Some(cache_cfg) => wrap_cache(target, cache_cfg),
        None => target,
    })
}

fn wrap_cache(inner: Rc<dyn RwHandler>, cfg: &CacheConfig) -> Rc<dyn RwHandler> {
    log::info!(
        "cache: {} chunks x {} bytes, {}",
        cfg.len,
        cfg.chunk_sz,
        if cfg.write_through {
            "write-through"
        } else {
            "write-invalidate"
        }
    );
    cache::cached(inner, cfg.len, cfg.chunk_sz, cfg.write_through)
}

/// Recursively builds one target node.
pub fn build_target(config: &TargetConfig) -> Result<Rc<dyn RwHandler>> {
    Ok(match config {
        TargetConfig::File { path } => {
            let target = file::FileTarget::open(path)
                .with_context(|| format!("opening backing file {}", path.display()))?;
            Rc::new(target)
        }
        TargetConfig::Mem { size_bytes } => Rc::new(inmem::InmemTarget::new(*size_bytes as usize)),
        TargetConfig::Raid0 { strip_sz, leaves } => {
            raid0::target(*strip_sz, build_leaves(leaves)?)
        }
        TargetConfig::Raid1 {
            read_strip_sz,
            failover_reads,
            leaves,
        } => {
            let policy = if *failover_reads {
                ReadPolicy::Failover
            } else {
                ReadPolicy::FailFast
            };
            raid1::target_with_policy(*read_strip_sz, build_leaves(leaves)?, policy)
        }
        TargetConfig::Raid4 { strip_sz, leaves } => {
            raid4::target(*strip_sz, build_leaves(leaves)?)
        }
        TargetConfig::Raid5 { strip_sz, leaves } => {
            raid5::target(*strip_sz, build_leaves(leaves)?)
        }
    })
}

fn build_leaves(leaves: &[TargetConfig]) -> Result<Vec<Rc<dyn RwHandler>>> {
    leaves.iter().map(build_target).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ublk_engine::{IoBuf, ReadQuery, WriteQuery};

    fn mem(size: u64) -> TargetConfig {
        TargetConfig::Mem { size_bytes: size }
    }

    #[test]
    fn builds_a_raid10_tree_that_round_trips() {
        let config = TargetConfig::Raid0 {
            strip_sz: 4096,
            leaves: vec![
                TargetConfig::Raid1 {
                    read_strip_sz: 4096,
                    failover_reads: false,
                    leaves: vec![mem(1 << 20), mem(1 << 20)],
                },
                TargetConfig::Raid1 {
                    read_strip_sz: 4096,
                    failover_reads: false,
                    leaves: vec![mem(1 << 20), mem(1 << 20)],
                },
            ],
        };

        let target = build_target(&config).unwrap();
        let payload: Vec<u8> = (0..32768u32).map(|i| (i * 5) as u8).collect();
        target
            .submit_write(WriteQuery::new(IoBuf::from_vec(payload.clone()), 0))
            .unwrap();
        let buf = IoBuf::alloc(32768);
        target.submit_read(ReadQuery::new(buf.clone(), 0)).unwrap();
        assert_eq!(buf.to_vec(), payload);
    }

    #[test]
    fn builds_a_cached_raid5_device() {
        let device = crate::config::DeviceConfig {
            bdev_suffix: "t".into(),
            target: TargetConfig::Raid5 {
                strip_sz: 512,
                leaves: vec![mem(1 << 20), mem(1 << 20), mem(1 << 20)],
            },
            cache: Some(crate::config::CacheConfig {
                len: 16,
                chunk_sz: 4096,
                write_through: true,
            }),
        };

        let target = build_device(&device).unwrap();
        let payload = vec![0x3c; 4096];
        target
            .submit_write(WriteQuery::new(IoBuf::from_vec(payload.clone()), 4096))
            .unwrap();
        let buf = IoBuf::alloc(4096);
        target
            .submit_read(ReadQuery::new(buf.clone(), 4096))
            .unwrap();
        assert_eq!(buf.to_vec(), payload);
    }

    #[test]
    fn builds_file_leaves_under_raid1() {
        let dir = tempfile::tempdir().unwrap();
        let config = TargetConfig::Raid1 {
            read_strip_sz: 4096,
            failover_reads: true,
            leaves: vec![
                TargetConfig::File {
                    path: dir.path().join("m0.img"),
                },
                TargetConfig::File {
                    path: dir.path().join("m1.img"),
                },
            ],
        };

        let target = build_target(&config).unwrap();
        target
            .submit_write(WriteQuery::new(IoBuf::from_vec(vec![0x61; 8192]), 0))
            .unwrap();

        // Both mirror files hold the payload.
        for name in ["m0.img", "m1.img"] {
            let bytes = std::fs::read(dir.path().join(name)).unwrap();
            assert_eq!(bytes, vec![0x61; 8192]);
        }
    }
}
