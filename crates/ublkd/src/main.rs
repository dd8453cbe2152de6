use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio::task::LocalSet;

use ublkd::{config, devloop, topology, uio};

/// User-space block-device worker: serves ublk devices against file,
/// in-memory and RAID topologies.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Path to the JSON topology configuration.
    #[arg(short, long)]
    config: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = config::load(&args.config)?;

    // One thread drives every device loop: the engine's no-preemption
    // invariant hangs on this being a current-thread runtime.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;

    let local = LocalSet::new();
    for device_cfg in &config.devices {
        let target = topology::build_device(device_cfg)?;
        let device = uio::attach(&device_cfg.bdev_suffix)
            .with_context(|| format!("attaching to ublk-{}", device_cfg.bdev_suffix))?;
        let suffix = device_cfg.bdev_suffix.clone();
        log::info!("serving ublk-{suffix}");
        let _serving = local.spawn_local(async move {
            if let Err(err) = devloop::run_device(device, target).await {
                log::error!("device ublk-{suffix} stopped: {err:#}");
            }
        });
    }

    runtime.block_on(local.run_until(async {
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        log::info!("shutting down");
        Ok(())
    }))
}
