//! The per-device event loop.
//!
//! One cooperative task per device: wait for readability on the kernel→user
//! UIO fd, read the cumulative event counter, pop exactly that many new
//! commands, hand a credit back per command, dispatch. Everything past the
//! pop runs inline on this thread; the engine relies on that.

use crate::ack::Acknowledger;
use crate::dispatch::Dispatcher;
use crate::uio::Device;
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::rc::Rc;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use ublk_engine::RwHandler;

pub async fn run_device(device: Device, target: Rc<dyn RwHandler>) -> Result<()> {
    let Device {
        cmds,
        acks,
        notifier,
        cellds,
        cells,
    } = device;

    let ack = Rc::new(Acknowledger::new(acks, Rc::clone(&notifier)));
    let dispatcher = Dispatcher::new(cellds, cells, target, ack);

    let afd = AsyncFd::with_interest(cmds.fd().try_clone()?, Interest::READABLE)
        .context("registering UIO fd with the reactor")?;

    loop {
        let mut guard = afd.readable().await?;

        let new_cmds = match cmds.drain_events() {
            Ok(count) => count,
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                guard.clear_ready();
                continue;
            }
            Err(err) => return Err(err).context("reading UIO event counter"),
        };

        for _ in 0..new_cmds {
            // The counter may run ahead of the ring publication; the pop
            // spin-yields across that window.
            let cmd = cmds.pop_spin();
            notifier.notify().context("handing back a command credit")?;
            dispatcher.handle(cmd);
        }

        guard.clear_ready();
    }
}
