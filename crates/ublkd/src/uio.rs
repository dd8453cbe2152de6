//! UIO device discovery and shared-region mapping.
//!
//! The driver exposes two UIO character devices per block device (one for
//! kernel→user notifications, one for user→kernel) and four memory regions
//! behind them: the command ring (`cmdb`), the ack ring (`cmdb_ack`), the
//! cell configuration (`cellc`) and the byte arena (`cells`). Sysfs
//! describes which map index carries which region; the mmap offset encodes
//! the map index in page-size units, per the UIO convention.

use anyhow::{bail, Context, Result};
use bytemuck::Zeroable;
use std::any::Any;
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::rc::Rc;

use ublk_ring::proto::{CellDesc, CellcHdr, Cmd, CmdAck, CmdbAckHdr, CmdbHdr};
use ublk_ring::{Popper, Pusher};

use ublk_engine::IoBuf;

const UIO_SUFFIX_KERNEL_TO_USER: &str = "_kernel_to_user";
const UIO_SUFFIX_USER_TO_KERNEL: &str = "_user_to_kernel";
const MAP_NAME_CMDB: &str = "cmdb";
const MAP_NAME_CELLC: &str = "cellc";
const MAP_NAME_CELLS: &str = "cells";

/// One mmapped UIO region; unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    /// Maps `len` bytes of `file` at UIO map index `map_index`.
    pub fn map(file: &File, len: usize, map_index: usize, writable: bool) -> Result<Self> {
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let offset = (map_index * page_size()) as libc::off_t;
        // SAFETY: a plain shared file mapping; the fd stays open only for
        // the duration of the call, which mmap allows.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                prot,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            bail!(
                "mmap of UIO map {} failed: {}",
                map_index,
                std::io::Error::last_os_error()
            );
        }
        Ok(Self {
            ptr: NonNull::new(ptr.cast()).expect("mmap returned null"),
            len,
        })
    }

    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads a header struct at the start of the region.
    ///
    /// # Safety
    ///
    /// The region must actually begin with a `T` written by the driver.
    unsafe fn header<T: bytemuck::Pod>(&self) -> T {
        assert!(std::mem::size_of::<T>() <= self.len);
        std::ptr::read_volatile(self.ptr.as_ptr().cast::<T>())
    }

    /// Pointer `offset` bytes into the region.
    fn at(&self, offset: usize) -> NonNull<u8> {
        assert!(offset <= self.len);
        // SAFETY: in-bounds offset of a live mapping.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(offset)) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: mapping created in `map` with exactly this length.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Writes the 4-byte signal word to a UIO fd (ack pushed / credit handed
/// back).
pub struct Notifier {
    fd: File,
}

impl Notifier {
    pub fn new(fd: File) -> Self {
        Self { fd }
    }

    pub fn notify(&self) -> std::io::Result<()> {
        let one = 1u32.to_ne_bytes();
        let written = (&self.fd).write(&one)?;
        if written != one.len() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "short write to UIO fd",
            ));
        }
        Ok(())
    }
}

/// Consumer end of the command ring plus its notification fd.
pub struct CmdQueue {
    popper: Popper<Cmd>,
    fd: File,
    /// UIO read() returns a cumulative event count; remember the last one to
    /// pop only the delta.
    last_events: Cell<u32>,
    _regions: Vec<Rc<MappedRegion>>,
}

impl CmdQueue {
    pub fn fd(&self) -> &File {
        &self.fd
    }

    /// Reads the cumulative event counter and returns how many new commands
    /// arrived since the previous call.
    pub fn drain_events(&self) -> std::io::Result<u32> {
        let mut count = [0u8; 4];
        (&self.fd).read_exact(&mut count)?;
        let total = u32::from_ne_bytes(count);
        let delta = total.wrapping_sub(self.last_events.replace(total));
        Ok(delta)
    }

    /// Pops one command, spinning out the window between the notification
    /// and the ring publication.
    pub fn pop_spin(&self) -> Cmd {
        self.popper.pop_spin()
    }
}

/// Producer end of the ack ring.
pub struct AckQueue {
    pusher: Pusher<CmdAck>,
    _regions: Vec<Rc<MappedRegion>>,
}

impl AckQueue {
    pub fn pusher(&self) -> &Pusher<CmdAck> {
        &self.pusher
    }
}

/// Everything needed to run one block device.
pub struct Device {
    pub cmds: CmdQueue,
    pub acks: AckQueue,
    pub notifier: Rc<Notifier>,
    /// Static snapshot of the cell descriptor table.
    pub cellds: Vec<CellDesc>,
    /// The shared byte arena the descriptors index into.
    pub cells: IoBuf,
}

/// Sysfs description of one UIO map of one UIO device.
struct UioMap {
    index: usize,
    name: String,
    size: usize,
}

struct UioDev {
    dev_path: PathBuf,
    kernel_to_user: bool,
    maps: Vec<UioMap>,
}

fn read_sysfs_string(path: &Path) -> Result<String> {
    Ok(std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?
        .trim()
        .to_string())
}

fn read_sysfs_hex(path: &Path) -> Result<usize> {
    let text = read_sysfs_string(path)?;
    let digits = text.strip_prefix("0x").unwrap_or(&text);
    usize::from_str_radix(digits, 16).with_context(|| format!("parsing {} as hex", path.display()))
}

/// Walks `/sys/block/<bdev>` for the two UIO devices and their maps.
fn discover(bdev_name: &str) -> Result<Vec<UioDev>> {
    let block_dir = PathBuf::from(format!("/sys/block/{bdev_name}"));
    let mut devs = Vec::new();

    for entry in std::fs::read_dir(&block_dir)
        .with_context(|| format!("listing {}", block_dir.display()))?
    {
        let entry = entry?;
        let file_name = entry.file_name();
        let dir_name = file_name.to_string_lossy();
        if !entry.path().is_dir() || !dir_name.starts_with("uio") {
            continue;
        }

        let uio_name = read_sysfs_string(&entry.path().join("name"))?;
        let kernel_to_user = if uio_name.ends_with(UIO_SUFFIX_KERNEL_TO_USER) {
            true
        } else if uio_name.ends_with(UIO_SUFFIX_USER_TO_KERNEL) {
            false
        } else {
            continue;
        };

        let mut maps = Vec::new();
        let maps_dir = entry.path().join("maps");
        for map_entry in std::fs::read_dir(&maps_dir)
            .with_context(|| format!("listing {}", maps_dir.display()))?
        {
            let map_entry = map_entry?;
            let map_file = map_entry.file_name();
            let map_dir = map_file.to_string_lossy();
            let Some(index) = map_dir.strip_prefix("map").and_then(|s| s.parse().ok()) else {
                continue;
            };
            maps.push(UioMap {
                index,
                name: read_sysfs_string(&map_entry.path().join("name"))?,
                size: read_sysfs_hex(&map_entry.path().join("size"))?,
            });
        }

        devs.push(UioDev {
            dev_path: PathBuf::from("/dev").join(&*dir_name),
            kernel_to_user,
            maps,
        });
    }

    let kernel_to_user = devs.iter().filter(|d| d.kernel_to_user).count();
    if devs.len() != 2 || kernel_to_user != 1 {
        bail!(
            "expected one kernel->user and one user->kernel UIO device under {}, found {}",
            block_dir.display(),
            devs.len()
        );
    }
    Ok(devs)
}

fn open_uio(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))
}

/// Attaches to the block device `ublk-<suffix>`: maps all four regions and
/// wires the ring endpoints over them.
pub fn attach(bdev_suffix: &str) -> Result<Device> {
    let bdev_name = format!("ublk-{bdev_suffix}");
    let devs = discover(&bdev_name)?;

    let mut cmdb: Option<Rc<MappedRegion>> = None;
    let mut cmdb_ack: Option<Rc<MappedRegion>> = None;
    let mut cellc: Option<Rc<MappedRegion>> = None;
    let mut cells: Option<Rc<MappedRegion>> = None;
    let mut k2u_fd: Option<File> = None;
    let mut u2k_fd: Option<File> = None;

    for dev in &devs {
        let fd = open_uio(&dev.dev_path)?;
        for map in &dev.maps {
            let slot = match (dev.kernel_to_user, map.name.as_str()) {
                (true, MAP_NAME_CMDB) => &mut cmdb,
                (true, MAP_NAME_CELLC) => &mut cellc,
                (true, MAP_NAME_CELLS) => &mut cells,
                (false, MAP_NAME_CMDB) => &mut cmdb_ack,
                _ => continue,
            };
            let writable = !dev.kernel_to_user || map.name == MAP_NAME_CELLS;
            *slot = Some(Rc::new(MappedRegion::map(&fd, map.size, map.index, writable)?));
        }
        if dev.kernel_to_user {
            k2u_fd = Some(fd);
        } else {
            u2k_fd = Some(fd);
        }
    }

    let cmdb = cmdb.context("no cmdb map")?;
    let cmdb_ack = cmdb_ack.context("no cmdb_ack map")?;
    let cellc = cellc.context("no cellc map")?;
    let cells = cells.context("no cells map")?;
    let k2u_fd = k2u_fd.context("no kernel->user UIO device")?;
    let u2k_fd = u2k_fd.context("no user->kernel UIO device")?;

    // SAFETY: the regions were mapped from the driver's UIO maps and begin
    // with the headers this reads; the endpoints keep Rc clones of their
    // regions alive for as long as they exist.
    unsafe { assemble(cmdb, cmdb_ack, cellc, cells, k2u_fd, u2k_fd) }
}

/// Builds the ring endpoints over already-mapped regions.
///
/// # Safety
///
/// Each region must carry the layout its name promises (see [`proto`]):
/// `cmdb` a [`CmdbHdr`] plus command slots, `cmdb_ack` a [`CmdbAckHdr`]
/// plus ack slots, `cellc` a [`CellcHdr`] plus the descriptor table, and
/// `cells` the byte arena.
///
/// [`proto`]: ublk_ring::proto
unsafe fn assemble(
    cmdb: Rc<MappedRegion>,
    cmdb_ack: Rc<MappedRegion>,
    cellc: Rc<MappedRegion>,
    cells: Rc<MappedRegion>,
    k2u_fd: File,
    u2k_fd: File,
) -> Result<Device> {
    let cmdb_hdr: CmdbHdr = cmdb.header();
    let ack_hdr: CmdbAckHdr = cmdb_ack.header();
    let cellc_hdr: CellcHdr = cellc.header();

    let cmd_slots_off = std::mem::size_of::<CmdbHdr>();
    let ack_slots_off = std::mem::size_of::<CmdbAckHdr>();
    let celld_off = std::mem::size_of::<CellcHdr>();

    if cmd_slots_off + cmdb_hdr.cmds_len as usize * std::mem::size_of::<Cmd>() > cmdb.len() {
        bail!("cmdb region too small for {} slots", cmdb_hdr.cmds_len);
    }
    if ack_slots_off + ack_hdr.cmds_len as usize * std::mem::size_of::<CmdAck>() > cmdb_ack.len() {
        bail!("cmdb_ack region too small for {} slots", ack_hdr.cmds_len);
    }
    let cellds_len = cellc_hdr.cellds_len as usize;
    if celld_off + cellds_len * std::mem::size_of::<CellDesc>() > cellc.len() {
        bail!("cellc region too small for {cellds_len} descriptors");
    }

    // The descriptor table is static device configuration: snapshot it.
    let mut cellds = vec![CellDesc::zeroed(); cellds_len];
    std::ptr::copy_nonoverlapping(
        cellc.at(celld_off).as_ptr().cast::<CellDesc>(),
        cellds.as_mut_ptr(),
        cellds_len,
    );

    // Command ring: tail is the first field of the cmdb header; the initial
    // head was published in cellc.
    let popper = Popper::new(
        cmdb.at(0).cast(),
        cmdb.at(cmd_slots_off).cast(),
        cmdb_hdr.cmds_len,
        cellc_hdr.cmdb_head,
    );

    // Ack ring: head lives in cellc (kernel-consumed), tail in cmdb_ack.
    let ack_head_off = std::mem::offset_of!(CellcHdr, cmdb_ack_head);
    let pusher = Pusher::new(
        cellc.at(ack_head_off).cast(),
        cmdb_ack.at(0).cast(),
        cmdb_ack.at(ack_slots_off).cast(),
        ack_hdr.cmds_len,
    );

    let cells_buf = IoBuf::from_raw(
        cells.ptr(),
        cells.len(),
        Rc::clone(&cells) as Rc<dyn Any>,
    );

    log::info!(
        "attached: {} command slots, {} ack slots, {} cell descriptors, {} byte arena",
        cmdb_hdr.cmds_len,
        ack_hdr.cmds_len,
        cellds_len,
        cells.len()
    );

    Ok(Device {
        cmds: CmdQueue {
            popper,
            fd: k2u_fd,
            last_events: Cell::new(0),
            _regions: vec![Rc::clone(&cmdb), Rc::clone(&cellc)],
        },
        acks: AckQueue {
            pusher,
            _regions: vec![cmdb_ack, cellc],
        },
        notifier: Rc::new(Notifier::new(u2k_fd)),
        cellds,
        cells: cells_buf,
    })
}
