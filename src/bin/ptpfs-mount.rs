//! FUSE mount binary: opens the first
//! Still Image class USB device found, wires it into a [`PtpFilesystem`],
//! and hands it to `fuser::mount2`. Mirrors the original kernel module's
//! `uid=`/`gid=` superblock option, exposed here as plain `clap` flags
//! instead of an `-o` mount-option string.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use ptpfs::{DeviceId, Registry, Session, SessionBuilder, UsbTransport};

#[derive(Parser)]
#[clap(name = "ptpfs-mount", about = "Mounts a PTP/USB device as a FUSE filesystem")]
struct Cli {
    /// Directory to mount the device's object tree onto.
    mountpoint: PathBuf,

    /// Owner uid applied to every reported file (defaults to the caller's).
    #[clap(long)]
    uid: Option<u32>,

    /// Owner gid applied to every reported file (defaults to the caller's).
    #[clap(long)]
    gid: Option<u32>,

    /// Let other users on the system access the mount.
    #[clap(long)]
    allow_other: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("ptpfs-mount: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), ptpfs::Error> {
    let transport = open_ptp_device()?;
    let session = SessionBuilder::new().open(transport)?;

    info!(
        "mounting {:?} as {:?}",
        session.device_info().map(|d| d.model.as_str()).unwrap_or("?"),
        cli.mountpoint
    );

    // One registry per process; a single ticket is enough for a single
    // mount, but reusing the registry means a future second consumer of
    // the same device can
    // share the session instead of opening a second one.
    let registry: Registry<Session<UsbTransport<rusb::Context>>> = Registry::new();
    let ticket = registry.insert(DeviceId(0), session);

    let uid = cli.uid.unwrap_or_else(|| unsafe { libc::getuid() });
    let gid = cli.gid.unwrap_or_else(|| unsafe { libc::getgid() });

    let fs = ptpfs::fs::PtpFilesystem::new(ticket, uid, gid);

    // Not `MountOption::RO`: this filesystem supports write, create, mkdir, and
    // unlink support, so the kernel must be allowed to pass writes
    // through to `Filesystem::write`/`create`/`mkdir`/`unlink`.
    let mut options = vec![fuser::MountOption::FSName("ptpfs".to_owned())];
    if cli.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }

    fuser::mount2(fs, &cli.mountpoint, &options).map_err(std::io::Error::from)?;
    Ok(())
}

/// Finds the first attached device exposing a Still Image (class 6)
/// interface and claims it, mirroring `ptp-tool`'s device discovery.
fn open_ptp_device() -> Result<UsbTransport<rusb::Context>, ptpfs::Error> {
    let context = rusb::Context::new()?;
    for device in context.devices()?.iter() {
        let config = match device.active_config_descriptor() {
            Ok(c) => c,
            Err(_) => continue,
        };
        let is_still_image = config
            .interfaces()
            .flat_map(|i| i.descriptors())
            .any(|d| d.class_code() == 6);
        if !is_still_image {
            continue;
        }

        let handle = Arc::new(device.open()?);
        return Ok(UsbTransport::new(handle)?);
    }
    Err(rusb::Error::NotFound.into())
}
