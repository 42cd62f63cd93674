//! Command-line PTP dumper with a `-u/-i/-l/-d` switch set. `-u` walks
//! the USB bus without opening a PTP session; `-i`/`-l`/`-d` open one
//! against the first Still Image class device found.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use clap::Parser;
use log::{info, warn};
use num_traits::ToPrimitive;

use ptpfs::{
    AssociationCode, Error, ObjectFormatCode, ObjectHandle, ObjectInfo, ResponseCode, Session,
    SessionBuilder, StandardAssociationCode, StandardObjectFormatCode, StorageId, Transport,
    UsbTransport,
};

#[derive(Parser)]
#[clap(name = "ptp-tool", about = "Picture Transfer Protocol command-line client")]
struct Cli {
    /// List USB devices and their interfaces without opening a PTP session.
    #[clap(short = 'u', long = "list-usb")]
    list_usb: bool,

    /// Open a session and print device + storage information.
    #[clap(short = 'i', long = "info")]
    info: bool,

    /// List every object across all storages.
    #[clap(short = 'l', long = "list")]
    list: bool,

    /// Like `-l`, additionally downloading every object over 1024 bytes
    /// into the current directory.
    #[clap(short = 'd', long = "download")]
    download: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("ptp-tool: {}", e);
        std::process::exit(exit_code_for(&e));
    }
}

/// A PTP response code exits with that code masked into a byte; any
/// other failure (transport/protocol/local I/O) exits with `-errno`.
fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Response(code) => {
            let raw = match code {
                ResponseCode::Standard(c) => c.to_u16().unwrap_or(0),
                ResponseCode::Other(n) => *n,
            };
            (raw & 0xFF) as i32
        }
        other => -other.to_errno(),
    }
}

fn run(cli: &Cli) -> Result<(), Error> {
    if cli.list_usb {
        return list_usb_devices();
    }

    let transport = open_ptp_device()?;
    let mut session = SessionBuilder::new().open(transport)?;

    if cli.info {
        print_device_info(&mut session)?;
        session.close_session()?;
        return Ok(());
    }

    if cli.list || cli.download {
        let storages = session.get_storage_ids()?;
        for storage in storages.into_iter().filter(|s| s.is_attached()) {
            let mut objects = Vec::new();
            collect_objects(&mut session, storage, ObjectHandle::root(), &mut objects)?;
            for (handle, info) in objects {
                print_listing_line(&info);
                if cli.download && info.object_compressed_size > 1024 {
                    download_object(&mut session, handle, &info)?;
                }
            }
        }
        session.close_session()?;
        return Ok(());
    }

    Ok(())
}

/// Walks `parent`'s children, recursing into folders (Association /
/// GenericFolder objects) and collecting every plain file, matching
/// `mmptp.cpp`'s flat object listing across a storage's hierarchy.
fn collect_objects<T: Transport>(
    session: &mut Session<T>,
    storage: StorageId,
    parent: ObjectHandle,
    out: &mut Vec<(ObjectHandle, ObjectInfo)>,
) -> Result<(), Error> {
    let handles = session.get_object_handles(storage, None, Some(parent))?;
    for handle in handles {
        let info = session.get_object_info(handle)?;
        let is_dir = matches!(
            (info.object_format, info.association_type),
            (
                ObjectFormatCode::Standard(StandardObjectFormatCode::Association),
                AssociationCode::Standard(StandardAssociationCode::GenericFolder)
            )
        );
        if is_dir {
            collect_objects(session, storage, handle, out)?;
        } else {
            out.push((handle, info));
        }
    }
    Ok(())
}

fn print_listing_line(info: &ObjectInfo) {
    println!(
        "{} {:>10} {} {} {}x{}x{} {}",
        permission_string(info.protection_status),
        info.object_compressed_size,
        timestamped_name(info),
        info.filename,
        info.image_pix_width,
        info.image_pix_height,
        info.image_bit_depth,
        format_name(info.object_format),
    );
}

/// Maps `ObjectInfo.protection_status` to an `ls`-style permission
/// string (`0x0000` unprotected, anything else read-only).
fn permission_string(protection_status: u16) -> &'static str {
    if protection_status == 0 {
        "-rw-r--r--"
    } else {
        "-r--r--r--"
    }
}

fn format_name(format: ObjectFormatCode) -> String {
    use StandardObjectFormatCode::*;
    match format {
        ObjectFormatCode::Standard(Association) => "Folder".to_owned(),
        ObjectFormatCode::Standard(Text) => "Text".to_owned(),
        ObjectFormatCode::Standard(Html) => "HTML".to_owned(),
        ObjectFormatCode::Standard(Mp3) => "MP3".to_owned(),
        ObjectFormatCode::Standard(Wav) => "WAV".to_owned(),
        ObjectFormatCode::Standard(Avi) => "AVI".to_owned(),
        ObjectFormatCode::Standard(Mpeg) => "MPEG".to_owned(),
        ObjectFormatCode::Standard(Asf) => "ASF".to_owned(),
        ObjectFormatCode::Standard(ExifJpeg) => "JPEG".to_owned(),
        ObjectFormatCode::Standard(Tiff) | ObjectFormatCode::Standard(TiffEp) => "TIFF".to_owned(),
        ObjectFormatCode::Standard(Bmp) => "BMP".to_owned(),
        ObjectFormatCode::Standard(Gif) => "GIF".to_owned(),
        ObjectFormatCode::Standard(Png) => "PNG".to_owned(),
        ObjectFormatCode::Standard(UndefinedNonImage) => "Unknown".to_owned(),
        ObjectFormatCode::Vendor(n) => format!("Vendor(0x{:04x})", n),
        ObjectFormatCode::Reserved(n) => format!("Reserved(0x{:04x})", n),
        _ => format!("0x{:04x}", ptp_format_code(format)),
    }
}

fn ptp_format_code(format: ObjectFormatCode) -> u16 {
    format.to_u16().unwrap_or(0)
}

/// Builds a download filename stamped with `capture_date`, else
/// `modification_date`, else the local clock, with the device's own
/// filename appended.
fn timestamped_name(info: &ObjectInfo) -> String {
    let stamp = parse_ptp_date(&info.capture_date)
        .or_else(|| parse_ptp_date(&info.modification_date))
        .unwrap_or_else(|| Local::now().naive_local());
    format!("{}_{}", stamp.format("%Y%m%d_%H%M%S"), info.filename)
}

fn parse_ptp_date(s: &str) -> Option<NaiveDateTime> {
    if s.len() < 15 {
        return None;
    }
    NaiveDateTime::parse_from_str(&s[..15], "%Y%m%dT%H%M%S").ok()
}

fn download_object<T: Transport>(
    session: &mut Session<T>,
    handle: ObjectHandle,
    info: &ObjectInfo,
) -> Result<(), Error> {
    let blocks = session.get_object(handle)?;
    let path = timestamped_name(info);

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o644)
        .open(&path)?;
    for block in blocks.blocks() {
        file.write_all(block)?;
    }
    info!("downloaded {} ({} bytes)", path, blocks.len());
    Ok(())
}

fn print_device_info<T: Transport>(session: &mut Session<T>) -> Result<(), Error> {
    let info = match session.device_info() {
        Some(info) => info.clone(),
        None => session.get_device_info()?,
    };

    println!("Standard version: {}", info.version);
    println!(
        "Vendor extension: id=0x{:08x} version={} desc={}",
        info.vendor_ex_id, info.vendor_ex_version, info.vendor_extension_desc
    );
    println!("Functional mode: 0x{:04x}", info.functional_mode);
    println!("Operations supported: {}", format_code_list(&info.operations_supported));
    println!("Events supported: {}", format_code_list(&info.events_supported));
    println!("Device properties supported: {}", format_code_list(&info.device_properties_supported));
    println!("Capture formats: {}", format_code_list(&info.capture_formats));
    println!("Image formats: {}", format_code_list(&info.image_formats));
    println!("Manufacturer: {}", info.manufacturer);
    println!("Model: {}", info.model);
    println!("Device version: {}", info.device_version);
    println!("Serial number: {}", info.serial_number);

    for storage in session.get_storage_ids()?.into_iter().filter(|s| s.is_attached()) {
        match session.get_storage_info(storage) {
            Ok(s) => {
                println!("--- storage {} ---", storage);
                println!("  type: {:?}", s.storage_type);
                println!("  filesystem type: {:?}", s.filesystem_type);
                println!("  access capability: {:?}", s.access_capability);
                println!("  capacity: {} bytes", s.max_capacity);
                println!("  free: {} bytes ({} images)", s.free_space_in_bytes, s.free_space_in_images);
                println!("  description: {}", s.storage_description);
                println!("  volume label: {}", s.volume_label);
            }
            Err(e) => warn!("storage {} info unavailable: {}", storage, e),
        }
    }

    Ok(())
}

fn format_code_list(codes: &[u16]) -> String {
    codes
        .iter()
        .map(|c| format!("0x{:04x}", c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Walks every bus/device, printing the
/// Still Image interface(s) found the way `mmptp.cpp`'s `list_devices`
/// does. Needs no PTP session.
fn list_usb_devices() -> Result<(), Error> {
    let context = rusb::Context::new()?;
    for device in context.devices()?.iter() {
        let descriptor = device.device_descriptor()?;
        println!(
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            device.bus_number(),
            device.address(),
            descriptor.vendor_id(),
            descriptor.product_id()
        );

        let config = match device.active_config_descriptor() {
            Ok(c) => c,
            Err(e) => {
                warn!("  (could not read config descriptor: {})", e);
                continue;
            }
        };
        for interface in config.interfaces() {
            for desc in interface.descriptors() {
                println!(
                    "  interface {} class=0x{:02x} subclass=0x{:02x} protocol=0x{:02x}{}",
                    desc.interface_number(),
                    desc.class_code(),
                    desc.sub_class_code(),
                    desc.protocol_code(),
                    if desc.class_code() == 6 { " (Still Image)" } else { "" }
                );
            }
        }
    }
    Ok(())
}

/// Finds the first attached device exposing a Still Image (class 6)
/// interface and claims it, the way `mmptp.cpp`'s `acquire_camera` picks
/// the first PTP-capable device rather than requiring the caller name one.
fn open_ptp_device() -> Result<UsbTransport<rusb::Context>, Error> {
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
