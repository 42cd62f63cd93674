//! Picture Transfer Protocol engine: framing, transaction engine,
//! session layer, and object tree/cache over a pluggable bulk
//! [`Transport`]. See `src/bin/ptp-tool.rs` and `src/fs` for the CLI
//! and FUSE adapters built on top of this crate.

#[cfg(feature = "serde")]
use serde::Serialize;

use num_traits::{FromPrimitive, ToPrimitive};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::io::Cursor;

mod command;
mod container;
mod data;
mod error;
mod event;
pub mod fs;
mod registry;
mod response;
mod session;
mod storage;
mod transaction;
mod transport;
mod tree;

pub use crate::command::*;
pub use crate::container::{
    encode_command, encode_data_container, encode_response, ContainerHeader, ContainerType,
    HEADER_SIZE,
};
pub use crate::data::{PtpData, PtpRead, PtpWrite};
pub use crate::error::{CodecError, Error, ProtocolError, TransportError};
pub use crate::event::*;
pub use crate::registry::{DeviceId, Registry, Ticket};
pub use crate::response::*;
pub use crate::session::{poll_event, Session, SessionBuilder, SessionState};
pub use crate::storage::*;
pub use crate::transaction::{BlockList, Outcome, Phase, TransactionIds};
pub use crate::transport::{
    Transport, UsbEventSource, UsbTransport, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT,
};
#[cfg(feature = "test-util")]
pub use crate::transport::fake;
pub use crate::tree::{format_extension, mime_format, CreatePolicy, Kind, NodeKey, Tree};

/// Device information dataset, returned by `GetDeviceInfo`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct DeviceInfo {
    pub version: u16,
    pub vendor_ex_id: u32,
    pub vendor_ex_version: u16,
    pub vendor_extension_desc: String,
    pub functional_mode: u16,
    pub operations_supported: Vec<u16>,
    pub events_supported: Vec<u16>,
    pub device_properties_supported: Vec<u16>,
    pub capture_formats: Vec<u16>,
    pub image_formats: Vec<u16>,
    pub manufacturer: String,
    pub model: String,
    pub device_version: String,
    pub serial_number: String,
}

impl DeviceInfo {
    pub fn decode(buf: &[u8]) -> Result<DeviceInfo, Error> {
        let mut cur = Cursor::new(buf);

        Ok(DeviceInfo {
            version: cur.read_ptp_u16()?,
            vendor_ex_id: cur.read_ptp_u32()?,
            vendor_ex_version: cur.read_ptp_u16()?,
            vendor_extension_desc: cur.read_ptp_str()?,
            functional_mode: cur.read_ptp_u16()?,
            operations_supported: cur.read_ptp_u16_vec()?,
            events_supported: cur.read_ptp_u16_vec()?,
            device_properties_supported: cur.read_ptp_u16_vec()?,
            capture_formats: cur.read_ptp_u16_vec()?,
            image_formats: cur.read_ptp_u16_vec()?,
            manufacturer: cur.read_ptp_str()?,
            model: cur.read_ptp_str()?,
            device_version: cur.read_ptp_str()?,
            serial_number: cur.read_ptp_str()?,
        })
    }
}

/// Object information dataset, returned by `GetObjectInfo` and
/// sent to `SendObjectInfo`/the EK vendor equivalent.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct ObjectInfo {
    pub storage_id: u32,
    pub object_format: ObjectFormatCode,
    pub protection_status: u16,
    pub object_compressed_size: u32,
    pub thumb_format: ObjectFormatCode,
    pub thumb_compressed_size: u32,
    pub thumb_pix_width: u32,
    pub thumb_pix_height: u32,
    pub image_pix_width: u32,
    pub image_pix_height: u32,
    pub image_bit_depth: u32,
    pub parent_object: u32,
    pub association_type: AssociationCode,
    pub association_desc: u32,
    pub sequence_number: u32,
    pub filename: String,
    pub capture_date: String,
    pub modification_date: String,
    pub keywords: String,
}

impl ObjectInfo {
    pub fn decode(buf: &[u8]) -> Result<ObjectInfo, Error> {
        let mut cur = Cursor::new(buf);

        Ok(ObjectInfo {
            storage_id: cur.read_ptp_u32()?,
            object_format: ObjectFormatCode::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadObjectFormat)?,
            protection_status: cur.read_ptp_u16()?,
            object_compressed_size: cur.read_ptp_u32()?,
            thumb_format: ObjectFormatCode::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadObjectFormat)?,
            thumb_compressed_size: cur.read_ptp_u32()?,
            thumb_pix_width: cur.read_ptp_u32()?,
            thumb_pix_height: cur.read_ptp_u32()?,
            image_pix_width: cur.read_ptp_u32()?,
            image_pix_height: cur.read_ptp_u32()?,
            image_bit_depth: cur.read_ptp_u32()?,
            parent_object: cur.read_ptp_u32()?,
            association_type: AssociationCode::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadAssociationCode)?,
            association_desc: cur.read_ptp_u32()?,
            sequence_number: cur.read_ptp_u32()?,
            filename: cur.read_ptp_str()?,
            capture_date: cur.read_ptp_str()?,
            modification_date: cur.read_ptp_str()?,
            keywords: cur.read_ptp_str()?,
        })
    }

    pub fn encode<W: WriteBytesExt>(&self, mut w: W) -> Result<(), Error> {
        w.write_ptp_u32(self.storage_id)?;
        w.write_ptp_u16(self.object_format.to_u16().unwrap())?;
        w.write_ptp_u16(self.protection_status)?;
        w.write_ptp_u32(self.object_compressed_size)?;
        w.write_ptp_u16(self.thumb_format.to_u16().unwrap())?;
        w.write_ptp_u32(self.thumb_compressed_size)?;
        w.write_ptp_u32(self.thumb_pix_width)?;
        w.write_ptp_u32(self.thumb_pix_height)?;
        w.write_ptp_u32(self.image_pix_width)?;
        w.write_ptp_u32(self.image_pix_height)?;
        w.write_ptp_u32(self.image_bit_depth)?;
        w.write_ptp_u32(self.parent_object)?;
        w.write_ptp_u16(self.association_type.to_u16().unwrap())?;
        w.write_ptp_u32(self.association_desc)?;
        w.write_ptp_u32(self.sequence_number)?;
        w.write_ptp_str(&self.filename)?;
        w.write_ptp_str(&self.capture_date)?;
        w.write_ptp_str(&self.modification_date)?;
        w.write_ptp_str(&self.keywords)?;
        Ok(())
    }
}

/// Storage information dataset, returned by `GetStorageInfo`.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct StorageInfo {
    pub storage_type: StorageType,
    pub filesystem_type: FilesystemType,
    pub access_capability: AccessType,
    pub max_capacity: u64,
    pub free_space_in_bytes: u64,
    pub free_space_in_images: u32,
    pub storage_description: String,
    pub volume_label: String,
}

impl StorageInfo {
    pub fn decode<T: PtpRead>(cur: &mut T) -> Result<StorageInfo, Error> {
        Ok(StorageInfo {
            storage_type: StorageType::from_u16(cur.read_ptp_u16()?).ok_or(Error::BadStorageType)?,
            filesystem_type: FilesystemType::from_u16(cur.read_ptp_u16()?)
                .ok_or(Error::BadFilesystemType)?,
            access_capability: AccessType::from_u16(cur.read_ptp_u16()?).ok_or(Error::BadAccessType)?,
            max_capacity: cur.read_ptp_u64()?,
            free_space_in_bytes: cur.read_ptp_u64()?,
            free_space_in_images: cur.read_ptp_u32()?,
            storage_description: cur.read_ptp_str()?,
            volume_label: cur.read_ptp_str()?,
        })
    }
}

/// A device property's current/factory value together with the form
/// describing its legal range (`GetDevicePropValue`/`PropDesc`).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum FormData {
    None,
    Range {
        min_value: PtpData,
        max_value: PtpData,
        step: PtpData,
    },
    Enumeration {
        array: Vec<PtpData>,
    },
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct PropInfo {
    pub property_code: u16,
    pub data_type: u16,
    pub get_set: u8,
    pub is_enable: u8,
    pub factory_default: PtpData,
    pub current: PtpData,
    pub form: FormData,
}

impl PropInfo {
    pub fn decode<T: PtpRead>(cur: &mut T) -> Result<PropInfo, Error> {
        let data_type;
        Ok(PropInfo {
            property_code: cur.read_u16::<LittleEndian>()?,
            data_type: {
                data_type = cur.read_u16::<LittleEndian>()?;
                data_type
            },
            get_set: cur.read_u8()?,
            is_enable: cur.read_u8()?,
            factory_default: PtpData::read_type(data_type, cur)?,
            current: PtpData::read_type(data_type, cur)?,
            form: {
                match cur.read_u8()? {
                    0x01 => FormData::Range {
                        min_value: PtpData::read_type(data_type, cur)?,
                        max_value: PtpData::read_type(data_type, cur)?,
                        step: PtpData::read_type(data_type, cur)?,
                    },
                    0x02 => FormData::Enumeration {
                        array: {
                            let len = cur.read_u16::<LittleEndian>()? as usize;
                            let mut arr = Vec::with_capacity(len);
                            for _ in 0..len {
                                arr.push(PtpData::read_type(data_type, cur)?);
                            }
                            arr
                        },
                    },
                    _ => FormData::None,
                }
            },
        })
    }
}
