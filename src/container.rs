//! Container framing: encode/decode of the three wire container
//! kinds, kept separate from transaction state so framing
//! has its own module the way `command`/`response`/`event` do.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

#[cfg(feature = "serde")]
use serde::Serialize;

use crate::error::ProtocolError;
use crate::Error;

pub const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[cfg_attr(feature = "serde", derive(Serialize))]
#[repr(u16)]
pub enum ContainerType {
    Command = 1,
    Data = 2,
    Response = 3,
    Event = 4,
}

/// A parsed 12-byte container header. Never allocates; the
/// payload is read separately by the transaction engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerHeader {
    /// total bytes the peer must consume for this container, header
    /// included (`length` on the wire).
    pub length: u32,
    pub kind: ContainerType,
    pub code: u16,
    pub transaction_id: u32,
}

impl ContainerHeader {
    /// Bytes of payload following this header, per `length`.
    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }

    pub fn belongs_to(&self, tid: u32) -> bool {
        self.transaction_id == tid
    }

    /// Decodes a 12-byte header from `buf`. Borrows; never allocates.
    pub fn decode(buf: &[u8]) -> Result<ContainerHeader, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::BadHeader.into());
        }
        let mut cur = buf;
        let length = cur.read_u32::<LittleEndian>()?;
        if (length as usize) < HEADER_SIZE {
            return Err(ProtocolError::LengthOverflow.into());
        }
        let kind_u16 = cur.read_u16::<LittleEndian>()?;
        let kind = ContainerType::from_u16(kind_u16)
            .ok_or(ProtocolError::UnexpectedType(kind_u16, "Command|Data|Response|Event"))?;
        let code = cur.read_u16::<LittleEndian>()?;
        let transaction_id = cur.read_u32::<LittleEndian>()?;

        Ok(ContainerHeader {
            length,
            kind,
            code,
            transaction_id,
        })
    }
}

/// Encodes a command container: 12-byte header followed by 0-5 `u32`
/// parameters, packed contiguously.
pub fn encode_command(code: u16, transaction_id: u32, params: &[u32]) -> Vec<u8> {
    assert!(params.len() <= 5, "a command carries at most 5 parameters");
    let length = (HEADER_SIZE + params.len() * 4) as u32;
    let mut buf = Vec::with_capacity(length as usize);
    buf.write_u32::<LittleEndian>(length).ok();
    buf.write_u16::<LittleEndian>(ContainerType::Command as u16).ok();
    buf.write_u16::<LittleEndian>(code).ok();
    buf.write_u32::<LittleEndian>(transaction_id).ok();
    for p in params {
        buf.write_u32::<LittleEndian>(*p).ok();
    }
    buf
}

/// Encodes a data container header followed by `payload`. Callers that
/// need to stream a large payload across multiple bulk writes should
/// use this for the first chunk only and append raw bytes afterward.
pub fn encode_data_container(code: u16, transaction_id: u32, payload: &[u8]) -> Vec<u8> {
    let length = (HEADER_SIZE + payload.len()) as u32;
    let mut buf = Vec::with_capacity(length as usize);
    buf.write_u32::<LittleEndian>(length).ok();
    buf.write_u16::<LittleEndian>(ContainerType::Data as u16).ok();
    buf.write_u16::<LittleEndian>(code).ok();
    buf.write_u32::<LittleEndian>(transaction_id).ok();
    buf.extend_from_slice(payload);
    buf
}

/// Encodes a response container with 0-5 parameters (used by tests
/// that simulate a peer).
pub fn encode_response(code: u16, transaction_id: u32, params: &[u32]) -> Vec<u8> {
    assert!(params.len() <= 5, "a response carries at most 5 parameters");
    let length = (HEADER_SIZE + params.len() * 4) as u32;
    let mut buf = Vec::with_capacity(length as usize);
    buf.write_u32::<LittleEndian>(length).ok();
    buf.write_u16::<LittleEndian>(ContainerType::Response as u16).ok();
    buf.write_u16::<LittleEndian>(code).ok();
    buf.write_u32::<LittleEndian>(transaction_id).ok();
    for p in params {
        buf.write_u32::<LittleEndian>(*p).ok();
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_header_round_trips() {
        let encoded = encode_command(0x1002, 0, &[1]);
        assert_eq!(
            encoded,
            vec![0x10, 0x00, 0x00, 0x00, 0x01, 0x00, 0x02, 0x10, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
        let header = ContainerHeader::decode(&encoded[..HEADER_SIZE]).unwrap();
        assert_eq!(header.length as usize, encoded.len());
        assert_eq!(header.kind, ContainerType::Command);
        assert_eq!(header.code, 0x1002);
        assert_eq!(header.transaction_id, 0);
    }

    #[test]
    fn header_too_short_is_bad_header() {
        let buf = [0u8; 4];
        match ContainerHeader::decode(&buf) {
            Err(Error::Protocol(ProtocolError::BadHeader)) => {}
            other => panic!("expected BadHeader, got {:?}", other),
        }
    }

    #[test]
    fn length_below_header_size_is_length_overflow() {
        let mut buf = vec![0u8; 12];
        buf[0] = 4; // length = 4, less than HEADER_SIZE
        match ContainerHeader::decode(&buf) {
            Err(Error::Protocol(ProtocolError::LengthOverflow)) => {}
            other => panic!("expected LengthOverflow, got {:?}", other),
        }
    }

    #[test]
    fn unknown_type_is_unexpected_type() {
        let mut buf = vec![0u8; 12];
        buf[0..4].copy_from_slice(&12u32.to_le_bytes());
        buf[4..6].copy_from_slice(&9u16.to_le_bytes());
        match ContainerHeader::decode(&buf) {
            Err(Error::Protocol(ProtocolError::UnexpectedType(9, _))) => {}
            other => panic!("expected UnexpectedType, got {:?}", other),
        }
    }

    /// GetStorageIDs data container carrying one id.
    #[test]
    fn storage_ids_data_container_scenario() {
        let bytes: [u8; 20] = [
            0x14, 0x00, 0x00, 0x00, 0x02, 0x00, 0x04, 0x10, 0x01, 0x00, 0x00, 0x00, 0x01, 0x00,
            0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
        ];
        let header = ContainerHeader::decode(&bytes[..HEADER_SIZE]).unwrap();
        assert_eq!(header.kind, ContainerType::Data);
        assert_eq!(header.code, 0x1004);
        assert_eq!(header.transaction_id, 1);
        assert_eq!(header.payload_len(), 8);
    }
}
