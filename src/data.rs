use std::io::{Cursor, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::ToPrimitive;

use crate::error::CodecError;
use crate::Error;

/// Unpacking trait for every primitive and composite the wire format
/// uses. Implementations must never read past the end of the
/// supplied buffer; overruns are reported as `CodecError::Truncated`
/// rather than propagated as a raw I/O error.
pub trait PtpRead: ReadBytesExt {
    /// Bytes remaining to be read, used to bounds-check length prefixes
    /// before committing to a read.
    fn remaining(&self) -> usize;

    fn read_ptp_u8(&mut self) -> Result<u8, Error> {
        Ok(self.read_u8()?)
    }

    fn read_ptp_i8(&mut self) -> Result<i8, Error> {
        Ok(self.read_i8()?)
    }

    fn read_ptp_u16(&mut self) -> Result<u16, Error> {
        Ok(self.read_u16::<LittleEndian>()?)
    }

    fn read_ptp_i16(&mut self) -> Result<i16, Error> {
        Ok(self.read_i16::<LittleEndian>()?)
    }

    fn read_ptp_u32(&mut self) -> Result<u32, Error> {
        Ok(self.read_u32::<LittleEndian>()?)
    }

    fn read_ptp_i32(&mut self) -> Result<i32, Error> {
        Ok(self.read_i32::<LittleEndian>()?)
    }

    fn read_ptp_u64(&mut self) -> Result<u64, Error> {
        Ok(self.read_u64::<LittleEndian>()?)
    }

    fn read_ptp_i64(&mut self) -> Result<i64, Error> {
        Ok(self.read_i64::<LittleEndian>()?)
    }

    fn read_ptp_u128(&mut self) -> Result<(u64, u64), Error> {
        let lo = self.read_u64::<LittleEndian>()?;
        let hi = self.read_u64::<LittleEndian>()?;
        Ok((lo, hi))
    }

    fn read_ptp_i128(&mut self) -> Result<(u64, u64), Error> {
        let lo = self.read_u64::<LittleEndian>()?;
        let hi = self.read_u64::<LittleEndian>()?;
        Ok((lo, hi))
    }

    #[inline(always)]
    fn read_ptp_vec<T: Sized, U: Fn(&mut Self) -> Result<T, Error>>(
        &mut self,
        elem_size: usize,
        func: U,
    ) -> Result<Vec<T>, Error> {
        let len = self.read_u32::<LittleEndian>()? as usize;
        if len.saturating_mul(elem_size) > self.remaining() {
            return Err(CodecError::Truncated.into());
        }
        (0..len).map(|_| func(self)).collect()
    }

    fn read_ptp_u8_vec(&mut self) -> Result<Vec<u8>, Error> {
        self.read_ptp_vec(1, |cur| cur.read_ptp_u8())
    }

    fn read_ptp_i8_vec(&mut self) -> Result<Vec<i8>, Error> {
        self.read_ptp_vec(1, |cur| cur.read_ptp_i8())
    }

    fn read_ptp_u16_vec(&mut self) -> Result<Vec<u16>, Error> {
        self.read_ptp_vec(2, |cur| cur.read_ptp_u16())
    }

    fn read_ptp_i16_vec(&mut self) -> Result<Vec<i16>, Error> {
        self.read_ptp_vec(2, |cur| cur.read_ptp_i16())
    }

    fn read_ptp_u32_vec(&mut self) -> Result<Vec<u32>, Error> {
        self.read_ptp_vec(4, |cur| cur.read_ptp_u32())
    }

    fn read_ptp_i32_vec(&mut self) -> Result<Vec<i32>, Error> {
        self.read_ptp_vec(4, |cur| cur.read_ptp_i32())
    }

    fn read_ptp_u64_vec(&mut self) -> Result<Vec<u64>, Error> {
        self.read_ptp_vec(8, |cur| cur.read_ptp_u64())
    }

    fn read_ptp_i64_vec(&mut self) -> Result<Vec<i64>, Error> {
        self.read_ptp_vec(8, |cur| cur.read_ptp_i64())
    }

    fn read_ptp_u128_vec(&mut self) -> Result<Vec<(u64, u64)>, Error> {
        self.read_ptp_vec(16, |cur| cur.read_ptp_u128())
    }

    fn read_ptp_i128_vec(&mut self) -> Result<Vec<(u64, u64)>, Error> {
        self.read_ptp_vec(16, |cur| cur.read_ptp_i128())
    }

    /// Reads a length-prefixed UCS-2 string. `char_count` covers
    /// the trailing NUL, if present; `0` means an empty, NUL-less
    /// string. Non-ASCII-safe code points become the replacement
    /// character via `String::from_utf16_lossy`, rather than rejecting
    /// invalid UTF-16 outright; a malformed string from a flaky device
    /// shouldn't abort the whole unpack.
    fn read_ptp_str(&mut self) -> Result<String, Error> {
        let len = self.read_u8()? as usize;
        if len == 0 {
            return Ok(String::new());
        }
        if len.saturating_sub(1).saturating_mul(2) + 2 > self.remaining() {
            return Err(CodecError::Truncated.into());
        }
        let data: Vec<u16> = (0..(len - 1))
            .map(|_| self.read_u16::<LittleEndian>())
            .collect::<Result<Vec<_>, _>>()?;
        self.read_u16::<LittleEndian>()?; // trailing NUL
        Ok(String::from_utf16_lossy(&data))
    }

    fn expect_end(&mut self) -> Result<(), Error>;
}

impl<T: AsRef<[u8]>> PtpRead for Cursor<T> {
    fn remaining(&self) -> usize {
        let len = self.get_ref().as_ref().len() as u64;
        len.saturating_sub(self.position()) as usize
    }

    fn expect_end(&mut self) -> Result<(), Error> {
        let len = self.get_ref().as_ref().len();
        if len as u64 != self.position() {
            Err(Error::Malformed(format!(
                "response had {} trailing bytes after {} were consumed",
                len as u64 - self.position(),
                self.position()
            )))
        } else {
            Ok(())
        }
    }
}

/// Packing counterpart to `PtpRead`, used by `ObjectInfo::encode` and
/// the container layer rather than packing fields ad hoc with
/// `byteorder::WriteBytesExt` calls; this trait centralizes the same
/// little-endian conventions so pack and unpack stay in lockstep.
pub trait PtpWrite: WriteBytesExt {
    fn write_ptp_u8(&mut self, v: u8) -> Result<(), Error> {
        Ok(self.write_u8(v)?)
    }

    fn write_ptp_u16(&mut self, v: u16) -> Result<(), Error> {
        Ok(self.write_u16::<LittleEndian>(v)?)
    }

    fn write_ptp_u32(&mut self, v: u32) -> Result<(), Error> {
        Ok(self.write_u32::<LittleEndian>(v)?)
    }

    fn write_ptp_u64(&mut self, v: u64) -> Result<(), Error> {
        Ok(self.write_u64::<LittleEndian>(v)?)
    }

    /// Packs a length-prefixed UCS-2 string: empty strings
    /// pack as a single `0` byte; non-empty strings pack as
    /// `char_count` (including the trailing NUL) followed by the
    /// UTF-16 code units and a trailing NUL.
    fn write_ptp_str(&mut self, s: &str) -> Result<(), Error> {
        if s.is_empty() {
            self.write_u8(0)?;
            return Ok(());
        }
        let units: Vec<u16> = s.encode_utf16().collect();
        let char_count = (units.len() + 1) as u8;
        self.write_u8(char_count)?;
        for unit in units {
            self.write_u16::<LittleEndian>(unit)?;
        }
        self.write_u16::<LittleEndian>(0)?;
        Ok(())
    }

    fn write_ptp_u32_vec(&mut self, v: &[u32]) -> Result<(), Error> {
        self.write_u32::<LittleEndian>(v.len() as u32)?;
        for item in v {
            self.write_u32::<LittleEndian>(*item)?;
        }
        Ok(())
    }

    fn write_ptp_u16_vec(&mut self, v: &[u16]) -> Result<(), Error> {
        self.write_u32::<LittleEndian>(v.len() as u32)?;
        for item in v {
            self.write_u16::<LittleEndian>(*item)?;
        }
        Ok(())
    }
}

impl<W: WriteBytesExt> PtpWrite for W {}

#[derive(Debug, Eq, PartialEq, PartialOrd, Clone)]
pub enum PtpData {
    UNDEF,
    INT8(i8),
    UINT8(u8),
    INT16(i16),
    UINT16(u16),
    INT32(i32),
    UINT32(u32),
    INT64(i64),
    UINT64(u64),
    INT128((u64, u64)),
    UINT128((u64, u64)),
    AINT8(Vec<i8>),
    AUINT8(Vec<u8>),
    AINT16(Vec<i16>),
    AUINT16(Vec<u16>),
    AINT32(Vec<i32>),
    AUINT32(Vec<u32>),
    AINT64(Vec<i64>),
    AUINT64(Vec<u64>),
    AINT128(Vec<(u64, u64)>),
    AUINT128(Vec<(u64, u64)>),
    STR(String),
}

impl PtpData {
    pub fn encode(&self) -> Vec<u8> {
        use self::PtpData::*;
        let mut out = vec![];
        match self {
            &INT8(val) => {
                out.write_i8(val).ok();
            }
            &UINT8(val) => {
                out.write_u8(val).ok();
            }
            &INT16(val) => {
                out.write_i16::<LittleEndian>(val).ok();
            }
            &UINT16(val) => {
                out.write_u16::<LittleEndian>(val).ok();
            }
            &INT32(val) => {
                out.write_i32::<LittleEndian>(val).ok();
            }
            &UINT32(val) => {
                out.write_u32::<LittleEndian>(val).ok();
            }
            &INT64(val) => {
                out.write_i64::<LittleEndian>(val).ok();
            }
            &UINT64(val) => {
                out.write_u64::<LittleEndian>(val).ok();
            }
            &INT128((lo, hi)) => {
                out.write_u64::<LittleEndian>(lo).ok();
                out.write_u64::<LittleEndian>(hi).ok();
            }
            &UINT128((lo, hi)) => {
                out.write_u64::<LittleEndian>(lo).ok();
                out.write_u64::<LittleEndian>(hi).ok();
            }
            &AINT8(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i8(*item).ok();
                }
            }
            &AUINT8(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u8(*item).ok();
                }
            }
            &AINT16(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i16::<LittleEndian>(*item).ok();
                }
            }
            &AUINT16(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u16::<LittleEndian>(*item).ok();
                }
            }
            &AINT32(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i32::<LittleEndian>(*item).ok();
                }
            }
            &AUINT32(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u32::<LittleEndian>(*item).ok();
                }
            }
            &AINT64(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_i64::<LittleEndian>(*item).ok();
                }
            }
            &AUINT64(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for item in val {
                    out.write_u64::<LittleEndian>(*item).ok();
                }
            }
            &AINT128(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for &(lo, hi) in val {
                    out.write_u64::<LittleEndian>(lo).ok();
                    out.write_u64::<LittleEndian>(hi).ok();
                }
            }
            &AUINT128(ref val) => {
                out.write_u32::<LittleEndian>(val.len() as u32).ok();
                for &(lo, hi) in val {
                    out.write_u64::<LittleEndian>(lo).ok();
                    out.write_u64::<LittleEndian>(hi).ok();
                }
            }
            &STR(ref val) => {
                out.write_ptp_str(val).ok();
            }
            _ => {}
        }
        out
    }

    pub fn read_type<T: PtpRead>(kind: u16, reader: &mut T) -> Result<PtpData, Error> {
        use self::PtpData::*;
        Ok(match kind {
            0x0001 => INT8(reader.read_ptp_i8()?),
            0x0002 => UINT8(reader.read_ptp_u8()?),
            0x0003 => INT16(reader.read_ptp_i16()?),
            0x0004 => UINT16(reader.read_ptp_u16()?),
            0x0005 => INT32(reader.read_ptp_i32()?),
            0x0006 => UINT32(reader.read_ptp_u32()?),
            0x0007 => INT64(reader.read_ptp_i64()?),
            0x0008 => UINT64(reader.read_ptp_u64()?),
            0x0009 => INT128(reader.read_ptp_i128()?),
            0x000A => UINT128(reader.read_ptp_u128()?),
            0x4001 => AINT8(reader.read_ptp_i8_vec()?),
            0x4002 => AUINT8(reader.read_ptp_u8_vec()?),
            0x4003 => AINT16(reader.read_ptp_i16_vec()?),
            0x4004 => AUINT16(reader.read_ptp_u16_vec()?),
            0x4005 => AINT32(reader.read_ptp_i32_vec()?),
            0x4006 => AUINT32(reader.read_ptp_u32_vec()?),
            0x4007 => AINT64(reader.read_ptp_i64_vec()?),
            0x4008 => AUINT64(reader.read_ptp_u64_vec()?),
            0x4009 => AINT128(reader.read_ptp_i128_vec()?),
            0x400A => AUINT128(reader.read_ptp_u128_vec()?),
            0xFFFF => STR(reader.read_ptp_str()?),
            _ => UNDEF,
        })
    }
}

impl ToPrimitive for PtpData {
    fn to_i64(&self) -> Option<i64> {
        match self {
            PtpData::INT8(v) => Some(*v as i64),
            PtpData::UINT8(v) => Some(*v as i64),
            PtpData::INT16(v) => Some(*v as i64),
            PtpData::UINT16(v) => Some(*v as i64),
            PtpData::INT32(v) => Some(*v as i64),
            PtpData::UINT32(v) => Some(*v as i64),
            PtpData::INT64(v) => Some(*v as i64),
            _ => None,
        }
    }

    fn to_u64(&self) -> Option<u64> {
        match self {
            PtpData::UINT8(v) => Some(*v as u64),
            PtpData::UINT16(v) => Some(*v as u64),
            PtpData::UINT32(v) => Some(*v as u64),
            PtpData::UINT64(v) => Some(*v as u64),
            _ => None,
        }
    }
}

impl From<i8> for PtpData {
    fn from(value: i8) -> Self {
        PtpData::INT8(value)
    }
}

impl From<u8> for PtpData {
    fn from(value: u8) -> Self {
        PtpData::UINT8(value)
    }
}

impl From<i16> for PtpData {
    fn from(value: i16) -> Self {
        PtpData::INT16(value)
    }
}

impl From<u16> for PtpData {
    fn from(value: u16) -> Self {
        PtpData::UINT16(value)
    }
}

impl From<i32> for PtpData {
    fn from(value: i32) -> Self {
        PtpData::INT32(value)
    }
}

impl From<u32> for PtpData {
    fn from(value: u32) -> Self {
        PtpData::UINT32(value)
    }
}

impl From<i64> for PtpData {
    fn from(value: i64) -> Self {
        PtpData::INT64(value)
    }
}

impl From<u64> for PtpData {
    fn from(value: u64) -> Self {
        PtpData::UINT64(value)
    }
}

impl<'a> From<&'a str> for PtpData {
    fn from(value: &'a str) -> Self {
        PtpData::STR(value.to_owned())
    }
}

impl From<String> for PtpData {
    fn from(value: String) -> Self {
        PtpData::STR(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_round_trip() {
        let mut buf = vec![];
        buf.write_ptp_str("FILE.JPG").unwrap();
        assert_eq!(
            buf,
            vec![
                0x08, 0x46, 0x00, 0x49, 0x00, 0x4C, 0x00, 0x45, 0x00, 0x2E, 0x00, 0x4A, 0x00,
                0x50, 0x00, 0x47, 0x00, 0x00, 0x00
            ]
        );
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.read_ptp_str().unwrap(), "FILE.JPG");
    }

    #[test]
    fn empty_str_round_trip() {
        let mut buf = vec![];
        buf.write_ptp_str("").unwrap();
        assert_eq!(buf, vec![0x00]);
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.read_ptp_str().unwrap(), "");
    }

    #[test]
    fn u32_vec_round_trip() {
        let mut buf = vec![];
        buf.write_ptp_u32_vec(&[1, 2, 3]).unwrap();
        let mut cur = Cursor::new(&buf);
        assert_eq!(cur.read_ptp_u32_vec().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn empty_array_encodes_length_prefix_only() {
        let mut buf = vec![];
        buf.write_ptp_u32_vec(&[]).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }

    #[test]
    fn truncated_vec_is_an_error() {
        // claims 10 elements but the buffer only holds 1
        let buf = vec![10, 0, 0, 0, 0xAB];
        let mut cur = Cursor::new(&buf);
        match cur.read_ptp_u32_vec() {
            Err(Error::Codec(CodecError::Truncated)) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn truncated_string_is_an_error() {
        // claims char_count=8 (7 code units + NUL) but buffer is short
        let buf = vec![8, 0x46, 0x00];
        let mut cur = Cursor::new(&buf);
        match cur.read_ptp_str() {
            Err(Error::Codec(CodecError::Truncated)) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }
}
