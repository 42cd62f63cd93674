use std::io;

use thiserror::Error;

use crate::response::ResponseCode;

/// Errors raised by the bulk transport layer.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("an i/o error occurred: {0}")]
    Io(#[from] io::Error),

    #[error("a usb error occurred: {0}")]
    Usb(#[from] rusb::Error),

    #[error("the transport timed out")]
    Timeout,

    #[error("the endpoint stalled")]
    Stalled,

    #[error("the device was disconnected")]
    Disconnected,
}

/// Errors raised while framing containers.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("container header was truncated")]
    BadHeader,

    #[error("container length overflowed the payload")]
    LengthOverflow,

    #[error("unexpected container type {0:?}, expected {1:?}")]
    UnexpectedType(u16, &'static str),

    #[error("transaction id mismatch: expected {expected}, got {got}")]
    TxIdMismatch { expected: u32, got: u32 },

    #[error("data container code 0x{got:04x} did not match command code 0x{expected:04x}")]
    CodeMismatch { expected: u16, got: u16 },
}

/// Errors raised while packing/unpacking datasets.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unpack read past the end of the supplied buffer")]
    Truncated,

    #[error("string data was not valid UTF-16: {0}")]
    BadString(String),
}

/// The top-level error type for every operation in this crate.
#[derive(Error, Debug)]
pub enum Error {
    /// The PTP responder returned a status other than `Ok`, either a
    /// `StandardResponseCode` or a vendor-defined code.
    #[error("the ptp device returned an error code: {0:?}")]
    Response(ResponseCode),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("the data received was malformed: {0}")]
    Malformed(String),

    #[error("the data received was malformed: bad object format")]
    BadObjectFormat,

    #[error("the data received was malformed: bad association code")]
    BadAssociationCode,

    #[error("the data received was malformed: bad storage type")]
    BadStorageType,

    #[error("the data received was malformed: bad filesystem type")]
    BadFilesystemType,

    #[error("the data received was malformed: bad access capability")]
    BadAccessType,

    #[error("the data received was malformed: bad event code")]
    BadEventCode,

    #[error("received an event with no payload")]
    NoEventPayload,

    #[error("operation is not supported by this device")]
    NotSupported,

    #[error("create-handle reconciliation could not uniquely identify the new object")]
    CacheInconsistent,

    #[error("the session is not open")]
    SessionNotOpen,

    #[error("the session has been broken by a transport failure")]
    SessionBroken,

    /// Another rusb error, kept for direct calls that bypass the
    /// `Transport` trait (device/endpoint discovery).
    #[error("a usb error occurred: {0}")]
    Usb(#[from] rusb::Error),

    /// Another IO error, kept for direct calls into `std::io`.
    #[error("an i/o error occurred: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Maps a PTP response code into the POSIX errno the filesystem
    /// adapter should surface.
    pub fn to_errno(&self) -> i32 {
        use crate::response::StandardResponseCode as R;

        match self {
            Error::Response(ResponseCode::Standard(code)) => match code {
                R::ObjectWriteProtected | R::AccessDenied | R::StoreReadOnly => libc::EPERM,
                R::StoreFull => libc::ENOSPC,
                R::InvalidObjectHandle | R::InvalidStorageId | R::InvalidParentObject => {
                    libc::ENOENT
                }
                R::SessionNotOpen | R::DeviceBusy => libc::EBUSY,
                _ => libc::EIO,
            },
            Error::Response(ResponseCode::Other(_)) => libc::EIO,
            Error::Transport(_) | Error::Protocol(_) | Error::Codec(_) => libc::EIO,
            Error::SessionNotOpen | Error::SessionBroken => libc::EIO,
            Error::NotSupported => libc::ENOSYS,
            _ => libc::EIO,
        }
    }
}
