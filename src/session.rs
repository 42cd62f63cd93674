//! Session layer: opens/closes a PTP session over the
//! transaction engine, caches device-info capability bits, and exposes
//! typed operation wrappers in place of bare
//! inherent methods.

use std::io::Cursor;

use log::{debug, trace, warn};
use num_traits::ToPrimitive;

use crate::command::{ek, StandardCommandCode};
use crate::data::{PtpRead, PtpWrite};
use crate::response::{ResponseCode, StandardResponseCode};
use crate::storage::{ObjectFormatCode, ObjectHandle, StorageId};
use crate::transaction::{self, BlockList, Phase, TransactionIds};
use crate::transport::Transport;
use crate::{DeviceInfo, Error, ObjectInfo, StorageInfo};

/// Session state machine. `Open -> Broken` happens on a
/// transport-level failure; a broken session must be closed and
/// reopened by the caller, there is no in-place recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
    Broken,
}

/// Builds a [`Session`], exposing whether to pre-probe device info
/// before `OpenSession` as an explicit flag rather than hard-wiring it.
pub struct SessionBuilder {
    pre_probe: bool,
    session_id: u32,
}

impl SessionBuilder {
    pub fn new() -> SessionBuilder {
        SessionBuilder {
            pre_probe: false,
            session_id: 1,
        }
    }

    /// When set, issues one `GetDeviceInfo` in the `Closed` state before
    /// `OpenSession`. Some devices lock up on `OpenSession` without
    /// this; default off since most don't need it.
    pub fn pre_probe(mut self, yes: bool) -> SessionBuilder {
        self.pre_probe = yes;
        self
    }

    pub fn session_id(mut self, id: u32) -> SessionBuilder {
        self.session_id = id;
        self
    }

    pub fn open<T: Transport>(self, transport: T) -> Result<Session<T>, Error> {
        let mut session = Session {
            transport,
            ids: TransactionIds::new(),
            state: SessionState::Closed,
            device_info: None,
            prefer_ek: false,
        };

        if self.pre_probe {
            debug!("pre-probing device info before OpenSession");
            let tid = session.ids.next();
            let _ = session.run_raw(tid, StandardCommandCode::GetDeviceInfo.to_u16().unwrap(), &[], Phase::Receive)?;
        }

        // OpenSession's request must set session_id = 0, tx_id = 0:
        // the single parameter is the session id being opened, not the
        // container's transaction_id.
        session.state = SessionState::Opening;
        session.run_at(
            0,
            StandardCommandCode::OpenSession.to_u16().unwrap(),
            &[self.session_id],
            Phase::NoData,
        )?;
        session.state = SessionState::Open;

        let info = session.get_device_info()?;
        session.prefer_ek = info.operations_supported.contains(&ek::SEND_FILE_OBJECT_INFO)
            && info.operations_supported.contains(&ek::SEND_FILE_OBJECT);
        session.device_info = Some(info);

        Ok(session)
    }
}

/// A typed wrapper around the transaction engine: tracks session
/// state, allocates transaction ids, and maps response codes to errors.
pub struct Session<T: Transport> {
    transport: T,
    ids: TransactionIds,
    state: SessionState,
    device_info: Option<DeviceInfo>,
    /// Cached once per session: prefer the EK vendor `SendFileObjectInfo`
    /// / `SendFileObject` pair over the standard opcodes.
    prefer_ek: bool,
}

impl<T: Transport> Session<T> {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device_info(&self) -> Option<&DeviceInfo> {
        self.device_info.as_ref()
    }

    fn require_open(&self) -> Result<(), Error> {
        match self.state {
            SessionState::Open => Ok(()),
            SessionState::Broken => Err(Error::SessionBroken),
            _ => Err(Error::SessionNotOpen),
        }
    }

    /// Runs one transaction at the next allocated transaction id,
    /// mapping any transport/protocol failure to `Broken`: a
    /// timeout or disconnect aborts the transaction and the session has
    /// no in-core recovery.
    fn run(&mut self, code: u16, params: &[u32], phase: Phase) -> Result<BlockList, Error> {
        let tid = self.ids.next();
        self.run_at(tid, code, params, phase)
    }

    /// Like `run`, but at a caller-chosen transaction id. Only
    /// `OpenSession` needs this directly: its request is pinned
    /// to `tx_id = 0`, bypassing the allocator entirely.
    fn run_at(&mut self, tid: u32, code: u16, params: &[u32], phase: Phase) -> Result<BlockList, Error> {
        match self.run_raw(tid, code, params, phase) {
            Ok(outcome) => Ok(outcome),
            // A transport failure or a protocol desync (stale tx_id,
            // mismatched data code, an unexpected container type where
            // a response was due) both leave the half-duplex pipe in
            // an unknown state: there is no in-core recovery from
            // either, so both break the session (spec §4.7/§5/§8 S6).
            Err(e @ Error::Transport(_)) | Err(e @ Error::Protocol(_)) => {
                self.state = SessionState::Broken;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn run_raw(&mut self, tid: u32, code: u16, params: &[u32], phase: Phase) -> Result<BlockList, Error> {
        trace!("run 0x{:04x} tid={} params={:?}", code, tid, params);
        let outcome = transaction::run(&self.transport, code, tid, params, phase)?;

        let response: ResponseCode =
            num_traits::FromPrimitive::from_u16(outcome.response_code).unwrap_or(ResponseCode::Other(outcome.response_code));

        match response {
            ResponseCode::Standard(StandardResponseCode::Ok) => Ok(outcome.data),
            other => {
                warn!("0x{:04x} failed with response {:?}", code, other);
                Err(Error::Response(other))
            }
        }
    }

    pub fn get_device_info(&mut self) -> Result<DeviceInfo, Error> {
        let data = self.run(StandardCommandCode::GetDeviceInfo.to_u16().unwrap(), &[], Phase::Receive)?;
        let info = DeviceInfo::decode(&data.into_contiguous())?;
        debug!("device_info {:?}", info);
        Ok(info)
    }

    pub fn close_session(&mut self) -> Result<(), Error> {
        self.require_open()?;
        self.state = SessionState::Closing;
        self.run(StandardCommandCode::CloseSession.to_u16().unwrap(), &[], Phase::NoData)?;
        self.state = SessionState::Closed;
        Ok(())
    }

    pub fn get_storage_ids(&mut self) -> Result<Vec<StorageId>, Error> {
        self.require_open()?;
        let data = self.run(StandardCommandCode::GetStorageIDs.to_u16().unwrap(), &[], Phase::Receive)?;
        let mut cur = Cursor::new(data.into_contiguous());
        let ids = cur.read_ptp_u32_vec()?;
        cur.expect_end()?;
        Ok(ids.into_iter().map(StorageId::from_raw).collect())
    }

    pub fn get_storage_info(&mut self, id: StorageId) -> Result<StorageInfo, Error> {
        self.require_open()?;
        let data = self.run(
            StandardCommandCode::GetStorageInfo.to_u16().unwrap(),
            &[id.raw()],
            Phase::Receive,
        )?;
        let mut cur = Cursor::new(data.into_contiguous());
        let info = StorageInfo::decode(&mut cur)?;
        cur.expect_end()?;
        Ok(info)
    }

    /// `format_filter = None` matches any format; `parent = None`
    /// returns every object in the storage rather than scoping to one
    /// directory.
    pub fn get_object_handles(
        &mut self,
        storage: StorageId,
        format_filter: Option<ObjectFormatCode>,
        parent: Option<ObjectHandle>,
    ) -> Result<Vec<ObjectHandle>, Error> {
        self.require_open()?;
        let data = self.run(
            StandardCommandCode::GetObjectHandles.to_u16().unwrap(),
            &[
                storage.raw(),
                format_filter.map_or(0, |f| f.to_u32().unwrap_or(0)),
                parent.map_or(0, |p| p.raw()),
            ],
            Phase::Receive,
        )?;
        let mut cur = Cursor::new(data.into_contiguous());
        let handles = cur.read_ptp_u32_vec()?;
        cur.expect_end()?;
        Ok(handles.into_iter().map(ObjectHandle::from_raw).collect())
    }

    pub fn get_num_objects(
        &mut self,
        storage: Option<StorageId>,
        format_filter: Option<ObjectFormatCode>,
        parent: Option<ObjectHandle>,
    ) -> Result<u32, Error> {
        self.require_open()?;
        let data = self.run(
            StandardCommandCode::GetNumObjects.to_u16().unwrap(),
            &[
                storage.map_or(0xFFFFFFFF, |s| s.raw()),
                format_filter.map_or(0, |f| f.to_u32().unwrap_or(0)),
                parent.map_or(0, |p| p.raw()),
            ],
            Phase::Receive,
        )?;
        let mut cur = Cursor::new(data.into_contiguous());
        let n = cur.read_ptp_u32()?;
        cur.expect_end()?;
        Ok(n)
    }

    pub fn get_object_info(&mut self, handle: ObjectHandle) -> Result<ObjectInfo, Error> {
        self.require_open()?;
        let data = self.run(
            StandardCommandCode::GetObjectInfo.to_u16().unwrap(),
            &[handle.raw()],
            Phase::Receive,
        )?;
        ObjectInfo::decode(&data.into_contiguous())
    }

    /// Downloads an object as a block list; the caller decides
    /// whether to materialize it contiguously or stream it.
    pub fn get_object(&mut self, handle: ObjectHandle) -> Result<BlockList, Error> {
        self.require_open()?;
        self.run(StandardCommandCode::GetObject.to_u16().unwrap(), &[handle.raw()], Phase::Receive)
    }

    pub fn get_partial_object(
        &mut self,
        handle: ObjectHandle,
        offset: u32,
        size: u32,
    ) -> Result<BlockList, Error> {
        self.require_open()?;
        self.run(
            StandardCommandCode::GetPartialObject.to_u16().unwrap(),
            &[handle.raw(), offset, size],
            Phase::Receive,
        )
    }

    /// Prefers the EK vendor opcode when the device advertised support
    /// for it at session-open time.
    pub fn send_object_info(
        &mut self,
        storage: StorageId,
        parent: ObjectHandle,
        info: &ObjectInfo,
    ) -> Result<(StorageId, ObjectHandle, ObjectHandle), Error> {
        self.require_open()?;
        let mut payload = Vec::new();
        info.encode(&mut payload)?;

        let code = if self.prefer_ek {
            ek::SEND_FILE_OBJECT_INFO
        } else {
            StandardCommandCode::SendObjectInfo.to_u16().unwrap()
        };

        let data = self.run(code, &[storage.raw(), parent.raw()], Phase::Send(&payload))?;
        // The device echoes {storage, parent, handle}; some devices send
        // no data phase at all for this response shape, so tolerate an
        // empty block list and report handle 0 for later reconciliation.
        if data.is_empty() {
            return Ok((storage, parent, ObjectHandle::from_raw(0)));
        }
        let mut cur = Cursor::new(data.into_contiguous());
        let storage_id = StorageId::from_raw(cur.read_ptp_u32()?);
        let parent_handle = ObjectHandle::from_raw(cur.read_ptp_u32()?);
        let handle = ObjectHandle::from_raw(cur.read_ptp_u32()?);
        Ok((storage_id, parent_handle, handle))
    }

    pub fn send_object(&mut self, payload: &[u8]) -> Result<(), Error> {
        self.require_open()?;
        let code = if self.prefer_ek {
            ek::SEND_FILE_OBJECT
        } else {
            StandardCommandCode::SendObject.to_u16().unwrap()
        };
        self.run(code, &[], Phase::Send(payload))?;
        Ok(())
    }

    pub fn delete_object(&mut self, handle: ObjectHandle) -> Result<(), Error> {
        self.require_open()?;
        self.run(
            StandardCommandCode::DeleteObject.to_u16().unwrap(),
            &[handle.raw(), 0],
            Phase::NoData,
        )?;
        Ok(())
    }
}

/// Narrow passthrough to the interrupt-endpoint event channel.
/// Nothing in the CLI or FUSE adapter calls this; it exists so a
/// caller could drain events without the engine building a consumer
/// loop around it. Only meaningful for transports that expose an
/// interrupt endpoint, which is why it's free-standing
/// rather than a `Session` method bound to the bulk-only `Transport`.
pub fn poll_event<R: crate::event::EventSource>(
    source: &R,
    timeout: std::time::Duration,
) -> Result<Option<crate::event::Event>, Error> {
    source.poll(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container;
    use crate::transport::fake::FakeTransport;

    fn device_info_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_ptp_u16(100).unwrap(); // standard_version
        buf.write_ptp_u32(0).unwrap(); // vendor_ex_id
        buf.write_ptp_u16(0).unwrap(); // vendor_ex_version
        buf.write_ptp_str("").unwrap(); // vendor_extension_desc
        buf.write_ptp_u16(0).unwrap(); // functional_mode
        buf.write_ptp_u16_vec(&[0x1001, 0x1002, 0x1009]).unwrap(); // operations_supported
        buf.write_ptp_u16_vec(&[]).unwrap(); // events_supported
        buf.write_ptp_u16_vec(&[]).unwrap(); // device_properties_supported
        buf.write_ptp_u16_vec(&[]).unwrap(); // capture_formats
        buf.write_ptp_u16_vec(&[]).unwrap(); // image_formats
        buf.write_ptp_str("Acme").unwrap(); // manufacturer
        buf.write_ptp_str("Model1").unwrap(); // model
        buf.write_ptp_str("1.0").unwrap(); // device_version
        buf.write_ptp_str("SN1").unwrap(); // serial_number
        buf
    }

    #[test]
    fn open_session_advances_tx_id_and_caches_device_info() {
        let t = FakeTransport::new();
        // OpenSession response: pinned to tx_id = 0, not drawn
        // from the session's transaction id allocator.
        t.queue_read(container::encode_response(0x2001, 0, &[]));
        // the post-open get_device_info() call is the first transaction
        // to draw from the allocator, so it lands on tx_id = 1.
        t.queue_read(container::encode_data_container(0x1001, 1, &device_info_bytes()));
        t.queue_read(container::encode_response(0x2001, 1, &[]));

        let session = SessionBuilder::new().session_id(1).open(&t).unwrap();
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.device_info().unwrap().manufacturer, "Acme");

        // OpenSession's command carries exactly one parameter (the
        // session id) at tx_id = 0.
        assert_eq!(
            t.written.borrow()[0],
            container::encode_command(StandardCommandCode::OpenSession.to_u16().unwrap(), 0, &[1])
        );
    }

    #[test]
    fn operation_before_open_is_rejected() {
        let t = FakeTransport::new();
        let mut session = Session {
            transport: t,
            ids: TransactionIds::new(),
            state: SessionState::Closed,
            device_info: None,
            prefer_ek: false,
        };
        match session.get_storage_ids() {
            Err(Error::SessionNotOpen) => {}
            other => panic!("expected SessionNotOpen, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn non_ok_response_maps_to_response_error() {
        let t = FakeTransport::new();
        let mut session = Session {
            transport: t,
            ids: TransactionIds::new(),
            state: SessionState::Open,
            device_info: None,
            prefer_ek: false,
        };
        session
            .transport
            .queue_read(container::encode_response(0x2009, 1, &[]));

        match session.get_storage_ids() {
            Err(Error::Response(ResponseCode::Standard(StandardResponseCode::InvalidObjectHandle))) => {}
            other => panic!("expected Response(InvalidObjectHandle), got {:?}", other.map(|_| ())),
        }
    }

    // S6: a response carrying a stale tx_id must both raise
    // `Protocol::TxIdMismatch` and leave the session `Broken`, since
    // the half-duplex pipe is now desynchronized and there is no
    // in-core recovery (spec §4.7/§5/§8 S6).
    #[test]
    fn tx_id_mismatch_response_breaks_the_session() {
        let t = FakeTransport::new();
        let mut session = Session {
            transport: t,
            ids: TransactionIds::new(),
            state: SessionState::Open,
            device_info: None,
            prefer_ek: false,
        };
        // session allocates tid=1 for this call; peer replies with a
        // stale tid=0 from some earlier, already-completed transaction.
        session
            .transport
            .queue_read(container::encode_response(0x2001, 0, &[]));

        match session.get_storage_ids() {
            Err(Error::Protocol(crate::error::ProtocolError::TxIdMismatch { expected: 1, got: 0 })) => {}
            other => panic!("expected Protocol::TxIdMismatch, got {:?}", other.map(|_| ())),
        }
        assert_eq!(session.state(), SessionState::Broken);
    }
}
