//! Bulk transport: opaque byte-buffer I/O over the OUT/IN
//! endpoint pair. This layer has no knowledge of PTP framing; it just
//! moves bytes with timeouts and clears a stalled endpoint on request.
//!
//! Handles endpoint discovery, bulk I/O, and the stall-clear-on-EPIPE
//! behavior bulk transfers need.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};

use crate::error::TransportError;

/// Default write timeout.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout. Long-object reads must accommodate slow media.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Bulk transport contract. Implementations translate
/// USB-specific stalls/timeouts into `TransportError`.
pub trait Transport {
    /// Sends `buf` out the OUT endpoint, bounded by `timeout`.
    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Reads up to `buf.len()` bytes from the IN endpoint, bounded by
    /// `timeout`. Returns the number of bytes actually read.
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Clears a halted endpoint after a `Stalled` error. The caller may
    /// retry the framing-level operation once afterward.
    fn clear_halt(&self) -> Result<(), TransportError>;
}

/// `rusb`-backed transport over a claimed Still Image (class `0x06`)
/// interface's bulk IN/OUT endpoints.
pub struct UsbTransport<C: rusb::UsbContext> {
    iface: u8,
    ep_in: u8,
    ep_out: u8,
    handle: Arc<rusb::DeviceHandle<C>>,
}

impl<C: rusb::UsbContext> UsbTransport<C> {
    /// Claims the Still Image interface on `handle` and discovers its
    /// bulk endpoint pair.
    pub fn new(handle: Arc<rusb::DeviceHandle<C>>) -> Result<UsbTransport<C>, TransportError> {
        let config_desc = handle.device().active_config_descriptor()?;

        let interface_desc = config_desc
            .interfaces()
            .flat_map(|i| i.descriptors())
            .find(|x| x.class_code() == 6)
            .ok_or(rusb::Error::NotFound)?;

        debug!("found still-image interface {}", interface_desc.interface_number());

        handle.claim_interface(interface_desc.interface_number())?;
        handle.set_alternate_setting(
            interface_desc.interface_number(),
            interface_desc.setting_number(),
        )?;

        let find_endpoint = |direction, transfer_type| {
            interface_desc
                .endpoint_descriptors()
                .find(|ep| ep.direction() == direction && ep.transfer_type() == transfer_type)
                .map(|x| x.address())
                .ok_or(rusb::Error::NotFound)
        };

        Ok(UsbTransport {
            iface: interface_desc.interface_number(),
            ep_in: find_endpoint(rusb::Direction::In, rusb::TransferType::Bulk)?,
            ep_out: find_endpoint(rusb::Direction::Out, rusb::TransferType::Bulk)?,
            handle,
        })
    }

    pub fn interface(&self) -> u8 {
        self.iface
    }

    pub fn release(&self) -> Result<(), TransportError> {
        Ok(self.handle.release_interface(self.iface)?)
    }

    fn classify(err: rusb::Error) -> TransportError {
        match err {
            rusb::Error::Timeout => TransportError::Timeout,
            rusb::Error::Pipe => TransportError::Stalled,
            rusb::Error::NoDevice => TransportError::Disconnected,
            other => TransportError::Usb(other),
        }
    }
}

impl<C: rusb::UsbContext> Transport for UsbTransport<C> {
    fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        trace!("bulk write {} bytes", buf.len());
        self.handle
            .write_bulk(self.ep_out, buf, timeout)
            .map_err(Self::classify)
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let n = self
            .handle
            .read_bulk(self.ep_in, buf, timeout)
            .map_err(Self::classify)?;
        trace!("bulk read {} bytes", n);
        Ok(n)
    }

    fn clear_halt(&self) -> Result<(), TransportError> {
        let pipe_in = self.handle.clear_halt(self.ep_in);
        let pipe_out = self.handle.clear_halt(self.ep_out);
        pipe_in.map_err(Self::classify)?;
        pipe_out.map_err(Self::classify)?;
        Ok(())
    }
}

/// Interrupt-endpoint counterpart to [`UsbTransport`], used only by
/// [`crate::session::poll_event`]. Kept
/// separate from `UsbTransport` since the bulk `Transport` contract has
/// no notion of an interrupt pipe.
pub struct UsbEventSource<C: rusb::UsbContext> {
    ep_int: u8,
    handle: Arc<rusb::DeviceHandle<C>>,
}

impl<C: rusb::UsbContext> UsbEventSource<C> {
    pub fn new(handle: Arc<rusb::DeviceHandle<C>>) -> Result<UsbEventSource<C>, TransportError> {
        let config_desc = handle.device().active_config_descriptor()?;
        let interface_desc = config_desc
            .interfaces()
            .flat_map(|i| i.descriptors())
            .find(|x| x.class_code() == 6)
            .ok_or(rusb::Error::NotFound)?;

        let ep_int = interface_desc
            .endpoint_descriptors()
            .find(|ep| ep.direction() == rusb::Direction::In && ep.transfer_type() == rusb::TransferType::Interrupt)
            .map(|x| x.address())
            .ok_or(rusb::Error::NotFound)?;

        Ok(UsbEventSource { ep_int, handle })
    }
}

impl<C: rusb::UsbContext> crate::event::EventSource for UsbEventSource<C> {
    fn poll(&self, timeout: Duration) -> Result<Option<crate::event::Event>, crate::Error> {
        use crate::container::{ContainerHeader, ContainerType, HEADER_SIZE};

        let mut buf = [0u8; 24];
        let n = match self.handle.read_interrupt(self.ep_int, &mut buf, timeout) {
            Ok(n) => n,
            Err(rusb::Error::Timeout) => return Ok(None),
            Err(e) => return Err(UsbTransport::<C>::classify(e).into()),
        };

        if n < HEADER_SIZE {
            return Err(crate::error::ProtocolError::BadHeader.into());
        }
        let header = ContainerHeader::decode(&buf[..HEADER_SIZE])?;
        if header.kind != ContainerType::Event {
            return Err(crate::error::ProtocolError::UnexpectedType(
                header.code,
                "expected an Event container",
            )
            .into());
        }

        crate::event::Event::new(header.code, &buf[HEADER_SIZE..n]).map(Some)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    //! An in-memory fake transport used by integration tests to drive
    //! the transaction engine without real USB hardware. Modeled on
    //! how `a1ien-libptp`'s `read.rs` is exercised in isolation.
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;

    pub struct FakeTransport {
        pub to_read: RefCell<VecDeque<Vec<u8>>>,
        pub written: RefCell<Vec<Vec<u8>>>,
        pub stalls_remaining: RefCell<u32>,
        pub halts_cleared: RefCell<u32>,
    }

    impl FakeTransport {
        pub fn new() -> Self {
            FakeTransport {
                to_read: RefCell::new(VecDeque::new()),
                written: RefCell::new(vec![]),
                stalls_remaining: RefCell::new(0),
                halts_cleared: RefCell::new(0),
            }
        }

        /// Queues a chunk the next `read` call will hand back, split at
        /// whatever granularity the test wants to exercise multi-segment
        /// reassembly.
        pub fn queue_read(&self, chunk: Vec<u8>) {
            self.to_read.borrow_mut().push_back(chunk);
        }

        pub fn stall_next_write(&self, n: u32) {
            *self.stalls_remaining.borrow_mut() = n;
        }
    }

    impl Transport for FakeTransport {
        fn write(&self, buf: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
            let mut remaining = self.stalls_remaining.borrow_mut();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::Stalled);
            }
            self.written.borrow_mut().push(buf.to_vec());
            Ok(buf.len())
        }

        fn read(&self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
            let mut queue = self.to_read.borrow_mut();
            let chunk = queue.pop_front().ok_or(TransportError::Timeout)?;
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                // put back the remainder for the next read
                queue.push_front(chunk[n..].to_vec());
            }
            Ok(n)
        }

        fn clear_halt(&self) -> Result<(), TransportError> {
            *self.halts_cleared.borrow_mut() += 1;
            Ok(())
        }
    }

    /// Lets tests hold onto a `&FakeTransport` (to keep queuing reads
    /// after handing one to a `Session`) while still satisfying the
    /// by-value `Transport` bound `SessionBuilder::open` expects.
    impl Transport for &FakeTransport {
        fn write(&self, buf: &[u8], timeout: Duration) -> Result<usize, TransportError> {
            (**self).write(buf, timeout)
        }

        fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
            (**self).read(buf, timeout)
        }

        fn clear_halt(&self) -> Result<(), TransportError> {
            (**self).clear_halt()
        }
    }
}
