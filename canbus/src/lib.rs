//! CAN framing and bus access for the DAQ crate backplane.
//!
//! Every acquisition board in the crate hangs off one shared CAN bus running
//! at 1 Mbit/s with 29-bit extended identifiers. This crate owns the
//! wire-level pieces: the [`Frame`] type, the [`CanBus`] abstraction over a
//! buffered receive FIFO, the SocketCAN backend with its background listener
//! ([`socket::SocketCan`]), and a scriptable bus double for protocol tests
//! ([`mock::MockBus`]).

pub mod mock;
pub mod socket;

use std::time::Duration;

use thiserror::Error;

/// Largest identifier expressible in 29 bits.
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Errors that can come out of bus access.
#[derive(Error, Debug)]
pub enum Error {
    #[error("identifier {0:#x} does not fit in 29 bits")]
    InvalidId(u32),
    #[error("frame payload of {0} bytes exceeds 8")]
    Oversize(usize),
    #[error("the bus listener terminated")]
    Disconnected,
    #[error("socket error")]
    Io(#[from] std::io::Error),
}

/// A CAN 2.0B data frame with an extended identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    id: u32,
    len: u8,
    data: [u8; 8],
}

impl Frame {
    pub fn new(id: u32, payload: &[u8]) -> Result<Self, Error> {
        if id > MAX_EXTENDED_ID {
            return Err(Error::InvalidId(id));
        }
        if payload.len() > 8 {
            return Err(Error::Oversize(payload.len()));
        }
        let mut data = [0u8; 8];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            id,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.len)]
    }

    /// The payload as a big-endian integer, zero-padded on the right to
    /// 8 bytes. The bootloader packs device ids and statuses this way.
    pub fn data_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        buf[..usize::from(self.len)].copy_from_slice(self.data());
        u64::from_be_bytes(buf)
    }
}

/// A kernel-side acceptance filter: a frame passes when
/// `received & mask == id & mask`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Filter {
    pub id: u32,
    pub mask: u32,
}

/// A CAN bus with buffered reception.
///
/// Arrival is decoupled from consumption: received frames accumulate in an
/// unbounded FIFO and [`CanBus::recv`] is a bounded poll against it. An
/// expired deadline only means "stop waiting" — nothing in flight is undone.
pub trait CanBus {
    fn send(&mut self, frame: &Frame) -> Result<(), Error>;

    /// Wait up to `timeout` for the next buffered frame. `None` means the
    /// deadline expired with nothing to hand out.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, Error>;
}
