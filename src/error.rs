//! The error taxonomy shared by every layer of the crate.

use std::time::Duration;

use num_derive::FromPrimitive;
use thiserror::Error;

/// Hard failures reported by a board in the status byte of a reply.
///
/// The discriminants are the raw status codes off the wire, so a status byte
/// can be classified with `FromPrimitive`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum DeviceFault {
    #[error("the board does not implement this command")]
    NotImplemented = 0xF8,
    #[error("the addressed channel does not exist on this board")]
    WrongChannel = 0xFA,
    #[error("a command argument was out of range")]
    WrongArg = 0xFB,
    #[error("the board did not recognize the command")]
    UnknownCommand = 0xFC,
    #[error("the board's command queue is full")]
    QueueFull = 0xFD,
    #[error("the board reported a command error")]
    CommandError = 0xFF,
}

/// Soft conditions a board can report. These are surfaced to the caller
/// rather than treated as failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceWarning {
    /// The board accepted the command but is still busy with an earlier one.
    Busy,
    /// The command succeeded with a warning.
    Soft,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("channel {0} is out of range")]
    Channel(u8),
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("board did not wake after {attempts} attempts")]
    Wake { attempts: u32 },
    #[error("device fault")]
    Device(#[from] DeviceFault),
    #[error("broadcast to board {board} failed at {register}.{bitfield}")]
    Broadcast {
        board: u8,
        register: String,
        bitfield: String,
        #[source]
        source: Box<Error>,
    },
    #[error("access at offset {offset:#x} for {count} words exceeds window of {length:#x} bytes")]
    OutOfBounds {
        offset: usize,
        count: usize,
        length: usize,
    },
    #[error("insufficient permissions to map physical memory")]
    PermissionDenied,
    #[error("bus error")]
    Bus(#[from] canbus::Error),
    #[error("io error")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::FromPrimitive;

    #[test]
    fn fault_codes_round_trip() {
        assert_eq!(DeviceFault::from_u8(0xF8), Some(DeviceFault::NotImplemented));
        assert_eq!(DeviceFault::from_u8(0xFA), Some(DeviceFault::WrongChannel));
        assert_eq!(DeviceFault::from_u8(0xFF), Some(DeviceFault::CommandError));
        // Warning and busy codes are not faults.
        assert_eq!(DeviceFault::from_u8(0xF9), None);
        assert_eq!(DeviceFault::from_u8(0xFE), None);
        assert_eq!(DeviceFault::from_u8(0x00), None);
    }
}
