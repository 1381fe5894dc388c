//! Host-side control of a CAN-connected multi-board data acquisition crate.
//!
//! The crate controller runs on the backplane SoC and talks to the hardware
//! on two paths: the FPGA register file, memory-mapped through `/dev/mem`
//! and addressed symbolically ([`registers`], [`regmap`], [`registry`]),
//! and the acquisition boards' microcontrollers, reached over the shared
//! CAN bus with a wake-then-command protocol ([`board`], [`commands`]) and
//! a multi-device bootloader flashing flow ([`flash`]).
//!
//! Hardware access sits behind two traits so everything above is testable
//! without a crate: [`mmio::WordAccess`] for the register file and
//! [`canbus::CanBus`] for the bus.

pub mod board;
pub mod commands;
pub mod error;
pub mod flash;
pub mod mmio;
pub mod prelude;
pub mod registers;
pub mod regmap;
pub mod registry;

pub use error::{Error, Result};
