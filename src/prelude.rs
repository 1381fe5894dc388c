//! Convenience re-exports for typical control-session code.

pub use crate::board::{Board, CommandReply, DeviceAddress, Status, WakeConfig};
pub use crate::commands::CommandSet;
pub use crate::error::{DeviceFault, DeviceWarning, Error, Result};
pub use crate::flash::{FirmwareFlasher, FlashConfig, FlashReport};
pub use crate::mmio::{DevMem, MockMem, WordAccess};
pub use crate::registers::{BitfieldRegister, RegisterEntry, RegisterMap};
pub use crate::registry::DeviceRegistry;
pub use canbus::{CanBus, Filter, Frame};
