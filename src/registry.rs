//! Crate-level fan-out of register settings across board slots.
//!
//! Most FPGA blocks exist once per board slot, named `{block}_{index}`.
//! [`DeviceRegistry`] owns the slot list and templates a setting name over
//! it, so callers address "the sync generator divider" once instead of per
//! slot.

use tracing::debug;

use crate::error::{Error, Result};
use crate::mmio::WordAccess;
use crate::registers::BitfieldRegister;

/// The per-board registers of one crate controller, plus the slot list to
/// fan out over.
#[derive(Debug)]
pub struct DeviceRegistry<M> {
    regs: BitfieldRegister<M>,
    boards: Vec<u8>,
    /// A slot carrying the crate aggregator rather than an acquisition
    /// board. Broadcasts reach it last, after every board is configured.
    aggregator: Option<u8>,
}

impl<M: WordAccess> DeviceRegistry<M> {
    pub fn new(regs: BitfieldRegister<M>, boards: Vec<u8>, aggregator: Option<u8>) -> Self {
        Self {
            regs,
            boards,
            aggregator,
        }
    }

    pub fn boards(&self) -> &[u8] {
        &self.boards
    }

    pub fn registers(&self) -> &BitfieldRegister<M> {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut BitfieldRegister<M> {
        &mut self.regs
    }

    /// Write a per-board bitfield, on one board or on all of them.
    ///
    /// With `board: None` the write is broadcast sequentially over the slot
    /// list and then the aggregator. The first failure aborts the broadcast
    /// and the error names the slot it died on; earlier slots keep the new
    /// value.
    pub fn set_board_setting(
        &mut self,
        name: &str,
        bitfield: &str,
        data: u32,
        board: Option<u8>,
    ) -> Result<()> {
        match board {
            Some(board) => self.write_one(name, bitfield, data, board),
            None => {
                let targets: Vec<u8> = self
                    .boards
                    .iter()
                    .copied()
                    .chain(self.aggregator)
                    .collect();
                for board in targets {
                    self.write_one(name, bitfield, data, board)
                        .map_err(|e| Error::Broadcast {
                            board,
                            register: format!("{name}{board}"),
                            bitfield: bitfield.to_string(),
                            source: Box::new(e),
                        })?;
                }
                Ok(())
            }
        }
    }

    /// Read a per-board bitfield from one board.
    pub fn get_board_setting(&self, name: &str, bitfield: &str, board: u8) -> Result<u32> {
        self.regs.read_bits(&format!("{name}{board}"), bitfield)
    }

    fn write_one(&mut self, name: &str, bitfield: &str, data: u32, board: u8) -> Result<()> {
        let register = format!("{name}{board}");
        debug!("set {register}.{bitfield} = {data:#x}");
        self.regs.write_bits(&register, bitfield, data)
    }
}
