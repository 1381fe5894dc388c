//! Symbolic access to the FPGA register file.
//!
//! Registers are addressed by name through a [`RegisterMap`]. A map entry is
//! either a [`RegisterEntry::Leaf`], a single word carrying named bitfields,
//! or a [`RegisterEntry::Group`], a functional block whose children are
//! leaves. [`BitfieldRegister`] resolves `register.bitfield` paths against
//! the map and performs masked read-modify-write accesses through any
//! [`WordAccess`] backend.

use std::collections::HashMap;
use std::sync::Arc;

use kstring::KString;

use crate::error::{Error, Result};
use crate::mmio::WordAccess;

/// Inclusive bit positions of a field inside a 32-bit word, as
/// `(low, high)`.
pub type BitRange = (u8, u8);

/// One named entry of the register map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterEntry {
    /// A single 32-bit word at a byte address, with its named bitfields.
    Leaf {
        addr: usize,
        bits: HashMap<KString, BitRange>,
    },
    /// A functional block of leaf registers.
    Group {
        children: HashMap<KString, RegisterEntry>,
    },
}

/// The full register map of the FPGA design, keyed by register name.
pub type RegisterMap = HashMap<KString, RegisterEntry>;

/// A fully resolved bitfield location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    pub addr: usize,
    pub low: u8,
    pub high: u8,
}

impl Target {
    /// The unshifted field mask.
    pub fn mask(&self) -> u32 {
        (((1u64) << (self.high - self.low + 1)) - 1) as u32
    }
}

/// The register file of one FPGA, viewed through a register map.
#[derive(Debug, Clone)]
pub struct BitfieldRegister<M> {
    mem: M,
    map: Arc<RegisterMap>,
}

impl<M: WordAccess> BitfieldRegister<M> {
    pub fn new(mem: M, map: Arc<RegisterMap>) -> Self {
        Self { mem, map }
    }

    pub fn map(&self) -> &RegisterMap {
        &self.map
    }

    /// Resolve `register.bitfield` to an address and bit range.
    ///
    /// A top-level leaf is searched directly. For a group, the first child
    /// leaf carrying the bitfield wins. When `register` is not a top-level
    /// name it is looked up as a child leaf of any group, so both the flat
    /// and the nested spelling of a name resolve to the same [`Target`].
    pub fn resolve(&self, register: &str, bitfield: &str) -> Result<Target> {
        if let Some(entry) = self.map.get(register) {
            if let Some(target) = Self::resolve_in(entry, bitfield) {
                return Ok(target);
            }
        } else if let Some(entry) = self.find_nested(register) {
            if let Some(target) = Self::resolve_in(entry, bitfield) {
                return Ok(target);
            }
        }
        Err(Error::Configuration(format!(
            "no register map entry for {register}.{bitfield}"
        )))
    }

    /// Resolve a register name to the byte address of its word.
    pub fn resolve_addr(&self, register: &str) -> Result<usize> {
        let entry = self
            .map
            .get(register)
            .or_else(|| self.find_nested(register));
        match entry {
            Some(RegisterEntry::Leaf { addr, .. }) => Ok(*addr),
            _ => Err(Error::Configuration(format!(
                "no addressable register named {register}"
            ))),
        }
    }

    fn resolve_in(entry: &RegisterEntry, bitfield: &str) -> Option<Target> {
        match entry {
            RegisterEntry::Leaf { addr, bits } => {
                let &(low, high) = bits.get(bitfield)?;
                Some(Target {
                    addr: *addr,
                    low,
                    high,
                })
            }
            RegisterEntry::Group { children } => children
                .values()
                .find_map(|child| Self::resolve_in(child, bitfield)),
        }
    }

    fn find_nested(&self, register: &str) -> Option<&RegisterEntry> {
        self.map.values().find_map(|entry| match entry {
            RegisterEntry::Group { children } => children.get(register),
            RegisterEntry::Leaf { .. } => None,
        })
    }

    /// Read one bitfield, shifted down to bit 0.
    pub fn read_bits(&self, register: &str, bitfield: &str) -> Result<u32> {
        let target = self.resolve(register, bitfield)?;
        let word = self.mem.read_word(target.addr)?;
        Ok((word >> target.low) & target.mask())
    }

    /// Write one bitfield, leaving the other bits of the word untouched.
    /// Data wider than the field is truncated to the field mask.
    pub fn write_bits(&mut self, register: &str, bitfield: &str, data: u32) -> Result<()> {
        let target = self.resolve(register, bitfield)?;
        self.write_target(target, data)
    }

    fn write_target(&mut self, target: Target, data: u32) -> Result<()> {
        let word = self.mem.read_word(target.addr)?;
        let mask = target.mask();
        let word = (word & !(mask << target.low)) | ((data & mask) << target.low);
        self.mem.write_word(target.addr, word)
    }

    /// Read a whole register word by name.
    pub fn read_register(&self, register: &str) -> Result<u32> {
        let addr = self.resolve_addr(register)?;
        self.mem.read_word(addr)
    }

    /// Write a whole register word by name.
    pub fn write_register(&mut self, register: &str, word: u32) -> Result<()> {
        let addr = self.resolve_addr(register)?;
        self.mem.write_word(addr, word)
    }

    /// Read a set of registers by name. A group name expands to all of its
    /// child leaves.
    pub fn dump_registers(&self, names: &[&str]) -> Result<HashMap<KString, u32>> {
        let mut out = HashMap::new();
        for name in names {
            match self.map.get(*name).or_else(|| self.find_nested(name)) {
                Some(RegisterEntry::Leaf { addr, .. }) => {
                    out.insert(KString::from_ref(name), self.mem.read_word(*addr)?);
                }
                Some(RegisterEntry::Group { children }) => {
                    for (child, entry) in children {
                        if let RegisterEntry::Leaf { addr, .. } = entry {
                            out.insert(child.clone(), self.mem.read_word(*addr)?);
                        }
                    }
                }
                None => {
                    return Err(Error::Configuration(format!(
                        "no register map entry for {name}"
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Restore whole registers from a [`dump_registers`] snapshot.
    ///
    /// Every name is resolved before the first write, so a misspelled entry
    /// anywhere in the snapshot leaves the hardware untouched.
    ///
    /// [`dump_registers`]: Self::dump_registers
    pub fn load_registers(&mut self, snapshot: &HashMap<KString, u32>) -> Result<()> {
        let writes = snapshot
            .iter()
            .map(|(name, word)| Ok((self.resolve_addr(name.as_str())?, *word)))
            .collect::<Result<Vec<_>>>()?;
        for (addr, word) in writes {
            self.mem.write_word(addr, word)?;
        }
        Ok(())
    }

    /// Apply a batch of bitfield writes, resolving every entry first like
    /// [`load_registers`](Self::load_registers).
    pub fn load_bitfields(&mut self, settings: &[(&str, &str, u32)]) -> Result<()> {
        let targets = settings
            .iter()
            .map(|(register, bitfield, data)| {
                Ok((self.resolve(register, bitfield)?, *data))
            })
            .collect::<Result<Vec<_>>>()?;
        for (target, data) in targets {
            self.write_target(target, data)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmio::MockMem;

    fn leaf(addr: usize, bits: &[(&str, BitRange)]) -> RegisterEntry {
        RegisterEntry::Leaf {
            addr,
            bits: bits
                .iter()
                .map(|(name, range)| (KString::from_ref(name), *range))
                .collect(),
        }
    }

    fn test_map() -> Arc<RegisterMap> {
        let mut children = HashMap::new();
        children.insert(
            KString::from_static("ctrl_0"),
            leaf(0x10, &[("EN", (0, 0)), ("DIV", (16, 29)), ("POL", (31, 31))]),
        );
        children.insert(
            KString::from_static("ctrl_1"),
            leaf(0x14, &[("HOLD", (0, 15))]),
        );
        let mut map = RegisterMap::new();
        map.insert(
            KString::from_static("ctrl"),
            RegisterEntry::Group { children },
        );
        map.insert(
            KString::from_static("version"),
            leaf(0x00, &[("MAJOR", (16, 31)), ("MINOR", (0, 15))]),
        );
        Arc::new(map)
    }

    fn regs() -> BitfieldRegister<MockMem> {
        BitfieldRegister::new(MockMem::new(64), test_map())
    }

    #[test]
    fn masked_write_leaves_neighbors_alone() {
        let mut regs = regs();
        regs.write_register("ctrl_0", 0xFFFF_FFFF).unwrap();
        regs.write_bits("ctrl", "DIV", 0x2A).unwrap();
        assert_eq!(regs.read_bits("ctrl", "DIV").unwrap(), 0x2A);
        // Bits outside 16..=29 keep their sentinel value.
        assert_eq!(regs.read_bits("ctrl", "EN").unwrap(), 1);
        assert_eq!(regs.read_bits("ctrl", "POL").unwrap(), 1);
        assert_eq!(regs.read_register("ctrl_0").unwrap(), 0xC02A_FFFF);
    }

    #[test]
    fn oversize_data_is_truncated_to_the_field() {
        let mut regs = regs();
        regs.write_bits("version", "MINOR", 0x12_3456).unwrap();
        assert_eq!(regs.read_bits("version", "MINOR").unwrap(), 0x3456);
        assert_eq!(regs.read_bits("version", "MAJOR").unwrap(), 0);
    }

    #[test]
    fn flat_and_nested_names_resolve_identically() {
        let regs = regs();
        assert_eq!(
            regs.resolve("ctrl", "HOLD").unwrap(),
            regs.resolve("ctrl_1", "HOLD").unwrap()
        );
        assert_eq!(regs.resolve_addr("ctrl_1").unwrap(), 0x14);
    }

    #[test]
    fn unknown_names_are_configuration_errors() {
        let regs = regs();
        assert!(matches!(
            regs.resolve("ctrl", "NOPE"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            regs.resolve("missing", "EN"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn bitfield_batch_is_all_or_nothing() {
        let mut regs = regs();
        let err = regs
            .load_bitfields(&[("ctrl", "EN", 1), ("ctrl", "TYPO", 1)])
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        // The valid first entry was not applied.
        assert_eq!(regs.read_register("ctrl_0").unwrap(), 0);

        regs.load_bitfields(&[("ctrl", "EN", 1), ("ctrl_1", "HOLD", 0xBEEF)])
            .unwrap();
        assert_eq!(regs.read_bits("ctrl", "EN").unwrap(), 1);
        assert_eq!(regs.read_bits("ctrl", "HOLD").unwrap(), 0xBEEF);
    }

    #[test]
    fn dump_then_restore_round_trips() {
        let mut regs = regs();
        regs.write_register("ctrl_0", 0xC02A_0001).unwrap();
        regs.write_register("ctrl_1", 0x1234).unwrap();
        let snapshot = regs.dump_registers(&["ctrl", "version"]).unwrap();

        regs.write_register("ctrl_0", 0).unwrap();
        regs.write_register("ctrl_1", 0xFFFF_FFFF).unwrap();
        regs.load_registers(&snapshot).unwrap();
        assert_eq!(regs.read_register("ctrl_0").unwrap(), 0xC02A_0001);
        assert_eq!(regs.read_register("ctrl_1").unwrap(), 0x1234);
        assert_eq!(regs.read_register("version").unwrap(), 0);
    }

    #[test]
    fn restore_with_a_bad_name_touches_nothing() {
        let mut regs = regs();
        let mut snapshot = HashMap::new();
        snapshot.insert(KString::from_static("ctrl_0"), 0xAAAA_AAAA);
        snapshot.insert(KString::from_static("no_such_register"), 1);
        assert!(matches!(
            regs.load_registers(&snapshot),
            Err(Error::Configuration(_))
        ));
        assert_eq!(regs.read_register("ctrl_0").unwrap(), 0);
    }

    #[test]
    fn group_dump_expands_children() {
        let mut regs = regs();
        regs.write_register("ctrl_1", 0x1234).unwrap();
        let dump = regs.dump_registers(&["ctrl", "version"]).unwrap();
        assert_eq!(dump.len(), 3);
        assert_eq!(dump["ctrl_1"], 0x1234);
        assert_eq!(dump["version"], 0);
    }
}
