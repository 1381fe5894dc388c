//! The board command dictionary.
//!
//! Every command the board firmware understands, keyed by name. Read
//! variants carry the write code with bit 7 set. The `outputs` of a
//! descriptor name which reply bytes carry each returned value; most
//! replies carry one big-endian value, a few carry two (for example a
//! value plus an iteration count).

use std::collections::HashMap;
use std::sync::OnceLock;

use kstring::KString;

/// Status codes a board can place in the last byte of a reply.
pub mod status {
    pub const NOT_IMPLEMENTED: u8 = 0xF8;
    pub const WARNING: u8 = 0xF9;
    pub const WRONG_CHANNEL: u8 = 0xFA;
    pub const WRONG_ARG: u8 = 0xFB;
    pub const UNKNOWN_CMD: u8 = 0xFC;
    pub const QUEUE_FULL: u8 = 0xFD;
    pub const BUSY: u8 = 0xFE;
    pub const ERROR: u8 = 0xFF;
}

/// Command and reply frames are always this long.
pub const FRAME_LEN: usize = 6;

/// Read commands are the write code with this bit set.
const READ: u8 = 0x80;

/// One dictionary entry: the wire code and the reply bytes carrying each
/// output value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub byte: u8,
    pub outputs: &'static [&'static [usize]],
}

/// No meaningful payload; decodes to the single value 0.
const NONE: &[&[usize]] = &[&[]];
/// One value in bytes 1..=4.
const B1_4: &[&[usize]] = &[&[1, 2, 3, 4]];
/// One value in bytes 3..=4.
const B3_4: &[&[usize]] = &[&[3, 4]];
/// One value in byte 4.
const B4: &[&[usize]] = &[&[4]];

#[rustfmt::skip]
const TABLE: &[(&str, u8, &[&[usize]])] = &[
    // Board management
    ("NOP",                     0x00,        NONE),
    ("ID_WRITE",                0x50,        NONE),
    ("ID_READ",                 0x50 | READ, B3_4),
    ("FW_VER_READ",             0x51 | READ, B1_4),
    ("HW_REV_READ",             0x52 | READ, B4),
    ("BLINK",                   0x5F,        NONE),
    ("RESTART",                 0x70,        NONE),
    ("RECALIBRATE",             0x71,        NONE),
    ("POWERDOWN_CONFIG",        0x72,        NONE),
    ("POWERDOWN_READ",          0x72 | READ, B4),
    ("RESET_FACTORY",           0x78,        NONE),
    // Analog front end
    ("FILTER_ENABLE_WRITE",     0x01,        NONE),
    ("FILTER_ENABLE_READ",      0x01 | READ, B3_4),
    ("FREQUENCY_WRITE",         0x02,        B1_4),
    ("FREQUENCY_READ",          0x02 | READ, B1_4),
    ("INPUT_GROUND_WRITE",      0x03,        NONE),
    ("INPUT_GROUND_READ",       0x03 | READ, B3_4),
    ("FREQUENCY_AND_ENABLE",    0x04,        B1_4),
    ("TRIMMER_WRITE",           0x0E,        NONE),
    ("TRIMMER_READ",            0x0E | READ, B3_4),
    ("TRIMMER_READ_FORCE",      0x0F | READ, B3_4),
    // Settings memory
    ("LOAD_SETTINGS",           0x10,        NONE),
    ("SAVE_SETTINGS",           0x11,        NONE),
    ("SLOT_LOCK_WRITE",         0x12,        NONE),
    ("SLOT_LOCK_READ",          0x12 | READ, B4),
    ("SLOT_USED_WRITE",         0x13,        NONE),
    ("SLOT_USED_READ",          0x13 | READ, B4),
    ("SLOT_STARTUP_WRITE",      0x14,        NONE),
    ("SLOT_STARTUP_READ",       0x14 | READ, B4),
    ("LOAD_STARTUP_SETTINGS",   0x15,        NONE),
    ("MEMORY_WRITE",            0x18,        NONE),
    ("MEMORY_READ",             0x18 | READ, B1_4),
    ("ERASE_ALL",               0x1F,        NONE),
    // ADC
    ("ADC_MEAS_EN_WRITE",       0x20,        NONE),
    ("ADC_MEAS_EN_READ",        0x20 | READ, B4),
    ("ADC_FREQ_WRITE",          0x21,        B1_4),
    ("ADC_FREQ_READ",           0x21 | READ, B1_4),
    ("ADC_ACQ_TIME_WRITE",      0x22,        NONE),
    ("ADC_ACQ_TIME_READ",       0x22 | READ, B3_4),
    ("ADC_REG_WRITE",           0x28,        NONE),
    ("ADC_REG_READ",            0x28 | READ, B1_4),
    ("ADC_SHORT_INPUTS_WRITE",  0x29,        NONE),
    ("ADC_SHORT_INPUTS_READ",   0x29 | READ, B4),
    ("ADC_BUFFERS_WRITE",       0x2A,        NONE),
    ("ADC_BUFFERS_READ",        0x2A | READ, B4),
    ("ADC_REF_BUFFERS_WRITE",   0x2B,        NONE),
    ("ADC_REF_BUFFERS_READ",    0x2B | READ, B4),
    ("ADC_CALIBRATION_WRITE",   0x2D,        NONE),
    ("ADC_CALIBRATION_READ",    0x2D | READ, B1_4),
    ("ADC_CALIBRATION_SAVE",    0x2E,        NONE),
    ("ADC_CALIBRATION_RECALL",  0x2E | READ, NONE),
    ("ADC_CALIBRATION_AUTO",    0x2F,        B1_4),
    // Measurement
    ("ADC_START_MEAS",          0x38,        NONE),
    ("ADC_STOP_MEAS",           0x39,        NONE),
    ("ADC_READ_MEAS",           0x3A | READ, B1_4),
    ("ADC_READ_DATA",           0x3B | READ, NONE),
    ("ADC_CONTINUOUS",          0x3D,        NONE),
    ("ADC_STOP",                0x3E,        NONE),
    ("ADC_SINGLE",              0x3F,        B1_4),
    ("MODE_WRITE",              0x30,        NONE),
    ("MODE_READ",               0x30 | READ, B4),
    // Monitoring
    ("POWERSUPPLY_READ",        0x40 | READ, B3_4),
    ("TEMPERATURE_READ",        0x41 | READ, B3_4),
    ("TESTPOINT_READ",          0x4E | READ, &[&[2, 3, 4], &[1]]),
    ("TRIMMER_RES_READ",        0x4F | READ, &[&[1, 2], &[3, 4]]),
    // Error bookkeeping
    ("ERROR_CNT_RESET",         0x60,        NONE),
    ("ERROR_CNT_READ",          0x60 | READ, B1_4),
    ("ERROR_LIST_RESET",        0x61,        NONE),
    ("ERROR_LIST_READ",         0x61 | READ, &[&[1], &[4]]),
    ("ERROR_INSTANT_MODE",      0x6F,        NONE),
    ("ERROR_INSTANT_MODE_READ", 0x6F | READ, B4),
];

/// The immutable command dictionary.
#[derive(Debug)]
pub struct CommandSet {
    commands: HashMap<KString, CommandDescriptor>,
}

impl CommandSet {
    /// The built-in dictionary, constructed once and shared by reference.
    pub fn builtin() -> &'static CommandSet {
        static SET: OnceLock<CommandSet> = OnceLock::new();
        SET.get_or_init(|| CommandSet {
            commands: TABLE
                .iter()
                .map(|&(name, byte, outputs)| {
                    (KString::from_static(name), CommandDescriptor { byte, outputs })
                })
                .collect(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&CommandDescriptor> {
        self.commands.get(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_variants_carry_the_read_bit() {
        let set = CommandSet::builtin();
        for (write, read) in [
            ("ID_WRITE", "ID_READ"),
            ("FREQUENCY_WRITE", "FREQUENCY_READ"),
            ("ADC_FREQ_WRITE", "ADC_FREQ_READ"),
            ("ERROR_CNT_RESET", "ERROR_CNT_READ"),
        ] {
            let w = set.get(write).unwrap().byte;
            let r = set.get(read).unwrap().byte;
            assert_eq!(r, w | 0x80, "{read}");
        }
    }

    #[test]
    fn single_conversion_returns_data_on_its_own_code() {
        // ADC_SINGLE is a conversion trigger that happens to return data;
        // its code carries no read bit.
        let set = CommandSet::builtin();
        let single = set.get("ADC_SINGLE").unwrap();
        assert_eq!(single.byte, 0x3F);
        assert_eq!(single.outputs, &[&[1, 2, 3, 4][..]][..]);
    }

    #[test]
    fn command_bytes_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for &(name, byte, _) in TABLE {
            assert!(seen.insert(byte), "duplicate code for {name}");
        }
    }

    #[test]
    fn dual_output_commands() {
        let set = CommandSet::builtin();
        assert_eq!(set.get("TESTPOINT_READ").unwrap().outputs.len(), 2);
        assert_eq!(
            set.get("TRIMMER_RES_READ").unwrap().outputs,
            &[&[1, 2][..], &[3, 4][..]][..]
        );
        assert_eq!(set.get("NOP").unwrap().outputs, &[&[][..]][..]);
    }

    #[test]
    fn dictionary_is_complete() {
        assert_eq!(CommandSet::builtin().len(), TABLE.len());
    }
}
