//! The built-in register catalog of the crate controller FPGA design.
//!
//! Addresses are byte offsets into the lightweight HPS-to-FPGA bridge
//! window. Each acquisition board slot gets its own control, sync generator
//! and packetizer block, spaced 0x100 apart; the remaining blocks are
//! global to the crate.

use std::collections::HashMap;
use std::sync::Arc;

use kstring::KString;

use crate::registers::{BitRange, RegisterEntry, RegisterMap};

const BOARD_CONTROL_BASE: usize = 0x0001_0000;
const PACKETIZER_BASE: usize = 0x0001_1000;
const SYNC_GENERATOR_BASE: usize = 0x0001_2000;
const BLOCK_STRIDE: usize = 0x100;

fn leaf(addr: usize, bits: &[(&str, BitRange)]) -> RegisterEntry {
    RegisterEntry::Leaf {
        addr,
        bits: bits
            .iter()
            .map(|(name, range)| (KString::from_ref(name), *range))
            .collect(),
    }
}

fn group(children: Vec<(String, RegisterEntry)>) -> RegisterEntry {
    RegisterEntry::Group {
        children: children
            .into_iter()
            .map(|(name, entry)| (KString::from_string(name), entry))
            .collect(),
    }
}

fn board_control(board: u8) -> RegisterEntry {
    let base = BOARD_CONTROL_BASE + BLOCK_STRIDE * board as usize;
    group(vec![
        (
            format!("board_control_{board}_0"),
            leaf(
                base,
                &[
                    ("SPI_POL", (31, 31)),
                    ("SPI_PHA", (30, 30)),
                    ("SPI_CLK_DIV", (16, 29)),
                    ("N_BIT", (10, 15)),
                    ("CRC_EN", (9, 9)),
                    ("SER_PAR", (8, 8)),
                    ("N_SLAVE", (5, 7)),
                    ("ID", (1, 4)),
                    ("EN", (0, 0)),
                ],
            ),
        ),
        (
            format!("board_control_{board}_1"),
            leaf(
                base + 0x4,
                &[("RDY_SAMPLE", (16, 31)), ("MISO_DELAY", (0, 15))],
            ),
        ),
        (
            format!("board_control_{board}_2"),
            leaf(
                base + 0x8,
                &[("SSEL_HOLD", (16, 31)), ("RESET_HOLD", (0, 15))],
            ),
        ),
    ])
}

fn sync_generator(board: u8) -> RegisterEntry {
    let base = SYNC_GENERATOR_BASE + BLOCK_STRIDE * board as usize;
    group(vec![
        (
            format!("sync_generator_{board}_0"),
            leaf(
                base,
                &[
                    ("RESET", (31, 31)),
                    ("RESET_TIMESTAMP", (30, 30)),
                    ("SYNC_DISABLE_VAL", (8, 8)),
                    ("GENERATE_TIMESTAMP", (4, 4)),
                    ("ENABLE", (0, 0)),
                ],
            ),
        ),
        (
            format!("sync_generator_{board}_1"),
            leaf(base + 0x4, &[("DIVIDER", (0, 23))]),
        ),
        (
            format!("sync_generator_{board}_2"),
            leaf(base + 0x8, &[("PULSE_WIDTH", (0, 23))]),
        ),
        (
            format!("sync_generator_{board}_3"),
            leaf(base + 0xC, &[("TIMESTAMP_RESET_VALUE", (0, 31))]),
        ),
        (
            format!("sync_generator_{board}_4"),
            leaf(base + 0x10, &[("TIMESTAMP", (0, 31))]),
        ),
    ])
}

fn packetizer(board: u8) -> RegisterEntry {
    let base = PACKETIZER_BASE + BLOCK_STRIDE * board as usize;
    let mut children = vec![
        (
            format!("packetizer_{board}_0"),
            leaf(
                base,
                &[
                    ("PAYLOAD_HEADER", (12, 31)),
                    ("RTP_PAYLOAD_TYPE", (4, 11)),
                    ("DROP_TIMESTAMP", (2, 2)),
                    ("DROP_ON_ERROR", (1, 1)),
                    ("EN", (0, 0)),
                ],
            ),
        ),
        (
            format!("packetizer_{board}_1"),
            leaf(base + 0x4, &[("PACKET_SAMPLES", (0, 31))]),
        ),
        (
            format!("packetizer_{board}_2"),
            leaf(base + 0x8, &[("RTP_SOURCE", (0, 31))]),
        ),
        (
            format!("packetizer_{board}_4"),
            leaf(base + 0x10, &[("PKT_CNT", (0, 31))]),
        ),
        (
            format!("packetizer_{board}_5"),
            leaf(base + 0x14, &[("DAT_CNT", (0, 31))]),
        ),
    ];
    // One monitor word per channel FIFO: live fill, high-water mark, and
    // dropped-sample count.
    for ch in 0..12usize {
        children.push((
            format!("packetizer_{board}_{}", 16 + ch),
            leaf(
                base + 0x40 + 0x4 * ch,
                &[(&format!("FIFO_FILL_LEVEL_{ch}"), (0, 31))],
            ),
        ));
        children.push((
            format!("packetizer_{board}_{}", 32 + ch),
            leaf(
                base + 0x80 + 0x4 * ch,
                &[(&format!("MAX_FILL_LEVEL_{ch}"), (0, 31))],
            ),
        ));
        children.push((
            format!("packetizer_{board}_{}", 48 + ch),
            leaf(
                base + 0xC0 + 0x4 * ch,
                &[(&format!("CNT_DROPPED_{ch}"), (0, 31))],
            ),
        ));
    }
    group(children)
}

/// Build the register catalog for the given board slots.
///
/// The result is shared read-only between every accessor for the lifetime
/// of the process.
pub fn builtin(boards: &[u8]) -> Arc<RegisterMap> {
    let mut map: RegisterMap = HashMap::new();

    map.insert(
        KString::from_static("led"),
        leaf(
            0x1000,
            &[
                ("LED0", (0, 0)),
                ("LED1", (1, 1)),
                ("LED2", (2, 2)),
                ("LED3", (3, 3)),
            ],
        ),
    );
    map.insert(
        KString::from_static("enable_n"),
        leaf(0x2000, &[("EN_N", (0, 0))]),
    );
    map.insert(
        KString::from_static("sys_id"),
        group(vec![
            (
                "sys_id_0".to_string(),
                leaf(0x1010, &[("SYSTEM_ID", (0, 31))]),
            ),
            (
                "sys_id_1".to_string(),
                leaf(0x1014, &[("SYSTEM_ID_TIMESTAMP", (0, 31))]),
            ),
        ]),
    );
    map.insert(
        KString::from_static("clock_ref_generator"),
        group(vec![
            (
                "clock_ref_generator_0".to_string(),
                leaf(
                    0x0001_3000,
                    &[
                        ("EXT_CLK_REF_OUT_ENA", (3, 3)),
                        ("INT_CLK_REF_IN_SEL", (2, 2)),
                        ("EXT_CLK_REF_IN_ENA", (1, 1)),
                        ("ENABLE", (0, 0)),
                    ],
                ),
            ),
            (
                "clock_ref_generator_1".to_string(),
                leaf(0x0001_3004, &[("DIVIDER", (0, 7))]),
            ),
        ]),
    );
    map.insert(
        KString::from_static("udp_streamer"),
        group(vec![
            (
                "udp_streamer_0".to_string(),
                leaf(
                    0x0002_0000,
                    &[("ERR", (2, 2)), ("RUN", (1, 1)), ("EN", (0, 0))],
                ),
            ),
            (
                "udp_streamer_1".to_string(),
                leaf(0x0002_0004, &[("DEST_MAC_ADDRESS_MSB", (0, 31))]),
            ),
            (
                "udp_streamer_2".to_string(),
                leaf(0x0002_0008, &[("DEST_MAC_ADDRESS_LSB", (0, 15))]),
            ),
            (
                "udp_streamer_3".to_string(),
                leaf(0x0002_000C, &[("SOUR_MAC_ADDRESS_MSB", (0, 31))]),
            ),
            (
                "udp_streamer_4".to_string(),
                leaf(0x0002_0010, &[("SOUR_MAC_ADDRESS_LSB", (0, 15))]),
            ),
            (
                "udp_streamer_5".to_string(),
                leaf(0x0002_0014, &[("SOUR_IP_ADDRESS", (0, 31))]),
            ),
            (
                "udp_streamer_6".to_string(),
                leaf(0x0002_0018, &[("DEST_IP_ADDRESS", (0, 31))]),
            ),
            (
                "udp_streamer_7".to_string(),
                leaf(
                    0x0002_001C,
                    &[("SOUR_UDP_PORT", (16, 31)), ("DEST_UDP_PORT", (0, 15))],
                ),
            ),
            (
                "udp_streamer_8".to_string(),
                leaf(0x0002_0020, &[("PACKET_COUNT", (0, 31))]),
            ),
        ]),
    );

    for &board in boards {
        map.insert(
            KString::from_string(format!("board_control_{board}")),
            board_control(board),
        );
        map.insert(
            KString::from_string(format!("sync_generator_{board}")),
            sync_generator(board),
        );
        map.insert(
            KString::from_string(format!("packetizer_{board}")),
            packetizer(board),
        );
    }

    Arc::new(map)
}

/// How many bytes of bridge window the catalog spans.
pub const WINDOW_LENGTH: usize = 0x0004_0000;

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(entry: &RegisterEntry, out: &mut Vec<(usize, Vec<BitRange>)>) {
        match entry {
            RegisterEntry::Leaf { addr, bits } => {
                out.push((*addr, bits.values().copied().collect()))
            }
            RegisterEntry::Group { children } => {
                for child in children.values() {
                    leaves(child, out);
                }
            }
        }
    }

    #[test]
    fn bitfields_within_a_leaf_never_overlap() {
        let map = builtin(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let mut all = Vec::new();
        for entry in map.values() {
            leaves(entry, &mut all);
        }
        assert!(!all.is_empty());
        for (addr, ranges) in all {
            assert!(addr + 4 <= WINDOW_LENGTH);
            let mut used = 0u32;
            for (low, high) in ranges {
                assert!(low <= high && high < 32, "bad range at {addr:#x}");
                let mask = (((1u64 << (high - low + 1)) - 1) as u32) << low;
                assert_eq!(used & mask, 0, "overlap at {addr:#x}");
                used |= mask;
            }
        }
    }

    #[test]
    fn per_board_blocks_are_stride_spaced() {
        let map = builtin(&[0, 3]);
        let regs = crate::registers::BitfieldRegister::new(
            crate::mmio::MockMem::new(WINDOW_LENGTH),
            Arc::clone(&map),
        );
        assert_eq!(regs.resolve_addr("board_control_0_0").unwrap(), 0x1_0000);
        assert_eq!(regs.resolve_addr("board_control_3_0").unwrap(), 0x1_0300);
        assert_eq!(regs.resolve_addr("sync_generator_3_4").unwrap(), 0x1_2310);
        assert_eq!(regs.resolve_addr("packetizer_0_48").unwrap(), 0x1_10C0);
        // Unlisted boards get no blocks.
        assert!(regs.resolve_addr("board_control_1_0").is_err());
    }
}
