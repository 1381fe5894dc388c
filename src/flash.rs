//! Firmware flashing over the bootloader protocol.
//!
//! All boards share the image: the bootloader is entered by broadcast,
//! every device in bootloader mode announces its id, and each flash write
//! then runs against the whole set at once. A sector is done only when
//! every selected device has acknowledged its checksum.

use std::collections::HashMap;
use std::io::Read;
use std::time::{Duration, Instant};

use indicatif::ProgressBar;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use canbus::{CanBus, Frame};

/// Flash sectors are written whole.
pub const SECTOR_SIZE: usize = 4096;
/// One CAN frame of sector data.
pub const CHUNK_SIZE: usize = 8;
pub const CHUNKS_PER_SECTOR: usize = SECTOR_SIZE / CHUNK_SIZE;
/// Sectors are addressed by a single payload byte.
pub const MAX_SECTORS: usize = 256;

/// Base identifier of bootloader requests; replies come back at
/// `BOOT_ID_BASE + REPLY_OFFSET + phase`.
pub const BOOT_ID_BASE: u32 = 0x100;
pub const REPLY_OFFSET: u32 = 0x10;

/// The bootloader's phases, each with its own pair of identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BootPhase {
    EnterBootloader = 0,
    GetId = 1,
    ReadId = 2,
    EnterFlash = 3,
    SelectSector = 4,
    SendData = 5,
    SendChecksum = 6,
    FlashStatus = 7,
    ExitFlash = 8,
}

impl BootPhase {
    pub fn request_id(self) -> u32 {
        BOOT_ID_BASE + self as u32
    }

    pub fn reply_id(self) -> u32 {
        BOOT_ID_BASE + REPLY_OFFSET + self as u32
    }
}

/// A device's verdict on a flashed sector, from byte 4 of its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum SectorAck {
    WrongHash = 0,
    FlashError = 1,
    Accepted = 3,
}

/// Flashing deadlines and retry bounds.
#[derive(Debug, Clone, Copy)]
pub struct FlashConfig {
    /// How long to collect get-id replies.
    pub discovery_window: Duration,
    /// How long to wait for every device to ack a sector checksum.
    pub consensus_window: Duration,
    /// Receive poll granularity inside the windows.
    pub poll_interval: Duration,
    /// Full rewrites of one sector before recording it as failed.
    pub sector_retries: u32,
}

impl Default for FlashConfig {
    fn default() -> Self {
        Self {
            discovery_window: Duration::from_millis(10),
            consensus_window: Duration::from_secs(5),
            poll_interval: Duration::from_millis(1),
            sector_retries: 10,
        }
    }
}

/// Per-device outcome of one flashing run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlashReport {
    /// Ids discovered and selected for programming.
    pub devices: Vec<u32>,
    /// Sectors a device never acknowledged, keyed by device id. Absent
    /// key = fully flashed.
    pub failed_sectors: HashMap<u32, Vec<usize>>,
    pub sectors_written: usize,
}

impl FlashReport {
    /// True when every selected device acknowledged every sector.
    pub fn is_complete(&self) -> bool {
        self.failed_sectors.is_empty()
    }
}

/// Drives the bootloader protocol over a [`CanBus`].
pub struct FirmwareFlasher<B> {
    bus: B,
    config: FlashConfig,
}

impl<B: CanBus> FirmwareFlasher<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            config: FlashConfig::default(),
        }
    }

    pub fn with_config(mut self, config: FlashConfig) -> Self {
        self.config = config;
        self
    }

    /// Flash a firmware image onto every device that answers the id scan.
    ///
    /// Devices that stay silent during discovery are left alone. A sector
    /// that some device never acknowledges is recorded in the report and
    /// flashing continues with the rest of the image.
    pub fn flash_image<R: Read>(&mut self, mut image: R) -> Result<FlashReport> {
        let mut firmware = Vec::new();
        image.read_to_end(&mut firmware)?;
        if firmware.len() > MAX_SECTORS * SECTOR_SIZE {
            return Err(Error::Configuration(format!(
                "firmware image of {} bytes exceeds the {MAX_SECTORS}-sector address space",
                firmware.len()
            )));
        }

        info!("entering bootloader mode");
        self.send(BootPhase::EnterBootloader, &[0])?;

        let discovered = self.discover()?;
        let devices: Vec<u32> = discovered.iter().map(|(id, _)| *id).collect();
        info!("discovered {} devices: {devices:x?}", devices.len());

        let mut report = FlashReport {
            devices: devices.clone(),
            ..FlashReport::default()
        };
        if discovered.is_empty() {
            self.send(BootPhase::ExitFlash, &[0])?;
            return Ok(report);
        }

        // Unicast selection: each device recognizes its own announcement
        // payload echoed back.
        for (id, payload) in &discovered {
            debug!("selecting device {id:#x} for programming");
            self.send(BootPhase::EnterFlash, payload)?;
        }

        let sectors: Vec<&[u8]> = firmware.chunks(SECTOR_SIZE).collect();
        let bar = ProgressBar::new(sectors.len() as u64);
        bar.set_message("Writing firmware");
        for (index, sector) in sectors.iter().enumerate() {
            let survivors = self.program_sector(index, sector, &devices)?;
            for id in survivors {
                warn!("device {id:#x} never acknowledged sector {index}");
                report.failed_sectors.entry(id).or_default().push(index);
            }
            report.sectors_written += 1;
            bar.inc(1);
        }
        bar.finish();

        info!("leaving programming mode");
        self.send(BootPhase::ExitFlash, &[0])?;
        Ok(report)
    }

    fn send(&mut self, phase: BootPhase, payload: &[u8]) -> Result<()> {
        let frame = Frame::new(phase.request_id(), payload)?;
        self.bus.send(&frame)?;
        Ok(())
    }

    /// Broadcast get-id and collect every distinct announcement within the
    /// discovery window. Returns `(device id, raw payload)` pairs.
    fn discover(&mut self) -> Result<Vec<(u32, Vec<u8>)>> {
        self.send(BootPhase::GetId, &[0])?;
        let mut found: Vec<(u32, Vec<u8>)> = Vec::new();
        let deadline = Instant::now() + self.config.discovery_window;
        while Instant::now() < deadline {
            let Some(frame) = self.bus.recv(self.config.poll_interval)? else {
                continue;
            };
            if frame.id() != BootPhase::GetId.reply_id() {
                continue;
            }
            let id = (frame.data_u64() >> 32) as u32;
            if found.iter().all(|(seen, _)| *seen != id) {
                found.push((id, frame.data().to_vec()));
            }
        }
        Ok(found)
    }

    /// Write one sector to all devices, retrying whole rewrites until every
    /// device acks or the retry budget runs out. Returns the ids still
    /// pending afterwards.
    fn program_sector(
        &mut self,
        index: usize,
        sector: &[u8],
        devices: &[u32],
    ) -> Result<Vec<u32>> {
        let mut pending: Vec<u32> = devices.to_vec();
        for attempt in 1..=self.config.sector_retries {
            debug!("sector {index} attempt {attempt}");
            self.send(BootPhase::SelectSector, &[index as u8])?;
            for chunk in 0..CHUNKS_PER_SECTOR {
                let data = padded_chunk(sector, chunk);
                self.send(BootPhase::SendData, &data)?;
            }
            let (high, low) = sector_checksum(sector);
            let mut payload = [0u8; 8];
            payload[..4].copy_from_slice(&high.to_le_bytes());
            payload[4..].copy_from_slice(&low.to_le_bytes());
            self.send(BootPhase::SendChecksum, &payload)?;

            pending = self.await_consensus(devices)?;
            if pending.is_empty() {
                return Ok(pending);
            }
            debug!("sector {index} still pending on {pending:x?}");
        }
        Ok(pending)
    }

    /// Wait for checksum acks. Only an explicit accept clears a device;
    /// a hash or flash error keeps it pending so the sector is rewritten.
    fn await_consensus(&mut self, devices: &[u32]) -> Result<Vec<u32>> {
        let mut pending: Vec<u32> = devices.to_vec();
        let deadline = Instant::now() + self.config.consensus_window;
        while Instant::now() < deadline && !pending.is_empty() {
            let Some(frame) = self.bus.recv(self.config.poll_interval)? else {
                continue;
            };
            if !is_boot_reply(frame.id()) {
                continue;
            }
            let data = frame.data_u64();
            let id = (data >> 32) as u32;
            let ack = SectorAck::from_u8(((data >> 24) & 0xFF) as u8);
            debug!("device {id:#x} answered {ack:?}");
            if matches!(ack, Some(SectorAck::Accepted)) {
                pending.retain(|&p| p != id);
            }
        }
        Ok(pending)
    }
}

/// The 8 bytes of chunk `index`, 0xFF-padded past the end of the image.
fn padded_chunk(sector: &[u8], index: usize) -> [u8; CHUNK_SIZE] {
    let mut data = [0xFF; CHUNK_SIZE];
    let start = index * CHUNK_SIZE;
    if start < sector.len() {
        let end = (start + CHUNK_SIZE).min(sector.len());
        data[..end - start].copy_from_slice(&sector[start..end]);
    }
    data
}

/// The sector checksum pair as computed by the bootloader.
///
/// Four accumulators sum the 16-bit little-endian lanes of every chunk,
/// weighted by the 1-based chunk index, wrapping mod 2^32; the pair sent on
/// the wire folds them as `(acc0 ^ acc3, acc1 ^ acc2)`.
pub fn sector_checksum(sector: &[u8]) -> (u32, u32) {
    let mut acc = [0u32; 4];
    for chunk in 0..CHUNKS_PER_SECTOR {
        let data = padded_chunk(sector, chunk);
        let weight = (chunk + 1) as u32;
        for (i, lane) in acc.iter_mut().enumerate() {
            let value = u32::from(u16::from_le_bytes([data[2 * i], data[2 * i + 1]]));
            *lane = lane.wrapping_add(weight.wrapping_mul(value));
        }
    }
    (acc[0] ^ acc[3], acc[1] ^ acc[2])
}

/// True for any identifier in the bootloader reply range.
fn is_boot_reply(id: u32) -> bool {
    (BOOT_ID_BASE + REPLY_OFFSET..=BOOT_ID_BASE + REPLY_OFFSET + BootPhase::ExitFlash as u32)
        .contains(&id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbus::mock::MockBus;

    fn fast_config() -> FlashConfig {
        FlashConfig {
            discovery_window: Duration::from_millis(5),
            consensus_window: Duration::from_millis(5),
            poll_interval: Duration::from_millis(1),
            sector_retries: 2,
        }
    }

    fn announcement(device: u32, status: u8) -> [u8; 8] {
        let mut data = [0u8; 8];
        data[..4].copy_from_slice(&device.to_be_bytes());
        data[4] = status;
        data
    }

    /// A responder modelling devices in bootloader mode that ack every
    /// checksum.
    fn boot_devices(ids: &'static [u32]) -> canbus::mock::Responder {
        Box::new(move |frame: &Frame| match frame.id() {
            id if id == BootPhase::GetId.request_id() => ids
                .iter()
                .map(|&d| {
                    Frame::new(BootPhase::GetId.reply_id(), &announcement(d, 0)).unwrap()
                })
                .collect(),
            id if id == BootPhase::SendChecksum.request_id() => ids
                .iter()
                .map(|&d| {
                    Frame::new(
                        BootPhase::SendChecksum.reply_id(),
                        &announcement(d, SectorAck::Accepted as u8),
                    )
                    .unwrap()
                })
                .collect(),
            _ => Vec::new(),
        })
    }

    #[test]
    fn checksum_is_deterministic_and_flip_sensitive() {
        let mut sector = vec![0u8; SECTOR_SIZE];
        for (i, byte) in sector.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        let a = sector_checksum(&sector);
        assert_eq!(a, sector_checksum(&sector));
        sector[1234] ^= 0x01;
        assert_ne!(a, sector_checksum(&sector));
    }

    #[test]
    fn zero_sector_checksum_is_zero() {
        assert_eq!(sector_checksum(&[0u8; SECTOR_SIZE]), (0, 0));
    }

    #[test]
    fn short_sector_is_ff_padded() {
        // A 10-byte tail behaves exactly like the explicitly padded sector.
        let tail = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        let mut padded = [0xFFu8; SECTOR_SIZE];
        padded[..10].copy_from_slice(&tail);
        assert_eq!(sector_checksum(&tail), sector_checksum(&padded));
        assert_eq!(padded_chunk(&tail, 1)[2..], [0xFF; 6]);
    }

    #[test]
    fn flash_reaches_consensus_with_two_devices() -> anyhow::Result<()> {
        let bus = MockBus::with_responder(boot_devices(&[0xAAAA_0001, 0xAAAA_0002]));
        let mut flasher = FirmwareFlasher::new(bus).with_config(fast_config());
        let image = vec![0x5Au8; SECTOR_SIZE + 100];
        let report = flasher.flash_image(&image[..])?;

        assert_eq!(report.devices, vec![0xAAAA_0001, 0xAAAA_0002]);
        assert!(report.is_complete());
        assert_eq!(report.sectors_written, 2);

        // Enter, get-id, 2 selections, then per sector: select + 512 chunks
        // + checksum, and the final exit.
        let sent = &flasher.bus.sent;
        assert_eq!(sent.len(), 4 + 2 * (1 + CHUNKS_PER_SECTOR + 1) + 1);
        assert_eq!(sent[0].id(), BootPhase::EnterBootloader.request_id());
        assert_eq!(sent.last().unwrap().id(), BootPhase::ExitFlash.request_id());
        Ok(())
    }

    #[test]
    fn silent_device_exhausts_retries_and_is_reported() {
        // Device 2 answers the id scan but never acks a checksum.
        let bus = MockBus::with_responder(Box::new(move |frame: &Frame| {
            match frame.id() {
                id if id == BootPhase::GetId.request_id() => vec![
                    Frame::new(BootPhase::GetId.reply_id(), &announcement(1, 0)).unwrap(),
                    Frame::new(BootPhase::GetId.reply_id(), &announcement(2, 0)).unwrap(),
                ],
                id if id == BootPhase::SendChecksum.request_id() => vec![Frame::new(
                    BootPhase::SendChecksum.reply_id(),
                    &announcement(1, SectorAck::Accepted as u8),
                )
                .unwrap()],
                _ => Vec::new(),
            }
        }));
        let mut flasher = FirmwareFlasher::new(bus).with_config(fast_config());
        let report = flasher.flash_image(&[0xA5u8; SECTOR_SIZE][..]).unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failed_sectors[&2], vec![0]);
        assert!(!report.failed_sectors.contains_key(&1));

        // The sector was rewritten sector_retries times.
        let selects = flasher
            .bus
            .sent
            .iter()
            .filter(|f| f.id() == BootPhase::SelectSector.request_id())
            .count();
        assert_eq!(selects, 2);
    }

    #[test]
    fn error_acks_keep_the_device_pending() {
        // A hash error must not count as consensus.
        let bus = MockBus::with_responder(Box::new(move |frame: &Frame| {
            match frame.id() {
                id if id == BootPhase::GetId.request_id() => vec![
                    Frame::new(BootPhase::GetId.reply_id(), &announcement(9, 0)).unwrap(),
                ],
                id if id == BootPhase::SendChecksum.request_id() => vec![Frame::new(
                    BootPhase::SendChecksum.reply_id(),
                    &announcement(9, SectorAck::WrongHash as u8),
                )
                .unwrap()],
                _ => Vec::new(),
            }
        }));
        let mut flasher = FirmwareFlasher::new(bus).with_config(fast_config());
        let report = flasher.flash_image(&[1u8; 16][..]).unwrap();
        assert_eq!(report.failed_sectors[&9], vec![0]);
    }

    #[test]
    fn oversize_image_is_rejected_before_any_traffic() {
        let mut flasher = FirmwareFlasher::new(MockBus::new()).with_config(fast_config());
        let image = vec![0u8; MAX_SECTORS * SECTOR_SIZE + 1];
        assert!(matches!(
            flasher.flash_image(&image[..]),
            Err(Error::Configuration(_))
        ));
        assert!(flasher.bus.sent.is_empty());
    }

    #[test]
    fn no_devices_is_a_clean_empty_run() {
        let mut flasher = FirmwareFlasher::new(MockBus::new()).with_config(fast_config());
        let report = flasher.flash_image(&[0u8; 64][..]).unwrap();
        assert!(report.devices.is_empty());
        assert!(report.is_complete());
        assert_eq!(report.sectors_written, 0);
        // Enter bootloader, get-id, exit.
        assert_eq!(flasher.bus.sent.len(), 3);
    }
}
