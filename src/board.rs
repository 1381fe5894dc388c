//! Command and reply traffic with one acquisition board.
//!
//! Boards are microcontroller devices hanging off the crate CAN bus. A
//! command is one 6-byte frame; the board echoes the command byte back
//! with a status code and up to four payload bytes. Boards powerdown
//! aggressively, so every command is prefixed by a wake handshake: NOPs
//! are fired until one is answered, then the real command goes out.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::commands::{status, CommandDescriptor, CommandSet, FRAME_LEN};
use crate::error::{DeviceFault, DeviceWarning, Error, Result};
use canbus::{CanBus, Filter, Frame};
use num_traits::FromPrimitive;

/// Fixed upper identifier bits shared by every board in every crate.
pub const ID_PREFIX: u32 = 0x0041_0000;
/// Acceptance mask matching all channels of one board.
pub const ID_MASK: u32 = 0x1FFF_FFF0;
/// Channels 1..=12 address the analog inputs; 0 addresses the board itself.
pub const MAX_CHANNEL: u8 = 12;

/// The bus identity of one board: crate number plus slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAddress {
    pub crate_id: u8,
    pub board: u8,
}

impl DeviceAddress {
    pub fn new(crate_id: u8, board: u8) -> Self {
        Self { crate_id, board }
    }

    /// The identifier of channel 0, which is also the filter base.
    pub fn base_id(&self) -> u32 {
        ID_PREFIX | (u32::from(self.crate_id) << 8) | (u32::from(self.board) << 4)
    }

    /// The identifier addressing one channel of this board.
    pub fn channel_id(&self, channel: u8) -> Result<u32> {
        if channel > MAX_CHANNEL {
            return Err(Error::Channel(channel));
        }
        Ok(self.base_id() | u32::from(channel))
    }

    /// The kernel filter accepting every channel of this board.
    pub fn filter(&self) -> Filter {
        Filter {
            id: self.base_id(),
            mask: ID_MASK,
        }
    }
}

/// Tuning of the wake handshake.
#[derive(Debug, Clone, Copy)]
pub struct WakeConfig {
    /// NOPs fired before giving up on the board.
    pub attempts: u32,
    /// Reply wait per NOP.
    pub reply_timeout: Duration,
}

impl Default for WakeConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            reply_timeout: Duration::from_millis(10),
        }
    }
}

/// Non-fault outcome of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// The board answered with a retryable condition; the caller decides.
    Warning(DeviceWarning),
}

/// A decoded reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReply {
    pub status: Status,
    /// One value per output group of the command descriptor.
    pub values: Vec<u32>,
    /// NOPs it took to get the board to answer, 1..=attempts.
    pub wake_attempts: u32,
}

impl CommandReply {
    /// The first (usually only) output value.
    pub fn value(&self) -> u32 {
        self.values.first().copied().unwrap_or(0)
    }
}

/// One acquisition board reached over a [`CanBus`].
pub struct Board<B> {
    bus: B,
    commands: &'static CommandSet,
    address: DeviceAddress,
    wake_config: WakeConfig,
    default_timeout: Duration,
}

impl<B: CanBus> Board<B> {
    pub fn new(bus: B, address: DeviceAddress) -> Self {
        Self {
            bus,
            commands: CommandSet::builtin(),
            address,
            wake_config: WakeConfig::default(),
            default_timeout: Duration::from_millis(100),
        }
    }

    pub fn with_wake_config(mut self, wake_config: WakeConfig) -> Self {
        self.wake_config = wake_config;
        self
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    fn frame(&self, byte: u8, data: u32, channel: u8, queue: bool) -> Result<Frame> {
        let id = self.address.channel_id(channel)?;
        let be = data.to_be_bytes();
        let payload = [byte, be[0], be[1], be[2], be[3], u8::from(queue)];
        Ok(Frame::new(id, &payload)?)
    }

    /// Wake the board from powerdown: fire NOPs until one is answered.
    /// Returns the number of attempts it took.
    pub fn wake(&mut self) -> Result<u32> {
        let set = self.commands;
        let nop = set.get("NOP").ok_or_else(|| {
            Error::Configuration("command dictionary is missing NOP".to_string())
        })?;
        for attempt in 1..=self.wake_config.attempts {
            let frame = self.frame(nop.byte, 0, 0, false)?;
            self.bus.send(&frame)?;
            match self.poll_reply(nop, 0, self.wake_config.reply_timeout) {
                Ok(reply) if matches!(reply.status, Status::Success) => {
                    debug!("board {} awake after {attempt} NOPs", self.address.board);
                    return Ok(attempt);
                }
                // Boards answer with garbage while coming out of powerdown;
                // anything short of a clean NOP ack is one more attempt.
                Ok(_) | Err(Error::Timeout(_) | Error::Device(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        warn!(
            "board {} not answering after {} NOPs",
            self.address.board, self.wake_config.attempts
        );
        Err(Error::Wake {
            attempts: self.wake_config.attempts,
        })
    }

    /// Send a command by dictionary name.
    ///
    /// A `timeout` of `None` with `queue` unset is fire-and-forget: the
    /// frame goes out after the wake handshake and no reply is read.
    /// Otherwise the call blocks until a matching reply or the deadline.
    pub fn send_command(
        &mut self,
        name: &str,
        data: u32,
        channel: u8,
        timeout: Option<Duration>,
        queue: bool,
    ) -> Result<Option<CommandReply>> {
        let set = self.commands;
        let descriptor = set
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown command {name}")))?;
        let wake_attempts = self.wake()?;

        debug!(
            "send {name} data {data:#010x} ch {channel} queue {queue} to board {}",
            self.address.board
        );
        let frame = self.frame(descriptor.byte, data, channel, queue)?;
        self.bus.send(&frame)?;

        match timeout {
            None if !queue => Ok(None),
            _ => {
                let timeout = timeout.unwrap_or(self.default_timeout);
                let mut reply = self.poll_reply(descriptor, channel, timeout)?;
                reply.wake_attempts = wake_attempts;
                Ok(Some(reply))
            }
        }
    }

    /// Poll the deferred reply of an earlier queued command.
    pub fn check_reply(
        &mut self,
        name: &str,
        channel: u8,
        timeout: Duration,
    ) -> Result<CommandReply> {
        let set = self.commands;
        let descriptor = set
            .get(name)
            .ok_or_else(|| Error::Configuration(format!("unknown command {name}")))?;
        self.poll_reply(descriptor, channel, timeout)
    }

    /// Wait for a reply to `descriptor` on `channel`, discarding frames
    /// from other channels or echoing other commands.
    fn poll_reply(
        &mut self,
        descriptor: &CommandDescriptor,
        channel: u8,
        timeout: Duration,
    ) -> Result<CommandReply> {
        let id = self.address.channel_id(channel)?;
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let Some(frame) = self.bus.recv(deadline - now)? else {
                return Err(Error::Timeout(timeout));
            };
            let data = frame.data();
            if frame.id() != id || data.len() != FRAME_LEN || data[0] != descriptor.byte {
                debug!("dropping unrelated frame id {:#x}", frame.id());
                continue;
            }
            let status = classify(data[FRAME_LEN - 1])?;
            return Ok(CommandReply {
                status,
                values: decode_values(descriptor, data),
                wake_attempts: 0,
            });
        }
    }
}

/// Map a reply status byte to an outcome.
fn classify(code: u8) -> Result<Status> {
    match code {
        status::WARNING => Ok(Status::Warning(DeviceWarning::Soft)),
        status::BUSY => Ok(Status::Warning(DeviceWarning::Busy)),
        _ => match DeviceFault::from_u8(code) {
            Some(fault) => Err(Error::Device(fault)),
            None => Ok(Status::Success),
        },
    }
}

/// Fold the descriptor's reply byte groups into big-endian values. An
/// empty group decodes to 0.
fn decode_values(descriptor: &CommandDescriptor, data: &[u8]) -> Vec<u32> {
    descriptor
        .outputs
        .iter()
        .map(|group| group.iter().fold(0u32, |acc, &i| (acc << 8) | u32::from(data[i])))
        .collect()
}

fn sign16(v: u32) -> i32 {
    i32::from(v as u16 as i16)
}

/// Typed wrappers over the command dictionary. Slow commands carry the
/// firmware's measured execution time as their deadline.
impl<B: CanBus> Board<B> {
    fn call(&mut self, name: &str, data: u32, channel: u8) -> Result<CommandReply> {
        let timeout = self.default_timeout;
        self.call_with(name, data, channel, timeout)
    }

    fn call_with(
        &mut self,
        name: &str,
        data: u32,
        channel: u8,
        timeout: Duration,
    ) -> Result<CommandReply> {
        Ok(self
            .send_command(name, data, channel, Some(timeout), false)?
            .unwrap_or(CommandReply {
                status: Status::Success,
                values: Vec::new(),
                wake_attempts: 0,
            }))
    }

    pub fn nop(&mut self) -> Result<CommandReply> {
        self.call("NOP", 0, 0)
    }

    /// Store a 16-bit board identity in non-volatile memory.
    pub fn write_id(&mut self, id: u16) -> Result<CommandReply> {
        self.call("ID_WRITE", u32::from(id) << 16, 0)
    }

    pub fn read_id(&mut self) -> Result<u16> {
        Ok(self.call("ID_READ", 0, 0)?.value() as u16)
    }

    /// Firmware build stamp, formatted YYMMDDhhmm.
    pub fn firmware_version(&mut self) -> Result<u32> {
        Ok(self.call("FW_VER_READ", 0, 0)?.value())
    }

    pub fn hardware_revision(&mut self) -> Result<u32> {
        Ok(self.call("HW_REV_READ", 0, 0)?.value())
    }

    pub fn blink(&mut self, mode: u8, delay_ms: u32, period_ms: u32, count: u8) -> Result<CommandReply> {
        let data = (u32::from(mode) << 24)
            | ((delay_ms / 10) << 16)
            | ((period_ms / 20) << 8)
            | u32::from(count);
        self.call("BLINK", data, 0)
    }

    /// The reply is quick; the board then drops off the bus to reboot.
    pub fn restart(&mut self) -> Result<CommandReply> {
        self.call("RESTART", 0, 0)
    }

    /// Analog recalibration takes about 2.6 s on the board.
    pub fn recalibrate(&mut self) -> Result<CommandReply> {
        self.call_with("RECALIBRATE", 0, 0, Duration::from_secs(3))
    }

    pub fn factory_reset(&mut self) -> Result<CommandReply> {
        self.call_with("RESET_FACTORY", 0, 0, Duration::from_secs(2))
    }

    pub fn write_powerdown(&mut self, powerdown: bool, persist: bool) -> Result<CommandReply> {
        let data = (u32::from(powerdown) << 24) | (u32::from(persist) << 16);
        self.call("POWERDOWN_CONFIG", data, 0)
    }

    pub fn read_powerdown(&mut self) -> Result<bool> {
        Ok(self.call("POWERDOWN_READ", 0, 0)?.value() != 0)
    }

    pub fn write_filter_enable(&mut self, channel: u8, enable: bool) -> Result<CommandReply> {
        self.call("FILTER_ENABLE_WRITE", u32::from(enable) << 24, channel)
    }

    pub fn read_filter_enable(&mut self, channel: u8) -> Result<bool> {
        Ok(self.call("FILTER_ENABLE_READ", 0, channel)?.value() != 0)
    }

    /// Cut-off frequency in Hz.
    pub fn write_filter_frequency(&mut self, channel: u8, hz: u32) -> Result<CommandReply> {
        self.call("FREQUENCY_WRITE", hz << 16, channel)
    }

    pub fn read_filter_frequency(&mut self, channel: u8) -> Result<u32> {
        Ok(self.call("FREQUENCY_READ", 0, channel)?.value())
    }

    pub fn write_input_grounded(&mut self, channel: u8, grounded: bool) -> Result<CommandReply> {
        self.call("INPUT_GROUND_WRITE", u32::from(grounded) << 24, channel)
    }

    pub fn read_input_grounded(&mut self, channel: u8) -> Result<bool> {
        Ok(self.call("INPUT_GROUND_READ", 0, channel)?.value() != 0)
    }

    /// Cut-off, filter enable and input grounding in one command.
    pub fn write_filter_settings(
        &mut self,
        channel: u8,
        hz: u32,
        enable: bool,
        grounded: bool,
    ) -> Result<CommandReply> {
        let data = (hz << 16) | (u32::from(enable) << 8) | u32::from(grounded);
        self.call("FREQUENCY_AND_ENABLE", data, channel)
    }

    pub fn write_trimmer(&mut self, channel: u8, trimmer: u8, value: u16) -> Result<CommandReply> {
        let data = (u32::from(trimmer) << 24) | (u32::from(value) << 8);
        self.call("TRIMMER_WRITE", data, channel)
    }

    pub fn read_trimmer(&mut self, channel: u8, trimmer: u8) -> Result<u16> {
        Ok(self.call("TRIMMER_READ", u32::from(trimmer) << 24, channel)?.value() as u16)
    }

    /// Loading a settings slot takes about 0.42 s.
    pub fn load_slot(&mut self, slot: u8) -> Result<CommandReply> {
        self.call_with("LOAD_SETTINGS", u32::from(slot) << 24, 0, Duration::from_millis(500))
    }

    pub fn save_slot(&mut self, slot: u8, lock: bool) -> Result<CommandReply> {
        let data = (u32::from(slot) << 24) | (u32::from(lock) << 16);
        self.call("SAVE_SETTINGS", data, 0)
    }

    pub fn write_memory(&mut self, address: u16, data: u8) -> Result<CommandReply> {
        let value = (u32::from(address) << 16) | (u32::from(data) << 8);
        self.call("MEMORY_WRITE", value, 0)
    }

    pub fn read_memory(&mut self, address: u16, nbytes: u8) -> Result<u32> {
        let value = (u32::from(address) << 16) | (u32::from(nbytes) << 8);
        Ok(self.call("MEMORY_READ", value, 0)?.value())
    }

    /// Formatting the settings memory takes about 2.2 s.
    pub fn erase_memory(&mut self) -> Result<CommandReply> {
        self.call_with("ERASE_ALL", 0, 0, Duration::from_millis(2500))
    }

    /// ADC output rate in Hz. The wire carries mHz; bit 31 disables the
    /// ADC's single-cycle settling mode.
    pub fn write_adc_frequency(
        &mut self,
        channel: u8,
        hz: f64,
        single_cycle_disable: bool,
    ) -> Result<f64> {
        let data = ((hz * 1000.0) as u32) | (u32::from(single_cycle_disable) << 31);
        let reply = self.call("ADC_FREQ_WRITE", data, channel)?;
        Ok(f64::from(reply.value()) / 1000.0)
    }

    pub fn read_adc_frequency(&mut self, channel: u8) -> Result<f64> {
        Ok(f64::from(self.call("ADC_FREQ_READ", 0, channel)?.value()) / 1000.0)
    }

    /// 0 = internal sync, 1 = external serial, 2 = external parallel.
    pub fn write_adc_mode(&mut self, mode: u8) -> Result<CommandReply> {
        self.call("MODE_WRITE", u32::from(mode) << 24, 0)
    }

    pub fn read_adc_mode(&mut self) -> Result<u8> {
        Ok(self.call("MODE_READ", 0, 0)?.value() as u8)
    }

    pub fn start_measurement(&mut self, channel: u8) -> Result<CommandReply> {
        self.call("ADC_START_MEAS", 0, channel)
    }

    pub fn stop_measurement(&mut self, channel: u8) -> Result<CommandReply> {
        self.call("ADC_STOP_MEAS", 0, channel)
    }

    /// `kind`: 0 average, 1 RMS, 2 max-min, 3 status, 4 sample count,
    /// 5 elapsed ms, 6 enable.
    pub fn read_measurement(&mut self, channel: u8, kind: u8) -> Result<u32> {
        Ok(self.call("ADC_READ_MEAS", u32::from(kind) << 24, channel)?.value())
    }

    /// Start continuous acquisition. `alt_sync` selects the alternate
    /// sync alignment mode.
    pub fn start_daq(&mut self, channel: u8, alt_sync: bool) -> Result<CommandReply> {
        self.call("ADC_CONTINUOUS", u32::from(alt_sync) << 24, channel)
    }

    pub fn stop_daq(&mut self, channel: u8) -> Result<CommandReply> {
        self.call("ADC_STOP", 0, channel)
    }

    /// One immediate conversion, as a raw ADC code.
    pub fn read_adc_conversion(&mut self, channel: u8) -> Result<u32> {
        Ok(self.call("ADC_SINGLE", 0, channel)?.value())
    }

    /// Supply rail voltage in volts. Rails 0..=7 per the board monitor.
    pub fn read_power_supply(&mut self, rail: u8) -> Result<f64> {
        let reply = self.call("POWERSUPPLY_READ", u32::from(rail) << 24, 0)?;
        Ok(f64::from(sign16(reply.value())) / 1000.0)
    }

    /// Board temperature in degrees Celsius.
    pub fn read_temperature(&mut self) -> Result<f64> {
        let reply = self.call("TEMPERATURE_READ", 0, 0)?;
        Ok(f64::from(sign16(reply.value())) / 100.0)
    }

    pub fn reset_error_counter(&mut self) -> Result<CommandReply> {
        self.call("ERROR_CNT_RESET", 0, 0)
    }

    pub fn read_error_counter(&mut self) -> Result<u32> {
        Ok(self.call("ERROR_CNT_READ", 0, 0)?.value())
    }

    pub fn reset_error_list(&mut self) -> Result<CommandReply> {
        self.call("ERROR_LIST_RESET", 0, 0)
    }

    /// Returns `(position, code)` of the oldest recorded error.
    pub fn read_error_list(&mut self) -> Result<(u32, u32)> {
        let reply = self.call("ERROR_LIST_READ", 0, 0)?;
        Ok((reply.values[0], reply.values[1]))
    }

    pub fn write_error_mode(&mut self, instant: bool, persist: bool) -> Result<CommandReply> {
        let data = (u32::from(instant) << 24) | (u32::from(persist) << 16);
        self.call("ERROR_INSTANT_MODE", data, 0)
    }

    pub fn read_error_mode(&mut self) -> Result<bool> {
        Ok(self.call("ERROR_INSTANT_MODE_READ", 0, 0)?.value() != 0)
    }
}
