//! CMSIS-DAP packet processing.
//!
//! Covers the commands that touch the pin layer directly plus the vendor
//! command that requests update mode. Memory and register transfers are left
//! to a full debug engine; they answer with the "unknown command" byte.

use core::fmt;

use crate::indicator::{Indicator, StatusIndicators};
use crate::pins::{DebugPort, swj_sequence};
use crate::tick::{Ticks, elapsed};
use crate::update::BootloaderRequest;

/// Packet size reported by DAP_Info and used for the bulk endpoints.
pub const WIRE_PACKET_SIZE: u16 = 64;
pub const PACKET_SIZE: usize = WIRE_PACKET_SIZE as usize;
pub const PACKET_COUNT: u8 = 1;

const DAP_OK: u8 = 0x00;
const UNKNOWN_COMMAND: u8 = 0xFF;

/// Capability bit advertising SWD in `DAP_Info`.
const CAPABILITY_SWD: u8 = 0x01;

const PIN_SWCLK: u8 = 1 << 0;
const PIN_SWDIO: u8 = 1 << 1;
const PIN_TDI: u8 = 1 << 2;
const PIN_TDO: u8 = 1 << 3;
const PIN_NTRST: u8 = 1 << 5;
const PIN_NRESET: u8 = 1 << 7;

/// Upper bound on the `DAP_SWJ_Pins` wait, in pin reads.
const MAX_PIN_WAIT: u32 = 10_000;

/// Ticks a reply may wait for the host before it is discarded.
pub const REPLY_TIMEOUT_TICKS: u32 = 1_000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Command {
    Info = 0x00,
    HostStatus = 0x01,
    Connect = 0x02,
    Disconnect = 0x03,
    ResetTarget = 0x0A,
    SwjPins = 0x10,
    SwjSequence = 0x12,
    /// Vendor command 0: reboot into the update-mode bootloader.
    EnterUpdateMode = 0x80,
}

impl Command {
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => Command::Info,
            0x01 => Command::HostStatus,
            0x02 => Command::Connect,
            0x03 => Command::Disconnect,
            0x0A => Command::ResetTarget,
            0x10 => Command::SwjPins,
            0x12 => Command::SwjSequence,
            0x80 => Command::EnterUpdateMode,
            _ => return None,
        })
    }
}

/// Debug port selected by `DAP_Connect`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    Disabled,
    Swd,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DapError {
    EmptyRequest,
    /// Request shorter than its command requires.
    Truncated(u8),
    ResponseTooSmall,
}

impl fmt::Display for DapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DapError::EmptyRequest => f.write_str("empty request"),
            DapError::Truncated(command) => write!(f, "truncated request for 0x{command:02x}"),
            DapError::ResponseTooSmall => f.write_str("response buffer too small"),
        }
    }
}

/// Identification strings reported by `DAP_Info`.
#[derive(Copy, Clone, Debug)]
pub struct DapInfo {
    pub vendor: &'static str,
    pub product: &'static str,
    pub serial: &'static str,
    pub firmware_version: &'static str,
}

impl DapInfo {
    pub const DEFAULT: Self = Self {
        vendor: "Devan Lai",
        product: "DAP42 CMSIS-DAP",
        serial: "DAP42",
        firmware_version: "1.0",
    };
}

#[derive(Debug)]
pub struct DapProcessor {
    info: DapInfo,
    port: Port,
}

impl DapProcessor {
    #[must_use]
    pub const fn new(info: DapInfo) -> Self {
        Self {
            info,
            port: Port::Disabled,
        }
    }

    #[must_use]
    pub const fn port(&self) -> Port {
        self.port
    }

    /// Executes one request packet, writing the reply into `response`.
    ///
    /// Returns the reply length.
    pub fn process<P>(
        &mut self,
        port: &mut P,
        bootloader: &mut BootloaderRequest,
        request: &[u8],
        response: &mut [u8],
    ) -> Result<usize, DapError>
    where
        P: DebugPort + StatusIndicators + ?Sized,
    {
        let (&id, args) = request.split_first().ok_or(DapError::EmptyRequest)?;
        let mut reply = Writer::new(response);

        let Some(command) = Command::from_byte(id) else {
            reply.push(UNKNOWN_COMMAND)?;
            return Ok(reply.len());
        };
        reply.push(id)?;

        match command {
            Command::Info => self.info(args, &mut reply)?,
            Command::HostStatus => {
                let [kind, status, ..] = *args else {
                    return Err(DapError::Truncated(id));
                };
                let on = status != 0;
                match kind {
                    0 => port.set_indicator(Indicator::Connected, on),
                    1 => port.set_indicator(Indicator::Running, on),
                    _ => {}
                }
                reply.push(DAP_OK)?;
            }
            Command::Connect => {
                let mode = args.first().copied().unwrap_or(0);
                if mode <= 1 {
                    port.swd_setup();
                    self.port = Port::Swd;
                    reply.push(1)?;
                } else {
                    reply.push(0)?;
                }
            }
            Command::Disconnect => {
                port.port_off();
                self.port = Port::Disabled;
                reply.push(DAP_OK)?;
            }
            Command::ResetTarget => {
                // No device-specific reset sequence is implemented.
                reply.push(DAP_OK)?;
                reply.push(0)?;
            }
            Command::SwjPins => {
                let [output, select, w0, w1, w2, w3, ..] = *args else {
                    return Err(DapError::Truncated(id));
                };
                let wait_us = u32::from_le_bytes([w0, w1, w2, w3]);
                if select & PIN_SWCLK != 0 {
                    if output & PIN_SWCLK != 0 {
                        port.swclk_set();
                    } else {
                        port.swclk_clr();
                    }
                }
                if select & PIN_SWDIO != 0 {
                    port.swdio_out(output & PIN_SWDIO != 0);
                }
                if select & PIN_NRESET != 0 {
                    port.nreset_out(output & PIN_NRESET != 0);
                }
                reply.push(settle_pins(port, output, select, wait_us))?;
            }
            Command::SwjSequence => {
                let (&count, data) = args.split_first().ok_or(DapError::Truncated(id))?;
                let bits = if count == 0 { 256 } else { usize::from(count) };
                if data.len() < bits.div_ceil(8) {
                    return Err(DapError::Truncated(id));
                }
                swj_sequence(port, bits, data);
                reply.push(DAP_OK)?;
            }
            Command::EnterUpdateMode => {
                bootloader.request();
                reply.push(DAP_OK)?;
            }
        }

        Ok(reply.len())
    }

    fn info(&self, args: &[u8], reply: &mut Writer<'_>) -> Result<(), DapError> {
        let Some(&kind) = args.first() else {
            return Err(DapError::Truncated(Command::Info as u8));
        };
        match kind {
            0x01 => reply.string(self.info.vendor),
            0x02 => reply.string(self.info.product),
            0x03 => reply.string(self.info.serial),
            0x04 => reply.string(self.info.firmware_version),
            0xF0 => reply.extend(&[1, CAPABILITY_SWD]),
            0xFE => reply.extend(&[1, PACKET_COUNT]),
            0xFF => {
                let [lo, hi] = WIRE_PACKET_SIZE.to_le_bytes();
                reply.extend(&[2, lo, hi])
            }
            // Target device vendor/name and anything unknown: no information.
            _ => reply.push(0),
        }
    }
}

impl Default for DapProcessor {
    fn default() -> Self {
        Self::new(DapInfo::DEFAULT)
    }
}

/// Reply waiting for the host to read it from the IN endpoint.
///
/// While held, the engine counts as busy and update mode waits;
/// [`HeldReply::expire`] bounds that wait.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct HeldReply {
    held: Option<(usize, Ticks)>,
}

impl HeldReply {
    #[must_use]
    pub const fn new() -> Self {
        Self { held: None }
    }

    pub fn hold(&mut self, len: usize, now: Ticks) {
        self.held = Some((len, now));
    }

    #[must_use]
    pub fn pending_len(&self) -> Option<usize> {
        self.held.map(|(len, _)| len)
    }

    pub fn release(&mut self) {
        self.held = None;
    }

    /// Drops the reply once it has waited `timeout` ticks; returns whether it did.
    pub fn expire(&mut self, now: Ticks, timeout: u32) -> bool {
        match self.held {
            Some((_, since)) if elapsed(since, now) >= timeout => {
                self.held = None;
                true
            }
            _ => false,
        }
    }
}

fn read_pins<P: DebugPort + ?Sized>(port: &P) -> u8 {
    [
        (port.swclk_in(), PIN_SWCLK),
        (port.swdio_in(), PIN_SWDIO),
        (port.tdi_in(), PIN_TDI),
        (port.tdo_in(), PIN_TDO),
        (port.ntrst_in(), PIN_NTRST),
        (port.nreset_in(), PIN_NRESET),
    ]
    .into_iter()
    .filter(|(level, _)| *level)
    .fold(0, |pins, (_, bit)| pins | bit)
}

/// Re-reads the pins until the selected ones match `output`, for at most
/// `wait` reads (capped at [`MAX_PIN_WAIT`]). One read takes roughly a
/// microsecond on the probe.
fn settle_pins<P: DebugPort + ?Sized>(port: &P, output: u8, select: u8, wait: u32) -> u8 {
    let mut pins = read_pins(port);
    for _ in 0..wait.min(MAX_PIN_WAIT) {
        if pins & select == output & select {
            break;
        }
        pins = read_pins(port);
    }
    pins
}

struct Writer<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn push(&mut self, byte: u8) -> Result<(), DapError> {
        let slot = self.buf.get_mut(self.len).ok_or(DapError::ResponseTooSmall)?;
        *slot = byte;
        self.len += 1;
        Ok(())
    }

    fn extend(&mut self, bytes: &[u8]) -> Result<(), DapError> {
        bytes.iter().try_for_each(|byte| self.push(*byte))
    }

    /// Length-prefixed, NUL-terminated string.
    fn string(&mut self, value: &str) -> Result<(), DapError> {
        let len = u8::try_from(value.len() + 1).map_err(|_| DapError::ResponseTooSmall)?;
        self.push(len)?;
        self.extend(value.as_bytes())?;
        self.push(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::LedPattern;

    #[derive(Default)]
    struct MockPort {
        clk: bool,
        dio: bool,
        nreset: bool,
        configured: bool,
        connected_led: bool,
        clocked_bits: usize,
        /// The target holds nRESET low whatever the probe drives.
        reset_held: bool,
        nreset_reads: core::cell::Cell<usize>,
    }

    impl DebugPort for MockPort {
        fn swd_setup(&mut self) {
            self.configured = true;
            self.clk = true;
            self.dio = true;
        }

        fn port_off(&mut self) {
            self.configured = false;
        }

        fn swclk_set(&mut self) {
            self.clk = true;
            self.clocked_bits += 1;
        }

        fn swclk_clr(&mut self) {
            self.clk = false;
        }

        fn swclk_in(&self) -> bool {
            self.clk
        }

        fn swdio_set(&mut self) {
            self.dio = true;
        }

        fn swdio_clr(&mut self) {
            self.dio = false;
        }

        fn swdio_in(&self) -> bool {
            self.dio
        }

        fn swdio_out(&mut self, bit: bool) {
            self.dio = bit;
        }

        fn swdio_out_enable(&mut self) {}

        fn swdio_out_disable(&mut self) {}

        fn nreset_in(&self) -> bool {
            self.nreset_reads.set(self.nreset_reads.get() + 1);
            self.nreset && !self.reset_held
        }

        fn nreset_out(&mut self, level: bool) {
            self.nreset = level;
        }

        fn dap_setup(&mut self) {}
    }

    impl StatusIndicators for MockPort {
        fn show(&mut self, _pattern: LedPattern) {}

        fn set_indicator(&mut self, indicator: Indicator, on: bool) {
            if indicator == Indicator::Connected {
                self.connected_led = on;
            }
        }
    }

    fn run(request: &[u8]) -> (MockPort, BootloaderRequest, heapless::Vec<u8, PACKET_SIZE>) {
        let mut port = MockPort::default();
        let mut bootloader = BootloaderRequest::new();
        let mut response = [0u8; PACKET_SIZE];
        let len = DapProcessor::default()
            .process(&mut port, &mut bootloader, request, &mut response)
            .unwrap();
        let reply = heapless::Vec::from_slice(&response[..len]).unwrap();
        (port, bootloader, reply)
    }

    #[test]
    fn info_reports_vendor_string_with_terminator() {
        let (_, _, reply) = run(&[0x00, 0x01]);
        assert_eq!(reply[0], 0x00);
        assert_eq!(usize::from(reply[1]), "Devan Lai".len() + 1);
        assert_eq!(&reply[2..11], b"Devan Lai");
        assert_eq!(reply[11], 0);
    }

    #[test]
    fn info_reports_packet_geometry() {
        let (_, _, size) = run(&[0x00, 0xFF]);
        assert_eq!(size.as_slice(), &[0x00, 2, 64, 0]);
        let (_, _, count) = run(&[0x00, 0xFE]);
        assert_eq!(count.as_slice(), &[0x00, 1, 1]);
        let (_, _, caps) = run(&[0x00, 0xF0]);
        assert_eq!(caps.as_slice(), &[0x00, 1, CAPABILITY_SWD]);
    }

    #[test]
    fn connect_selects_swd_and_refuses_jtag() {
        let (port, _, reply) = run(&[0x02, 0x00]);
        assert_eq!(reply.as_slice(), &[0x02, 1]);
        assert!(port.configured);

        let (port, _, reply) = run(&[0x02, 0x02]);
        assert_eq!(reply.as_slice(), &[0x02, 0]);
        assert!(!port.configured);
    }

    #[test]
    fn swj_pins_writes_selected_and_reads_back() {
        let (port, _, reply) = run(&[
            0x10,
            PIN_NRESET | PIN_SWCLK,
            PIN_NRESET | PIN_SWCLK,
            0,
            0,
            0,
            0,
        ]);
        assert!(port.nreset);
        assert!(port.clk);
        assert_eq!(reply.as_slice(), &[0x10, PIN_NRESET | PIN_SWCLK]);
    }

    #[test]
    fn swj_pins_wait_gives_up_when_the_pin_never_settles() {
        let mut port = MockPort {
            reset_held: true,
            ..MockPort::default()
        };
        let mut bootloader = BootloaderRequest::new();
        let mut response = [0u8; PACKET_SIZE];
        let [w0, w1, w2, w3] = 50u32.to_le_bytes();
        let len = DapProcessor::default()
            .process(
                &mut port,
                &mut bootloader,
                &[0x10, PIN_NRESET, PIN_NRESET, w0, w1, w2, w3],
                &mut response,
            )
            .unwrap();
        assert_eq!(&response[..len], &[0x10, 0]);
        assert_eq!(port.nreset_reads.get(), 51);
    }

    #[test]
    fn swj_pins_wait_is_capped() {
        let mut port = MockPort {
            reset_held: true,
            ..MockPort::default()
        };
        let mut bootloader = BootloaderRequest::new();
        let mut response = [0u8; PACKET_SIZE];
        DapProcessor::default()
            .process(
                &mut port,
                &mut bootloader,
                &[0x10, PIN_NRESET, PIN_NRESET, 0xFF, 0xFF, 0xFF, 0xFF],
                &mut response,
            )
            .unwrap();
        assert_eq!(port.nreset_reads.get(), MAX_PIN_WAIT as usize + 1);
    }

    #[test]
    fn swj_sequence_zero_count_means_256_bits() {
        let mut request = [0xFFu8; 34];
        request[0] = 0x12;
        request[1] = 0;
        let (port, _, reply) = run(&request);
        assert_eq!(reply.as_slice(), &[0x12, DAP_OK]);
        assert_eq!(port.clocked_bits, 256);
    }

    #[test]
    fn swj_sequence_rejects_short_payload() {
        let mut port = MockPort::default();
        let mut bootloader = BootloaderRequest::new();
        let mut response = [0u8; PACKET_SIZE];
        let result = DapProcessor::default().process(
            &mut port,
            &mut bootloader,
            &[0x12, 16, 0xFF],
            &mut response,
        );
        assert_eq!(result, Err(DapError::Truncated(0x12)));
    }

    #[test]
    fn host_status_drives_connected_led() {
        let (port, _, reply) = run(&[0x01, 0x00, 0x01]);
        assert!(port.connected_led);
        assert_eq!(reply.as_slice(), &[0x01, DAP_OK]);
    }

    #[test]
    fn vendor_command_requests_update_mode() {
        let (_, bootloader, reply) = run(&[0x80]);
        assert!(bootloader.is_requested());
        assert_eq!(reply.as_slice(), &[0x80, DAP_OK]);
    }

    #[test]
    fn unknown_command_answers_ff() {
        let (_, bootloader, reply) = run(&[0x05, 0x00]);
        assert_eq!(reply.as_slice(), &[UNKNOWN_COMMAND]);
        assert!(!bootloader.is_requested());
    }

    #[test]
    fn reports_empty_request() {
        let mut port = MockPort::default();
        let mut bootloader = BootloaderRequest::new();
        let mut response = [0u8; 4];
        let err = DapProcessor::default()
            .process(&mut port, &mut bootloader, &[], &mut response)
            .unwrap_err();
        assert_eq!(err, DapError::EmptyRequest);
    }

    #[test]
    fn held_reply_waits_for_the_host() {
        let mut reply = HeldReply::new();
        reply.hold(3, Ticks::from_raw(10));
        assert!(!reply.expire(Ticks::from_raw(10 + REPLY_TIMEOUT_TICKS - 1), REPLY_TIMEOUT_TICKS));
        assert_eq!(reply.pending_len(), Some(3));

        reply.release();
        assert_eq!(reply.pending_len(), None);
        assert!(!reply.expire(Ticks::from_raw(u32::MAX), REPLY_TIMEOUT_TICKS));
    }

    #[test]
    fn uncollected_reply_is_dropped_after_the_timeout() {
        let mut reply = HeldReply::new();
        let start = Ticks::from_raw(u32::MAX - 5);
        reply.hold(1, start);

        assert!(reply.expire(start.wrapping_add(REPLY_TIMEOUT_TICKS), REPLY_TIMEOUT_TICKS));
        assert_eq!(reply.pending_len(), None);
        assert!(!reply.expire(start.wrapping_add(2 * REPLY_TIMEOUT_TICKS), REPLY_TIMEOUT_TICKS));
    }
}
