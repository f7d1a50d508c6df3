//! SLCAN: CAN frames tunnelled over a serial line as CR-terminated ASCII.
//!
//! Only the subset the probe answers is implemented: bit-rate selection,
//! open/close, standard and extended data/remote frames, and the version,
//! serial-number and status queries.

use core::fmt;

use heapless::Vec;

/// Longest command line accepted (`T` + 8 id + length + 16 data).
pub const MAX_LINE: usize = 26;

pub type Reply = Vec<u8, 32>;

const OK: u8 = b'\r';
const BELL: u8 = 0x07;
const VERSION: &[u8] = b"V1013\r";
const SERIAL: &[u8] = b"NDA42\r";

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Bitrate {
    Kbps10,
    Kbps20,
    Kbps50,
    Kbps100,
    Kbps125,
    Kbps250,
    Kbps500,
    Kbps800,
    Mbps1,
}

impl Bitrate {
    /// Decodes the digit following an `S` command.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            b'0' => Bitrate::Kbps10,
            b'1' => Bitrate::Kbps20,
            b'2' => Bitrate::Kbps50,
            b'3' => Bitrate::Kbps100,
            b'4' => Bitrate::Kbps125,
            b'5' => Bitrate::Kbps250,
            b'6' => Bitrate::Kbps500,
            b'7' => Bitrate::Kbps800,
            b'8' => Bitrate::Mbps1,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn bits_per_second(self) -> u32 {
        match self {
            Bitrate::Kbps10 => 10_000,
            Bitrate::Kbps20 => 20_000,
            Bitrate::Kbps50 => 50_000,
            Bitrate::Kbps100 => 100_000,
            Bitrate::Kbps125 => 125_000,
            Bitrate::Kbps250 => 250_000,
            Bitrate::Kbps500 => 500_000,
            Bitrate::Kbps800 => 800_000,
            Bitrate::Mbps1 => 1_000_000,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanMode {
    /// Controller held in reset; the channel is closed.
    #[default]
    Reset,
    Normal,
    ListenOnly,
    Loopback,
}

impl CanMode {
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, CanMode::Reset)
    }

    #[must_use]
    pub const fn can_transmit(self) -> bool {
        matches!(self, CanMode::Normal | CanMode::Loopback)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CanId {
    Standard(u16),
    Extended(u32),
}

impl CanId {
    pub const STANDARD_MAX: u16 = 0x7FF;
    pub const EXTENDED_MAX: u32 = 0x1FFF_FFFF;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    id: CanId,
    remote: bool,
    len: u8,
    data: [u8; 8],
}

impl CanFrame {
    /// Data frame; `None` when the payload exceeds eight bytes.
    #[must_use]
    pub fn data(id: CanId, payload: &[u8]) -> Option<Self> {
        let len = u8::try_from(payload.len()).ok().filter(|len| *len <= 8)?;
        let mut data = [0; 8];
        data[..payload.len()].copy_from_slice(payload);
        Some(Self {
            id,
            remote: false,
            len,
            data,
        })
    }

    /// Remote frame requesting `len` bytes.
    #[must_use]
    pub fn remote(id: CanId, len: u8) -> Option<Self> {
        (len <= 8).then_some(Self {
            id,
            remote: true,
            len,
            data: [0; 8],
        })
    }

    #[must_use]
    pub const fn id(&self) -> CanId {
        self.id
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.remote
    }

    #[must_use]
    pub const fn len(&self) -> u8 {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Payload bytes; empty for remote frames.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        if self.remote {
            &[]
        } else {
            &self.data[..usize::from(self.len)]
        }
    }
}

/// CAN peripheral behind the bridge.
pub trait CanController {
    fn configure(&mut self, bitrate: Bitrate, mode: CanMode);
    fn transmit(&mut self, frame: &CanFrame) -> Result<(), SlcanError>;
    fn receive(&mut self) -> Option<CanFrame>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlcanCommand {
    SetBitrate(Bitrate),
    Open(CanMode),
    Close,
    Transmit(CanFrame),
    Version,
    SerialNumber,
    StatusFlags,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlcanError {
    Empty,
    UnknownCommand(u8),
    Malformed,
    LineTooLong,
    /// Command not valid while the channel is open/closed.
    WrongState,
    TransmitFailed,
    ReplyOverflow,
}

impl fmt::Display for SlcanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlcanError::Empty => f.write_str("empty command"),
            SlcanError::UnknownCommand(byte) => write!(f, "unknown command 0x{byte:02x}"),
            SlcanError::Malformed => f.write_str("malformed command"),
            SlcanError::LineTooLong => f.write_str("command line too long"),
            SlcanError::WrongState => f.write_str("command not valid in current mode"),
            SlcanError::TransmitFailed => f.write_str("transmit failed"),
            SlcanError::ReplyOverflow => f.write_str("reply buffer overflow"),
        }
    }
}

fn hex_value(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    digits.iter().try_fold(0u32, |acc, &digit| {
        let nibble = char::from(digit).to_digit(16)?;
        Some((acc << 4) | nibble)
    })
}

fn parse_frame(line: &[u8], extended: bool, remote: bool) -> Result<CanFrame, SlcanError> {
    let id_len = if extended { 8 } else { 3 };
    let body = line.get(1..).ok_or(SlcanError::Malformed)?;
    let raw_id = body
        .get(..id_len)
        .and_then(hex_value)
        .ok_or(SlcanError::Malformed)?;
    let id = if extended {
        if raw_id > CanId::EXTENDED_MAX {
            return Err(SlcanError::Malformed);
        }
        CanId::Extended(raw_id)
    } else {
        let raw = u16::try_from(raw_id).map_err(|_| SlcanError::Malformed)?;
        if raw > CanId::STANDARD_MAX {
            return Err(SlcanError::Malformed);
        }
        CanId::Standard(raw)
    };

    let len = body
        .get(id_len)
        .and_then(|digit| char::from(*digit).to_digit(10))
        .and_then(|len| u8::try_from(len).ok())
        .filter(|len| *len <= 8)
        .ok_or(SlcanError::Malformed)?;
    let rest = &body[id_len + 1..];

    if remote {
        if !rest.is_empty() {
            return Err(SlcanError::Malformed);
        }
        return CanFrame::remote(id, len).ok_or(SlcanError::Malformed);
    }

    if rest.len() != usize::from(len) * 2 {
        return Err(SlcanError::Malformed);
    }
    let mut payload = [0u8; 8];
    for (slot, pair) in payload.iter_mut().zip(rest.chunks_exact(2)) {
        let byte = hex_value(pair).ok_or(SlcanError::Malformed)?;
        *slot = u8::try_from(byte).map_err(|_| SlcanError::Malformed)?;
    }
    CanFrame::data(id, &payload[..usize::from(len)]).ok_or(SlcanError::Malformed)
}

/// Parses one command line without its trailing CR.
pub fn parse_command(line: &[u8]) -> Result<SlcanCommand, SlcanError> {
    let (&command, args) = line.split_first().ok_or(SlcanError::Empty)?;
    let no_args = |cmd: SlcanCommand| {
        if args.is_empty() {
            Ok(cmd)
        } else {
            Err(SlcanError::Malformed)
        }
    };

    match command {
        b'S' => match args {
            [code] => Bitrate::from_code(*code)
                .map(SlcanCommand::SetBitrate)
                .ok_or(SlcanError::Malformed),
            _ => Err(SlcanError::Malformed),
        },
        b'O' => no_args(SlcanCommand::Open(CanMode::Normal)),
        b'L' => no_args(SlcanCommand::Open(CanMode::ListenOnly)),
        b'l' => no_args(SlcanCommand::Open(CanMode::Loopback)),
        b'C' => no_args(SlcanCommand::Close),
        b'V' => no_args(SlcanCommand::Version),
        b'N' => no_args(SlcanCommand::SerialNumber),
        b'F' => no_args(SlcanCommand::StatusFlags),
        b't' => parse_frame(line, false, false).map(SlcanCommand::Transmit),
        b'T' => parse_frame(line, true, false).map(SlcanCommand::Transmit),
        b'r' => parse_frame(line, false, true).map(SlcanCommand::Transmit),
        b'R' => parse_frame(line, true, true).map(SlcanCommand::Transmit),
        other => Err(SlcanError::UnknownCommand(other)),
    }
}

fn push_hex(out: &mut Reply, value: u32, digits: u32) -> Result<(), SlcanError> {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for shift in (0..digits).rev() {
        let nibble = (value >> (shift * 4)) & 0xF;
        out.push(HEX[nibble as usize])
            .map_err(|_| SlcanError::ReplyOverflow)?;
    }
    Ok(())
}

/// Formats a received frame as an SLCAN line, CR included.
pub fn encode_frame(frame: &CanFrame, out: &mut Reply) -> Result<(), SlcanError> {
    let (tag, id, digits) = match (frame.id, frame.remote) {
        (CanId::Standard(id), false) => (b't', u32::from(id), 3),
        (CanId::Standard(id), true) => (b'r', u32::from(id), 3),
        (CanId::Extended(id), false) => (b'T', id, 8),
        (CanId::Extended(id), true) => (b'R', id, 8),
    };
    out.push(tag).map_err(|_| SlcanError::ReplyOverflow)?;
    push_hex(out, id, digits)?;
    out.push(b'0' + frame.len)
        .map_err(|_| SlcanError::ReplyOverflow)?;
    for byte in frame.payload() {
        push_hex(out, u32::from(*byte), 2)?;
    }
    out.push(OK).map_err(|_| SlcanError::ReplyOverflow)
}

/// Line assembler and command executor for one SLCAN channel.
#[derive(Debug)]
pub struct SlcanBridge<C> {
    controller: C,
    line: Vec<u8, MAX_LINE>,
    overflowed: bool,
    bitrate: Bitrate,
    mode: CanMode,
}

impl<C: CanController> SlcanBridge<C> {
    /// Applies the startup configuration to `controller`.
    pub fn new(mut controller: C, bitrate: Bitrate, mode: CanMode) -> Self {
        controller.configure(bitrate, mode);
        Self {
            controller,
            line: Vec::new(),
            overflowed: false,
            bitrate,
            mode,
        }
    }

    pub fn bitrate(&self) -> Bitrate {
        self.bitrate
    }

    pub fn mode(&self) -> CanMode {
        self.mode
    }

    pub fn controller(&self) -> &C {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut C {
        &mut self.controller
    }

    /// Feeds one byte from the host. Returns the reply once a line completes.
    pub fn handle_byte(&mut self, byte: u8) -> Option<Reply> {
        match byte {
            b'\r' => {
                let result = if self.overflowed {
                    Err(SlcanError::LineTooLong)
                } else {
                    parse_command(&self.line).and_then(|command| self.execute(command))
                };
                self.line.clear();
                self.overflowed = false;
                Some(result.unwrap_or_else(|_| bell()))
            }
            b'\n' => None,
            _ => {
                if self.line.push(byte).is_err() {
                    self.overflowed = true;
                }
                None
            }
        }
    }

    /// Formats the next frame received from the bus, if the channel is open.
    pub fn next_received(&mut self) -> Option<Reply> {
        if !self.mode.is_open() {
            return None;
        }
        let frame = self.controller.receive()?;
        let mut out = Reply::new();
        encode_frame(&frame, &mut out).ok()?;
        Some(out)
    }

    pub fn execute(&mut self, command: SlcanCommand) -> Result<Reply, SlcanError> {
        match command {
            SlcanCommand::SetBitrate(bitrate) => {
                if self.mode.is_open() {
                    return Err(SlcanError::WrongState);
                }
                self.bitrate = bitrate;
                self.controller.configure(bitrate, self.mode);
                Ok(reply(&[OK]))
            }
            SlcanCommand::Open(mode) => {
                if self.mode.is_open() {
                    return Err(SlcanError::WrongState);
                }
                self.mode = mode;
                self.controller.configure(self.bitrate, mode);
                Ok(reply(&[OK]))
            }
            SlcanCommand::Close => {
                if !self.mode.is_open() {
                    return Err(SlcanError::WrongState);
                }
                self.mode = CanMode::Reset;
                self.controller.configure(self.bitrate, CanMode::Reset);
                Ok(reply(&[OK]))
            }
            SlcanCommand::Transmit(frame) => {
                if !self.mode.can_transmit() {
                    return Err(SlcanError::WrongState);
                }
                self.controller.transmit(&frame)?;
                let ack = match frame.id {
                    CanId::Standard(_) => b'z',
                    CanId::Extended(_) => b'Z',
                };
                Ok(reply(&[ack, OK]))
            }
            SlcanCommand::Version => Ok(reply(VERSION)),
            SlcanCommand::SerialNumber => Ok(reply(SERIAL)),
            SlcanCommand::StatusFlags => {
                if !self.mode.is_open() {
                    return Err(SlcanError::WrongState);
                }
                Ok(reply(b"F00\r"))
            }
        }
    }
}

fn reply(bytes: &[u8]) -> Reply {
    let mut out = Reply::new();
    // Every fixed reply is shorter than the buffer.
    let _ = out.extend_from_slice(bytes);
    out
}

fn bell() -> Reply {
    reply(&[BELL])
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Deque;

    #[derive(Default)]
    struct Loopback {
        configured: Option<(Bitrate, CanMode)>,
        frames: Deque<CanFrame, 4>,
    }

    impl CanController for Loopback {
        fn configure(&mut self, bitrate: Bitrate, mode: CanMode) {
            self.configured = Some((bitrate, mode));
        }

        fn transmit(&mut self, frame: &CanFrame) -> Result<(), SlcanError> {
            self.frames
                .push_back(*frame)
                .map_err(|_| SlcanError::TransmitFailed)
        }

        fn receive(&mut self) -> Option<CanFrame> {
            self.frames.pop_front()
        }
    }

    fn feed(bridge: &mut SlcanBridge<Loopback>, line: &[u8]) -> Reply {
        let mut reply = None;
        for byte in line {
            reply = bridge.handle_byte(*byte);
        }
        reply.unwrap()
    }

    fn bridge() -> SlcanBridge<Loopback> {
        SlcanBridge::new(Loopback::default(), Bitrate::Kbps500, CanMode::Reset)
    }

    #[test]
    fn starts_closed_at_configured_bitrate() {
        let bridge = bridge();
        assert_eq!(
            bridge.controller().configured,
            Some((Bitrate::Kbps500, CanMode::Reset))
        );
        assert!(!bridge.mode().is_open());
    }

    #[test]
    fn parses_standard_data_frame() {
        let command = parse_command(b"t12330A0B0C").unwrap();
        let expected = CanFrame::data(CanId::Standard(0x123), &[0x0A, 0x0B, 0x0C]).unwrap();
        assert_eq!(command, SlcanCommand::Transmit(expected));
    }

    #[test]
    fn parses_extended_remote_frame() {
        let command = parse_command(b"R1FFFFFFF4").unwrap();
        let expected = CanFrame::remote(CanId::Extended(0x1FFF_FFFF), 4).unwrap();
        assert_eq!(command, SlcanCommand::Transmit(expected));
    }

    #[test]
    fn rejects_out_of_range_and_short_frames() {
        assert_eq!(parse_command(b"t8001"), Err(SlcanError::Malformed));
        assert_eq!(parse_command(b"t1232AA"), Err(SlcanError::Malformed));
        assert_eq!(parse_command(b"t1239"), Err(SlcanError::Malformed));
        assert_eq!(parse_command(b"S9"), Err(SlcanError::Malformed));
        assert_eq!(parse_command(b"x"), Err(SlcanError::UnknownCommand(b'x')));
    }

    #[test]
    fn bitrate_only_changes_while_closed() {
        let mut bridge = bridge();
        assert_eq!(feed(&mut bridge, b"S8\r").as_slice(), b"\r");
        assert_eq!(bridge.bitrate(), Bitrate::Mbps1);

        assert_eq!(feed(&mut bridge, b"O\r").as_slice(), b"\r");
        assert_eq!(feed(&mut bridge, b"S4\r").as_slice(), &[BELL]);
        assert_eq!(bridge.bitrate(), Bitrate::Mbps1);
    }

    #[test]
    fn loopback_echoes_transmitted_frame() {
        let mut bridge = bridge();
        feed(&mut bridge, b"l\r");
        assert_eq!(feed(&mut bridge, b"t7FF2BEEF\r").as_slice(), b"z\r");
        assert_eq!(bridge.next_received().unwrap().as_slice(), b"t7FF2BEEF\r");
        assert_eq!(bridge.next_received(), None);
    }

    #[test]
    fn listen_only_refuses_transmit() {
        let mut bridge = bridge();
        feed(&mut bridge, b"L\r");
        assert_eq!(feed(&mut bridge, b"t1230\r").as_slice(), &[BELL]);
    }

    #[test]
    fn extended_transmit_acknowledged_with_capital_z() {
        let mut bridge = bridge();
        feed(&mut bridge, b"O\r");
        assert_eq!(feed(&mut bridge, b"T0000010011F\r").as_slice(), b"Z\r");
    }

    #[test]
    fn overlong_line_is_rejected_once() {
        let mut bridge = bridge();
        let long = [b'V'; MAX_LINE + 4];
        for byte in long {
            assert_eq!(bridge.handle_byte(byte), None);
        }
        assert_eq!(bridge.handle_byte(b'\r').unwrap().as_slice(), &[BELL]);
        assert_eq!(feed(&mut bridge, b"V\r").as_slice(), VERSION);
    }

    #[test]
    fn encodes_extended_remote_frame() {
        let frame = CanFrame::remote(CanId::Extended(0x0ABC_DEF0), 2).unwrap();
        let mut out = Reply::new();
        encode_frame(&frame, &mut out).unwrap();
        assert_eq!(out.as_slice(), b"R0ABCDEF02\r");
    }
}
