//! USB CDC to USART2 serial bridge.
//!
//! The host sees DTR/RTS on the bridge port as the target's bootloader and
//! reset controls; changes are forwarded to the target-state controller.
//! Line coding set by the host is translated to the UART frame format.

#[cfg(target_os = "none")]
mod uart;

#[cfg(target_os = "none")]
pub use uart::{SerialBridge, UartResources};

/// Slowest rate the bridge accepts from SET_LINE_CODING.
pub const MIN_BAUD: u32 = 1_200;
/// USART2 clocked from the 48 MHz bus at 16x oversampling.
pub const MAX_BAUD: u32 = 3_000_000;

/// Bytes of one USB packet still to be handed to the UART.
///
/// The next packet is read only once the previous one is fully written.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Backlog {
    len: usize,
    written: usize,
}

impl Backlog {
    pub const fn new() -> Self {
        Self { len: 0, written: 0 }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.written >= self.len
    }

    /// Starts tracking a freshly received packet of `len` bytes.
    pub fn fill(&mut self, len: usize) {
        self.len = len;
        self.written = 0;
    }

    /// Index range of the unwritten remainder.
    #[must_use]
    pub fn remaining(&self) -> core::ops::Range<usize> {
        self.written.min(self.len)..self.len
    }

    /// Records `count` bytes accepted by the UART; returns `true` once the
    /// packet is complete.
    pub fn advance(&mut self, count: usize) -> bool {
        self.written = self.written.saturating_add(count).min(self.len);
        self.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

/// Last DTR/RTS levels seen on the bridge port.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LineMonitor {
    dtr: bool,
    rts: bool,
}

impl LineMonitor {
    pub const fn new() -> Self {
        Self {
            dtr: false,
            rts: false,
        }
    }

    /// Records the current levels, returning them when either line moved.
    pub fn update(&mut self, dtr: bool, rts: bool) -> Option<(bool, bool)> {
        if (dtr, rts) == (self.dtr, self.rts) {
            return None;
        }
        self.dtr = dtr;
        self.rts = rts;
        Some((dtr, rts))
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ParityMode {
    None,
    Odd,
    Even,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StopMode {
    One,
    OneAndHalf,
    Two,
}

/// UART frame format derived from a CDC line coding.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UartFormat {
    pub baud: u32,
    /// Word length as the USART counts it, parity bit included.
    pub word_bits: u8,
    pub parity: ParityMode,
    pub stop: StopMode,
}

impl UartFormat {
    /// 8N1 at `baud`.
    pub const fn eight_n_one(baud: u32) -> Self {
        Self {
            baud,
            word_bits: 8,
            parity: ParityMode::None,
            stop: StopMode::One,
        }
    }

    /// Maps the raw SET_LINE_CODING fields.
    ///
    /// Returns `None` for formats the USART cannot produce: mark or space
    /// parity, a rate outside [`MIN_BAUD`]..=[`MAX_BAUD`], or a word that is
    /// not 8 or 9 bits once the parity bit is counted.
    pub fn from_line_coding(baud: u32, data_bits: u8, parity: u8, stop: u8) -> Option<Self> {
        if !(MIN_BAUD..=MAX_BAUD).contains(&baud) {
            return None;
        }
        let parity = match parity {
            0 => ParityMode::None,
            1 => ParityMode::Odd,
            2 => ParityMode::Even,
            _ => return None,
        };
        let stop = match stop {
            0 => StopMode::One,
            1 => StopMode::OneAndHalf,
            2 => StopMode::Two,
            _ => return None,
        };
        let word_bits = data_bits.saturating_add(u8::from(parity != ParityMode::None));
        matches!(word_bits, 8 | 9).then_some(Self {
            baud,
            word_bits,
            parity,
            stop,
        })
    }
}
