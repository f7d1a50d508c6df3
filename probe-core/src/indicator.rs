//! Three-LED status output.

use crate::pins::{OutputLine, Polarity};

/// 3-bit value selecting one of eight patterns across the three LEDs.
///
/// Bit 2 drives LED0, bit 1 LED1 and bit 0 LED2.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LedPattern(u8);

impl LedPattern {
    pub const OFF: Self = Self(0);
    /// Shown once peripherals are configured.
    pub const BOOT: Self = Self(0b001);
    /// Shown during the update-mode countdown.
    pub const ALL: Self = Self(0b111);

    /// Builds a pattern from the low three bits of `bits`.
    #[must_use]
    pub const fn new(bits: u8) -> Self {
        Self(bits & 0b111)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Whether LED `index` (0..3) is lit by this pattern.
    #[must_use]
    pub const fn is_lit(self, index: usize) -> bool {
        match index {
            0..=2 => self.0 & (0b100 >> index) != 0,
            _ => false,
        }
    }

    /// Patterns shown by the power-on self-test, in order.
    pub fn self_test() -> impl Iterator<Item = LedPattern> {
        (1..=7).map(LedPattern::new)
    }
}

/// Debug-unit status outputs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Indicator {
    Connected,
    Running,
    Activity,
}

impl Indicator {
    /// LED line carrying this indicator.
    #[must_use]
    pub const fn led(self) -> usize {
        match self {
            Indicator::Connected => 0,
            Indicator::Running => 1,
            Indicator::Activity => 2,
        }
    }
}

pub trait StatusIndicators {
    fn show(&mut self, pattern: LedPattern);
    fn set_indicator(&mut self, indicator: Indicator, on: bool);
}

/// Board without status LEDs.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoIndicators;

impl StatusIndicators for NoIndicators {
    fn show(&mut self, _pattern: LedPattern) {}

    fn set_indicator(&mut self, _indicator: Indicator, _on: bool) {}
}

/// Three LEDs sharing one polarity.
#[derive(Debug)]
pub struct StatusLeds<L0, L1, L2> {
    led0: L0,
    led1: L1,
    led2: L2,
    polarity: Polarity,
}

impl<L0, L1, L2> StatusLeds<L0, L1, L2>
where
    L0: OutputLine,
    L1: OutputLine,
    L2: OutputLine,
{
    pub fn new(led0: L0, led1: L1, led2: L2, polarity: Polarity) -> Self {
        Self {
            led0,
            led1,
            led2,
            polarity,
        }
    }

    pub fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn drive(&mut self, index: usize, on: bool) {
        let level = self.polarity.level(on);
        match index {
            0 => self.led0.set_level(level),
            1 => self.led1.set_level(level),
            _ => self.led2.set_level(level),
        }
    }
}

impl<L0, L1, L2> StatusIndicators for StatusLeds<L0, L1, L2>
where
    L0: OutputLine,
    L1: OutputLine,
    L2: OutputLine,
{
    fn show(&mut self, pattern: LedPattern) {
        for index in 0..3 {
            self.drive(index, pattern.is_lit(index));
        }
    }

    fn set_indicator(&mut self, indicator: Indicator, on: bool) {
        self.drive(indicator.led(), on);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Level(Option<bool>);

    impl OutputLine for Level {
        fn set_high(&mut self) {
            self.0 = Some(true);
        }

        fn set_low(&mut self) {
            self.0 = Some(false);
        }
    }

    fn levels(leds: &StatusLeds<Level, Level, Level>) -> [Option<bool>; 3] {
        [leds.led0.0, leds.led1.0, leds.led2.0]
    }

    #[test]
    fn pattern_bits_map_msb_to_led0() {
        let mut leds = StatusLeds::new(
            Level::default(),
            Level::default(),
            Level::default(),
            Polarity::ActiveHigh,
        );
        leds.show(LedPattern::new(0b100));
        assert_eq!(levels(&leds), [Some(true), Some(false), Some(false)]);

        leds.show(LedPattern::BOOT);
        assert_eq!(levels(&leds), [Some(false), Some(false), Some(true)]);
    }

    #[test]
    fn active_low_inverts_every_write() {
        let mut leds = StatusLeds::new(
            Level::default(),
            Level::default(),
            Level::default(),
            Polarity::ActiveLow,
        );
        leds.show(LedPattern::ALL);
        assert_eq!(levels(&leds), [Some(false); 3]);

        leds.set_indicator(Indicator::Activity, false);
        assert_eq!(levels(&leds), [Some(false), Some(false), Some(true)]);
    }

    #[test]
    fn pattern_masks_to_three_bits() {
        assert_eq!(LedPattern::new(0xFF), LedPattern::ALL);
        assert!(!LedPattern::ALL.is_lit(3));
    }

    #[test]
    fn self_test_walks_every_lit_pattern() {
        let bits: heapless::Vec<u8, 8> = LedPattern::self_test().map(LedPattern::bits).collect();
        assert_eq!(bits.as_slice(), &[1, 2, 3, 4, 5, 6, 7]);
    }
}
