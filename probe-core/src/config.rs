//! Probe tunables.

use crate::activity::DEFAULT_ACTIVITY_HOLD;
use crate::pins::Polarity;
use crate::slcan::{Bitrate, CanMode};
use crate::target::DEFAULT_DEBOUNCE_TICKS;

/// Configuration shared by the superloop and its collaborators.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ProbeConfig {
    /// Superloop iterations the activity LED stays on after traffic.
    pub activity_hold: u32,
    /// Ticks between a control-line pulse and the requested target state.
    pub target_debounce: u32,
    pub countdown_repetitions: u8,
    /// Length of each on and off phase of the update-mode countdown.
    pub countdown_phase_ms: u32,
    pub watchdog_period_ms: u32,
    /// Upper bound between watchdog refreshes inside busy-waits.
    pub watchdog_refresh_ms: u32,
    pub update_mode: bool,
    pub led_polarity: Polarity,
    pub uart_baud: u32,
    pub can_bitrate: Bitrate,
    pub can_mode: CanMode,
}

impl ProbeConfig {
    pub const DEFAULT: Self = Self::new();

    #[must_use]
    pub const fn new() -> Self {
        Self {
            activity_hold: DEFAULT_ACTIVITY_HOLD,
            target_debounce: DEFAULT_DEBOUNCE_TICKS,
            countdown_repetitions: 3,
            countdown_phase_ms: 150,
            watchdog_period_ms: 1_000,
            watchdog_refresh_ms: 10,
            update_mode: true,
            led_polarity: Polarity::ActiveHigh,
            uart_baud: 115_200,
            can_bitrate: Bitrate::Kbps500,
            can_mode: CanMode::Reset,
        }
    }

    #[must_use]
    pub const fn with_update_mode(mut self, enabled: bool) -> Self {
        self.update_mode = enabled;
        self
    }

    #[must_use]
    pub const fn with_led_polarity(mut self, polarity: Polarity) -> Self {
        self.led_polarity = polarity;
        self
    }

    #[must_use]
    pub const fn with_countdown(mut self, repetitions: u8, phase_ms: u32) -> Self {
        self.countdown_repetitions = repetitions;
        self.countdown_phase_ms = phase_ms;
        self
    }

    #[must_use]
    pub const fn with_target_debounce(mut self, ticks: u32) -> Self {
        self.target_debounce = ticks;
        self
    }

    #[must_use]
    pub const fn with_activity_hold(mut self, iterations: u32) -> Self {
        self.activity_hold = iterations;
        self
    }

    #[must_use]
    pub const fn with_uart_baud(mut self, baud: u32) -> Self {
        self.uart_baud = baud;
        self
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_interval_fits_inside_watchdog_period() {
        let config = ProbeConfig::DEFAULT;
        assert!(config.watchdog_refresh_ms < config.watchdog_period_ms);
        assert!(config.countdown_phase_ms < config.watchdog_period_ms);
    }

    #[test]
    fn builders_override_single_fields() {
        let config = ProbeConfig::new()
            .with_update_mode(false)
            .with_led_polarity(Polarity::ActiveLow);
        assert!(!config.update_mode);
        assert_eq!(config.led_polarity, Polarity::ActiveLow);
        assert_eq!(config.target_debounce, 25);
    }
}
