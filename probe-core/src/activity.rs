//! Shared activity LED countdown.
//!
//! Every USB-facing subsystem refreshes the same timer; the last write wins.

use crate::indicator::{Indicator, StatusIndicators};

/// Iterations the activity LED stays lit after the last event.
pub const DEFAULT_ACTIVITY_HOLD: u32 = 1_000;

#[derive(Clone, Debug)]
pub struct ActivityIndicator {
    remaining: u32,
    hold: u32,
}

impl ActivityIndicator {
    #[must_use]
    pub const fn new(hold: u32) -> Self {
        Self { remaining: 0, hold }
    }

    /// Restarts the countdown.
    pub fn on_activity(&mut self) {
        self.remaining = self.hold;
    }

    #[must_use]
    pub const fn remaining(&self) -> u32 {
        self.remaining
    }

    #[must_use]
    pub const fn is_lit(&self) -> bool {
        self.remaining > 0
    }

    /// Advances the countdown by one superloop iteration and drives the LED.
    ///
    /// Returns whether the LED was driven on.
    pub fn step<S: StatusIndicators + ?Sized>(&mut self, leds: &mut S) -> bool {
        let lit = self.remaining > 0;
        if lit {
            self.remaining -= 1;
        }
        leds.set_indicator(Indicator::Activity, lit);
        lit
    }
}

impl Default for ActivityIndicator {
    fn default() -> Self {
        Self::new(DEFAULT_ACTIVITY_HOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicator::LedPattern;

    #[derive(Default)]
    struct Led {
        on: Option<bool>,
    }

    impl StatusIndicators for Led {
        fn show(&mut self, _pattern: LedPattern) {}

        fn set_indicator(&mut self, indicator: Indicator, on: bool) {
            assert_eq!(indicator, Indicator::Activity);
            self.on = Some(on);
        }
    }

    #[test]
    fn stays_lit_for_exactly_the_hold() {
        let mut led = Led::default();
        let mut activity = ActivityIndicator::default();
        activity.on_activity();
        assert_eq!(activity.remaining(), 1_000);

        for iteration in 0..1_000 {
            assert!(activity.step(&mut led), "iteration {iteration}");
            assert_eq!(led.on, Some(true));
        }

        assert!(!activity.step(&mut led));
        assert_eq!(led.on, Some(false));
        assert_eq!(activity.remaining(), 0);
    }

    #[test]
    fn event_resets_to_full_hold() {
        let mut led = Led::default();
        let mut activity = ActivityIndicator::new(10);
        activity.on_activity();
        for _ in 0..7 {
            activity.step(&mut led);
        }
        assert_eq!(activity.remaining(), 3);

        activity.on_activity();
        assert_eq!(activity.remaining(), 10);
    }

    #[test]
    fn idle_timer_drives_led_off() {
        let mut led = Led::default();
        let mut activity = ActivityIndicator::default();
        assert!(!activity.step(&mut led));
        assert!(!activity.is_lit());
        assert_eq!(led.on, Some(false));
    }
}
