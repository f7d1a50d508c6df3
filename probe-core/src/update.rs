//! Update-mode (bootloader) entry.
//!
//! The update-mode USB handler only raises [`BootloaderRequest`]. Once the
//! debug engine is idle the superloop hands control to [`enter_update_mode`],
//! which blinks a countdown while keeping the watchdog fed and then leaves
//! through [`UpdateMode::reset_and_jump`]. Nothing on this path returns.

use crate::config::ProbeConfig;
use crate::indicator::{LedPattern, StatusIndicators};
use crate::tick::{TickSource, elapsed};

/// Hardware watchdog.
pub trait Watchdog {
    fn refresh(&mut self);
}

impl<W: Watchdog + ?Sized> Watchdog for &mut W {
    fn refresh(&mut self) {
        (**self).refresh();
    }
}

/// Watchdog that is never started.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn refresh(&mut self) {}
}

/// Entry point into the firmware-update context.
pub trait UpdateMode {
    /// Consumes a request persisted across the last reset.
    fn take_persisted_request(&mut self) -> bool;

    /// Transfers control to the update-mode image immediately.
    fn jump(&mut self) -> !;

    /// Persists a request and resets; the next boot's gate performs the jump.
    fn reset_and_jump(&mut self) -> !;
}

/// Build without update mode. Nothing is ever persisted; a jump parks the core.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoUpdateMode;

impl UpdateMode for NoUpdateMode {
    fn take_persisted_request(&mut self) -> bool {
        false
    }

    fn jump(&mut self) -> ! {
        loop {
            core::hint::spin_loop();
        }
    }

    fn reset_and_jump(&mut self) -> ! {
        self.jump()
    }
}

/// Flag raised by the update-mode handler and consumed by the superloop.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BootloaderRequest {
    requested: bool,
}

impl BootloaderRequest {
    #[must_use]
    pub const fn new() -> Self {
        Self { requested: false }
    }

    pub fn request(&mut self) {
        self.requested = true;
    }

    #[must_use]
    pub const fn is_requested(&self) -> bool {
        self.requested
    }
}

/// Routes a persisted update request before anything else is initialised.
pub fn boot_gate<U: UpdateMode + ?Sized>(config: &ProbeConfig, update: &mut U) {
    if config.update_mode && update.take_persisted_request() {
        #[cfg(feature = "defmt")]
        defmt::info!("update: persisted request, jumping to bootloader");
        update.jump();
    }
}

/// Spins for `ms` ticks, refreshing the watchdog at least every `refresh_every` ticks.
pub fn busy_wait<C, W>(clock: &C, watchdog: &mut W, ms: u32, refresh_every: u32)
where
    C: TickSource + ?Sized,
    W: Watchdog + ?Sized,
{
    let start = clock.now();
    let mut last_refresh = start;
    loop {
        let now = clock.now();
        if elapsed(start, now) >= ms {
            break;
        }
        if elapsed(last_refresh, now) >= refresh_every {
            watchdog.refresh();
            last_refresh = now;
        }
        core::hint::spin_loop();
    }
    watchdog.refresh();
}

/// Blinks the countdown and jumps into update mode.
pub fn enter_update_mode<C, W, S, U>(
    config: &ProbeConfig,
    clock: &C,
    watchdog: &mut W,
    leds: &mut S,
    update: &mut U,
) -> !
where
    C: TickSource + ?Sized,
    W: Watchdog + ?Sized,
    S: StatusIndicators + ?Sized,
    U: UpdateMode + ?Sized,
{
    let phase = config.countdown_phase_ms;
    let refresh = config.watchdog_refresh_ms;
    #[cfg(feature = "defmt")]
    defmt::info!(
        "update: countdown, {=u8} x {=u32} ms",
        config.countdown_repetitions,
        phase
    );
    for _ in 0..config.countdown_repetitions {
        watchdog.refresh();
        leds.show(LedPattern::ALL);
        busy_wait(clock, watchdog, phase, refresh);
        leds.show(LedPattern::OFF);
        busy_wait(clock, watchdog, phase, refresh);
    }
    update.reset_and_jump()
}
