//! Target-state controller.
//!
//! Flashing tools sequence a target reset or bootloader entry by toggling the
//! DTR and RTS control lines of the bridged serial port. This module turns
//! those changes into pulses on the probe's reset and bootloader-control lines:
//!
//! | DTR | RTS | effect |
//! |-----|-----|--------|
//! | differ | | assert both lines now, apply `(reset = DTR, boot = RTS)` after the debounce |
//! | 0 | 0 | cancel anything pending, release both lines now |
//! | 1 | 1 | nothing; hosts raise both lines simply by opening the port |
//!
//! Callbacks only record the request; the superloop applies it in [`TargetStateController::poll`].

use crate::tick::{Ticks, elapsed};

/// Default deferral between the pulse and the requested state, in ticks.
pub const DEFAULT_DEBOUNCE_TICKS: u32 = 25;

/// The two physical lines wired to the target. `true` means asserted.
pub trait TargetLines {
    fn set_boot_request(&mut self, asserted: bool);
    fn set_reset(&mut self, asserted: bool);
}

impl<T: TargetLines + ?Sized> TargetLines for &mut T {
    fn set_boot_request(&mut self, asserted: bool) {
        (**self).set_boot_request(asserted);
    }

    fn set_reset(&mut self, asserted: bool) {
        (**self).set_reset(asserted);
    }
}

/// Logical state of the target-control lines.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TargetState {
    pub reset: bool,
    pub enter_bootloader: bool,
}

impl TargetState {
    pub const RELEASED: Self = Self::new(false, false);
    /// Both lines asserted; safe intermediate state while a request is deferred.
    pub const PULSE: Self = Self::new(true, true);

    #[must_use]
    pub const fn new(reset: bool, enter_bootloader: bool) -> Self {
        Self {
            reset,
            enter_bootloader,
        }
    }
}

/// Drives `state` onto `lines`, bootloader control first.
///
/// Writing reset first could release the target from reset while a stale
/// bootloader request is still on the line.
pub fn set_target_state<L: TargetLines + ?Sized>(lines: &mut L, state: TargetState) {
    lines.set_boot_request(state.enter_bootloader);
    lines.set_reset(state.reset);
}

/// Request waiting for the debounce to elapse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DeferredRequest {
    pub started_at: Ticks,
    pub state: TargetState,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ControllerState {
    Idle,
    PendingDeferred,
}

/// What a control-line change did to the lines.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LineAction {
    /// Both lines asserted and a deferred request recorded.
    Pulsed,
    /// Pending request dropped and both lines released.
    Released,
    Ignored,
}

#[derive(Clone, Debug)]
pub struct TargetStateController {
    pending: Option<DeferredRequest>,
    debounce: u32,
}

impl TargetStateController {
    #[must_use]
    pub const fn new(debounce: u32) -> Self {
        Self {
            pending: None,
            debounce,
        }
    }

    #[must_use]
    pub const fn state(&self) -> ControllerState {
        match self.pending {
            Some(_) => ControllerState::PendingDeferred,
            None => ControllerState::Idle,
        }
    }

    #[must_use]
    pub const fn pending(&self) -> Option<DeferredRequest> {
        self.pending
    }

    #[must_use]
    pub const fn debounce(&self) -> u32 {
        self.debounce
    }

    /// Host changed DTR/RTS. The latest qualifying change replaces any pending request.
    pub fn on_control_line_change<L: TargetLines + ?Sized>(
        &mut self,
        lines: &mut L,
        dtr: bool,
        rts: bool,
        now: Ticks,
    ) -> LineAction {
        if dtr != rts {
            set_target_state(lines, TargetState::PULSE);
            self.pending = Some(DeferredRequest {
                started_at: now,
                state: TargetState::new(dtr, rts),
            });
            #[cfg(feature = "defmt")]
            defmt::debug!("target: pulse, DTR={=bool} RTS={=bool}", dtr, rts);
            LineAction::Pulsed
        } else if !dtr {
            self.pending = None;
            set_target_state(lines, TargetState::RELEASED);
            #[cfg(feature = "defmt")]
            defmt::debug!("target: released");
            LineAction::Released
        } else {
            LineAction::Ignored
        }
    }

    /// Applies the pending request once the debounce has elapsed.
    pub fn poll<L: TargetLines + ?Sized>(
        &mut self,
        lines: &mut L,
        now: Ticks,
    ) -> Option<TargetState> {
        let request = self.pending?;
        if elapsed(request.started_at, now) < self.debounce {
            return None;
        }

        set_target_state(lines, request.state);
        self.pending = None;
        #[cfg(feature = "defmt")]
        defmt::info!("target: applied {}", request.state);
        Some(request.state)
    }
}

impl Default for TargetStateController {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE_TICKS)
    }
}
