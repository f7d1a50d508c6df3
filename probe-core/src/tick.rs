//! Millisecond tick service.
//!
//! A periodic interrupt advances a 32-bit counter at [`TICK_HZ`]. Every
//! relative-time computation in the probe goes through [`elapsed`], which uses
//! wrapping subtraction so results stay correct across the counter roll-over
//! for any delta below 2^31 ticks (roughly 24 days).

use portable_atomic::{AtomicU32, Ordering};

/// Rate at which the tick interrupt fires.
pub const TICK_HZ: u32 = 1_000;

/// Raw value of the tick counter at some instant.
///
/// Deliberately not `Ord`: comparing two readings is only meaningful through
/// [`elapsed`], which survives wraparound.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ticks(u32);

impl Ticks {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Ticks elapsed between `start` and `self`.
    #[must_use]
    pub const fn elapsed_since(self, start: Ticks) -> u32 {
        elapsed(start, self)
    }

    /// Returns the reading `ticks` after `self`, wrapping at the counter range.
    #[must_use]
    pub const fn wrapping_add(self, ticks: u32) -> Self {
        Self(self.0.wrapping_add(ticks))
    }
}

/// Computes `now - start` with unsigned wraparound.
#[must_use]
pub const fn elapsed(start: Ticks, now: Ticks) -> u32 {
    now.0.wrapping_sub(start.0)
}

/// Anything that can report the current tick count.
pub trait TickSource {
    fn now(&self) -> Ticks;
}

impl<T> TickSource for &T
where
    T: TickSource + ?Sized,
{
    fn now(&self) -> Ticks {
        (**self).now()
    }
}

/// Counter shared between the tick interrupt (sole writer) and the superloop.
///
/// Only plain loads and stores are used, so the counter works on cores without
/// atomic read-modify-write instructions.
#[derive(Debug)]
pub struct TickCounter {
    ticks: AtomicU32,
}

impl TickCounter {
    #[must_use]
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    /// Creates a counter that starts from an arbitrary reading.
    #[must_use]
    pub const fn starting_at(raw: u32) -> Self {
        Self {
            ticks: AtomicU32::new(raw),
        }
    }

    /// Advances the counter by one tick. Must only be called from the tick interrupt.
    pub fn tick(&self) {
        let next = self.ticks.load(Ordering::Relaxed).wrapping_add(1);
        self.ticks.store(next, Ordering::Relaxed);
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for TickCounter {
    fn now(&self) -> Ticks {
        Ticks(self.ticks.load(Ordering::Relaxed))
    }
}
