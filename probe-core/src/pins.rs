//! Pin abstraction layer consumed by the debug engine's bit-bang loop.
//!
//! The contract is split in two. Minimal line traits ([`OutputLine`],
//! [`InputLine`], [`FlexLine`]) describe a single GPIO and are implemented by
//! the firmware over HAL pins and by tests over recording mocks. [`DebugPort`]
//! is the capability set the debug engine calls once or twice per clock edge;
//! [`SwdPins`] implements it over the line traits. Every operation is a handful
//! of register writes: nothing here blocks or allocates.

use crate::indicator::{Indicator, LedPattern, StatusIndicators};
use crate::target::TargetLines;

/// Push-pull or open-drain output.
pub trait OutputLine {
    fn set_high(&mut self);
    fn set_low(&mut self);

    fn set_level(&mut self, high: bool) {
        if high {
            self.set_high();
        } else {
            self.set_low();
        }
    }
}

/// Readable line.
pub trait InputLine {
    fn is_high(&self) -> bool;
}

/// Line whose direction can be switched at runtime without touching its output latch.
pub trait FlexLine: OutputLine + InputLine {
    fn set_as_output(&mut self);
    fn set_as_input(&mut self);
}

/// Stand-in for a line the board does not route.
///
/// Writes are ignored and reads report the released (high) level, which for
/// the active-low control lines means "not asserted".
#[derive(Copy, Clone, Debug, Default)]
pub struct NoLine;

impl OutputLine for NoLine {
    fn set_high(&mut self) {}

    fn set_low(&mut self) {}
}

impl InputLine for NoLine {
    fn is_high(&self) -> bool {
        true
    }
}

impl FlexLine for NoLine {
    fn set_as_output(&mut self) {}

    fn set_as_input(&mut self) {}
}

/// Electrical sense of an output.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    #[default]
    ActiveHigh,
    ActiveLow,
}

impl Polarity {
    /// Pin level that expresses the logical `on` state.
    #[must_use]
    pub const fn level(self, on: bool) -> bool {
        match self {
            Polarity::ActiveHigh => on,
            Polarity::ActiveLow => !on,
        }
    }
}

/// Capability set the debug engine drives the target with.
///
/// `nreset` levels are electrical: `false` asserts reset on the target.
pub trait DebugPort {
    /// Configures SWCLK/SWDIO as push-pull outputs, both high.
    fn swd_setup(&mut self);
    /// Returns the debug pins to high-impedance inputs.
    fn port_off(&mut self);

    fn swclk_set(&mut self);
    fn swclk_clr(&mut self);
    fn swclk_in(&self) -> bool;

    fn swdio_set(&mut self);
    fn swdio_clr(&mut self);
    fn swdio_in(&self) -> bool;
    fn swdio_out(&mut self, bit: bool);
    fn swdio_out_enable(&mut self);
    fn swdio_out_disable(&mut self);

    fn nreset_in(&self) -> bool;
    fn nreset_out(&mut self, level: bool);

    /// One-time setup at power-on: every line released.
    fn dap_setup(&mut self);

    // JTAG is not wired on any supported board.
    fn jtag_setup(&mut self) {}

    fn tdi_in(&self) -> bool {
        false
    }

    fn tdi_out(&mut self, _bit: bool) {}

    fn tdo_in(&self) -> bool {
        false
    }

    fn ntrst_in(&self) -> bool {
        false
    }

    fn ntrst_out(&mut self, _level: bool) {}
}

/// How the SWDIO direction is signalled to the outside world.
pub trait DirectionControl {
    /// SWDIO is about to drive the target.
    fn drive(&mut self);
    /// SWDIO has stopped driving the target.
    fn release(&mut self);
}

/// SWDIO is wired straight to the target; nothing to signal.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectDirection;

impl DirectionControl for DirectDirection {
    fn drive(&mut self) {}

    fn release(&mut self) {}
}

/// SWDIO passes through a level translator with an explicit direction input.
///
/// The companion pin is high while the probe drives SWDIO and low while it listens.
#[derive(Debug)]
pub struct BufferedDirection<P> {
    pin: P,
}

impl<P: OutputLine> BufferedDirection<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }

    pub fn into_inner(self) -> P {
        self.pin
    }
}

impl<P: OutputLine> DirectionControl for BufferedDirection<P> {
    fn drive(&mut self) {
        self.pin.set_high();
    }

    fn release(&mut self) {
        self.pin.set_low();
    }
}

/// [`DebugPort`] over four GPIO lines.
#[derive(Debug)]
pub struct SwdPins<Clk, Dio, Rst, Dir = DirectDirection> {
    swclk: Clk,
    swdio: Dio,
    nreset: Rst,
    direction: Dir,
}

impl<Clk, Dio, Rst> SwdPins<Clk, Dio, Rst, DirectDirection>
where
    Clk: FlexLine,
    Dio: FlexLine,
    Rst: OutputLine + InputLine,
{
    pub fn new(swclk: Clk, swdio: Dio, nreset: Rst) -> Self {
        Self::with_direction(swclk, swdio, nreset, DirectDirection)
    }
}

impl<Clk, Dio, Rst, Dir> SwdPins<Clk, Dio, Rst, Dir>
where
    Clk: FlexLine,
    Dio: FlexLine,
    Rst: OutputLine + InputLine,
    Dir: DirectionControl,
{
    pub fn with_direction(swclk: Clk, swdio: Dio, nreset: Rst, direction: Dir) -> Self {
        Self {
            swclk,
            swdio,
            nreset,
            direction,
        }
    }

    pub fn direction(&self) -> &Dir {
        &self.direction
    }

    pub fn release(self) -> (Clk, Dio, Rst, Dir) {
        (self.swclk, self.swdio, self.nreset, self.direction)
    }
}

impl<Clk, Dio, Rst, Dir> DebugPort for SwdPins<Clk, Dio, Rst, Dir>
where
    Clk: FlexLine,
    Dio: FlexLine,
    Rst: OutputLine + InputLine,
    Dir: DirectionControl,
{
    fn swd_setup(&mut self) {
        // Latch the idle level before the drivers turn on so the target never sees a low glitch.
        self.swclk.set_high();
        self.swdio.set_high();
        self.nreset.set_high();
        self.direction.drive();
        self.swclk.set_as_output();
        self.swdio.set_as_output();
    }

    fn port_off(&mut self) {
        self.swdio.set_low();
        self.swclk.set_low();
        self.swdio.set_as_input();
        self.swclk.set_as_input();
        self.direction.release();
    }

    fn swclk_set(&mut self) {
        self.swclk.set_high();
    }

    fn swclk_clr(&mut self) {
        self.swclk.set_low();
    }

    fn swclk_in(&self) -> bool {
        self.swclk.is_high()
    }

    fn swdio_set(&mut self) {
        self.swdio.set_high();
    }

    fn swdio_clr(&mut self) {
        self.swdio.set_low();
    }

    fn swdio_in(&self) -> bool {
        self.swdio.is_high()
    }

    fn swdio_out(&mut self, bit: bool) {
        self.swdio.set_level(bit);
    }

    fn swdio_out_enable(&mut self) {
        self.direction.drive();
        self.swdio.set_as_output();
    }

    fn swdio_out_disable(&mut self) {
        self.swdio.set_as_input();
        self.direction.release();
    }

    fn nreset_in(&self) -> bool {
        self.nreset.is_high()
    }

    fn nreset_out(&mut self, level: bool) {
        self.nreset.set_level(level);
    }

    fn dap_setup(&mut self) {
        self.port_off();
        self.nreset.set_high();
    }
}

/// Everything the probe drives: debug port, bootloader-control line and status LEDs.
///
/// The bootloader-control line is active low, like nRESET.
#[derive(Debug)]
pub struct ProbePins<S, C, L> {
    swd: S,
    boot_ctl: C,
    leds: L,
}

impl<S, C, L> ProbePins<S, C, L>
where
    S: DebugPort,
    C: OutputLine,
    L: StatusIndicators,
{
    pub fn new(swd: S, boot_ctl: C, leds: L) -> Self {
        Self {
            swd,
            boot_ctl,
            leds,
        }
    }

    pub fn swd(&self) -> &S {
        &self.swd
    }

    pub fn leds(&self) -> &L {
        &self.leds
    }

    pub fn boot_ctl(&self) -> &C {
        &self.boot_ctl
    }
}

impl<S, C, L> DebugPort for ProbePins<S, C, L>
where
    S: DebugPort,
    C: OutputLine,
    L: StatusIndicators,
{
    fn swd_setup(&mut self) {
        self.swd.swd_setup();
    }

    fn port_off(&mut self) {
        self.swd.port_off();
    }

    fn swclk_set(&mut self) {
        self.swd.swclk_set();
    }

    fn swclk_clr(&mut self) {
        self.swd.swclk_clr();
    }

    fn swclk_in(&self) -> bool {
        self.swd.swclk_in()
    }

    fn swdio_set(&mut self) {
        self.swd.swdio_set();
    }

    fn swdio_clr(&mut self) {
        self.swd.swdio_clr();
    }

    fn swdio_in(&self) -> bool {
        self.swd.swdio_in()
    }

    fn swdio_out(&mut self, bit: bool) {
        self.swd.swdio_out(bit);
    }

    fn swdio_out_enable(&mut self) {
        self.swd.swdio_out_enable();
    }

    fn swdio_out_disable(&mut self) {
        self.swd.swdio_out_disable();
    }

    fn nreset_in(&self) -> bool {
        self.swd.nreset_in()
    }

    fn nreset_out(&mut self, level: bool) {
        self.swd.nreset_out(level);
    }

    fn dap_setup(&mut self) {
        self.swd.dap_setup();
        self.boot_ctl.set_high();
        self.leds.show(LedPattern::OFF);
    }
}

impl<S, C, L> TargetLines for ProbePins<S, C, L>
where
    S: DebugPort,
    C: OutputLine,
    L: StatusIndicators,
{
    fn set_boot_request(&mut self, asserted: bool) {
        self.boot_ctl.set_level(!asserted);
    }

    fn set_reset(&mut self, asserted: bool) {
        self.swd.nreset_out(!asserted);
    }
}

impl<S, C, L> StatusIndicators for ProbePins<S, C, L>
where
    S: DebugPort,
    C: OutputLine,
    L: StatusIndicators,
{
    fn show(&mut self, pattern: LedPattern) {
        self.leds.show(pattern);
    }

    fn set_indicator(&mut self, indicator: Indicator, on: bool) {
        self.leds.set_indicator(indicator, on);
    }
}

/// Clocks `count` bits of `data` out on SWDIO, least significant bit first.
///
/// `data` must hold at least `count.div_ceil(8)` bytes; missing bytes clock out as ones.
pub fn swj_sequence<P: DebugPort + ?Sized>(port: &mut P, count: usize, data: &[u8]) {
    for index in 0..count {
        let bit = data
            .get(index / 8)
            .is_none_or(|byte| byte & (1 << (index % 8)) != 0);
        swd_write_bit(port, bit);
    }
}

/// Drives one bit onto SWDIO, then a full clock cycle.
pub fn swd_write_bit<P: DebugPort + ?Sized>(port: &mut P, bit: bool) {
    port.swdio_out(bit);
    port.swclk_clr();
    port.swclk_set();
}

/// Samples SWDIO while SWCLK is low, then raises the clock.
pub fn swd_read_bit<P: DebugPort + ?Sized>(port: &mut P) -> bool {
    port.swclk_clr();
    let bit = port.swdio_in();
    port.swclk_set();
    bit
}

/// Idle clock cycles while the line changes hands.
pub fn turnaround<P: DebugPort + ?Sized>(port: &mut P, cycles: u8) {
    for _ in 0..cycles {
        port.swclk_clr();
        port.swclk_set();
    }
}
