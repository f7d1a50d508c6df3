//! Supervisory superloop.
//!
//! One iteration, in fixed order:
//!
//! 1. refresh the watchdog
//! 2. poll the USB transport
//! 3. update the serial bridge, CAN bridge and virtual serial channel
//! 4. update the debug engine; traffic refreshes the activity timer
//! 5. with the engine idle, honour a pending update-mode request (never returns)
//! 6. step the activity indicator
//! 7. apply a due deferred target state
//!
//! Optional subsystems are chosen at build time by the [`Board`] associated
//! types. A disabled one is the zero-sized [`Absent`], so the loop body is the
//! same in every configuration.

use crate::activity::ActivityIndicator;
use crate::config::ProbeConfig;
use crate::indicator::{LedPattern, StatusIndicators};
use crate::pins::DebugPort;
use crate::target::{TargetLines, TargetState, TargetStateController};
use crate::tick::TickSource;
use crate::update::{BootloaderRequest, UpdateMode, Watchdog, enter_update_mode};

/// Callbacks raised by USB-facing subsystems.
///
/// Implementations only record state; the superloop acts on it later.
pub trait HostEvents {
    fn on_activity(&mut self);
    fn on_bootloader_request(&mut self);
    fn on_control_line_change(&mut self, dtr: bool, rts: bool);
}

/// USB device stack, polled once per iteration.
pub trait UsbTransport {
    fn poll<E: HostEvents + ?Sized>(&mut self, events: &mut E);
}

/// Optional non-blocking subsystem.
pub trait Subsystem {
    fn update<E: HostEvents + ?Sized>(&mut self, events: &mut E);
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineStatus {
    /// Processed traffic this iteration.
    Active,
    Idle,
}

/// Debug-access-port engine.
pub trait DebugEngine<P: ?Sized> {
    fn update(&mut self, port: &mut P, bootloader: &mut BootloaderRequest) -> EngineStatus;
}

/// Subsystem compiled out of this build.
#[derive(Copy, Clone, Debug, Default)]
pub struct Absent;

impl Subsystem for Absent {
    fn update<E: HostEvents + ?Sized>(&mut self, _events: &mut E) {}
}

/// Concrete collaborators for one build of the probe.
pub trait Board {
    type Pins: DebugPort + TargetLines + StatusIndicators;
    type Clock: TickSource;
    type Watchdog: Watchdog;
    type Usb: UsbTransport;
    type SerialBridge: Subsystem;
    type CanBridge: Subsystem;
    type VirtualSerial: Subsystem;
    type Engine: DebugEngine<Self::Pins>;
    type Update: UpdateMode;
}

pub struct Peripherals<B: Board> {
    pub pins: B::Pins,
    pub clock: B::Clock,
    pub watchdog: B::Watchdog,
    pub usb: B::Usb,
    pub serial_bridge: B::SerialBridge,
    pub can_bridge: B::CanBridge,
    pub virtual_serial: B::VirtualSerial,
    pub engine: B::Engine,
    pub update: B::Update,
}

/// State written by USB callbacks and read by the superloop.
///
/// Callbacks are dispatched synchronously from inside the loop's own polling
/// steps, so every field has a single owner and no locking is needed. Only the
/// clock is shared with an interrupt.
pub struct ProbeContext<P, C> {
    pins: P,
    clock: C,
    target: TargetStateController,
    activity: ActivityIndicator,
    bootloader: BootloaderRequest,
}

impl<P, C> ProbeContext<P, C>
where
    P: TargetLines,
    C: TickSource,
{
    pub fn new(config: &ProbeConfig, pins: P, clock: C) -> Self {
        Self {
            pins,
            clock,
            target: TargetStateController::new(config.target_debounce),
            activity: ActivityIndicator::new(config.activity_hold),
            bootloader: BootloaderRequest::new(),
        }
    }

    pub fn pins(&self) -> &P {
        &self.pins
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn target(&self) -> &TargetStateController {
        &self.target
    }

    pub fn activity(&self) -> &ActivityIndicator {
        &self.activity
    }

    pub fn bootloader(&self) -> &BootloaderRequest {
        &self.bootloader
    }
}

impl<P, C> HostEvents for ProbeContext<P, C>
where
    P: TargetLines,
    C: TickSource,
{
    fn on_activity(&mut self) {
        self.activity.on_activity();
    }

    fn on_bootloader_request(&mut self) {
        self.bootloader.request();
    }

    fn on_control_line_change(&mut self, dtr: bool, rts: bool) {
        let now = self.clock.now();
        self.target.on_control_line_change(&mut self.pins, dtr, rts, now);
    }
}

/// What one superloop iteration did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Iteration {
    pub engine: EngineStatus,
    pub activity_lit: bool,
    /// Deferred target state applied this iteration.
    pub applied: Option<TargetState>,
}

pub struct Supervisor<B: Board> {
    config: ProbeConfig,
    context: ProbeContext<B::Pins, B::Clock>,
    watchdog: B::Watchdog,
    usb: B::Usb,
    serial_bridge: B::SerialBridge,
    can_bridge: B::CanBridge,
    virtual_serial: B::VirtualSerial,
    engine: B::Engine,
    update: B::Update,
}

impl<B: Board> Supervisor<B> {
    pub fn new(config: ProbeConfig, parts: Peripherals<B>) -> Self {
        Self {
            context: ProbeContext::new(&config, parts.pins, parts.clock),
            config,
            watchdog: parts.watchdog,
            usb: parts.usb,
            serial_bridge: parts.serial_bridge,
            can_bridge: parts.can_bridge,
            virtual_serial: parts.virtual_serial,
            engine: parts.engine,
            update: parts.update,
        }
    }

    /// Releases every line, runs the LED self-test and shows the boot pattern.
    ///
    /// `pause` runs between self-test patterns.
    pub fn power_on(&mut self, mut pause: impl FnMut()) {
        let pins = &mut self.context.pins;
        pins.dap_setup();
        for pattern in LedPattern::self_test() {
            pins.show(pattern);
            pause();
        }
        pins.show(LedPattern::BOOT);
    }

    pub fn run(&mut self) -> ! {
        loop {
            self.run_once();
        }
    }

    pub fn run_once(&mut self) -> Iteration {
        self.watchdog.refresh();

        self.usb.poll(&mut self.context);

        self.serial_bridge.update(&mut self.context);
        self.can_bridge.update(&mut self.context);
        self.virtual_serial.update(&mut self.context);

        let engine = self
            .engine
            .update(&mut self.context.pins, &mut self.context.bootloader);
        if engine == EngineStatus::Active {
            self.context.on_activity();
        }

        if engine == EngineStatus::Idle
            && self.config.update_mode
            && self.context.bootloader.is_requested()
        {
            enter_update_mode(
                &self.config,
                &self.context.clock,
                &mut self.watchdog,
                &mut self.context.pins,
                &mut self.update,
            );
        }

        let activity_lit = self.context.activity.step(&mut self.context.pins);

        let now = self.context.clock.now();
        let applied = self.context.target.poll(&mut self.context.pins, now);

        Iteration {
            engine,
            activity_lit,
            applied,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    pub fn context(&self) -> &ProbeContext<B::Pins, B::Clock> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut ProbeContext<B::Pins, B::Clock> {
        &mut self.context
    }

    pub fn watchdog(&self) -> &B::Watchdog {
        &self.watchdog
    }

    pub fn usb_mut(&mut self) -> &mut B::Usb {
        &mut self.usb
    }

    pub fn serial_bridge_mut(&mut self) -> &mut B::SerialBridge {
        &mut self.serial_bridge
    }

    pub fn can_bridge_mut(&mut self) -> &mut B::CanBridge {
        &mut self.can_bridge
    }

    pub fn virtual_serial_mut(&mut self) -> &mut B::VirtualSerial {
        &mut self.virtual_serial
    }

    pub fn engine_mut(&mut self) -> &mut B::Engine {
        &mut self.engine
    }
}
