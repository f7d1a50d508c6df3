#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use probe_core::config::ProbeConfig;
use probe_core::indicator::{Indicator, LedPattern, StatusIndicators};
use probe_core::pins::DebugPort;
use probe_core::supervisor::{
    Absent, Board, DebugEngine, EngineStatus, HostEvents, Peripherals, Subsystem, Supervisor,
    UsbTransport,
};
use probe_core::target::{TargetLines, TargetState};
use probe_core::tick::{TickSource, Ticks};
use probe_core::update::{BootloaderRequest, UpdateMode, Watchdog};

/// Everything observable that happened on the simulated board, in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Boot(bool),
    Reset(bool),
    Pattern(LedPattern),
    Indicator(Indicator, bool),
    WatchdogRefresh(u32),
    UsbPoll,
    SubsystemUpdate(&'static str),
    EngineUpdate,
}

pub type Log = Rc<RefCell<Vec<Event>>>;

fn record(log: &Log, event: Event) {
    log.borrow_mut().push(event);
}

#[derive(Default)]
struct ClockState {
    now: Cell<u32>,
    step: Cell<u32>,
}

/// Shared millisecond clock. With a non-zero step every read advances it,
/// which is how busy-waits make progress without a tick interrupt.
#[derive(Clone, Default)]
pub struct SimClock(Rc<ClockState>);

impl SimClock {
    pub fn starting_at(raw: u32) -> Self {
        let clock = Self::default();
        clock.set(raw);
        clock
    }

    pub fn set(&self, raw: u32) {
        self.0.now.set(raw);
    }

    pub fn advance(&self, ticks: u32) {
        self.0.now.set(self.0.now.get().wrapping_add(ticks));
    }

    pub fn auto_step(&self, step: u32) {
        self.0.step.set(step);
    }

    /// Current reading without advancing.
    pub fn peek(&self) -> u32 {
        self.0.now.get()
    }
}

impl TickSource for SimClock {
    fn now(&self) -> Ticks {
        let now = self.0.now.get();
        self.0.now.set(now.wrapping_add(self.0.step.get()));
        Ticks::from_raw(now)
    }
}

pub struct RecordingPins {
    log: Log,
    lines: TargetState,
}

impl RecordingPins {
    pub fn lines(&self) -> TargetState {
        self.lines
    }
}

impl DebugPort for RecordingPins {
    fn swd_setup(&mut self) {}
    fn port_off(&mut self) {}
    fn swclk_set(&mut self) {}
    fn swclk_clr(&mut self) {}
    fn swclk_in(&self) -> bool {
        true
    }
    fn swdio_set(&mut self) {}
    fn swdio_clr(&mut self) {}
    fn swdio_in(&self) -> bool {
        true
    }
    fn swdio_out(&mut self, _bit: bool) {}
    fn swdio_out_enable(&mut self) {}
    fn swdio_out_disable(&mut self) {}
    fn nreset_in(&self) -> bool {
        !self.lines.reset
    }
    fn nreset_out(&mut self, level: bool) {
        self.set_reset(!level);
    }
    fn dap_setup(&mut self) {}
}

impl TargetLines for RecordingPins {
    fn set_boot_request(&mut self, asserted: bool) {
        self.lines.enter_bootloader = asserted;
        record(&self.log, Event::Boot(asserted));
    }

    fn set_reset(&mut self, asserted: bool) {
        self.lines.reset = asserted;
        record(&self.log, Event::Reset(asserted));
    }
}

impl StatusIndicators for RecordingPins {
    fn show(&mut self, pattern: LedPattern) {
        record(&self.log, Event::Pattern(pattern));
    }

    fn set_indicator(&mut self, indicator: Indicator, on: bool) {
        record(&self.log, Event::Indicator(indicator, on));
    }
}

pub struct RecordingWatchdog {
    log: Log,
    clock: SimClock,
}

impl Watchdog for RecordingWatchdog {
    fn refresh(&mut self) {
        record(&self.log, Event::WatchdogRefresh(self.clock.peek()));
    }
}

/// Host-side happenings the simulated USB stack delivers on its next poll.
#[derive(Copy, Clone, Debug)]
pub enum HostEvent {
    Activity,
    Bootloader,
    Lines { dtr: bool, rts: bool },
}

pub struct ScriptedUsb {
    log: Log,
    pending: VecDeque<HostEvent>,
}

impl ScriptedUsb {
    pub fn push(&mut self, event: HostEvent) {
        self.pending.push_back(event);
    }
}

impl UsbTransport for ScriptedUsb {
    fn poll<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        record(&self.log, Event::UsbPoll);
        while let Some(event) = self.pending.pop_front() {
            match event {
                HostEvent::Activity => events.on_activity(),
                HostEvent::Bootloader => events.on_bootloader_request(),
                HostEvent::Lines { dtr, rts } => events.on_control_line_change(dtr, rts),
            }
        }
    }
}

pub struct RecordingSubsystem {
    log: Log,
    name: &'static str,
    pub traffic: bool,
}

impl Subsystem for RecordingSubsystem {
    fn update<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        record(&self.log, Event::SubsystemUpdate(self.name));
        if std::mem::take(&mut self.traffic) {
            events.on_activity();
        }
    }
}

/// Engine replaying a fixed list of statuses, then idling.
pub struct ScriptedEngine {
    log: Log,
    script: VecDeque<EngineStatus>,
}

impl ScriptedEngine {
    pub fn report(&mut self, status: EngineStatus, iterations: usize) {
        self.script.extend(std::iter::repeat_n(status, iterations));
    }
}

impl DebugEngine<RecordingPins> for ScriptedEngine {
    fn update(
        &mut self,
        _port: &mut RecordingPins,
        _bootloader: &mut BootloaderRequest,
    ) -> EngineStatus {
        record(&self.log, Event::EngineUpdate);
        self.script.pop_front().unwrap_or(EngineStatus::Idle)
    }
}

/// Panic payload standing in for the jump into update mode.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Jump {
    Direct,
    AfterReset,
}

#[derive(Default)]
pub struct SentinelUpdate {
    pub persisted: bool,
}

impl UpdateMode for SentinelUpdate {
    fn take_persisted_request(&mut self) -> bool {
        std::mem::take(&mut self.persisted)
    }

    fn jump(&mut self) -> ! {
        panic::panic_any(Jump::Direct)
    }

    fn reset_and_jump(&mut self) -> ! {
        panic::panic_any(Jump::AfterReset)
    }
}

/// Runs `f`, returning the jump it ended in, if any.
pub fn catch_jump<F: FnOnce()>(f: F) -> Option<Jump> {
    let hook = panic::take_hook();
    panic::set_hook(Box::new(|info| {
        if info.payload().downcast_ref::<Jump>().is_none() {
            eprintln!("{info}");
        }
    }));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    panic::set_hook(hook);
    match result {
        Ok(()) => None,
        Err(payload) => match payload.downcast::<Jump>() {
            Ok(jump) => Some(*jump),
            Err(other) => panic::resume_unwind(other),
        },
    }
}

pub struct MockBoard;

impl Board for MockBoard {
    type Pins = RecordingPins;
    type Clock = SimClock;
    type Watchdog = RecordingWatchdog;
    type Usb = ScriptedUsb;
    type SerialBridge = RecordingSubsystem;
    type CanBridge = Absent;
    type VirtualSerial = RecordingSubsystem;
    type Engine = ScriptedEngine;
    type Update = SentinelUpdate;
}

pub struct Harness {
    pub supervisor: Supervisor<MockBoard>,
    pub clock: SimClock,
    pub log: Log,
}

impl Harness {
    pub fn new(config: ProbeConfig) -> Self {
        let log = Log::default();
        let clock = SimClock::default();
        let parts = Peripherals::<MockBoard> {
            pins: RecordingPins {
                log: log.clone(),
                lines: TargetState::RELEASED,
            },
            clock: clock.clone(),
            watchdog: RecordingWatchdog {
                log: log.clone(),
                clock: clock.clone(),
            },
            usb: ScriptedUsb {
                log: log.clone(),
                pending: VecDeque::new(),
            },
            serial_bridge: RecordingSubsystem {
                log: log.clone(),
                name: "serial",
                traffic: false,
            },
            can_bridge: Absent,
            virtual_serial: RecordingSubsystem {
                log: log.clone(),
                name: "virtual",
                traffic: false,
            },
            engine: ScriptedEngine {
                log: log.clone(),
                script: VecDeque::new(),
            },
            update: SentinelUpdate::default(),
        };
        Self {
            supervisor: Supervisor::new(config, parts),
            clock,
            log,
        }
    }

    pub fn host(&mut self, event: HostEvent) {
        self.supervisor.usb_mut().push(event);
    }

    pub fn lines(&self) -> TargetState {
        self.supervisor.context().pins().lines()
    }

    /// Runs one iteration per tick for `ticks` ticks.
    pub fn run_ticks(&mut self, ticks: u32) {
        for _ in 0..ticks {
            self.clock.advance(1);
            self.supervisor.run_once();
        }
    }

    pub fn take_log(&self) -> Vec<Event> {
        std::mem::take(&mut *self.log.borrow_mut())
    }

    /// Target-line writes only.
    pub fn target_writes(&self) -> Vec<Event> {
        self.log
            .borrow()
            .iter()
            .copied()
            .filter(|event| matches!(event, Event::Boot(_) | Event::Reset(_)))
            .collect()
    }
}
