//! Simulated board parts for the host emulator.
//!
//! Every part shares a [`Trace`] so the session can print what the
//! superloop did to the outside world after each command.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::process;
use std::rc::Rc;

use probe_core::config::ProbeConfig;
use probe_core::indicator::StatusLeds;
use probe_core::pins::{FlexLine, InputLine, OutputLine, ProbePins, SwdPins};
use probe_core::slcan::{Bitrate, CanController, CanFrame, CanMode, SlcanBridge, SlcanError};
use probe_core::supervisor::{
    Absent, Board, DebugEngine, EngineStatus, HostEvents, Subsystem, UsbTransport,
};
use probe_core::tick::{TickSource, Ticks};
use probe_core::update::{BootloaderRequest, UpdateMode, Watchdog};

/// Output lines collected since the last drain.
#[derive(Clone, Debug, Default)]
pub struct Trace(Rc<RefCell<Vec<String>>>);

impl Trace {
    pub fn note(&self, line: impl Into<String>) {
        self.0.borrow_mut().push(line.into());
    }

    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

/// A named GPIO that reports level changes.
#[derive(Debug)]
pub struct SimLine {
    name: &'static str,
    high: bool,
    trace: Trace,
}

impl SimLine {
    pub fn new(name: &'static str, high: bool, trace: &Trace) -> Self {
        Self {
            name,
            high,
            trace: trace.clone(),
        }
    }

    fn drive(&mut self, high: bool) {
        if self.high != high {
            self.high = high;
            let level = if high { "high" } else { "low" };
            self.trace.note(format!("{} -> {level}", self.name));
        }
    }
}

impl OutputLine for SimLine {
    fn set_high(&mut self) {
        self.drive(true);
    }

    fn set_low(&mut self) {
        self.drive(false);
    }
}

impl InputLine for SimLine {
    fn is_high(&self) -> bool {
        self.high
    }
}

impl FlexLine for SimLine {
    fn set_as_output(&mut self) {}

    fn set_as_input(&mut self) {}
}

pub type SimLeds = StatusLeds<SimLine, SimLine, SimLine>;
pub type SimPins = ProbePins<SwdPins<SimLine, SimLine, SimLine>, SimLine, SimLeds>;

pub fn sim_pins(config: &ProbeConfig, trace: &Trace) -> SimPins {
    let swd = SwdPins::new(
        SimLine::new("SWCLK", false, trace),
        SimLine::new("SWDIO", false, trace),
        SimLine::new("nRESET", true, trace),
    );
    let leds = StatusLeds::new(
        SimLine::new("LED0", false, trace),
        SimLine::new("LED1", false, trace),
        SimLine::new("LED2", false, trace),
        config.led_polarity,
    );
    ProbePins::new(swd, SimLine::new("CTL", true, trace), leds)
}

/// Millisecond clock moved by the session.
///
/// While free-running, every read advances it by one tick so that busy-waits
/// make progress.
#[derive(Clone, Debug, Default)]
pub struct SimClock(Rc<ClockState>);

#[derive(Debug, Default)]
struct ClockState {
    now: Cell<u32>,
    free_running: Cell<bool>,
}

impl SimClock {
    pub fn advance(&self, ticks: u32) {
        self.0.now.set(self.0.now.get().wrapping_add(ticks));
    }

    pub fn set_free_running(&self, enabled: bool) {
        self.0.free_running.set(enabled);
    }

    pub fn peek(&self) -> u32 {
        self.0.now.get()
    }
}

impl TickSource for SimClock {
    fn now(&self) -> Ticks {
        let now = self.0.now.get();
        if self.0.free_running.get() {
            self.0.now.set(now.wrapping_add(1));
        }
        Ticks::from_raw(now)
    }
}

#[derive(Clone, Debug, Default)]
pub struct SimWatchdog(Rc<Cell<u64>>);

impl SimWatchdog {
    pub fn refreshes(&self) -> u64 {
        self.0.get()
    }
}

impl Watchdog for SimWatchdog {
    fn refresh(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

/// Something the simulated host does over USB.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostEvent {
    ControlLines { dtr: bool, rts: bool },
    Traffic,
    Detach,
}

/// USB transport fed from the session's command queue.
#[derive(Clone, Debug, Default)]
pub struct HostLink(Rc<RefCell<VecDeque<HostEvent>>>);

impl HostLink {
    pub fn push(&self, event: HostEvent) {
        self.0.borrow_mut().push_back(event);
    }
}

impl UsbTransport for HostLink {
    fn poll<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        while let Some(event) = self.0.borrow_mut().pop_front() {
            match event {
                HostEvent::ControlLines { dtr, rts } => events.on_control_line_change(dtr, rts),
                HostEvent::Traffic => events.on_activity(),
                HostEvent::Detach => events.on_bootloader_request(),
            }
        }
    }
}

/// Debug engine whose busy flag is set from the console.
#[derive(Clone, Debug, Default)]
pub struct ScriptedEngine(Rc<Cell<bool>>);

impl ScriptedEngine {
    pub fn set_busy(&self, busy: bool) {
        self.0.set(busy);
    }

    pub fn is_busy(&self) -> bool {
        self.0.get()
    }
}

impl<P: ?Sized> DebugEngine<P> for ScriptedEngine {
    fn update(&mut self, _port: &mut P, _bootloader: &mut BootloaderRequest) -> EngineStatus {
        if self.0.get() {
            EngineStatus::Active
        } else {
            EngineStatus::Idle
        }
    }
}

/// CAN controller alone on its bus: loopback mode echoes, others just accept.
#[derive(Debug)]
pub struct LoopbackCan {
    mode: CanMode,
    received: VecDeque<CanFrame>,
    trace: Trace,
}

impl LoopbackCan {
    pub fn new(trace: &Trace) -> Self {
        Self {
            mode: CanMode::Reset,
            received: VecDeque::new(),
            trace: trace.clone(),
        }
    }
}

impl CanController for LoopbackCan {
    fn configure(&mut self, bitrate: Bitrate, mode: CanMode) {
        self.mode = mode;
        self.received.clear();
        self.trace.note(format!(
            "can: {} bit/s, {mode:?}",
            bitrate.bits_per_second()
        ));
    }

    fn transmit(&mut self, frame: &CanFrame) -> Result<(), SlcanError> {
        self.trace.note(format!("can: bus <- {frame:?}"));
        if self.mode == CanMode::Loopback {
            self.received.push_back(*frame);
        }
        Ok(())
    }

    fn receive(&mut self) -> Option<CanFrame> {
        self.received.pop_front()
    }
}

/// SLCAN line discipline over a byte queue filled by the `can` command.
pub struct SlcanPort {
    bridge: SlcanBridge<LoopbackCan>,
    input: Rc<RefCell<VecDeque<u8>>>,
    trace: Trace,
}

impl SlcanPort {
    pub fn new(config: &ProbeConfig, trace: &Trace) -> Self {
        Self {
            bridge: SlcanBridge::new(LoopbackCan::new(trace), config.can_bitrate, config.can_mode),
            input: Rc::default(),
            trace: trace.clone(),
        }
    }

    /// Handle for queueing host bytes.
    pub fn input(&self) -> Rc<RefCell<VecDeque<u8>>> {
        Rc::clone(&self.input)
    }

    pub fn mode(&self) -> CanMode {
        self.bridge.mode()
    }

    pub fn bitrate(&self) -> Bitrate {
        self.bridge.bitrate()
    }

    fn reply(&self, bytes: &[u8]) {
        self.trace
            .note(format!("can: host <- \"{}\"", bytes.escape_ascii()));
    }
}

impl Subsystem for SlcanPort {
    fn update<E: HostEvents + ?Sized>(&mut self, events: &mut E) {
        let pending: Vec<u8> = self.input.borrow_mut().drain(..).collect();
        if !pending.is_empty() {
            events.on_activity();
        }
        for byte in pending {
            if let Some(reply) = self.bridge.handle_byte(byte) {
                self.reply(&reply);
            }
        }
        while let Some(frame) = self.bridge.next_received() {
            events.on_activity();
            self.reply(&frame);
        }
    }
}

/// Update-mode entry for the emulator: report and end the process.
#[derive(Debug)]
pub struct ExitToBootloader {
    trace: Trace,
}

impl ExitToBootloader {
    pub fn new(trace: &Trace) -> Self {
        Self {
            trace: trace.clone(),
        }
    }

    fn exit(&self, message: &str) -> ! {
        let mut stdout = io::stdout().lock();
        for line in self.trace.drain() {
            let _ = writeln!(stdout, "  {line}");
        }
        let _ = writeln!(stdout, "{message}");
        let _ = stdout.flush();
        process::exit(0)
    }
}

impl UpdateMode for ExitToBootloader {
    fn take_persisted_request(&mut self) -> bool {
        false
    }

    fn jump(&mut self) -> ! {
        self.exit("update: jumping to bootloader")
    }

    fn reset_and_jump(&mut self) -> ! {
        self.exit("update: reset into bootloader, emulator stopped")
    }
}

pub struct SimBoard;

impl Board for SimBoard {
    type Pins = SimPins;
    type Clock = SimClock;
    type Watchdog = SimWatchdog;
    type Usb = HostLink;
    type SerialBridge = Absent;
    type CanBridge = SlcanPort;
    type VirtualSerial = Absent;
    type Engine = ScriptedEngine;
    type Update = ExitToBootloader;
}
