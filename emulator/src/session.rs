use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use probe_core::config::ProbeConfig;
use probe_core::pins::{DebugPort, InputLine};
use probe_core::supervisor::{Absent, Peripherals, Supervisor};

use crate::sim::{
    ExitToBootloader, HostEvent, HostLink, ScriptedEngine, SimBoard, SimClock, SimWatchdog,
    SlcanPort, Trace, sim_pins,
};

/// Upper bound for a single `tick` command.
const MAX_TICKS_PER_COMMAND: u32 = 100_000;

pub const HELP_TOPICS: &[(&str, &str)] = &[
    ("lines", "lines <dtr> <rts>   - change the bridge port control lines (0/1)"),
    ("tick", "tick [n]            - run n superloop iterations, 1 ms each"),
    ("activity", "activity            - simulate host traffic"),
    ("dap", "dap <busy|idle>     - make the debug engine report traffic or not"),
    ("dfu", "dfu                 - send DFU_DETACH (ends the session once idle)"),
    ("can", "can <command>       - send one SLCAN command, e.g. `can O`"),
    ("status", "status              - show probe state"),
    ("help", "help [topic]        - show help"),
];

/// One line of command output.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Line {
    Info(String),
    /// Something the probe did to a line, the LEDs or the CAN port.
    Trace(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandError {
    Unknown(String),
    Usage(&'static str),
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(command) => write!(f, "unknown command `{command}`; try `help`"),
            Self::Usage(usage) => write!(f, "usage: {usage}"),
        }
    }
}

pub struct Session {
    supervisor: Supervisor<SimBoard>,
    clock: SimClock,
    watchdog: SimWatchdog,
    host: HostLink,
    engine: ScriptedEngine,
    can_input: Rc<RefCell<VecDeque<u8>>>,
    trace: Trace,
    detach_sent: bool,
}

impl Session {
    pub fn new(config: ProbeConfig) -> Self {
        let trace = Trace::default();
        let clock = SimClock::default();
        let watchdog = SimWatchdog::default();
        let host = HostLink::default();
        let engine = ScriptedEngine::default();
        let can = SlcanPort::new(&config, &trace);
        let can_input = can.input();

        let mut supervisor = Supervisor::new(
            config,
            Peripherals::<SimBoard> {
                pins: sim_pins(&config, &trace),
                clock: clock.clone(),
                watchdog: watchdog.clone(),
                usb: host.clone(),
                serial_bridge: Absent,
                can_bridge: can,
                virtual_serial: Absent,
                engine: engine.clone(),
                update: ExitToBootloader::new(&trace),
            },
        );
        supervisor.power_on(|| {});

        Self {
            supervisor,
            clock,
            watchdog,
            host,
            engine,
            can_input,
            trace,
            detach_sent: false,
        }
    }

    /// Trace lines produced outside a command, such as during power-on.
    pub fn take_trace(&self) -> Vec<Line> {
        self.trace.drain().into_iter().map(Line::Trace).collect()
    }

    pub fn handle_command(&mut self, line: &str) -> Result<Vec<Line>, CommandError> {
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            return Ok(Vec::new());
        };
        let command = command.to_ascii_lowercase();

        let mut output = match command.as_str() {
            "lines" => {
                let usage = "lines <dtr> <rts>";
                let dtr = parse_level(words.next()).ok_or(CommandError::Usage(usage))?;
                let rts = parse_level(words.next()).ok_or(CommandError::Usage(usage))?;
                self.host.push(HostEvent::ControlLines { dtr, rts });
                self.run(1);
                Vec::new()
            }
            "tick" => {
                let count = match words.next() {
                    None => 1,
                    Some(raw) => raw
                        .parse::<u32>()
                        .ok()
                        .filter(|n| (1..=MAX_TICKS_PER_COMMAND).contains(n))
                        .ok_or(CommandError::Usage("tick [1..=100000]"))?,
                };
                self.run(count);
                vec![Line::Info(format!("t={} ms", self.clock.peek()))]
            }
            "activity" => {
                self.host.push(HostEvent::Traffic);
                self.run(1);
                Vec::new()
            }
            "dap" => {
                let busy = match words.next() {
                    Some("busy") => true,
                    Some("idle") => false,
                    _ => return Err(CommandError::Usage("dap <busy|idle>")),
                };
                self.engine.set_busy(busy);
                vec![Line::Info(format!(
                    "debug engine {}",
                    if busy { "busy" } else { "idle" }
                ))]
            }
            "dfu" => {
                self.host.push(HostEvent::Detach);
                self.detach_sent = true;
                self.run(1);
                vec![Line::Info("update request pending".to_owned())]
            }
            "can" => {
                let rest: Vec<&str> = words.collect();
                if rest.is_empty() {
                    return Err(CommandError::Usage("can <slcan command>"));
                }
                {
                    let mut input = self.can_input.borrow_mut();
                    input.extend(rest.concat().bytes());
                    input.push_back(b'\r');
                }
                self.run(1);
                Vec::new()
            }
            "status" => self.status(),
            "help" => help(words.next()),
            _ => return Err(CommandError::Unknown(command)),
        };

        output.extend(self.take_trace());
        Ok(output)
    }

    fn run(&mut self, iterations: u32) {
        for _ in 0..iterations {
            let requested =
                self.detach_sent || self.supervisor.context().bootloader().is_requested();
            // The countdown busy-waits on the clock; let it run freely then.
            self.clock.set_free_running(
                requested && !self.engine.is_busy() && self.supervisor.config().update_mode,
            );
            self.clock.advance(1);
            self.supervisor.run_once();
        }
    }

    fn status(&mut self) -> Vec<Line> {
        let can = self.supervisor.can_bridge_mut();
        let can = format!(
            "can: {:?} at {} bit/s",
            can.mode(),
            can.bitrate().bits_per_second()
        );
        let context = self.supervisor.context();
        let pins = context.pins();
        let level = |high: bool| if high { "high" } else { "low" };

        vec![
            Line::Info(format!(
                "t={} ms, watchdog refreshed {} times",
                self.clock.peek(),
                self.watchdog.refreshes()
            )),
            Line::Info(format!(
                "target: {:?}, pending {:?}",
                context.target().state(),
                context.target().pending()
            )),
            Line::Info(format!(
                "lines: CTL {}, nRESET {}",
                level(pins.boot_ctl().is_high()),
                level(pins.nreset_in())
            )),
            Line::Info(format!(
                "activity: {} ticks left",
                context.activity().remaining()
            )),
            Line::Info(format!(
                "debug engine {}, update request {}",
                if self.engine.is_busy() { "busy" } else { "idle" },
                if context.bootloader().is_requested() {
                    "pending"
                } else {
                    "none"
                }
            )),
            Line::Info(can),
        ]
    }
}

fn parse_level(word: Option<&str>) -> Option<bool> {
    match word? {
        "1" | "on" | "high" => Some(true),
        "0" | "off" | "low" => Some(false),
        _ => None,
    }
}

fn help(topic: Option<&str>) -> Vec<Line> {
    match topic {
        Some(topic) => HELP_TOPICS
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(topic))
            .map(|(_, text)| Line::Info((*text).to_owned()))
            .collect(),
        None => HELP_TOPICS
            .iter()
            .map(|(_, text)| Line::Info((*text).to_owned()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        let session = Session::new(ProbeConfig::DEFAULT);
        session.take_trace();
        session
    }

    fn traces(lines: &[Line]) -> Vec<&str> {
        lines
            .iter()
            .filter_map(|line| match line {
                Line::Trace(text) => Some(text.as_str()),
                Line::Info(_) => None,
            })
            .collect()
    }

    #[test]
    fn power_on_runs_the_self_test() {
        let session = Session::new(ProbeConfig::DEFAULT);
        let trace = session.take_trace();
        assert!(traces(&trace).contains(&"LED0 -> high"));
        assert!(traces(&trace).contains(&"LED2 -> high"));
    }

    #[test]
    fn reset_request_pulses_then_settles() {
        let mut session = session();

        let pulse = session.handle_command("lines 1 0").unwrap();
        let pulse = traces(&pulse);
        assert!(pulse.contains(&"CTL -> low"));
        assert!(pulse.contains(&"nRESET -> low"));

        let waiting = session.handle_command("tick 24").unwrap();
        assert!(!traces(&waiting).iter().any(|line| line.starts_with("CTL")));

        let settled = session.handle_command("tick").unwrap();
        let settled = traces(&settled);
        assert!(settled.contains(&"CTL -> high"));
        assert!(!settled.iter().any(|line| line.starts_with("nRESET")));
    }

    #[test]
    fn closing_the_port_releases_immediately() {
        let mut session = session();
        session.handle_command("lines 0 1").unwrap();

        let released = session.handle_command("lines 0 0").unwrap();
        let released = traces(&released);
        assert!(released.contains(&"CTL -> high"));
        assert!(released.contains(&"nRESET -> high"));

        let later = session.handle_command("tick 50").unwrap();
        assert!(!traces(&later).iter().any(|line| line.starts_with("CTL")));
    }

    #[test]
    fn slcan_loopback_echoes_frames() {
        let mut session = session();
        session.handle_command("can l").unwrap();

        let sent = session.handle_command("can t1232AABB").unwrap();
        let sent = traces(&sent);
        assert!(sent.contains(&"can: host <- \"z\\r\""));
        assert!(sent.contains(&"can: host <- \"t1232AABB\\r\""));
    }

    #[test]
    fn slcan_errors_ring_the_bell() {
        let mut session = session();
        let reply = session.handle_command("can F").unwrap();
        assert!(traces(&reply).contains(&"can: host <- \"\\x07\""));
    }

    #[test]
    fn bad_arguments_report_usage() {
        let mut session = session();
        assert_eq!(
            session.handle_command("lines 1"),
            Err(CommandError::Usage("lines <dtr> <rts>"))
        );
        assert_eq!(
            session.handle_command("tick 0"),
            Err(CommandError::Usage("tick [1..=100000]"))
        );
        assert!(matches!(
            session.handle_command("frobnicate"),
            Err(CommandError::Unknown(_))
        ));
    }

    #[test]
    fn status_reflects_engine_and_time() {
        let mut session = session();
        session.handle_command("dap busy").unwrap();
        session.handle_command("tick 10").unwrap();
        let status = session.handle_command("status").unwrap();
        assert!(status.contains(&Line::Info(
            "t=10 ms, watchdog refreshed 10 times".to_owned()
        )));
        assert!(status.contains(&Line::Info(
            "debug engine busy, update request none".to_owned()
        )));
    }
}
